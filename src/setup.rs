use std::io;
use std::net::Ipv4Addr;

use crate::address::RtnlAddressClient;
use crate::link::RtnlLinkClient;
use crate::logger::DiagLogger;
use crate::{RtnlClient, diag, diag_err};

const LOOPBACK_IF: &str = "lo";

pub const DEFAULT_EXTERNAL_IF: &str = "eth0";

/// Cap on the number of interfaces a single report covers. Entries beyond
/// the cap are dropped, with a diagnostic line noting the truncation.
pub const MAX_INTERFACES: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("interface enumeration failed: {0}")]
    InterfaceList(#[source] io::Error),

    #[error("query for interface {if_name} failed: {source}")]
    Interface { if_name: String, source: io::Error },
}

/// One-shot interface bring-up and report.
///
/// `configure` runs a fixed linear sequence: activate the loopback
/// interface, optionally assign an address to the external interface, then
/// enumerate all interfaces and report their IPv4 and hardware addresses
/// through the diagnostic logger.
///
/// Each invocation is independent; nothing is cached between calls. The
/// host's interface table is shared mutable state between processes, and no
/// mutual exclusion is attempted here.
pub struct IfSetup {
    link: RtnlLinkClient,
    address: RtnlAddressClient,
    logger: DiagLogger,
    external_if: String,
}

impl IfSetup {
    pub fn new(client: &RtnlClient, logger: DiagLogger) -> Self {
        Self::with_external_interface(client, logger, DEFAULT_EXTERNAL_IF)
    }

    pub fn with_external_interface(
        client: &RtnlClient,
        logger: DiagLogger,
        external_if: &str,
    ) -> Self {
        Self::from_clients(client.link(), client.address(), logger, external_if)
    }

    pub(crate) fn from_clients(
        link: RtnlLinkClient,
        address: RtnlAddressClient,
        logger: DiagLogger,
        external_if: &str,
    ) -> Self {
        Self {
            link,
            address,
            logger,
            external_if: external_if.to_owned(),
        }
    }

    /// Run the bring-up sequence. Activation failures (steps 1 and 2) are
    /// logged and do not stop the sequence; enumeration failures are logged
    /// and returned.
    pub fn configure(&self, addr: Option<crate::Ipv4Net>) -> Result<(), SetupError> {
        if let Err(err) = self.activate_loopback() {
            diag_err!(self.logger, &err, "failed to bring up {}", LOOPBACK_IF);
        }

        diag!(self.logger, "bring up interface: {}", self.external_if);

        if let Some(prefix) = addr {
            if let Err(err) = self.activate_external(prefix) {
                diag_err!(
                    self.logger,
                    &err,
                    "failed to bring up {} with {}",
                    self.external_if,
                    prefix
                );
            }
        }

        diag!(self.logger, "list all interfaces:");
        self.report_interfaces()
    }

    fn activate_loopback(&self) -> io::Result<()> {
        let lo = self.link.interface_get_by_name(LOOPBACK_IF)?;
        let prefix = crate::Ipv4Net::new(Ipv4Addr::LOCALHOST, 8).map_err(io::Error::other)?;
        self.address.ipv4_addr_set(lo.if_id, prefix)?;
        self.link.interface_set_up(lo.if_id)
    }

    fn activate_external(&self, prefix: crate::Ipv4Net) -> io::Result<()> {
        let interface = self.link.interface_get_by_name(&self.external_if)?;
        self.address.ipv4_addr_set(interface.if_id, prefix)?;
        self.link.interface_set_up(interface.if_id)
    }

    /// Report every interface by name, in the order the OS returns them.
    /// Interfaces with at least one IPv4 address additionally get their
    /// address(es) and hardware address reported; a failed query for one of
    /// those ends the whole report.
    fn report_interfaces(&self) -> Result<(), SetupError> {
        let mut interfaces = match self.link.interface_list() {
            Ok(list) => list,
            Err(err) => {
                diag_err!(self.logger, &err, "interface enumeration failed");
                return Err(SetupError::InterfaceList(err));
            }
        };

        if interfaces.len() > MAX_INTERFACES {
            interfaces.truncate(MAX_INTERFACES);
            diag!(
                self.logger,
                "interface list truncated to {} entries",
                MAX_INTERFACES
            );
        }

        for interface in interfaces {
            diag!(self.logger, "interface: {}", interface.if_name);

            let addrs = match self.address.ipv4_addrs_get(Some(interface.if_id)) {
                Ok(addrs) => addrs,
                Err(err) => {
                    diag_err!(
                        self.logger,
                        &err,
                        "address query for {} failed",
                        interface.if_name
                    );
                    return Err(SetupError::Interface {
                        if_name: interface.if_name,
                        source: err,
                    });
                }
            };

            // Interfaces without IPv4 are reported by name only.
            if addrs.is_empty() {
                continue;
            }

            let mac = match self.link.mac_addr_get(interface.if_id) {
                Ok(mac) => mac,
                Err(err) => {
                    diag_err!(
                        self.logger,
                        &err,
                        "hardware address query for {} failed",
                        interface.if_name
                    );
                    return Err(SetupError::Interface {
                        if_name: interface.if_name,
                        source: err,
                    });
                }
            };

            for addr in addrs {
                diag!(self.logger, "ip address: {}", addr);
            }
            match mac {
                Some(mac) => diag!(
                    self.logger,
                    "device: {} -> Ethernet {}",
                    interface.if_name,
                    mac
                ),
                None => diag!(
                    self.logger,
                    "device: {} -> no hardware address",
                    interface.if_name
                ),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{self, RtnlAddressClient, RtnlAddressRequest, RtnlAddressResponse};
    use crate::link::{
        self, Interface, MacAddr, RtnlLinkClient, RtnlLinkRequest, RtnlLinkResponse,
    };
    use crate::logger::{DiagLogger, MemorySink, Role};

    use ftth_common::channel::create_pair;

    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeHost {
        interfaces: Vec<Interface>,
        list_fails: bool,
        macs: HashMap<u32, MacAddr>,
        mac_fails_for: Option<u32>,
        addrs: HashMap<u32, Vec<Ipv4Addr>>,
        addrs_fail_for: Option<u32>,
    }

    struct Harness {
        setup: IfSetup,
        sink: Arc<MemorySink>,
        link_requests: Arc<Mutex<Vec<RtnlLinkRequest>>>,
        addr_requests: Arc<Mutex<Vec<RtnlAddressRequest>>>,
    }

    fn harness(host: FakeHost) -> Harness {
        let host = Arc::new(host);
        let link_requests = Arc::new(Mutex::new(Vec::new()));
        let addr_requests = Arc::new(Mutex::new(Vec::new()));

        let (link_tx, link_rx) = create_pair();
        {
            let host = host.clone();
            let requests = link_requests.clone();
            std::thread::spawn(move || run_fake_link(link_rx, host, requests));
        }

        let (addr_tx, addr_rx) = create_pair();
        {
            let host = host.clone();
            let requests = addr_requests.clone();
            std::thread::spawn(move || run_fake_address(addr_rx, host, requests));
        }

        let sink = MemorySink::new();
        let logger = DiagLogger::new(Role::Server, sink.clone());
        let setup = IfSetup::from_clients(
            RtnlLinkClient::new(link_tx),
            RtnlAddressClient::new(addr_tx),
            logger,
            "eth0",
        );

        Harness {
            setup,
            sink,
            link_requests,
            addr_requests,
        }
    }

    fn run_fake_link(
        mut server: link::Server,
        host: Arc<FakeHost>,
        requests: Arc<Mutex<Vec<RtnlLinkRequest>>>,
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async move {
            while let Some((req, respond)) = server.accept().await {
                requests.lock().unwrap().push(req.clone());
                match req {
                    RtnlLinkRequest::InterfaceList => {
                        if host.list_fails {
                            respond(RtnlLinkResponse::Failed);
                        } else {
                            respond(RtnlLinkResponse::InterfaceList(host.interfaces.clone()));
                        }
                    }
                    RtnlLinkRequest::InterfaceGetByName { if_name } => {
                        match host.interfaces.iter().find(|i| i.if_name == if_name) {
                            Some(interface) => {
                                respond(RtnlLinkResponse::Interface(interface.clone()))
                            }
                            None => respond(RtnlLinkResponse::NotFound),
                        }
                    }
                    RtnlLinkRequest::MacAddrGet { if_id } => {
                        if host.mac_fails_for == Some(if_id) {
                            respond(RtnlLinkResponse::Failed);
                        } else {
                            match host.macs.get(&if_id) {
                                Some(mac) => respond(RtnlLinkResponse::MacAddr(*mac)),
                                None => respond(RtnlLinkResponse::NotFound),
                            }
                        }
                    }
                    RtnlLinkRequest::InterfaceSetAdmin { .. } => {
                        respond(RtnlLinkResponse::Success)
                    }
                    _ => respond(RtnlLinkResponse::NotImplemented),
                }
            }
        });
    }

    fn run_fake_address(
        mut server: address::Server,
        host: Arc<FakeHost>,
        requests: Arc<Mutex<Vec<RtnlAddressRequest>>>,
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async move {
            while let Some((req, respond)) = server.accept().await {
                requests.lock().unwrap().push(req.clone());
                match req {
                    RtnlAddressRequest::Ipv4AddrsGet { if_id } => {
                        if host.addrs_fail_for == Some(if_id) {
                            respond(RtnlAddressResponse::Failed);
                        } else {
                            respond(RtnlAddressResponse::Ipv4Addrs(
                                host.addrs.get(&if_id).cloned().unwrap_or_default(),
                            ));
                        }
                    }
                    RtnlAddressRequest::Ipv4AddrSet { .. } => {
                        respond(RtnlAddressResponse::Success)
                    }
                    _ => respond(RtnlAddressResponse::NotImplemented),
                }
            }
        });
    }

    fn interface(name: &str, if_id: u32) -> Interface {
        Interface {
            if_name: name.to_owned(),
            if_id,
        }
    }

    fn message_of(line: &str) -> &str {
        line.rsplit_once("] ").unwrap().1
    }

    fn messages(sink: &MemorySink) -> Vec<String> {
        sink.lines()
            .iter()
            .map(|line| message_of(line).to_owned())
            .collect()
    }

    fn error_lines(sink: &MemorySink) -> Vec<String> {
        sink.lines()
            .iter()
            .filter(|line| line.contains("[errno: "))
            .cloned()
            .collect()
    }

    fn typical_host() -> FakeHost {
        let mut host = FakeHost::default();
        host.interfaces = vec![
            interface("lo", 1),
            interface("eth0", 2),
            interface("wg0", 3),
        ];
        host.macs.insert(1, MacAddr::default());
        host.macs
            .insert(2, MacAddr::new([0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]));
        host.addrs.insert(1, vec![Ipv4Addr::LOCALHOST]);
        host.addrs.insert(2, vec![Ipv4Addr::new(192, 0, 2, 10)]);
        host
    }

    #[test]
    fn reports_every_interface_once_in_order() {
        let h = harness(typical_host());
        h.setup.configure(None).unwrap();

        let names: Vec<String> = messages(&h.sink)
            .into_iter()
            .filter_map(|m| m.strip_prefix("interface: ").map(str::to_owned))
            .collect();
        assert_eq!(names, ["lo", "eth0", "wg0"]);

        let msgs = messages(&h.sink);
        assert!(msgs.contains(&"ip address: 192.0.2.10".to_owned()));
        assert!(msgs.contains(&"device: eth0 -> Ethernet de:ad:be:ef:00:01".to_owned()));
        assert!(error_lines(&h.sink).is_empty());
    }

    #[test]
    fn interface_without_ipv4_gets_no_hardware_query() {
        let h = harness(typical_host());
        h.setup.configure(None).unwrap();

        // wg0 (ifindex 3) has no IPv4 address: name line only.
        let msgs = messages(&h.sink);
        assert!(msgs.contains(&"interface: wg0".to_owned()));
        assert!(!msgs.iter().any(|m| m.contains("device: wg0")));

        let link_requests = h.link_requests.lock().unwrap();
        assert!(
            !link_requests
                .iter()
                .any(|req| matches!(req, RtnlLinkRequest::MacAddrGet { if_id: 3 }))
        );
    }

    #[test]
    fn bulk_query_failure_logs_once_and_aborts() {
        let mut host = typical_host();
        host.list_fails = true;
        let h = harness(host);

        let err = h.setup.configure(None).unwrap_err();
        assert!(matches!(err, SetupError::InterfaceList(_)));

        let errors = error_lines(&h.sink);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("interface enumeration failed"));

        assert!(!messages(&h.sink).iter().any(|m| m.starts_with("interface: ")));
        let addr_requests = h.addr_requests.lock().unwrap();
        assert!(
            !addr_requests
                .iter()
                .any(|req| matches!(req, RtnlAddressRequest::Ipv4AddrsGet { .. }))
        );
    }

    #[test]
    fn hardware_address_failure_aborts_enumeration() {
        let mut host = typical_host();
        host.interfaces.push(interface("eth1", 4));
        host.addrs.insert(4, vec![Ipv4Addr::new(192, 0, 2, 20)]);
        host.mac_fails_for = Some(2);
        let h = harness(host);

        let err = h.setup.configure(None).unwrap_err();
        match err {
            SetupError::Interface { if_name, .. } => assert_eq!(if_name, "eth0"),
            other => panic!("unexpected error: {:?}", other),
        }

        let msgs = messages(&h.sink);
        assert!(msgs.contains(&"interface: eth0".to_owned()));
        // eth1 comes after the failing query and must not be reported.
        assert!(!msgs.contains(&"interface: eth1".to_owned()));

        let errors = error_lines(&h.sink);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("hardware address query for eth0 failed"));
    }

    #[test]
    fn address_query_failure_aborts_enumeration() {
        let mut host = typical_host();
        host.interfaces.push(interface("eth1", 4));
        host.addrs.insert(4, vec![Ipv4Addr::new(192, 0, 2, 20)]);
        host.addrs_fail_for = Some(2);
        let h = harness(host);

        let err = h.setup.configure(None).unwrap_err();
        match err {
            SetupError::Interface { if_name, .. } => assert_eq!(if_name, "eth0"),
            other => panic!("unexpected error: {:?}", other),
        }

        let msgs = messages(&h.sink);
        assert!(msgs.contains(&"interface: eth0".to_owned()));
        assert!(!msgs.contains(&"interface: eth1".to_owned()));

        let errors = error_lines(&h.sink);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("address query for eth0 failed"));

        // The failed address query must not be followed by a hardware query.
        let link_requests = h.link_requests.lock().unwrap();
        assert!(
            !link_requests
                .iter()
                .any(|req| matches!(req, RtnlLinkRequest::MacAddrGet { if_id: 2 }))
        );
    }

    #[test]
    fn address_assignment_executed_when_given() {
        let h = harness(typical_host());
        let prefix: crate::Ipv4Net = "10.0.0.5/24".parse().unwrap();
        h.setup.configure(Some(prefix)).unwrap();

        let addr_requests = h.addr_requests.lock().unwrap();
        assert!(addr_requests.iter().any(|req| matches!(
            req,
            RtnlAddressRequest::Ipv4AddrSet { if_id: 2, prefix: p } if *p == prefix
        )));

        let link_requests = h.link_requests.lock().unwrap();
        assert!(link_requests.iter().any(|req| matches!(
            req,
            RtnlLinkRequest::InterfaceSetAdmin { if_id: 2, up: true }
        )));
    }

    #[test]
    fn address_assignment_skipped_when_absent() {
        let h = harness(typical_host());
        h.setup.configure(None).unwrap();

        // Only the loopback assignment (ifindex 1) may appear.
        let addr_requests = h.addr_requests.lock().unwrap();
        let sets: Vec<u32> = addr_requests
            .iter()
            .filter_map(|req| match req {
                RtnlAddressRequest::Ipv4AddrSet { if_id, .. } => Some(*if_id),
                _ => None,
            })
            .collect();
        assert_eq!(sets, [1]);
    }

    #[test]
    fn loopback_failure_is_logged_and_sequence_continues() {
        let mut host = typical_host();
        host.interfaces.retain(|i| i.if_name != "lo");
        host.addrs.remove(&1);
        let h = harness(host);

        h.setup.configure(None).unwrap();

        let errors = error_lines(&h.sink);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("failed to bring up lo"));
        assert!(messages(&h.sink).contains(&"interface: eth0".to_owned()));
    }

    #[test]
    fn enumeration_is_capped_at_max_interfaces() {
        let mut host = FakeHost::default();
        host.interfaces.push(interface("lo", 1));
        host.macs.insert(1, MacAddr::default());
        host.addrs.insert(1, vec![Ipv4Addr::LOCALHOST]);
        for i in 0..99u32 {
            host.interfaces.push(interface(&format!("veth{}", i), i + 2));
        }
        let h = harness(host);

        h.setup.configure(None).unwrap();

        let msgs = messages(&h.sink);
        let reported = msgs.iter().filter(|m| m.starts_with("interface: ")).count();
        assert_eq!(reported, MAX_INTERFACES);
        assert!(
            msgs.contains(&format!("interface list truncated to {} entries", MAX_INTERFACES))
        );
    }
}
