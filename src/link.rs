#![allow(unreachable_patterns)]

use ftth_common::channel::{AsyncWorldClient, AsyncWorldServer};

use futures::TryStreamExt;

use std::fmt::{Debug, Display};
use std::io::{self, ErrorKind};

use rtnetlink::{LinkMessageBuilder, LinkUnspec};

pub(crate) type Client = AsyncWorldClient<RtnlLinkRequest, RtnlLinkResponse>;
pub(crate) type Server = AsyncWorldServer<RtnlLinkRequest, RtnlLinkResponse>;

/// A 6-byte link-layer (Ethernet) address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MacAddr {
    pub inner: [u8; 6],
}

impl MacAddr {
    pub const fn new(inner: [u8; 6]) -> Self {
        Self { inner }
    }
}

impl Default for MacAddr {
    fn default() -> Self {
        Self { inner: [0; 6] }
    }
}

impl Debug for MacAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&format!("MacAddr({})", self))
    }
}

impl Display for MacAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&format!(
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.inner[0],
            self.inner[1],
            self.inner[2],
            self.inner[3],
            self.inner[4],
            self.inner[5],
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub if_name: String,
    pub if_id: u32,
}

#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum RtnlLinkRequest {
    InterfaceList,
    InterfaceGetByName { if_name: String },
    MacAddrGet { if_id: u32 },
    InterfaceSetAdmin { if_id: u32, up: bool },
}

#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum RtnlLinkResponse {
    Success,
    Failed,
    NotImplemented,
    NotFound,
    InterfaceList(Vec<Interface>),
    Interface(Interface),
    MacAddr(MacAddr),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RtnlLinkClient {
    client: Client,
}

impl RtnlLinkClient {
    pub(crate) fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn interface_set_up(&self, if_id: u32) -> io::Result<()> {
        self.interface_set_admin_state(if_id, true)
    }

    pub fn interface_set_down(&self, if_id: u32) -> io::Result<()> {
        self.interface_set_admin_state(if_id, false)
    }

    pub fn interface_set_admin_state(&self, if_id: u32, up: bool) -> io::Result<()> {
        let res = self
            .client
            .send_request(RtnlLinkRequest::InterfaceSetAdmin { if_id, up })?;
        let op = if up {
            "Set interface up"
        } else {
            "Set interface down"
        };
        handle_status_response(op, res)
    }

    pub fn interface_get_by_name(&self, name: &str) -> std::io::Result<Interface> {
        let name = name.to_owned();
        let res = self
            .client
            .send_request(RtnlLinkRequest::InterfaceGetByName { if_name: name })?;
        match res {
            RtnlLinkResponse::Interface(interface) => {
                return Ok(interface);
            }
            _ => {}
        }
        Err(std::io::Error::other("Not found"))
    }

    pub fn mac_addr_get(&self, if_id: u32) -> std::io::Result<Option<MacAddr>> {
        let res = self
            .client
            .send_request(RtnlLinkRequest::MacAddrGet { if_id })?;
        match res {
            RtnlLinkResponse::MacAddr(addr) => {
                return Ok(Some(addr));
            }
            RtnlLinkResponse::NotFound => {
                return Ok(None);
            }
            _ => {}
        }
        Err(std::io::Error::other("Failed to get hardware address"))
    }

    pub fn interface_list(&self) -> std::io::Result<Vec<Interface>> {
        let res = self.client.send_request(RtnlLinkRequest::InterfaceList)?;
        match res {
            RtnlLinkResponse::InterfaceList(list) => {
                return Ok(list);
            }
            _ => {}
        }
        Err(std::io::Error::other("Failed to list interfaces"))
    }
}

fn handle_status_response(op: &str, response: RtnlLinkResponse) -> io::Result<()> {
    match response {
        RtnlLinkResponse::Success => Ok(()),
        RtnlLinkResponse::NotFound => Err(io::Error::new(
            ErrorKind::NotFound,
            format!("{}: interface not found", op),
        )),
        RtnlLinkResponse::Failed => Err(io::Error::other(format!("{} failed", op))),
        RtnlLinkResponse::NotImplemented => Err(io::Error::new(
            ErrorKind::Unsupported,
            format!("{} not implemented", op),
        )),
        other => Err(io::Error::other(format!(
            "{} returned unexpected response: {:?}",
            op, other
        ))),
    }
}

async fn apply_link_set<F>(
    handle: &rtnetlink::LinkHandle,
    if_id: u32,
    op: F,
) -> Result<(), rtnetlink::Error>
where
    F: FnOnce(LinkMessageBuilder<LinkUnspec>) -> LinkMessageBuilder<LinkUnspec>,
{
    let builder = LinkMessageBuilder::<LinkUnspec>::new().index(if_id);
    let message = op(builder).build();
    handle.set(message).execute().await
}

fn map_link_result(result: Result<(), rtnetlink::Error>, op: &str, if_id: u32) -> RtnlLinkResponse {
    match result {
        Ok(()) => RtnlLinkResponse::Success,
        Err(rtnetlink::Error::NetlinkError(err_msg)) => {
            let io_err = err_msg.to_io();
            if io_err.kind() == ErrorKind::NotFound {
                RtnlLinkResponse::NotFound
            } else {
                log::warn!("Failed to {} for ifindex {}: {}", op, if_id, io_err);
                RtnlLinkResponse::Failed
            }
        }
        Err(err) => {
            log::warn!("Failed to {} for ifindex {}: {}", op, if_id, err);
            RtnlLinkResponse::Failed
        }
    }
}

pub(crate) async fn run_server(mut server: Server, mut handle: rtnetlink::LinkHandle) {
    'reqloop: while let Some((req, respond)) = server.accept().await {
        match req {
            RtnlLinkRequest::InterfaceGetByName { if_name } => {
                let response = handle.get().match_name(if_name.to_owned()).execute();
                futures::pin_mut!(response);
                while let Ok(Some(response)) = response.try_next().await {
                    let if_index = response.header.index;
                    if if_index == 0 {
                        continue;
                    }

                    respond(RtnlLinkResponse::Interface(Interface {
                        if_id: if_index,
                        if_name: if_name.to_owned(),
                    }));
                    continue 'reqloop;
                }
                respond(RtnlLinkResponse::NotFound);
            }
            RtnlLinkRequest::MacAddrGet { if_id } => {
                if if_id == 0 {
                    respond(RtnlLinkResponse::NotFound);
                    continue 'reqloop;
                }
                let response = handle.get().match_index(if_id).execute();
                futures::pin_mut!(response);
                while let Ok(Some(response)) = response.try_next().await {
                    for link in response.attributes.iter() {
                        match link {
                            netlink_packet_route::link::LinkAttribute::Address(addr) => {
                                respond(RtnlLinkResponse::MacAddr(MacAddr::new(
                                    addr[0..6].try_into().unwrap_or([0; 6]),
                                )));
                                continue 'reqloop;
                            }
                            _ => {}
                        }
                    }
                }
                respond(RtnlLinkResponse::NotFound);
            }
            RtnlLinkRequest::InterfaceList => {
                let mut interfaces = Vec::new();
                let response = handle.get().execute();
                futures::pin_mut!(response);
                while let Ok(Some(response)) = response.try_next().await {
                    let if_index = response.header.index;
                    let mut if_name = None;
                    for link in response.attributes.iter() {
                        match link {
                            netlink_packet_route::link::LinkAttribute::IfName(name) => {
                                if_name = Some(name.clone());
                            }
                            _ => {}
                        }
                    }

                    if if_index == 0 || if_name.is_none() {
                        continue;
                    }

                    interfaces.push(Interface {
                        if_id: if_index,
                        if_name: if_name.unwrap(),
                    });
                }
                respond(RtnlLinkResponse::InterfaceList(interfaces));
            }
            RtnlLinkRequest::InterfaceSetAdmin { if_id, up } => {
                if if_id == 0 {
                    respond(RtnlLinkResponse::NotFound);
                    continue 'reqloop;
                }

                let op_desc = if up {
                    "set interface up"
                } else {
                    "set interface down"
                };
                let result = apply_link_set(&handle, if_id, |builder| {
                    if up { builder.up() } else { builder.down() }
                })
                .await;

                respond(map_link_result(result, op_desc, if_id));
            }
            _ => respond(RtnlLinkResponse::NotImplemented),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_addr_formats_lowercase_colon_hex() {
        let mac = MacAddr::new([0xde, 0xad, 0xbe, 0xef, 0x00, 0x1a]);
        assert_eq!(mac.to_string(), "de:ad:be:ef:00:1a");
    }

    #[test]
    fn mac_addr_default_is_all_zero() {
        assert_eq!(MacAddr::default().to_string(), "00:00:00:00:00:00");
    }

    #[test]
    fn status_response_maps_not_found() {
        let err =
            handle_status_response("Set interface up", RtnlLinkResponse::NotFound).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
