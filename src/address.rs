#![allow(unreachable_patterns)]

use std::io::{self, ErrorKind};
use std::net::{IpAddr, Ipv4Addr};

use futures::TryStreamExt;

use ftth_common::channel::{AsyncWorldClient, AsyncWorldServer};

pub(crate) type Client = AsyncWorldClient<RtnlAddressRequest, RtnlAddressResponse>;
pub(crate) type Server = AsyncWorldServer<RtnlAddressRequest, RtnlAddressResponse>;

#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum RtnlAddressRequest {
    Ipv4AddrsGet { if_id: u32 },
    Ipv4AddrSet { prefix: crate::Ipv4Net, if_id: u32 },
}

#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum RtnlAddressResponse {
    Success,
    Failed,
    NotImplemented,
    NotFound,
    Ipv4Addrs(Vec<Ipv4Addr>),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RtnlAddressClient {
    client: Client,
}

impl RtnlAddressClient {
    pub(crate) fn new(client: Client) -> Self {
        Self { client }
    }

    /// Addresses on one interface, or every IPv4 address on the host when
    /// `if_id` is `None`.
    pub fn ipv4_addrs_get(&self, if_id: Option<u32>) -> std::io::Result<Vec<Ipv4Addr>> {
        let res = self.client.send_request(RtnlAddressRequest::Ipv4AddrsGet {
            if_id: if_id.unwrap_or(0),
        })?;
        match res {
            RtnlAddressResponse::Ipv4Addrs(addrs) => {
                return Ok(addrs);
            }
            _ => {}
        }
        Err(std::io::Error::other("Failed to get IPv4 addresses"))
    }

    /// Idempotent: assigning an address that is already present succeeds.
    pub fn ipv4_addr_set(&self, if_id: u32, prefix: crate::Ipv4Net) -> io::Result<()> {
        let res = self
            .client
            .send_request(RtnlAddressRequest::Ipv4AddrSet { prefix, if_id })?;
        handle_basic_response("IPv4 address set", res)
    }
}

fn handle_basic_response(operation: &str, response: RtnlAddressResponse) -> io::Result<()> {
    match response {
        RtnlAddressResponse::Success => Ok(()),
        RtnlAddressResponse::Failed => {
            Err(io::Error::other(format!("{} request failed", operation)))
        }
        RtnlAddressResponse::NotImplemented => Err(io::Error::new(
            ErrorKind::Unsupported,
            format!("{} request is not implemented", operation),
        )),
        RtnlAddressResponse::NotFound => Err(io::Error::new(
            ErrorKind::NotFound,
            format!("{} not found", operation),
        )),
        unexpected => Err(io::Error::other(format!(
            "{} returned unexpected response: {:?}",
            operation, unexpected
        ))),
    }
}

pub(crate) async fn run_server(mut server: Server, handle: rtnetlink::AddressHandle) {
    while let Some((req, respond)) = server.accept().await {
        match req {
            RtnlAddressRequest::Ipv4AddrsGet { if_id } => {
                let if_index = if_id;
                let mut addrs = Vec::new();
                let mut req = handle.get();
                if if_index != 0 {
                    req = req.set_link_index_filter(if_index);
                }
                let response = req.execute();

                futures::pin_mut!(response);
                while let Ok(Some(response)) = response.try_next().await {
                    if response.header.family != netlink_packet_route::AddressFamily::Inet {
                        continue;
                    }
                    for addr in response.attributes.iter() {
                        if let netlink_packet_route::address::AddressAttribute::Address(
                            std::net::IpAddr::V4(addr),
                        ) = addr
                        {
                            addrs.push(*addr);
                        }
                    }
                }
                respond(RtnlAddressResponse::Ipv4Addrs(addrs));
            }
            RtnlAddressRequest::Ipv4AddrSet { prefix, if_id } => {
                if if_id == 0 {
                    respond(RtnlAddressResponse::Failed);
                    continue;
                }

                let addr = prefix.addr();
                let prefix_len = prefix.prefix_len();
                let result = handle
                    .add(if_id, IpAddr::V4(addr), prefix_len)
                    .execute()
                    .await;

                match result {
                    Ok(()) => respond(RtnlAddressResponse::Success),
                    Err(rtnetlink::Error::NetlinkError(err_msg))
                        if err_msg.to_io().kind() == ErrorKind::AlreadyExists =>
                    {
                        respond(RtnlAddressResponse::Success);
                    }
                    Err(err) => {
                        log::warn!(
                            "Failed to add IPv4 address {}/{} on ifindex {}: {}",
                            addr,
                            prefix_len,
                            if_id,
                            err,
                        );
                        respond(RtnlAddressResponse::Failed);
                    }
                }
            }
            _ => respond(RtnlAddressResponse::NotImplemented),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_response_success() {
        assert!(handle_basic_response("IPv4 address set", RtnlAddressResponse::Success).is_ok());
    }

    #[test]
    fn basic_response_failed_is_other() {
        let err = handle_basic_response("IPv4 address set", RtnlAddressResponse::Failed)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Other);
    }
}
