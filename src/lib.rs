pub mod address;
pub mod link;
pub mod logger;
pub mod setup;

pub use ipnet::Ipv4Net;
pub use link::{Interface, MacAddr};
pub use logger::{DiagLogger, LogSink, Role, StdoutSink};
pub use setup::{DEFAULT_EXTERNAL_IF, IfSetup, MAX_INTERFACES, SetupError};

use ftth_common::channel::create_pair;

use futures::{FutureExt, future::join_all};

#[derive(Debug, Clone)]
pub struct RtnlClient {
    address: address::RtnlAddressClient,
    link: link::RtnlLinkClient,
}

impl RtnlClient {
    pub fn new() -> Self {
        let (address_tx, address_rx) = create_pair();
        let (link_tx, link_rx) = create_pair();

        std::thread::spawn(move || {
            let rt = match tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    log::error!("Tokio runtime building error: {}", e);
                    return;
                }
            };

            let _ = rt.block_on(async {
                #[allow(unused_variables)]
                let (connection, handle, receiver) = rtnetlink::new_connection()?;

                tokio::spawn(connection);

                let mut futures = Vec::new();
                futures.push(address::run_server(address_rx, handle.address()).boxed());
                futures.push(link::run_server(link_rx, handle.link()).boxed());

                join_all(futures).await;

                Ok::<(), std::io::Error>(())
            });
        });

        Self {
            address: address::RtnlAddressClient::new(address_tx),
            link: link::RtnlLinkClient::new(link_tx),
        }
    }

    pub fn address(&self) -> address::RtnlAddressClient {
        self.address.clone()
    }

    pub fn link(&self) -> link::RtnlLinkClient {
        self.link.clone()
    }
}

impl Default for RtnlClient {
    fn default() -> Self {
        Self::new()
    }
}
