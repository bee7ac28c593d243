//! DNS server lifecycle management.

use hickory_server::ServerFuture;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::DnsConfig;
use crate::error::Error;
use crate::resolver::DnsHandler;

/// UDP DNS server answering from the published network snapshot.
pub struct DnsServer {
    config: DnsConfig,
    handler: DnsHandler,
}

impl DnsServer {
    /// Create a server for the given configuration and handler.
    pub fn new(config: DnsConfig, handler: DnsHandler) -> Self {
        Self { config, handler }
    }

    /// Bind the UDP socket and serve queries until cancellation.
    pub async fn run(self, token: CancellationToken) -> Result<(), Error> {
        let socket = UdpSocket::bind(self.config.listen_addr).await?;
        info!(addr = %self.config.listen_addr, "DNS UDP listening");

        let mut server = ServerFuture::new(self.handler);
        server.register_socket(socket);

        tokio::select! {
            _ = token.cancelled() => {
                info!("DNS server shutdown requested");
            }
            result = server.block_until_done() => {
                if let Err(err) = result {
                    error!(%err, "DNS server error");
                    return Err(err.into());
                }
            }
        }

        info!("DNS server stopped");
        Ok(())
    }
}
