//! Module providing a [`Connector`](super::Connector) over TCP.

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct TcpConnector {
    pub nodelay: bool,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self { nodelay: true }
    }
}

#[async_trait]
impl super::Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, address: &str) -> std::io::Result<Self::Stream> {
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(self.nodelay)?;

        debug!(address, "tcp connection established");

        Ok(stream)
    }
}
