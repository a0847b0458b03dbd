use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use super::{BoxedStream, Connector};

/// Connects over plain TCP. Confidentiality comes from the sealed channel on top.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &str) -> std::io::Result<BoxedStream> {
        let stream = TcpStream::connect(endpoint).await?;
        stream.set_nodelay(true)?;
        tracing::debug!(endpoint, "tcp connection established");
        Ok(Box::new(stream))
    }
}

/// Accept a single connection from a listener.
pub async fn accept(listener: &TcpListener) -> std::io::Result<TcpStream> {
    let (stream, peer) = listener.accept().await?;
    stream.set_nodelay(true)?;
    tracing::debug!(%peer, "tcp connection accepted");
    Ok(stream)
}
