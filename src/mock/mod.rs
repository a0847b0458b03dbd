//! Software enclave and synthetic attestation platform for tests and local
//! development. Nothing here provides any security.

pub mod enclave;
pub mod platform;
pub mod runtime;

pub use enclave::MockEnclave;
pub use platform::{PlatformConfig, SyntheticPlatform};
pub use runtime::EchoRuntime;

use std::sync::Arc;

use async_trait::async_trait;

use crate::transport::{BoxedStream, Connector};

/// Connector that runs a [`MockEnclave`] on the far end of an in-memory pipe.
pub struct DuplexConnector {
    enclave: Arc<MockEnclave>,
}

impl DuplexConnector {
    pub fn new(enclave: Arc<MockEnclave>) -> Self {
        Self { enclave }
    }
}

#[async_trait]
impl Connector for DuplexConnector {
    async fn connect(&self, endpoint: &str) -> std::io::Result<BoxedStream> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let enclave = Arc::clone(&self.enclave);
        let endpoint = endpoint.to_string();
        tokio::spawn(async move {
            if let Err(e) = enclave.serve(server).await {
                tracing::debug!(%endpoint, error = %e, "mock enclave connection ended");
            }
        });
        Ok(Box::new(client))
    }
}
