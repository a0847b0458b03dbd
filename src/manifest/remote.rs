use std::time::Duration;

use async_trait::async_trait;
use ed25519_dalek::{Signature, VerifyingKey};

use crate::error::{Error, Result};

/// A manifest published at `url`, with a detached Ed25519 signature at
/// `<url>.sig` (hex) made by `publisher_key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteManifest {
    pub url: String,
    pub publisher_key: [u8; 32],
}

/// Downloads manifest documents. Failures are [`Error::ManifestFetch`].
#[async_trait]
pub trait ManifestFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// Fetches over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpManifestFetcher {
    client: reqwest::Client,
}

impl HttpManifestFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ManifestFetcher for HttpManifestFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::ManifestFetch(format!("{url}: {e}")))?;
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::ManifestFetch(format!("{url}: {e}")))?;
        Ok(body.to_vec())
    }
}

/// Download the manifest and its signature, and check the signature.
pub(crate) async fn fetch_verified(
    remote: &RemoteManifest,
    fetcher: &dyn ManifestFetcher,
) -> Result<String> {
    let publisher = VerifyingKey::from_bytes(&remote.publisher_key)
        .map_err(|_| Error::Configuration("manifest publisher key is not a valid point".into()))?;

    let signature_url = format!("{}.sig", remote.url);
    let (body, signature) = tokio::try_join!(
        fetcher.fetch(&remote.url),
        fetcher.fetch(&signature_url),
    )?;

    let signature = std::str::from_utf8(&signature)
        .ok()
        .and_then(|text| hex::decode(text.trim()).ok())
        .and_then(|bytes| Signature::from_slice(&bytes).ok())
        .ok_or_else(|| Error::ManifestFetch("manifest signature is not valid hex Ed25519".into()))?;

    publisher.verify_strict(&body, &signature).map_err(|_| {
        tracing::warn!(url = %remote.url, "remote manifest signature does not verify");
        Error::ManifestFetch("manifest signature does not verify".into())
    })?;

    String::from_utf8(body).map_err(|_| Error::ManifestFetch("manifest is not UTF-8".into()))
}
