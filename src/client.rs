//! Connection establishment: manifest, evidence, verification, trust
//! decision and channel binding, in that order.

use crate::attestation::dcap::DcapVerifier;
use crate::attestation::types::Collateral;
use crate::attestation::AttestationVerifier;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::manifest::{self, ManifestFetcher};
use crate::session::handshake::{fetch_evidence, PendingSession};
use crate::session::retry::with_retry;
use crate::session::{ChannelOptions, ConfidentialChannel};
use crate::transport::Connector;
use crate::trust;

/// Connect to `config.endpoint` over TCP and return an attested channel.
///
/// Remote manifests are fetched over HTTPS.
#[cfg(feature = "tcp")]
pub async fn connect(config: &ClientConfig) -> Result<ConfidentialChannel> {
    let fetcher = manifest::HttpManifestFetcher::new(config.handshake_timeout)?;
    connect_with(config, &crate::transport::tcp::TcpConnector, &fetcher).await
}

/// Connect using caller-supplied transport and manifest fetcher.
///
/// The channel is only returned once the enclave's evidence has verified,
/// the manifest has accepted its identity and the session keys are bound to
/// that evidence. Any attestation failure surfaces as the opaque
/// [`Error::Attestation`]; the cause is logged.
pub async fn connect_with(
    config: &ClientConfig,
    connector: &dyn Connector,
    fetcher: &dyn ManifestFetcher,
) -> Result<ConfidentialChannel> {
    let verifier = build_verifier(config)?;
    if config.allow_unattested_transport {
        tracing::warn!(
            endpoint = %config.endpoint,
            "UNSAFE: evidence will not be bound to the channel (allow_unattested_transport)"
        );
    }

    let (manifest, pending) = tokio::try_join!(
        manifest::resolve(&config.manifest, fetcher),
        fetch_with_retry(config, connector),
    )?;

    let collateral = Collateral::from_cbor(pending.collateral_bytes())?;
    let identity = verifier.verify(pending.evidence(), &collateral)?;
    let identity = trust::decide(&identity, &manifest).into_result()?;

    let options = ChannelOptions {
        request_timeout: config.request_timeout,
        max_payload_size: config.max_payload_size,
        allow_unattested_transport: config.allow_unattested_transport,
    };
    tokio::time::timeout(
        config.handshake_timeout,
        ConfidentialChannel::establish(pending, identity, &options),
    )
    .await
    .map_err(|_| Error::Timeout(config.handshake_timeout))?
}

fn build_verifier(config: &ClientConfig) -> Result<DcapVerifier> {
    if config.simulation_mode {
        return Ok(DcapVerifier::simulation());
    }
    let root = config.trust_root_pem.as_deref().ok_or_else(|| {
        Error::Configuration("a trust root certificate is required outside simulation mode".into())
    })?;
    DcapVerifier::new(root, config.tcb_policy.clone())
        .map_err(|e| Error::Configuration(format!("invalid trust root: {e}")))
}

async fn fetch_with_retry(config: &ClientConfig, connector: &dyn Connector) -> Result<PendingSession> {
    let attempt = move || async move {
        tokio::time::timeout(
            config.handshake_timeout,
            fetch_evidence(connector, &config.endpoint, config.max_payload_size),
        )
        .await
        .map_err(|_| Error::Timeout(config.handshake_timeout))?
    };

    match &config.retry_policy {
        Some(policy) => {
            with_retry(policy, |e: &Error| matches!(e, Error::Unreachable(_)), attempt).await
        }
        None => attempt().await,
    }
}
