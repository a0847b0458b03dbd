use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::attestation::types::TcbPolicy;
use crate::error::{Error, Result};
use crate::frame::MAX_PAYLOAD_SIZE;
use crate::manifest::{ManifestSource, RemoteManifest};
use crate::session::RetryPolicy;

/// Raw connect options, as they appear in a config file or on a command line.
///
/// Unknown fields are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ConnectOptions {
    pub endpoint: String,
    /// Mutually exclusive with `use_remote_manifest`.
    pub local_manifest_path: Option<PathBuf>,
    pub use_remote_manifest: bool,
    pub remote_manifest_url: Option<String>,
    /// Hex Ed25519 key the remote manifest must be signed with.
    pub remote_manifest_publisher_key: Option<String>,
    /// PEM file with the pinned attestation root certificate.
    pub trust_root_path: Option<PathBuf>,
    /// UNSAFE, debugging only: skip binding the evidence to the session.
    pub allow_unattested_transport: bool,
    /// UNSAFE, local testing only: skip every hardware check.
    pub simulation_mode: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            endpoint: "127.0.0.1:50051".into(),
            local_manifest_path: None,
            use_remote_manifest: false,
            remote_manifest_url: None,
            remote_manifest_publisher_key: None,
            trust_root_path: None,
            allow_unattested_transport: false,
            simulation_mode: false,
        }
    }
}

/// Validated configuration for [`connect`](crate::connect).
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: String,
    pub manifest: ManifestSource,
    /// PEM root certificate every PCK and TCB signing chain must end in.
    /// Required unless `simulation_mode` is set.
    pub trust_root_pem: Option<Vec<u8>>,
    pub tcb_policy: TcbPolicy,
    /// Bound on the evidence fetch and on key confirmation (default: 30s).
    pub handshake_timeout: Duration,
    /// Default per-request timeout (default: 60s).
    pub request_timeout: Duration,
    /// Maximum frame payload in bytes (default: 32 MiB).
    pub max_payload_size: u32,
    /// Retries for unreachable endpoints during the evidence fetch.
    pub retry_policy: Option<RetryPolicy>,
    pub allow_unattested_transport: bool,
    pub simulation_mode: bool,
}

impl ClientConfig {
    pub fn builder(endpoint: impl Into<String>) -> ClientConfigBuilder {
        ClientConfigBuilder::new(endpoint)
    }

    /// Validate raw options. Conflicting manifest sources are rejected
    /// before any file is read.
    pub fn from_options(options: ConnectOptions) -> Result<Self> {
        let remote = match (&options.remote_manifest_url, &options.remote_manifest_publisher_key)
        {
            (Some(url), Some(key)) => {
                let mut publisher_key = [0u8; 32];
                hex::decode_to_slice(key.trim(), &mut publisher_key).map_err(|e| {
                    Error::Configuration(format!("invalid remote_manifest_publisher_key: {e}"))
                })?;
                Some(RemoteManifest {
                    url: url.clone(),
                    publisher_key,
                })
            }
            (None, None) => None,
            _ => {
                return Err(Error::Configuration(
                    "remote_manifest_url and remote_manifest_publisher_key must be set together"
                        .into(),
                ))
            }
        };
        let manifest = ManifestSource::from_options(
            options.local_manifest_path,
            options.use_remote_manifest,
            remote,
        )?;

        let mut builder = ClientConfigBuilder::new(options.endpoint)
            .manifest(manifest)
            .allow_unattested_transport(options.allow_unattested_transport)
            .simulation_mode(options.simulation_mode);

        if let Some(path) = options.trust_root_path {
            let pem = std::fs::read(&path).map_err(|e| {
                Error::Configuration(format!("failed to read trust root {}: {e}", path.display()))
            })?;
            builder = builder.trust_root_pem(pem);
        }

        builder.build()
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug, Clone)]
pub struct ClientConfigBuilder {
    endpoint: String,
    manifest: ManifestSource,
    trust_root_pem: Option<Vec<u8>>,
    tcb_policy: TcbPolicy,
    handshake_timeout: Duration,
    request_timeout: Duration,
    max_payload_size: u32,
    retry_policy: Option<RetryPolicy>,
    allow_unattested_transport: bool,
    simulation_mode: bool,
}

impl ClientConfigBuilder {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            manifest: ManifestSource::Default,
            trust_root_pem: None,
            tcb_policy: TcbPolicy::default(),
            handshake_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
            max_payload_size: MAX_PAYLOAD_SIZE,
            retry_policy: None,
            allow_unattested_transport: false,
            simulation_mode: false,
        }
    }

    pub fn manifest(mut self, source: ManifestSource) -> Self {
        self.manifest = source;
        self
    }

    pub fn trust_root_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.trust_root_pem = Some(pem.into());
        self
    }

    pub fn tcb_policy(mut self, policy: TcbPolicy) -> Self {
        self.tcb_policy = policy;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn max_payload_size(mut self, size: u32) -> Self {
        self.max_payload_size = size;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// UNSAFE: accept evidence that is not bound to this session.
    pub fn allow_unattested_transport(mut self, allow: bool) -> Self {
        self.allow_unattested_transport = allow;
        self
    }

    /// UNSAFE: accept evidence without checking any hardware signature.
    pub fn simulation_mode(mut self, enabled: bool) -> Self {
        self.simulation_mode = enabled;
        self
    }

    pub fn build(self) -> Result<ClientConfig> {
        if self.endpoint.trim().is_empty() {
            return Err(Error::Configuration("endpoint must not be empty".into()));
        }
        if self.handshake_timeout.is_zero() {
            return Err(Error::Configuration("handshake_timeout must be > 0".into()));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::Configuration("request_timeout must be > 0".into()));
        }
        if self.max_payload_size == 0 {
            return Err(Error::Configuration("max_payload_size must be > 0".into()));
        }
        if self.trust_root_pem.is_none() && !self.simulation_mode {
            return Err(Error::Configuration(
                "a trust root certificate is required outside simulation mode".into(),
            ));
        }
        Ok(ClientConfig {
            endpoint: self.endpoint,
            manifest: self.manifest,
            trust_root_pem: self.trust_root_pem,
            tcb_policy: self.tcb_policy,
            handshake_timeout: self.handshake_timeout,
            request_timeout: self.request_timeout,
            max_payload_size: self.max_payload_size,
            retry_policy: self.retry_policy,
            allow_unattested_transport: self.allow_unattested_transport,
            simulation_mode: self.simulation_mode,
        })
    }
}
