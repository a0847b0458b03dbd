pub mod attestation;
pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod frame;
pub mod inference;
pub mod manifest;
pub mod session;
pub mod transport;
pub mod trust;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

// Re-export key types at crate root for convenience.
pub use error::{Error, Result};

#[cfg(feature = "tcp")]
pub use client::connect;
pub use client::connect_with;
pub use config::{ClientConfig, ClientConfigBuilder, ConnectOptions};
pub use session::{ChannelOptions, ChannelState, ConfidentialChannel, RetryPolicy};

pub use attestation::dcap::DcapVerifier;
pub use attestation::types::{
    AttestationEvidence, Collateral, TcbPolicy, TcbStatus, VerifiedIdentity,
};
pub use attestation::{AttestationProvider, AttestationVerifier};

pub use inference::{DType, InferenceResult, ModelId, ResponseProof, RunOptions, Tensor};
pub use manifest::{ApplicationEntry, Manifest, ManifestFetcher, ManifestSource, RemoteManifest};
pub use transport::Connector;
pub use trust::{RejectReason, TrustVerdict};
