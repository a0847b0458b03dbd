//! Confidential inference requests, issued over an attested channel.

pub mod protocol;
pub mod tensor;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::Error;

pub use tensor::{DType, Tensor};

/// Content hash (SHA-256) identifying a model registered in the enclave.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModelId([u8; 32]);

impl ModelId {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Id of a serialized model: the SHA-256 of its bytes.
    pub fn from_model_bytes(model: &[u8]) -> Self {
        Self(Sha256::digest(model).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModelId({self})")
    }
}

impl FromStr for ModelId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| Error::Configuration(format!("invalid model id {s:?}: {e}")))?;
        Ok(Self(bytes))
    }
}

/// Per-call knobs for [`ConfidentialChannel::run_with`](crate::ConfidentialChannel::run_with).
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Overrides the channel's default request timeout.
    pub timeout: Option<Duration>,
    /// Ask the enclave for a signed proof binding inputs to outputs.
    pub sign: bool,
}

impl RunOptions {
    pub fn signed() -> Self {
        Self {
            sign: true,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Enclave signature binding a request's inputs to its outputs.
///
/// Already verified against the attested response key when handed out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseProof {
    pub(crate) payload: Vec<u8>,
    pub(crate) signature: [u8; 64],
    pub(crate) input_hash: [u8; 32],
    pub(crate) output_hash: [u8; 32],
}

impl ResponseProof {
    /// The signed CBOR payload, suitable for archiving alongside the signature.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Ed25519 signature over [`payload`](Self::payload).
    pub fn signature(&self) -> &[u8; 64] {
        &self.signature
    }

    pub fn input_hash(&self) -> &[u8; 32] {
        &self.input_hash
    }

    pub fn output_hash(&self) -> &[u8; 32] {
        &self.output_hash
    }
}

/// Outputs of one inference call.
#[derive(Debug, Clone)]
pub struct InferenceResult {
    pub outputs: Vec<Tensor>,
    /// Present when [`RunOptions::sign`] was set.
    pub proof: Option<ResponseProof>,
}

/// Failure reported by a model runtime.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    #[error("model not found")]
    ModelNotFound,

    #[error("{0}")]
    Failed(String),
}

/// The model runtime hosted inside the enclave.
///
/// The client never implements this; it exists so enclave-side code (and the
/// test enclave) can plug a runtime behind the channel.
#[async_trait]
pub trait ModelRuntime: Send + Sync {
    async fn run(&self, model_id: &ModelId, inputs: Vec<Tensor>)
        -> Result<Vec<Tensor>, RuntimeError>;

    async fn delete(&self, model_id: &ModelId) -> Result<(), RuntimeError> {
        let _ = model_id;
        Err(RuntimeError::Failed("model deletion not supported".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_id_hex_roundtrip() {
        let id = ModelId::from_model_bytes(b"onnx graph bytes");
        let parsed: ModelId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(id.to_string().len(), 64);
    }

    #[test]
    fn model_id_rejects_bad_hex() {
        assert!(matches!(
            "abc".parse::<ModelId>(),
            Err(Error::Configuration(_))
        ));
        assert!("zz".repeat(32).parse::<ModelId>().is_err());
    }
}
