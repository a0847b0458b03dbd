use std::io;
use std::path::PathBuf;
use std::time::Duration;

use crate::attestation::types::TcbStatus;
use crate::inference::ModelId;
use crate::session::channel::ChannelState;
use crate::trust::RejectReason;

/// Errors from frame parsing and encoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid magic bytes: expected 0xA1C7, got 0x{0:04X}")]
    InvalidMagic(u16),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    #[error("undefined flag bits set: 0x{0:02X}")]
    UnknownFlags(u8),

    #[error("truncated frame header: {0} bytes")]
    Truncated(usize),

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: u32 },

    #[error("unknown dtype: {0}")]
    UnknownDType(u8),

    #[error("tensor shape overflow: dimensions produce more elements than representable")]
    ShapeOverflow,

    #[error("tensor data size mismatch: expected {expected} bytes, got {actual}")]
    TensorDataSizeMismatch { expected: usize, actual: usize },

    #[error("invalid tensor name: {0}")]
    InvalidTensorName(#[from] std::string::FromUtf8Error),

    #[error("incomplete tensor header")]
    IncompleteTensorHeader,

    #[error("tensor name is {0} bytes, limit is 65535")]
    TensorNameTooLong(usize),

    #[error("tensor padding contains non-zero bytes")]
    InvalidPadding,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors from cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("HKDF expand failed: invalid length")]
    HkdfExpandFailed,

    #[error("AEAD encryption failed")]
    SealFailed,

    #[error("AEAD decryption failed: ciphertext is invalid or tampered")]
    OpenFailed,

    #[error("nonce overflow: maximum sequence number reached")]
    NonceOverflow,

    #[error("sequence number replay: received {received}, expected > {expected}")]
    SequenceReplay { received: u64, expected: u64 },

    #[error("non-contributory key exchange: peer sent small-subgroup or identity point")]
    NonContributoryKey,
}

/// Detailed attestation failure causes.
///
/// These never leave the crate as-is: converting into [`Error`] logs the
/// cause at `warn` level and collapses it to [`Error::Attestation`].
#[derive(Debug, thiserror::Error)]
pub enum AttestError {
    #[error("malformed evidence: {0}")]
    Malformed(String),

    #[error("unsupported quote version {0}")]
    UnsupportedVersion(u16),

    #[error("unsupported attestation key type {0}")]
    UnsupportedKeyType(u16),

    #[error("unsupported TEE type 0x{0:08X}")]
    UnsupportedTeeType(u32),

    #[error("malformed collateral: {0}")]
    MalformedCollateral(String),

    #[error("{0} chain does not terminate at the pinned root")]
    UntrustedRoot(&'static str),

    #[error("{chain} chain validation failed: {reason}")]
    ChainInvalid { chain: &'static str, reason: String },

    #[error("PCK certificate serial {0} is revoked")]
    Revoked(String),

    #[error("TCB status {0:?} is not accepted by policy")]
    TcbStatus(TcbStatus),

    #[error("collateral expired at {next_update} (now {now})")]
    CollateralExpired { next_update: u64, now: u64 },

    #[error("{0} signature verification failed")]
    BadSignature(&'static str),

    #[error("report data does not bind this session")]
    ReportDataMismatch,

    #[error("trust decision rejected the enclave: {0}")]
    Rejected(RejectReason),

    #[error("evidence generation failed: {0}")]
    GenerationFailed(String),
}

/// Errors from session establishment and framing on the wire.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("unexpected message: expected {expected}, got {actual}")]
    UnexpectedMessage {
        expected: &'static str,
        actual: String,
    },

    #[error("session closed by peer")]
    Closed,

    #[error("received unencrypted frame in established session")]
    UnencryptedFrame,

    #[error("read buffer overflow: {size} bytes exceeds maximum")]
    ReadBufferOverflow { size: usize },

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
}

/// Top-level error type returned by every public operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Caller misuse, such as conflicting manifest sources. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("manifest parse error: {0}")]
    ManifestParse(String),

    #[error("manifest fetch error: {0}")]
    ManifestFetch(String),

    #[error("manifest not found: {}", .0.display())]
    ManifestNotFound(PathBuf),

    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("transport error: {0}")]
    Transport(String),

    /// Deliberately carries no detail. The cause is only in the logs.
    #[error("attestation failed")]
    Attestation,

    #[error("channel is {0}, expected attested")]
    ChannelState(ChannelState),

    #[error("model not found: {0}")]
    ModelNotFound(ModelId),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("response proof rejected: {0}")]
    ResponseSignature(String),
}

impl Error {
    /// Whether a caller-side retry policy may reattempt the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Unreachable(_) | Error::Transport(_) | Error::Timeout(_)
        )
    }
}

impl From<AttestError> for Error {
    fn from(cause: AttestError) -> Self {
        tracing::warn!(cause = %cause, "attestation rejected");
        Error::Attestation
    }
}

impl From<RejectReason> for Error {
    fn from(reason: RejectReason) -> Self {
        AttestError::Rejected(reason).into()
    }
}

impl From<FrameError> for Error {
    fn from(e: FrameError) -> Self {
        Error::Transport(e.to_string())
    }
}

impl From<CryptoError> for Error {
    fn from(e: CryptoError) -> Self {
        Error::Transport(e.to_string())
    }
}

impl From<SessionError> for Error {
    fn from(e: SessionError) -> Self {
        Error::Transport(e.to_string())
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
