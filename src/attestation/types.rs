use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use sha2::{Digest, Sha256};

use crate::error::AttestError;

/// Current collateral bundle format.
pub const COLLATERAL_VERSION: u16 = 1;

/// Raw quote bytes as delivered by the enclave. Opaque until verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestationEvidence {
    raw: Vec<u8>,
}

impl AttestationEvidence {
    pub fn new(raw: Vec<u8>) -> Self {
        Self { raw }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// SHA-256 of the raw evidence, used for transcript binding and logs.
    pub fn hash(&self) -> [u8; 32] {
        Sha256::digest(&self.raw).into()
    }
}

/// Certificates and TCB information needed to validate a quote's signer.
///
/// Certificate chains are DER encoded, leaf first and root last.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collateral {
    pub version: u16,
    pub pck_chain: Vec<ByteBuf>,
    /// JSON encoded [`TcbInfo`], signed as raw bytes.
    pub tcb_info: ByteBuf,
    /// DER ECDSA signature over `SHA-256(tcb_info)`.
    pub tcb_info_signature: ByteBuf,
    pub tcb_signing_chain: Vec<ByteBuf>,
}

impl Collateral {
    pub fn to_cbor(&self) -> Result<Vec<u8>, AttestError> {
        let mut out = Vec::new();
        ciborium::ser::into_writer(self, &mut out)
            .map_err(|e| AttestError::MalformedCollateral(format!("CBOR encode: {e}")))?;
        Ok(out)
    }

    pub fn from_cbor(bytes: &[u8]) -> Result<Self, AttestError> {
        ciborium::de::from_reader(bytes)
            .map_err(|e| AttestError::MalformedCollateral(format!("CBOR decode: {e}")))
    }
}

/// Platform TCB level reported by the collateral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TcbStatus {
    UpToDate,
    SwHardeningNeeded,
    ConfigurationNeeded,
    OutOfDate,
    Revoked,
}

/// Signed TCB information carried inside [`Collateral`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TcbInfo {
    pub version: u32,
    /// Unix seconds.
    pub issue_date: u64,
    /// Unix seconds after which the collateral is stale.
    pub next_update: u64,
    pub tcb_status: TcbStatus,
    /// Revoked PCK certificate serial numbers, hex encoded.
    #[serde(default)]
    pub revoked_serials: Vec<String>,
}

/// Which TCB levels are good enough to talk to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcbPolicy {
    accepted: Vec<TcbStatus>,
}

impl Default for TcbPolicy {
    fn default() -> Self {
        Self {
            accepted: vec![TcbStatus::UpToDate, TcbStatus::SwHardeningNeeded],
        }
    }
}

impl TcbPolicy {
    /// Only fully patched platforms.
    pub fn strict() -> Self {
        Self {
            accepted: vec![TcbStatus::UpToDate],
        }
    }

    pub fn with_accepted(accepted: Vec<TcbStatus>) -> Self {
        Self { accepted }
    }

    /// `Revoked` is never accepted, whatever the list says.
    pub fn accepts(&self, status: TcbStatus) -> bool {
        status != TcbStatus::Revoked && self.accepted.contains(&status)
    }
}

/// Identity claims extracted from evidence that passed verification.
///
/// Only the verifier can construct one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    measurement: Vec<u8>,
    signer: [u8; 32],
    isv_prod_id: u16,
    isv_svn: u16,
    debug: bool,
    report_data: [u8; 64],
    evidence_hash: [u8; 32],
    tcb_status: Option<TcbStatus>,
    simulated: bool,
}

#[allow(clippy::too_many_arguments)]
impl VerifiedIdentity {
    pub(crate) fn new(
        measurement: Vec<u8>,
        signer: [u8; 32],
        isv_prod_id: u16,
        isv_svn: u16,
        debug: bool,
        report_data: [u8; 64],
        evidence_hash: [u8; 32],
        tcb_status: Option<TcbStatus>,
        simulated: bool,
    ) -> Self {
        Self {
            measurement,
            signer,
            isv_prod_id,
            isv_svn,
            debug,
            report_data,
            evidence_hash,
            tcb_status,
            simulated,
        }
    }

    /// Enclave code measurement (MRENCLAVE).
    pub fn measurement(&self) -> &[u8] {
        &self.measurement
    }

    /// Enclave signer measurement (MRSIGNER).
    pub fn signer(&self) -> &[u8; 32] {
        &self.signer
    }

    pub fn isv_prod_id(&self) -> u16 {
        self.isv_prod_id
    }

    pub fn isv_svn(&self) -> u16 {
        self.isv_svn
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn report_data(&self) -> &[u8; 64] {
        &self.report_data
    }

    pub fn evidence_hash(&self) -> &[u8; 32] {
        &self.evidence_hash
    }

    /// `None` when the evidence was accepted in simulation mode.
    pub fn tcb_status(&self) -> Option<TcbStatus> {
        self.tcb_status
    }

    /// True when no hardware signature was checked.
    pub fn simulated(&self) -> bool {
        self.simulated
    }
}
