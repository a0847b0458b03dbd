pub mod dcap;
pub mod quote;
pub mod types;

use async_trait::async_trait;

use crate::error::AttestError;
use types::{AttestationEvidence, Collateral, VerifiedIdentity};

/// Produces evidence binding caller-chosen report data (runs inside the enclave).
#[async_trait]
pub trait AttestationProvider: Send + Sync {
    async fn attest(
        &self,
        report_data: &[u8; 64],
    ) -> Result<(AttestationEvidence, Collateral), AttestError>;
}

/// Validates evidence against its collateral (runs on the client).
///
/// Implementations must be pure: no I/O, no shared mutable state.
pub trait AttestationVerifier: Send + Sync {
    fn verify(
        &self,
        evidence: &AttestationEvidence,
        collateral: &Collateral,
    ) -> Result<VerifiedIdentity, AttestError>;
}
