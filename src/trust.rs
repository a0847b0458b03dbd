//! Compares a verified enclave identity with the manifest.
//!
//! Pure and stateless. Exact byte equality only: no prefixes, no case
//! folding, no "close enough".

use std::fmt;

use crate::attestation::types::VerifiedIdentity;
use crate::manifest::{ApplicationEntry, Manifest};

/// Why an enclave was not trusted. Logged, never returned to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// No manifest entry for the expected application.
    UnknownApplication,
    /// More than one entry claims the expected application.
    ConflictingEntries,
    /// The entry lists no accepted measurements.
    NoAcceptedMeasurements,
    /// No accepted measurement has the identity's length.
    MeasurementFormatMismatch,
    MeasurementNotAccepted,
    SignerMismatch,
    ProductMismatch,
    SvnTooLow,
    DebugNotAllowed,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RejectReason::UnknownApplication => "expected application not in manifest",
            RejectReason::ConflictingEntries => "manifest has conflicting entries",
            RejectReason::NoAcceptedMeasurements => "manifest accepts no measurements",
            RejectReason::MeasurementFormatMismatch => "measurement format differs from manifest",
            RejectReason::MeasurementNotAccepted => "measurement not accepted",
            RejectReason::SignerMismatch => "signer does not match",
            RejectReason::ProductMismatch => "product id does not match",
            RejectReason::SvnTooLow => "security version below minimum",
            RejectReason::DebugNotAllowed => "debug enclave not allowed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustVerdict {
    Accept(VerifiedIdentity),
    Reject(RejectReason),
}

impl TrustVerdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, TrustVerdict::Accept(_))
    }

    /// The accepted identity, or the reason as an error.
    pub fn into_result(self) -> Result<VerifiedIdentity, RejectReason> {
        match self {
            TrustVerdict::Accept(identity) => Ok(identity),
            TrustVerdict::Reject(reason) => Err(reason),
        }
    }
}

fn check_entry(identity: &VerifiedIdentity, entry: &ApplicationEntry) -> Result<(), RejectReason> {
    if entry.mr_enclave.is_empty() {
        return Err(RejectReason::NoAcceptedMeasurements);
    }
    let measurement = identity.measurement();
    if !entry
        .mr_enclave
        .iter()
        .any(|accepted| accepted.len() == measurement.len())
    {
        return Err(RejectReason::MeasurementFormatMismatch);
    }
    if !entry
        .mr_enclave
        .iter()
        .any(|accepted| accepted.as_slice() == measurement)
    {
        return Err(RejectReason::MeasurementNotAccepted);
    }

    if let Some(signer) = &entry.mr_signer {
        if signer != identity.signer() {
            return Err(RejectReason::SignerMismatch);
        }
    }
    if let Some(prod_id) = entry.isv_prod_id {
        if prod_id != identity.isv_prod_id() {
            return Err(RejectReason::ProductMismatch);
        }
    }
    if let Some(min_svn) = entry.min_isv_svn {
        if identity.isv_svn() < min_svn {
            return Err(RejectReason::SvnTooLow);
        }
    }
    if identity.debug() && !entry.allow_debug {
        return Err(RejectReason::DebugNotAllowed);
    }
    Ok(())
}

/// Accept iff the identity matches the single entry for the manifest's
/// expected application.
pub fn decide(identity: &VerifiedIdentity, manifest: &Manifest) -> TrustVerdict {
    let expected = manifest.expected_application();
    let mut entries = manifest
        .applications()
        .iter()
        .filter(|entry| entry.id == expected);

    let verdict = match (entries.next(), entries.next()) {
        (None, _) => Err(RejectReason::UnknownApplication),
        (Some(_), Some(_)) => Err(RejectReason::ConflictingEntries),
        (Some(entry), None) => check_entry(identity, entry),
    };

    match verdict {
        Ok(()) => {
            tracing::info!(
                application = expected,
                measurement = hex::encode(identity.measurement()),
                "enclave identity accepted"
            );
            TrustVerdict::Accept(identity.clone())
        }
        Err(reason) => {
            tracing::debug!(
                application = expected,
                measurement = hex::encode(identity.measurement()),
                %reason,
                "enclave identity rejected"
            );
            TrustVerdict::Reject(reason)
        }
    }
}
