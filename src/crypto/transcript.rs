use sha2::{Digest, Sha256};

use super::PublicKey;
use crate::frame::PROTOCOL_VERSION;

/// Everything both sides hash into the session transcript.
pub struct TranscriptInputs<'a> {
    pub evidence_hash: &'a [u8; 32],
    pub report_data: &'a [u8; 64],
    pub client_public: &'a PublicKey,
    pub enclave_public: &'a PublicKey,
    pub client_nonce: &'a [u8; 32],
    pub enclave_held: &'a [u8],
}

/// Compute the transcript hash binding the session keys to the attested evidence.
///
/// `SHA256("aic-transcript-v1" || evidence_hash || report_data || client_pk || enclave_pk || nonce || len(held) || held || version)`
pub fn compute_transcript(inputs: &TranscriptInputs<'_>) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"aic-transcript-v1");
    hasher.update(inputs.evidence_hash);
    hasher.update(inputs.report_data);
    hasher.update(inputs.client_public);
    hasher.update(inputs.enclave_public);
    hasher.update(inputs.client_nonce);
    hasher.update((inputs.enclave_held.len() as u32).to_be_bytes());
    hasher.update(inputs.enclave_held);
    hasher.update([PROTOCOL_VERSION]);
    hasher.finalize().into()
}
