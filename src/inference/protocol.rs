//! CBOR envelopes exchanged inside sealed `Data` frames.

use bytes::Bytes;
use ed25519_dalek::{Signature, VerifyingKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use sha2::{Digest, Sha256};

use super::{ModelId, ResponseProof, Tensor};
use crate::error::{Error, FrameError, SessionError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum Operation {
    Run {
        model_id: ByteBuf,
        inputs: Vec<ByteBuf>,
    },
    Delete {
        model_id: ByteBuf,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct RequestEnvelope {
    pub id: u64,
    pub op: Operation,
    pub sign: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum Status {
    Ok,
    ModelNotFound,
    InferenceError(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct WireProof {
    pub payload: ByteBuf,
    pub signature: ByteBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ResponseEnvelope {
    pub id: u64,
    pub status: Status,
    pub outputs: Vec<ByteBuf>,
    pub proof: Option<WireProof>,
}

/// Operation a proof vouches for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum ProofKind {
    Run,
    Delete,
}

/// What the enclave signs when a proof is requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ProofPayload {
    pub kind: ProofKind,
    pub request_id: u64,
    pub model_id: ByteBuf,
    pub input_hash: ByteBuf,
    pub output_hash: ByteBuf,
}

impl ProofPayload {
    /// Hashes are [`digest_tensors`] of the serialized inputs and outputs.
    pub(crate) fn run(
        request_id: u64,
        model_id: ByteBuf,
        input_hash: [u8; 32],
        output_hash: [u8; 32],
    ) -> Self {
        Self {
            kind: ProofKind::Run,
            request_id,
            model_id,
            input_hash: ByteBuf::from(input_hash.to_vec()),
            output_hash: ByteBuf::from(output_hash.to_vec()),
        }
    }

    /// A deletion carries no tensors; both hashes cover the empty list.
    pub(crate) fn delete(request_id: u64, model_id: ByteBuf) -> Self {
        let empty = ByteBuf::from(digest_tensors(&[]).to_vec());
        Self {
            kind: ProofKind::Delete,
            request_id,
            model_id,
            input_hash: empty.clone(),
            output_hash: empty,
        }
    }
}

pub(crate) fn encode_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, SessionError> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(value, &mut out)
        .map_err(|e| SessionError::MalformedEnvelope(e.to_string()))?;
    Ok(out)
}

pub(crate) fn decode_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, SessionError> {
    ciborium::de::from_reader(bytes).map_err(|e| SessionError::MalformedEnvelope(e.to_string()))
}

pub(crate) fn encode_tensors(tensors: &[Tensor]) -> Result<Vec<ByteBuf>, FrameError> {
    tensors
        .iter()
        .map(|t| t.to_bytes().map(|b| ByteBuf::from(b.to_vec())))
        .collect()
}

pub(crate) fn decode_tensors(encoded: Vec<ByteBuf>) -> Result<Vec<Tensor>, FrameError> {
    encoded
        .into_iter()
        .map(|b| Tensor::decode(Bytes::from(b.into_vec())))
        .collect()
}

/// Hash of a serialized tensor list, length-prefixed so boundaries count.
pub(crate) fn digest_tensors(encoded: &[ByteBuf]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"aic-tensors-v1");
    hasher.update((encoded.len() as u64).to_be_bytes());
    for tensor in encoded {
        hasher.update((tensor.len() as u64).to_be_bytes());
        hasher.update(tensor);
    }
    hasher.finalize().into()
}

#[cfg(any(test, feature = "mock"))]
pub(crate) fn model_id_from_wire(bytes: &ByteBuf) -> Option<ModelId> {
    let array: [u8; 32] = bytes.as_slice().try_into().ok()?;
    Some(ModelId::from_bytes(array))
}

/// Check a proof against what the client sent and received.
pub(crate) fn verify_proof(
    key: &VerifyingKey,
    proof: &WireProof,
    expected: &ProofPayload,
) -> Result<ResponseProof, Error> {
    let signature = Signature::from_slice(&proof.signature)
        .map_err(|_| Error::ResponseSignature("malformed signature".into()))?;
    key.verify_strict(&proof.payload, &signature)
        .map_err(|_| Error::ResponseSignature("signature does not verify".into()))?;

    let signed: ProofPayload = decode_cbor(&proof.payload)
        .map_err(|e| Error::ResponseSignature(format!("malformed payload: {e}")))?;
    if signed.kind != expected.kind {
        return Err(Error::ResponseSignature("proof is for another operation".into()));
    }
    if signed.request_id != expected.request_id {
        return Err(Error::ResponseSignature("request id mismatch".into()));
    }
    if signed.model_id != expected.model_id {
        return Err(Error::ResponseSignature("model id mismatch".into()));
    }
    if signed.input_hash != expected.input_hash {
        return Err(Error::ResponseSignature("input hash mismatch".into()));
    }
    if signed.output_hash != expected.output_hash {
        return Err(Error::ResponseSignature("output hash mismatch".into()));
    }

    let mut input_hash = [0u8; 32];
    input_hash.copy_from_slice(&expected.input_hash);
    let mut output_hash = [0u8; 32];
    output_hash.copy_from_slice(&expected.output_hash);

    Ok(ResponseProof {
        payload: proof.payload.to_vec(),
        signature: signature.to_bytes(),
        input_hash,
        output_hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;

    fn payload() -> ProofPayload {
        ProofPayload {
            kind: ProofKind::Run,
            request_id: 7,
            model_id: ByteBuf::from(vec![1; 32]),
            input_hash: ByteBuf::from(vec![2; 32]),
            output_hash: ByteBuf::from(vec![3; 32]),
        }
    }

    fn sign(key: &SigningKey, payload: &ProofPayload) -> WireProof {
        let bytes = encode_cbor(payload).unwrap();
        let signature = key.sign(&bytes);
        WireProof {
            payload: ByteBuf::from(bytes),
            signature: ByteBuf::from(signature.to_bytes().to_vec()),
        }
    }

    #[test]
    fn valid_proof_accepted() {
        let key = SigningKey::generate(&mut OsRng);
        let proof = sign(&key, &payload());
        let verified = verify_proof(&key.verifying_key(), &proof, &payload()).unwrap();
        assert_eq!(verified.input_hash(), &[2; 32]);
        assert_eq!(verified.output_hash(), &[3; 32]);
    }

    #[test]
    fn wrong_key_rejected() {
        let key = SigningKey::generate(&mut OsRng);
        let other = SigningKey::generate(&mut OsRng);
        let proof = sign(&key, &payload());
        let err = verify_proof(&other.verifying_key(), &proof, &payload()).unwrap_err();
        assert!(matches!(err, Error::ResponseSignature(_)));
    }

    #[test]
    fn input_hash_mismatch_rejected() {
        let key = SigningKey::generate(&mut OsRng);
        let proof = sign(&key, &payload());
        let mut expected = payload();
        expected.input_hash = ByteBuf::from(vec![9; 32]);
        let err = verify_proof(&key.verifying_key(), &proof, &expected).unwrap_err();
        assert!(err.to_string().contains("input hash"));
    }

    #[test]
    fn run_proof_not_accepted_for_delete() {
        let key = SigningKey::generate(&mut OsRng);
        let model_id = ByteBuf::from(vec![1; 32]);
        let proof = sign(&key, &ProofPayload::run(7, model_id.clone(), digest_tensors(&[]), digest_tensors(&[])));
        let err = verify_proof(
            &key.verifying_key(),
            &proof,
            &ProofPayload::delete(7, model_id.clone()),
        )
        .unwrap_err();
        assert!(err.to_string().contains("another operation"), "got {err}");

        let proof = sign(&key, &ProofPayload::delete(7, model_id.clone()));
        assert!(verify_proof(&key.verifying_key(), &proof, &ProofPayload::delete(7, model_id)).is_ok());
    }

    #[test]
    fn tensor_digest_respects_boundaries() {
        let a = vec![ByteBuf::from(vec![1, 2]), ByteBuf::from(vec![3])];
        let b = vec![ByteBuf::from(vec![1]), ByteBuf::from(vec![2, 3])];
        assert_ne!(digest_tensors(&a), digest_tensors(&b));
    }

    #[test]
    fn request_envelope_cbor() {
        let request = RequestEnvelope {
            id: 3,
            op: Operation::Delete {
                model_id: ByteBuf::from(vec![0xEE; 32]),
            },
            sign: false,
        };
        let decoded: RequestEnvelope = decode_cbor(&encode_cbor(&request).unwrap()).unwrap();
        assert_eq!(decoded, request);
        assert!(decode_cbor::<ResponseEnvelope>(b"\x01\x02").is_err());
    }
}
