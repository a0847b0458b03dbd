//! Evidence fetch and key agreement.
//!
//! ```text
//! client -> enclave  Hello(seq 0)  [1][client_pk 32][client_nonce 32]
//! enclave -> client  Hello(seq 0)  [2][len][enclave_held][len][evidence][len][collateral]
//! client -> enclave  Hello(seq 1)  [3][confirmation 32]
//! ```
//!
//! `enclave_held = kex_pk(32) || response_signing_pk(32)` and the evidence
//! must carry `report_data = SHA256("aic-report-data-v1" || enclave_held || client_nonce) || 0^32`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use ed25519_dalek::VerifyingKey;
use hkdf::Hkdf;
use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::attestation::types::{AttestationEvidence, VerifiedIdentity};
use crate::crypto::hpke::{self, KeyPair, SessionKeys};
use crate::crypto::transcript::{self, TranscriptInputs};
use crate::crypto::SymmetricKey;
use crate::error::{AttestError, CryptoError, Error, SessionError};
use crate::frame::codec::FrameCodec;
use crate::frame::{Frame, FrameType};
use crate::transport::{BoxedStream, Connector};

const CLIENT_HELLO: u8 = 1;
const SERVER_HELLO: u8 = 2;
const CONFIRMATION: u8 = 3;

/// Size of the enclave-held data: X25519 key + Ed25519 response key.
pub const ENCLAVE_HELD_SIZE: usize = 64;

/// Cap on evidence size accepted from the wire (64 KiB).
const MAX_EVIDENCE_SIZE: usize = 64 * 1024;

/// Cap on collateral size accepted from the wire (256 KiB).
const MAX_COLLATERAL_SIZE: usize = 256 * 1024;

/// Sequence number the client's first sealed frame uses.
pub(crate) const CLIENT_FIRST_SEALED_SEQ: u64 = 2;

/// Sequence number the enclave's first sealed frame uses.
#[cfg(any(test, feature = "mock"))]
pub(crate) const ENCLAVE_FIRST_SEALED_SEQ: u64 = 1;

/// Report data an honest enclave binds into its evidence for this session.
pub fn expected_report_data(enclave_held: &[u8], client_nonce: &[u8; 32]) -> [u8; 64] {
    let mut hasher = Sha256::new();
    hasher.update(b"aic-report-data-v1");
    hasher.update(enclave_held);
    hasher.update(client_nonce);
    let mut report_data = [0u8; 64];
    report_data[..32].copy_from_slice(&hasher.finalize());
    report_data
}

// -- Wire helpers --

fn encode_client_hello(public_key: &[u8; 32], nonce: &[u8; 32]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + 32 + 32);
    buf.put_u8(CLIENT_HELLO);
    buf.put_slice(public_key);
    buf.put_slice(nonce);
    buf.freeze()
}

#[cfg(any(test, feature = "mock"))]
pub(crate) fn parse_client_hello(payload: &[u8]) -> Result<([u8; 32], [u8; 32]), SessionError> {
    const EXPECTED_LEN: usize = 1 + 32 + 32;
    if payload.len() != EXPECTED_LEN {
        return Err(SessionError::HandshakeFailed(format!(
            "client hello: expected {EXPECTED_LEN} bytes, got {}",
            payload.len()
        )));
    }
    if payload[0] != CLIENT_HELLO {
        return Err(SessionError::UnexpectedMessage {
            expected: "client_hello (1)",
            actual: format!("message type {}", payload[0]),
        });
    }
    let mut pk = [0u8; 32];
    let mut nonce = [0u8; 32];
    pk.copy_from_slice(&payload[1..33]);
    nonce.copy_from_slice(&payload[33..65]);
    Ok((pk, nonce))
}

#[cfg(any(test, feature = "mock"))]
pub(crate) fn encode_server_hello(enclave_held: &[u8], evidence: &[u8], collateral: &[u8]) -> Bytes {
    let mut buf =
        BytesMut::with_capacity(1 + 12 + enclave_held.len() + evidence.len() + collateral.len());
    buf.put_u8(SERVER_HELLO);
    for field in [enclave_held, evidence, collateral] {
        buf.put_u32(field.len() as u32);
        buf.put_slice(field);
    }
    buf.freeze()
}

#[derive(Debug)]
struct ServerHello {
    enclave_held: Vec<u8>,
    evidence: Vec<u8>,
    collateral: Vec<u8>,
}

fn take_field(cursor: &mut &[u8], name: &str, max: usize) -> Result<Vec<u8>, SessionError> {
    if cursor.remaining() < 4 {
        return Err(SessionError::HandshakeFailed(format!(
            "server hello truncated before {name}"
        )));
    }
    let len = cursor.get_u32() as usize;
    if len > max {
        return Err(SessionError::HandshakeFailed(format!(
            "{name} too large: {len} bytes (max {max})"
        )));
    }
    if cursor.remaining() < len {
        return Err(SessionError::HandshakeFailed(format!(
            "server hello truncated in {name}"
        )));
    }
    let field = cursor[..len].to_vec();
    cursor.advance(len);
    Ok(field)
}

fn parse_server_hello(payload: &[u8]) -> Result<ServerHello, SessionError> {
    let Some((&kind, mut cursor)) = payload.split_first() else {
        return Err(SessionError::HandshakeFailed("empty server hello".into()));
    };
    if kind != SERVER_HELLO {
        return Err(SessionError::UnexpectedMessage {
            expected: "server_hello (2)",
            actual: format!("message type {kind}"),
        });
    }
    let enclave_held = take_field(&mut cursor, "enclave-held data", ENCLAVE_HELD_SIZE)?;
    let evidence = take_field(&mut cursor, "evidence", MAX_EVIDENCE_SIZE)?;
    let collateral = take_field(&mut cursor, "collateral", MAX_COLLATERAL_SIZE)?;
    if cursor.has_remaining() {
        return Err(SessionError::HandshakeFailed(format!(
            "server hello has {} trailing bytes",
            cursor.remaining()
        )));
    }
    if enclave_held.len() != ENCLAVE_HELD_SIZE {
        return Err(SessionError::HandshakeFailed(format!(
            "enclave-held data: expected {ENCLAVE_HELD_SIZE} bytes, got {}",
            enclave_held.len()
        )));
    }
    Ok(ServerHello {
        enclave_held,
        evidence,
        collateral,
    })
}

fn encode_confirmation(confirmation_hash: &[u8; 32]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + 32);
    buf.put_u8(CONFIRMATION);
    buf.put_slice(confirmation_hash);
    buf.freeze()
}

#[cfg(any(test, feature = "mock"))]
pub(crate) fn parse_confirmation(payload: &[u8]) -> Result<[u8; 32], SessionError> {
    const EXPECTED_LEN: usize = 1 + 32;
    if payload.len() != EXPECTED_LEN {
        return Err(SessionError::HandshakeFailed(format!(
            "confirmation: expected {EXPECTED_LEN} bytes, got {}",
            payload.len()
        )));
    }
    if payload[0] != CONFIRMATION {
        return Err(SessionError::UnexpectedMessage {
            expected: "confirmation (3)",
            actual: format!("message type {}", payload[0]),
        });
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&payload[1..33]);
    Ok(hash)
}

/// Confirmation hash over both directional keys, in client orientation.
pub(crate) fn compute_confirmation(
    session_id: &[u8; 32],
    client_send: &SymmetricKey,
    client_recv: &SymmetricKey,
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"aic-confirmation");
    hasher.update(session_id);
    hasher.update(client_send);
    hasher.update(client_recv);
    hasher.finalize().into()
}

/// Session id, domain-separated from the key material.
pub(crate) fn derive_session_id(transcript_hash: &[u8; 32]) -> Result<[u8; 32], CryptoError> {
    let hkdf = Hkdf::<Sha256>::new(None, transcript_hash);
    let mut session_id = [0u8; 32];
    hkdf.expand(b"aic-session-id", &mut session_id)
        .map_err(|_| CryptoError::HkdfExpandFailed)?;
    Ok(session_id)
}

// -- Transport helpers --

pub(crate) async fn send_frame<T: AsyncWrite + Unpin + ?Sized>(
    transport: &mut T,
    codec: &mut FrameCodec,
    frame: Frame,
) -> Result<(), Error> {
    let mut buf = BytesMut::new();
    codec.encode(frame, &mut buf)?;
    transport.write_all(&buf).await?;
    transport.flush().await?;
    Ok(())
}

/// Maximum read buffer size during handshake.
const HANDSHAKE_MAX_READ_BUF: usize =
    MAX_EVIDENCE_SIZE + MAX_COLLATERAL_SIZE + crate::frame::HEADER_SIZE + 4096;

pub(crate) async fn recv_frame<T: AsyncRead + Unpin + ?Sized>(
    transport: &mut T,
    codec: &mut FrameCodec,
    read_buf: &mut BytesMut,
    max_buffered: usize,
) -> Result<Frame, Error> {
    loop {
        if let Some(frame) = codec.decode(read_buf)? {
            return Ok(frame);
        }
        if read_buf.len() > max_buffered {
            return Err(SessionError::ReadBufferOverflow {
                size: read_buf.len(),
            }
            .into());
        }
        if transport.read_buf(read_buf).await? == 0 {
            return Err(SessionError::Closed.into());
        }
    }
}

/// Check that a handshake frame has the expected type and sequence number.
fn validate_handshake_frame(frame: &Frame, expected_seq: u64) -> Result<(), SessionError> {
    if frame.header.msg_type != FrameType::Hello || frame.header.flags.is_encrypted() {
        return Err(SessionError::UnexpectedMessage {
            expected: "plaintext Hello",
            actual: format!("{:?}", frame.header.msg_type),
        });
    }
    if frame.header.sequence != expected_seq {
        return Err(SessionError::HandshakeFailed(format!(
            "unexpected handshake sequence: expected {expected_seq}, got {}",
            frame.header.sequence
        )));
    }
    Ok(())
}

// -- Client side --

/// A connection whose evidence has been fetched but not yet trusted.
///
/// Holds the open transport so the channel can reuse it once the enclave is
/// accepted. Dropping it closes the connection.
pub struct PendingSession {
    stream: BoxedStream,
    read_buf: BytesMut,
    keypair: KeyPair,
    client_nonce: [u8; 32],
    enclave_held: Vec<u8>,
    evidence: AttestationEvidence,
    collateral: Vec<u8>,
    endpoint: String,
}

impl PendingSession {
    pub fn evidence(&self) -> &AttestationEvidence {
        &self.evidence
    }

    /// Raw CBOR collateral, decoded by the verifier step.
    pub fn collateral_bytes(&self) -> &[u8] {
        &self.collateral
    }

    pub fn client_nonce(&self) -> &[u8; 32] {
        &self.client_nonce
    }

    pub fn enclave_held(&self) -> &[u8] {
        &self.enclave_held
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Swap in different evidence. Only useful to exercise replay handling.
    #[cfg(any(test, feature = "mock"))]
    #[doc(hidden)]
    pub fn replace_evidence(&mut self, evidence: AttestationEvidence, collateral: Vec<u8>) {
        self.evidence = evidence;
        self.collateral = collateral;
    }

    /// Bind the session to the verified identity and finish key agreement.
    ///
    /// Fails with an attestation error when the identity's report data was
    /// not produced for this connection, unless `allow_unattested` is set.
    pub(crate) async fn bind(
        mut self,
        identity: &VerifiedIdentity,
        allow_unattested: bool,
        max_payload_size: u32,
    ) -> Result<BoundSession, Error> {
        let expected = expected_report_data(&self.enclave_held, &self.client_nonce);
        if identity.report_data() != &expected {
            if !allow_unattested {
                return Err(AttestError::ReportDataMismatch.into());
            }
            tracing::warn!(
                endpoint = %self.endpoint,
                "UNSAFE: report data does not bind this session, continuing because allow_unattested_transport is set"
            );
        }

        let mut kex_public = [0u8; 32];
        kex_public.copy_from_slice(&self.enclave_held[..32]);
        let mut response_public = [0u8; 32];
        response_public.copy_from_slice(&self.enclave_held[32..]);
        let response_key = VerifyingKey::from_bytes(&response_public)
            .map_err(|_| AttestError::Malformed("enclave response key is not a valid point".into()))?;

        let client_public = self.keypair.public.to_bytes();
        let transcript_hash = transcript::compute_transcript(&TranscriptInputs {
            evidence_hash: identity.evidence_hash(),
            report_data: identity.report_data(),
            client_public: &client_public,
            enclave_public: &kex_public,
            client_nonce: &self.client_nonce,
            enclave_held: &self.enclave_held,
        });

        let keys = hpke::derive_session_keys(
            &self.keypair.secret,
            &x25519_dalek::PublicKey::from(kex_public),
            &transcript_hash,
            true,
        )?;
        let session_id = derive_session_id(&transcript_hash)?;

        let confirmation = compute_confirmation(&session_id, &keys.send, &keys.recv);
        let mut codec = FrameCodec::with_max_payload_size(max_payload_size);
        send_frame(
            &mut self.stream,
            &mut codec,
            Frame::hello(1, encode_confirmation(&confirmation)),
        )
        .await?;

        tracing::debug!(endpoint = %self.endpoint, "session keys confirmed");

        Ok(BoundSession {
            stream: self.stream,
            read_buf: self.read_buf,
            keys,
            session_id,
            response_key,
            endpoint: self.endpoint,
        })
    }
}

/// Key material and transport for an accepted session.
pub(crate) struct BoundSession {
    pub stream: BoxedStream,
    pub read_buf: BytesMut,
    pub keys: SessionKeys,
    pub session_id: [u8; 32],
    pub response_key: VerifyingKey,
    pub endpoint: String,
}

/// Open the transport and collect the enclave's evidence for a fresh nonce.
///
/// Does not interpret the evidence beyond framing.
pub async fn fetch_evidence(
    connector: &dyn Connector,
    endpoint: &str,
    max_payload_size: u32,
) -> Result<PendingSession, Error> {
    let mut stream = connector
        .connect(endpoint)
        .await
        .map_err(|e| Error::Unreachable(format!("{endpoint}: {e}")))?;

    let keypair = KeyPair::generate();
    let mut client_nonce = [0u8; 32];
    rand::thread_rng().fill(&mut client_nonce);

    let mut codec = FrameCodec::with_max_payload_size(max_payload_size);
    let hello = Frame::hello(
        0,
        encode_client_hello(&keypair.public.to_bytes(), &client_nonce),
    );
    send_frame(&mut stream, &mut codec, hello).await?;

    let mut read_buf = BytesMut::with_capacity(4096);
    let frame = recv_frame(&mut stream, &mut codec, &mut read_buf, HANDSHAKE_MAX_READ_BUF).await?;
    validate_handshake_frame(&frame, 0)?;
    let hello = parse_server_hello(&frame.payload)?;

    tracing::debug!(
        endpoint,
        evidence_len = hello.evidence.len(),
        collateral_len = hello.collateral.len(),
        "evidence received"
    );

    Ok(PendingSession {
        stream,
        read_buf,
        keypair,
        client_nonce,
        enclave_held: hello.enclave_held,
        evidence: AttestationEvidence::new(hello.evidence),
        collateral: hello.collateral,
        endpoint: endpoint.to_string(),
    })
}

// -- Enclave side --

/// Keys and leftovers from the enclave side of the handshake.
#[cfg(any(test, feature = "mock"))]
pub(crate) struct EnclaveSession {
    pub keys: SessionKeys,
    pub session_id: [u8; 32],
    pub read_buf: BytesMut,
}

/// Run the enclave side of the handshake.
#[cfg(any(test, feature = "mock"))]
pub(crate) async fn respond<T: AsyncRead + AsyncWrite + Unpin>(
    transport: &mut T,
    provider: &dyn crate::attestation::AttestationProvider,
    response_public: &[u8; 32],
) -> Result<EnclaveSession, Error> {
    let mut codec = FrameCodec::new();
    let mut read_buf = BytesMut::with_capacity(4096);

    let frame = recv_frame(transport, &mut codec, &mut read_buf, HANDSHAKE_MAX_READ_BUF).await?;
    validate_handshake_frame(&frame, 0)?;
    let (client_public, client_nonce) = parse_client_hello(&frame.payload)?;

    let keypair = KeyPair::generate();
    let kex_public = keypair.public.to_bytes();
    let mut enclave_held = Vec::with_capacity(ENCLAVE_HELD_SIZE);
    enclave_held.extend_from_slice(&kex_public);
    enclave_held.extend_from_slice(response_public);

    let report_data = expected_report_data(&enclave_held, &client_nonce);
    let (evidence, collateral) = provider.attest(&report_data).await.map_err(|e| {
        tracing::warn!("evidence generation failed: {e}");
        SessionError::HandshakeFailed("evidence generation failed".into())
    })?;
    let collateral = collateral
        .to_cbor()
        .map_err(|e| SessionError::HandshakeFailed(e.to_string()))?;

    let hello = Frame::hello(
        0,
        encode_server_hello(&enclave_held, evidence.as_bytes(), &collateral),
    );
    send_frame(transport, &mut codec, hello).await?;

    // The transcript uses the report data the evidence actually carries.
    let carried = crate::attestation::quote::Quote::parse(evidence.as_bytes())
        .map(|q| q.body.report_data)
        .unwrap_or(report_data);

    let transcript_hash = transcript::compute_transcript(&TranscriptInputs {
        evidence_hash: &evidence.hash(),
        report_data: &carried,
        client_public: &client_public,
        enclave_public: &kex_public,
        client_nonce: &client_nonce,
        enclave_held: &enclave_held,
    });
    let keys = hpke::derive_session_keys(
        &keypair.secret,
        &x25519_dalek::PublicKey::from(client_public),
        &transcript_hash,
        false,
    )?;
    let session_id = derive_session_id(&transcript_hash)?;

    let frame = recv_frame(transport, &mut codec, &mut read_buf, HANDSHAKE_MAX_READ_BUF).await?;
    validate_handshake_frame(&frame, 1)?;
    let received = parse_confirmation(&frame.payload)?;
    let expected = compute_confirmation(&session_id, &keys.recv, &keys.send);
    if received != expected {
        return Err(SessionError::HandshakeFailed(
            "confirmation hash mismatch: peer derived different keys".into(),
        )
        .into());
    }

    Ok(EnclaveSession {
        keys,
        session_id,
        read_buf,
    })
}
