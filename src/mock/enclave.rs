//! Enclave side of the protocol, driven by pluggable attestation and runtime.

use std::sync::Arc;

use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use serde_bytes::ByteBuf;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::attestation::AttestationProvider;
use crate::crypto::seal::{OpeningContext, SealingContext};
use crate::error::{Error, SessionError};
use crate::frame::codec::FrameCodec;
use crate::frame::{FrameType, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use crate::inference::protocol::{
    self, Operation, ProofPayload, RequestEnvelope, ResponseEnvelope, Status, WireProof,
};
use crate::inference::{ModelRuntime, RuntimeError};
use crate::session::handshake::{self, ENCLAVE_FIRST_SEALED_SEQ};

/// A software enclave serving attested inference over any byte stream.
///
/// Requests are handled concurrently, so responses may leave out of order.
pub struct MockEnclave {
    provider: Arc<dyn AttestationProvider>,
    runtime: Arc<dyn ModelRuntime>,
    signing_key: SigningKey,
}

impl MockEnclave {
    pub fn new(provider: Arc<dyn AttestationProvider>, runtime: Arc<dyn ModelRuntime>) -> Self {
        Self {
            provider,
            runtime,
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Public half of the key used to sign response proofs.
    pub fn response_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Serve one connection until the client shuts down or the stream ends.
    pub async fn serve<T>(&self, mut transport: T) -> Result<(), Error>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let session =
            handshake::respond(&mut transport, self.provider.as_ref(), &self.response_key())
                .await?;
        tracing::debug!("enclave handshake complete");

        let (mut read_half, write_half) = tokio::io::split(transport);
        let mut opener = OpeningContext::new(&session.keys.recv, session.session_id);
        let sealer = SealingContext::new(
            &session.keys.send,
            session.session_id,
            ENCLAVE_FIRST_SEALED_SEQ,
        );

        let (responses_tx, responses_rx) = mpsc::channel::<ResponseEnvelope>(32);
        let writer = tokio::spawn(write_responses(write_half, sealer, responses_rx));

        let mut codec = FrameCodec::new();
        let mut read_buf = session.read_buf;
        let max_buffered = 2 * (MAX_PAYLOAD_SIZE as usize + HEADER_SIZE);

        let result = loop {
            let frame = match handshake::recv_frame(
                &mut read_half,
                &mut codec,
                &mut read_buf,
                max_buffered,
            )
            .await
            {
                Ok(frame) => frame,
                Err(e) => break Err(e),
            };
            if !frame.header.flags.is_encrypted() {
                break Err(SessionError::UnencryptedFrame.into());
            }
            let plaintext = match opener.open(&frame) {
                Ok(plaintext) => plaintext,
                Err(e) => break Err(e.into()),
            };

            match frame.header.msg_type {
                FrameType::Data => {
                    let request: RequestEnvelope = match protocol::decode_cbor(&plaintext) {
                        Ok(request) => request,
                        Err(e) => break Err(e.into()),
                    };
                    let runtime = Arc::clone(&self.runtime);
                    let signing_key = self.signing_key.clone();
                    let responses = responses_tx.clone();
                    tokio::spawn(async move {
                        let response = handle(runtime.as_ref(), &signing_key, request).await;
                        let _ = responses.send(response).await;
                    });
                }
                FrameType::Heartbeat => {}
                FrameType::Shutdown => break Ok(()),
                other => {
                    break Err(SessionError::UnexpectedMessage {
                        expected: "Data, Heartbeat or Shutdown",
                        actual: format!("{other:?}"),
                    }
                    .into())
                }
            }
        };

        drop(responses_tx);
        writer.abort();
        tracing::debug!(ok = result.is_ok(), "enclave connection finished");
        result
    }

    /// Accept and serve TCP connections forever.
    #[cfg(feature = "tcp")]
    pub async fn serve_tcp(self: Arc<Self>, listener: tokio::net::TcpListener) -> std::io::Result<()> {
        loop {
            let stream = crate::transport::tcp::accept(&listener).await?;
            let enclave = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = enclave.serve(stream).await {
                    tracing::debug!(error = %e, "enclave connection failed");
                }
            });
        }
    }
}

async fn write_responses<W: AsyncWrite + Unpin>(
    mut stream: W,
    mut sealer: SealingContext,
    mut responses: mpsc::Receiver<ResponseEnvelope>,
) -> Result<(), Error> {
    let mut codec = FrameCodec::new();
    while let Some(response) = responses.recv().await {
        let plaintext = protocol::encode_cbor(&response)?;
        let frame = sealer.seal(FrameType::Data, &plaintext)?;
        handshake::send_frame(&mut stream, &mut codec, frame).await?;
    }
    Ok(())
}

fn status_of(error: RuntimeError) -> Status {
    match error {
        RuntimeError::ModelNotFound => Status::ModelNotFound,
        RuntimeError::Failed(message) => Status::InferenceError(message),
    }
}

fn sign_proof(signing_key: &SigningKey, payload: &ProofPayload) -> Result<WireProof, SessionError> {
    let payload = protocol::encode_cbor(payload)?;
    let signature = signing_key.sign(&payload);
    Ok(WireProof {
        payload: ByteBuf::from(payload),
        signature: ByteBuf::from(signature.to_bytes().to_vec()),
    })
}

fn reply(id: u64, status: Status) -> ResponseEnvelope {
    ResponseEnvelope {
        id,
        status,
        outputs: Vec::new(),
        proof: None,
    }
}

async fn handle(
    runtime: &dyn ModelRuntime,
    signing_key: &SigningKey,
    request: RequestEnvelope,
) -> ResponseEnvelope {
    let id = request.id;
    match request.op {
        Operation::Run { model_id, inputs } => {
            let Some(model) = protocol::model_id_from_wire(&model_id) else {
                return reply(id, Status::InferenceError("malformed model id".into()));
            };
            let input_hash = protocol::digest_tensors(&inputs);
            let tensors = match protocol::decode_tensors(inputs) {
                Ok(tensors) => tensors,
                Err(e) => return reply(id, Status::InferenceError(e.to_string())),
            };
            let outputs = match runtime.run(&model, tensors).await {
                Ok(outputs) => outputs,
                Err(e) => return reply(id, status_of(e)),
            };
            let outputs = match protocol::encode_tensors(&outputs) {
                Ok(outputs) => outputs,
                Err(e) => return reply(id, Status::InferenceError(e.to_string())),
            };

            let proof = if request.sign {
                let payload = ProofPayload::run(
                    id,
                    model_id,
                    input_hash,
                    protocol::digest_tensors(&outputs),
                );
                match sign_proof(signing_key, &payload) {
                    Ok(proof) => Some(proof),
                    Err(e) => return reply(id, Status::InferenceError(e.to_string())),
                }
            } else {
                None
            };

            ResponseEnvelope {
                id,
                status: Status::Ok,
                outputs,
                proof,
            }
        }
        Operation::Delete { model_id } => {
            let Some(model) = protocol::model_id_from_wire(&model_id) else {
                return reply(id, Status::InferenceError("malformed model id".into()));
            };
            if let Err(e) = runtime.delete(&model).await {
                return reply(id, status_of(e));
            }
            let mut response = reply(id, Status::Ok);
            if request.sign {
                match sign_proof(signing_key, &ProofPayload::delete(id, model_id)) {
                    Ok(proof) => response.proof = Some(proof),
                    Err(e) => return reply(id, Status::InferenceError(e.to_string())),
                }
            }
            response
        }
    }
}
