use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::BytesMut;
use ed25519_dalek::VerifyingKey;
use serde_bytes::ByteBuf;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::attestation::types::VerifiedIdentity;
use crate::crypto::seal::{OpeningContext, SealingContext};
use crate::error::{Error, Result, SessionError};
use crate::frame::codec::FrameCodec;
use crate::frame::{FrameType, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use crate::inference::protocol::{
    self, Operation, ProofPayload, RequestEnvelope, ResponseEnvelope, Status,
};
use crate::inference::{InferenceResult, ModelId, ResponseProof, RunOptions, Tensor};
use crate::transport::BoxedStream;

use super::handshake::{self, BoundSession, PendingSession, CLIENT_FIRST_SEALED_SEQ};

/// Upper bound on how long `close` waits to notify the enclave.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Lifecycle of a [`ConfidentialChannel`].
///
/// `Unattested -> Attested -> Closed`. A channel never goes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Unattested,
    Attested,
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChannelState::Unattested => "unattested",
            ChannelState::Attested => "attested",
            ChannelState::Closed => "closed",
        })
    }
}

/// Per-channel settings, taken from the client configuration.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub request_timeout: Duration,
    pub max_payload_size: u32,
    /// UNSAFE: accept evidence whose report data does not bind this session.
    pub allow_unattested_transport: bool,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            max_payload_size: MAX_PAYLOAD_SIZE,
            allow_unattested_transport: false,
        }
    }
}

type Reply = oneshot::Sender<Result<ResponseEnvelope>>;

/// State shared with the reader task.
struct Shared {
    state: ChannelState,
    pending: HashMap<u64, Reply>,
    /// Cancelled on the transition to `Closed`.
    closed: CancellationToken,
}

impl Shared {
    /// Move to `Closed` and fail every waiter. Returns false if already closed.
    fn close(&mut self, reason: &str) -> bool {
        if self.state == ChannelState::Closed {
            return false;
        }
        self.state = ChannelState::Closed;
        self.closed.cancel();
        for (_, waiter) in self.pending.drain() {
            let _ = waiter.send(Err(Error::Transport(reason.to_string())));
        }
        true
    }
}

fn lock(shared: &StdMutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Writer {
    stream: WriteHalf<BoxedStream>,
    sealer: SealingContext,
    codec: FrameCodec,
    /// A write was interrupted or failed, the stream may end mid-frame.
    torn: bool,
}

impl Writer {
    async fn send(&mut self, msg_type: FrameType, plaintext: &[u8]) -> Result<()> {
        let frame = self.sealer.seal(msg_type, plaintext)?;
        self.torn = true;
        handshake::send_frame(&mut self.stream, &mut self.codec, frame).await?;
        self.torn = false;
        Ok(())
    }
}

struct Inner {
    shared: Arc<StdMutex<Shared>>,
    writer: Mutex<Writer>,
    reader: StdMutex<Option<JoinHandle<()>>>,
    closed: CancellationToken,
    next_id: AtomicU64,
    identity: VerifiedIdentity,
    endpoint: String,
    response_key: VerifyingKey,
    request_timeout: Duration,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let reader = self
            .reader
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = reader.take() {
            handle.abort();
        }
    }
}

/// An attested, encrypted session with one enclave.
///
/// Cheap to clone; clones share the session. Requests may be issued
/// concurrently from several tasks and are matched to responses by id.
#[derive(Clone)]
pub struct ConfidentialChannel {
    inner: Arc<Inner>,
}

impl fmt::Debug for ConfidentialChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfidentialChannel")
            .field("endpoint", &self.inner.endpoint)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ConfidentialChannel {
    /// Bind a pending session to an accepted identity and open the channel.
    pub async fn establish(
        pending: PendingSession,
        identity: VerifiedIdentity,
        options: &ChannelOptions,
    ) -> Result<Self> {
        let bound = pending
            .bind(
                &identity,
                options.allow_unattested_transport,
                options.max_payload_size,
            )
            .await?;
        let channel = Self::from_parts(bound, identity, options);
        channel.mark_attested();

        tracing::info!(
            endpoint = %channel.inner.endpoint,
            measurement = hex::encode(channel.inner.identity.measurement()),
            tcb_status = ?channel.inner.identity.tcb_status(),
            simulated = channel.inner.identity.simulated(),
            "channel attested"
        );
        Ok(channel)
    }

    /// Wrap a bound transport. The channel starts out `Unattested`.
    pub(crate) fn from_parts(
        bound: BoundSession,
        identity: VerifiedIdentity,
        options: &ChannelOptions,
    ) -> Self {
        let BoundSession {
            stream,
            read_buf,
            keys,
            session_id,
            response_key,
            endpoint,
        } = bound;

        let (read_half, write_half) = tokio::io::split(stream);
        let closed = CancellationToken::new();
        let shared = Arc::new(StdMutex::new(Shared {
            state: ChannelState::Unattested,
            pending: HashMap::new(),
            closed: closed.clone(),
        }));

        let reader = tokio::spawn(read_loop(
            read_half,
            read_buf,
            FrameCodec::with_max_payload_size(options.max_payload_size),
            OpeningContext::new(&keys.recv, session_id),
            Arc::clone(&shared),
            endpoint.clone(),
        ));

        let writer = Writer {
            stream: write_half,
            sealer: SealingContext::new(&keys.send, session_id, CLIENT_FIRST_SEALED_SEQ),
            codec: FrameCodec::with_max_payload_size(options.max_payload_size),
            torn: false,
        };

        Self {
            inner: Arc::new(Inner {
                shared,
                writer: Mutex::new(writer),
                reader: StdMutex::new(Some(reader)),
                closed,
                next_id: AtomicU64::new(1),
                identity,
                endpoint,
                response_key,
                request_timeout: options.request_timeout,
            }),
        }
    }

    fn mark_attested(&self) {
        let mut shared = lock(&self.inner.shared);
        if shared.state == ChannelState::Unattested {
            shared.state = ChannelState::Attested;
        }
    }

    pub fn state(&self) -> ChannelState {
        lock(&self.inner.shared).state
    }

    /// The identity this channel was attested against.
    pub fn identity(&self) -> &VerifiedIdentity {
        &self.inner.identity
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    fn ensure_attested(&self) -> Result<()> {
        match self.state() {
            ChannelState::Attested => Ok(()),
            other => Err(Error::ChannelState(other)),
        }
    }

    /// Run a model on the enclave and return its output tensors.
    pub async fn run(&self, model_id: &ModelId, inputs: Vec<Tensor>) -> Result<Vec<Tensor>> {
        Ok(self
            .run_with(model_id, inputs, RunOptions::default())
            .await?
            .outputs)
    }

    /// Like [`run`](Self::run), with a per-call timeout and optional signed proof.
    pub async fn run_with(
        &self,
        model_id: &ModelId,
        inputs: Vec<Tensor>,
        options: RunOptions,
    ) -> Result<InferenceResult> {
        self.ensure_attested()?;

        let encoded_inputs = protocol::encode_tensors(&inputs)?;
        let input_hash = protocol::digest_tensors(&encoded_inputs);
        let wire_model_id = ByteBuf::from(model_id.as_bytes().to_vec());
        let op = Operation::Run {
            model_id: wire_model_id.clone(),
            inputs: encoded_inputs,
        };
        let timeout = options.timeout.unwrap_or(self.inner.request_timeout);

        let (id, response) = self.request(op, options.sign, timeout).await?;
        match response.status {
            Status::Ok => {}
            Status::ModelNotFound => return Err(Error::ModelNotFound(*model_id)),
            Status::InferenceError(message) => return Err(Error::Inference(message)),
        }

        let proof = if options.sign {
            let expected = ProofPayload::run(
                id,
                wire_model_id,
                input_hash,
                protocol::digest_tensors(&response.outputs),
            );
            Some(self.check_proof(&response, &expected)?)
        } else {
            None
        };

        let outputs = protocol::decode_tensors(response.outputs)?;
        Ok(InferenceResult { outputs, proof })
    }

    /// Ask the enclave to drop a registered model.
    pub async fn delete_model(&self, model_id: &ModelId) -> Result<()> {
        self.delete_model_with(model_id, RunOptions::default())
            .await
            .map(|_| ())
    }

    /// Like [`delete_model`](Self::delete_model). With [`RunOptions::sign`]
    /// set, returns the enclave's verified proof that this model was deleted.
    pub async fn delete_model_with(
        &self,
        model_id: &ModelId,
        options: RunOptions,
    ) -> Result<Option<ResponseProof>> {
        self.ensure_attested()?;
        let wire_model_id = ByteBuf::from(model_id.as_bytes().to_vec());
        let op = Operation::Delete {
            model_id: wire_model_id.clone(),
        };
        let timeout = options.timeout.unwrap_or(self.inner.request_timeout);

        let (id, response) = self.request(op, options.sign, timeout).await?;
        match response.status {
            Status::Ok => {}
            Status::ModelNotFound => return Err(Error::ModelNotFound(*model_id)),
            Status::InferenceError(message) => return Err(Error::Inference(message)),
        }

        if !options.sign {
            return Ok(None);
        }
        let expected = ProofPayload::delete(id, wire_model_id);
        self.check_proof(&response, &expected).map(Some)
    }

    fn check_proof(
        &self,
        response: &ResponseEnvelope,
        expected: &ProofPayload,
    ) -> Result<ResponseProof> {
        let proof = response
            .proof
            .as_ref()
            .ok_or_else(|| Error::ResponseSignature("enclave returned no proof".into()))?;
        protocol::verify_proof(&self.inner.response_key, proof, expected)
    }

    /// Send a sealed heartbeat frame, bounded by the request timeout.
    pub async fn heartbeat(&self) -> Result<()> {
        self.ensure_attested()?;
        let timeout = self.inner.request_timeout;
        self.write_frame(FrameType::Heartbeat, &[], Instant::now() + timeout, timeout)
            .await
    }

    /// Close the channel.
    ///
    /// Idempotent. In-flight requests fail with [`Error::Transport`]. The
    /// enclave is notified on a best-effort basis, bounded by a short grace
    /// period.
    pub async fn close(&self) {
        if !lock(&self.inner.shared).close("channel closed locally") {
            return;
        }

        let notify = async {
            let mut writer = self.inner.writer.lock().await;
            if writer.torn {
                tracing::debug!("not sending shutdown frame after an interrupted write");
            } else if let Err(e) = writer.send(FrameType::Shutdown, &[]).await {
                tracing::debug!(error = %e, "failed to send shutdown frame");
            }
            let _ = writer.stream.shutdown().await;
        };
        if tokio::time::timeout(CLOSE_GRACE, notify).await.is_err() {
            tracing::debug!(endpoint = %self.inner.endpoint, "shutdown notification timed out");
        }

        let reader = self
            .inner
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = reader {
            handle.abort();
        }

        tracing::info!(endpoint = %self.inner.endpoint, "channel closed");
    }

    /// Close after a fatal transport error.
    fn fail(&self, reason: &str) {
        if lock(&self.inner.shared).close(reason) {
            tracing::warn!(endpoint = %self.inner.endpoint, reason, "channel failed");
        }
    }

    fn forget(&self, id: u64) {
        lock(&self.inner.shared).pending.remove(&id);
    }

    /// Seal and write one frame. Waiting for the writer and writing both
    /// give up as soon as the channel closes or `deadline` passes.
    async fn write_frame(
        &self,
        msg_type: FrameType,
        plaintext: &[u8],
        deadline: Instant,
        timeout: Duration,
    ) -> Result<()> {
        let write = async {
            let mut writer = self.inner.writer.lock().await;
            if self.state() == ChannelState::Closed {
                return Err(Error::Transport("channel closed".into()));
            }
            writer.send(msg_type, plaintext).await
        };

        tokio::select! {
            biased;
            _ = self.inner.closed.cancelled() => {
                Err(Error::Transport("channel closed during write".into()))
            }
            outcome = tokio::time::timeout_at(deadline, write) => match outcome {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    if matches!(e, Error::Transport(_)) {
                        self.fail(&e.to_string());
                    }
                    Err(e)
                }
                Err(_) => {
                    // A partially written frame leaves the stream unusable.
                    self.fail("write timed out");
                    Err(Error::Timeout(timeout))
                }
            },
        }
    }

    /// Send one request and wait for its response, all within `timeout`.
    async fn request(
        &self,
        op: Operation,
        sign: bool,
        timeout: Duration,
    ) -> Result<(u64, ResponseEnvelope)> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = protocol::encode_cbor(&RequestEnvelope { id, op, sign })?;
        let deadline = Instant::now() + timeout;

        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut shared = lock(&self.inner.shared);
            if shared.state != ChannelState::Attested {
                return Err(Error::ChannelState(shared.state));
            }
            shared.pending.insert(id, reply_tx);
        }

        if let Err(e) = self
            .write_frame(FrameType::Data, &payload, deadline, timeout)
            .await
        {
            self.forget(id);
            return Err(e);
        }

        tracing::debug!(id, len = payload.len(), "request sent");

        match tokio::time::timeout_at(deadline, reply_rx).await {
            Ok(Ok(response)) => response.map(|r| (id, r)),
            Ok(Err(_)) => Err(Error::Transport("channel closed before response".into())),
            Err(_) => {
                self.forget(id);
                tracing::warn!(endpoint = %self.inner.endpoint, id, ?timeout, "request timed out");
                Err(Error::Timeout(timeout))
            }
        }
    }
}

/// Route sealed responses to their waiters until the session ends.
async fn read_loop(
    mut stream: ReadHalf<BoxedStream>,
    mut read_buf: BytesMut,
    mut codec: FrameCodec,
    mut opener: OpeningContext,
    shared: Arc<StdMutex<Shared>>,
    endpoint: String,
) {
    let max_buffered = 2 * (MAX_PAYLOAD_SIZE as usize + HEADER_SIZE);

    let reason = loop {
        let frame =
            match handshake::recv_frame(&mut stream, &mut codec, &mut read_buf, max_buffered).await
            {
                Ok(frame) => frame,
                Err(e) => break e.to_string(),
            };

        if !frame.header.flags.is_encrypted() {
            break SessionError::UnencryptedFrame.to_string();
        }
        let plaintext = match opener.open(&frame) {
            Ok(plaintext) => plaintext,
            Err(e) => break e.to_string(),
        };

        match frame.header.msg_type {
            FrameType::Data => {
                let response: ResponseEnvelope = match protocol::decode_cbor(&plaintext) {
                    Ok(response) => response,
                    Err(e) => break e.to_string(),
                };
                let waiter = lock(&shared).pending.remove(&response.id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(Ok(response));
                    }
                    None => {
                        tracing::debug!(id = response.id, "dropping response with no waiter");
                    }
                }
            }
            FrameType::Heartbeat => tracing::debug!("heartbeat received"),
            FrameType::Shutdown => break "enclave closed the session".to_string(),
            FrameType::Error => {
                break format!(
                    "enclave reported an error: {}",
                    String::from_utf8_lossy(&plaintext)
                )
            }
            FrameType::Hello => {
                break SessionError::UnexpectedMessage {
                    expected: "sealed frame",
                    actual: "Hello".into(),
                }
                .to_string()
            }
        }
    };

    if lock(&shared).close(&reason) {
        tracing::warn!(%endpoint, %reason, "channel closed by transport");
    }
}
