//! ChaCha20-Poly1305 sealing of post-handshake frames.
//!
//! Associated data is `version || type || flags || session_id || sequence`,
//! so a frame cannot be replayed into another session, reordered or
//! relabelled. The nonce is the sequence number, big-endian in the low
//! eight bytes.

use bytes::Bytes;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use zeroize::Zeroize;

use super::SymmetricKey;
use crate::error::CryptoError;
use crate::frame::{Frame, FrameHeader, FrameType, PROTOCOL_VERSION};

const AAD_SIZE: usize = 3 + 32 + 8;

fn associated_data(header: &FrameHeader, session_id: &[u8; 32]) -> [u8; AAD_SIZE] {
    let mut aad = [0u8; AAD_SIZE];
    aad[0] = PROTOCOL_VERSION;
    aad[1] = header.msg_type as u8;
    aad[2] = header.flags.raw();
    aad[3..35].copy_from_slice(session_id);
    aad[35..].copy_from_slice(&header.sequence.to_be_bytes());
    aad
}

fn nonce(sequence: u64) -> Nonce {
    let mut bytes = [0u8; 12];
    bytes[4..].copy_from_slice(&sequence.to_be_bytes());
    *Nonce::from_slice(&bytes)
}

/// Outgoing half: assigns sequence numbers and seals frames.
pub struct SealingContext {
    cipher: ChaCha20Poly1305,
    session_id: [u8; 32],
    next_sequence: u64,
}

impl Drop for SealingContext {
    fn drop(&mut self) {
        self.session_id.zeroize();
    }
}

impl SealingContext {
    /// `first_sequence` skips the numbers the handshake already used in
    /// plaintext.
    pub fn new(key: &SymmetricKey, session_id: [u8; 32], first_sequence: u64) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            session_id,
            next_sequence: first_sequence,
        }
    }

    /// Seal `plaintext` into a ready-to-send frame of type `msg_type`.
    pub fn seal(&mut self, msg_type: FrameType, plaintext: &[u8]) -> Result<Frame, CryptoError> {
        let sequence = self.next_sequence;
        self.next_sequence = sequence
            .checked_add(1)
            .ok_or(CryptoError::NonceOverflow)?;

        let mut frame = Frame::sealed(msg_type, sequence, Bytes::new());
        let aad = associated_data(&frame.header, &self.session_id);
        let ciphertext = self
            .cipher
            .encrypt(
                &nonce(sequence),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::SealFailed)?;
        frame.payload = Bytes::from(ciphertext);
        Ok(frame)
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }
}

/// Incoming half: authenticates frames and rejects replays.
pub struct OpeningContext {
    cipher: ChaCha20Poly1305,
    session_id: [u8; 32],
    last_sequence: Option<u64>,
}

impl Drop for OpeningContext {
    fn drop(&mut self) {
        self.session_id.zeroize();
    }
}

impl OpeningContext {
    pub fn new(key: &SymmetricKey, session_id: [u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            session_id,
            last_sequence: None,
        }
    }

    /// Authenticate and decrypt `frame`. Sequence numbers must strictly
    /// increase; a failed open does not advance the window.
    pub fn open(&mut self, frame: &Frame) -> Result<Vec<u8>, CryptoError> {
        let sequence = frame.header.sequence;
        if let Some(last) = self.last_sequence.filter(|&last| sequence <= last) {
            return Err(CryptoError::SequenceReplay {
                received: sequence,
                expected: last,
            });
        }

        let aad = associated_data(&frame.header, &self.session_id);
        let plaintext = self
            .cipher
            .decrypt(
                &nonce(sequence),
                Payload {
                    msg: &frame.payload,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::OpenFailed)?;

        self.last_sequence = Some(sequence);
        Ok(plaintext)
    }
}
