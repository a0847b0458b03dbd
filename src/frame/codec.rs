use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use super::{Frame, FrameHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use crate::error::FrameError;

/// Tokio codec for [`Frame`]s, with a payload limit enforced both ways.
///
/// Stateless between calls: a partially received frame is re-parsed from
/// the buffer once more bytes arrive.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_payload_size: u32,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_payload_size(MAX_PAYLOAD_SIZE)
    }

    /// Limits above [`MAX_PAYLOAD_SIZE`] are clamped.
    pub fn with_max_payload_size(max_payload_size: u32) -> Self {
        Self {
            max_payload_size: max_payload_size.min(MAX_PAYLOAD_SIZE),
        }
    }

    fn check(&self, size: usize) -> Result<(), FrameError> {
        if size > self.max_payload_size as usize {
            return Err(FrameError::PayloadTooLarge {
                size,
                max: self.max_payload_size,
            });
        }
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }
        let (header, payload_len) = FrameHeader::parse(&src[..HEADER_SIZE])?;
        self.check(payload_len as usize)?;

        let total = HEADER_SIZE + payload_len as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(total);
        let payload = frame.split_off(HEADER_SIZE).freeze();
        Ok(Some(Frame { header, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        self.check(frame.payload.len())?;
        frame.write_to(dst)
    }
}
