//! Wire framing shared by the handshake and the sealed channel.
//!
//! ```text
//! magic u16 | version u8 | type u8 | flags u8 | sequence u64 | length u32 | payload
//! ```
//!
//! Big-endian. The header is also the AEAD associated data for sealed
//! frames, minus the length.

pub mod codec;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::FrameError;

/// Magic bytes: 0xA1 0xC7 ("Attested Inference Client").
pub const MAGIC: u16 = 0xA1C7;

pub const PROTOCOL_VERSION: u8 = 1;

/// magic(2) version(1) type(1) flags(1) seq(8) len(4).
pub const HEADER_SIZE: usize = 17;

/// Hard ceiling on any payload: 32 MiB.
pub const MAX_PAYLOAD_SIZE: u32 = 32 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Plaintext handshake messages (client hello, server hello, confirmation).
    Hello = 0x01,
    /// Sealed request or response envelope.
    Data = 0x02,
    Error = 0x03,
    Heartbeat = 0x04,
    Shutdown = 0x05,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(v: u8) -> Result<Self, FrameError> {
        Ok(match v {
            0x01 => Self::Hello,
            0x02 => Self::Data,
            0x03 => Self::Error,
            0x04 => Self::Heartbeat,
            0x05 => Self::Shutdown,
            other => return Err(FrameError::UnknownMessageType(other)),
        })
    }
}

/// Header flag bits. Only [`Flags::ENCRYPTED`] is defined; any other bit is
/// a decode error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flags(u8);

impl Flags {
    pub const ENCRYPTED: u8 = 0x01;

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn encrypted() -> Self {
        Self(Self::ENCRYPTED)
    }

    fn from_wire(raw: u8) -> Result<Self, FrameError> {
        if raw & !Self::ENCRYPTED != 0 {
            return Err(FrameError::UnknownFlags(raw));
        }
        Ok(Self(raw))
    }

    pub const fn raw(self) -> u8 {
        self.0
    }

    pub const fn is_encrypted(self) -> bool {
        self.0 & Self::ENCRYPTED != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub msg_type: FrameType,
    pub flags: Flags,
    pub sequence: u64,
}

impl FrameHeader {
    /// Parse a fixed-size header, returning it with the announced payload
    /// length. Does not enforce any payload limit.
    pub fn parse(mut raw: &[u8]) -> Result<(Self, u32), FrameError> {
        if raw.len() < HEADER_SIZE {
            return Err(FrameError::Truncated(raw.len()));
        }
        let magic = raw.get_u16();
        if magic != MAGIC {
            return Err(FrameError::InvalidMagic(magic));
        }
        let version = raw.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(FrameError::UnsupportedVersion(version));
        }
        let msg_type = FrameType::try_from(raw.get_u8())?;
        let flags = Flags::from_wire(raw.get_u8())?;
        let sequence = raw.get_u64();
        let payload_len = raw.get_u32();
        Ok((
            Self {
                msg_type,
                flags,
                sequence,
            },
            payload_len,
        ))
    }

    fn write(&self, payload_len: u32, dst: &mut BytesMut) {
        dst.put_u16(MAGIC);
        dst.put_u8(PROTOCOL_VERSION);
        dst.put_u8(self.msg_type as u8);
        dst.put_u8(self.flags.raw());
        dst.put_u64(self.sequence);
        dst.put_u32(payload_len);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    /// Plaintext frame. Only valid during the handshake.
    pub fn hello(sequence: u64, payload: Bytes) -> Self {
        Self {
            header: FrameHeader {
                msg_type: FrameType::Hello,
                flags: Flags::empty(),
                sequence,
            },
            payload,
        }
    }

    /// Frame carrying AEAD ciphertext. Every post-handshake frame, heartbeats
    /// and shutdown included, goes through here.
    pub fn sealed(msg_type: FrameType, sequence: u64, ciphertext: Bytes) -> Self {
        Self {
            header: FrameHeader {
                msg_type,
                flags: Flags::encrypted(),
                sequence,
            },
            payload: ciphertext,
        }
    }

    /// Append header and payload to `dst`.
    pub fn write_to(&self, dst: &mut BytesMut) -> Result<(), FrameError> {
        let payload_len =
            u32::try_from(self.payload.len()).map_err(|_| FrameError::PayloadTooLarge {
                size: self.payload.len(),
                max: MAX_PAYLOAD_SIZE,
            })?;
        dst.reserve(HEADER_SIZE + self.payload.len());
        self.header.write(payload_len, dst);
        dst.extend_from_slice(&self.payload);
        Ok(())
    }
}
