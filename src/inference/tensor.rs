use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::FrameError;

/// Tensor element types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DType {
    F32 = 0,
    F64 = 1,
    F16 = 2,
    BF16 = 3,
    I32 = 4,
    I64 = 5,
    U8 = 6,
    U32 = 7,
}

impl DType {
    pub fn from_u8(v: u8) -> Result<Self, FrameError> {
        match v {
            0 => Ok(Self::F32),
            1 => Ok(Self::F64),
            2 => Ok(Self::F16),
            3 => Ok(Self::BF16),
            4 => Ok(Self::I32),
            5 => Ok(Self::I64),
            6 => Ok(Self::U8),
            7 => Ok(Self::U32),
            other => Err(FrameError::UnknownDType(other)),
        }
    }

    /// Size in bytes of one element of this dtype.
    pub const fn element_size(self) -> usize {
        match self {
            DType::U8 => 1,
            DType::F16 | DType::BF16 => 2,
            DType::F32 | DType::I32 | DType::U32 => 4,
            DType::F64 | DType::I64 => 8,
        }
    }
}

/// Maximum number of tensor dimensions.
const MAX_NDIMS: u16 = 32;

/// A named tensor as carried inside request and response envelopes.
///
/// The client treats tensors as opaque payloads: the data length is not
/// checked against the shape on the way out. [`Tensor::validate`] is for model
/// runtimes, which own shape and type validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tensor {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<u32>,
    pub data: Bytes,
}

impl Tensor {
    pub fn new(
        name: impl Into<String>,
        dtype: DType,
        shape: Vec<u32>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape,
            data: data.into(),
        }
    }

    /// Build an `F32` tensor from values, little-endian.
    pub fn from_f32(name: impl Into<String>, shape: Vec<u32>, values: &[f32]) -> Self {
        let mut data = BytesMut::with_capacity(values.len() * 4);
        for v in values {
            data.put_f32_le(*v);
        }
        Self::new(name, DType::F32, shape, data.freeze())
    }

    /// Read back `F32` values. `None` for other dtypes or ragged data.
    pub fn to_f32(&self) -> Option<Vec<f32>> {
        if self.dtype != DType::F32 || self.data.len() % 4 != 0 {
            return None;
        }
        let mut data = &self.data[..];
        let mut out = Vec::with_capacity(data.len() / 4);
        while data.has_remaining() {
            out.push(data.get_f32_le());
        }
        Some(out)
    }

    /// Check that the data length matches the shape and dtype.
    pub fn validate(&self) -> Result<(), FrameError> {
        let expected = self.expected_data_len()?;
        if self.data.len() != expected {
            return Err(FrameError::TensorDataSizeMismatch {
                expected,
                actual: self.data.len(),
            });
        }
        Ok(())
    }

    fn expected_data_len(&self) -> Result<usize, FrameError> {
        let elem_count = self
            .shape
            .iter()
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim as usize))
            .ok_or(FrameError::ShapeOverflow)?;
        elem_count
            .checked_mul(self.dtype.element_size())
            .ok_or(FrameError::ShapeOverflow)
    }

    /// Encode into the tensor wire format.
    ///
    /// `ndims(2 LE) dtype(1) shape(ndims*4 LE) name_len(2 LE) name padding data`,
    /// with zero padding so the data starts 8-byte aligned.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), FrameError> {
        if self.shape.len() > MAX_NDIMS as usize {
            return Err(FrameError::ShapeOverflow);
        }
        let name_bytes = self.name.as_bytes();
        let name_len = u16::try_from(name_bytes.len())
            .map_err(|_| FrameError::TensorNameTooLong(name_bytes.len()))?;

        let sub_header_len = 2 + 1 + self.shape.len() * 4 + 2 + name_bytes.len();
        let padding = (8 - (sub_header_len % 8)) % 8;

        buf.reserve(sub_header_len + padding + self.data.len());
        buf.put_u16_le(self.shape.len() as u16);
        buf.put_u8(self.dtype as u8);
        for &dim in &self.shape {
            buf.put_u32_le(dim);
        }
        buf.put_u16_le(name_len);
        buf.extend_from_slice(name_bytes);
        buf.put_bytes(0, padding);
        buf.extend_from_slice(&self.data);

        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes, FrameError> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode from the tensor wire format. Structural checks only.
    pub fn decode(mut buf: Bytes) -> Result<Self, FrameError> {
        if buf.len() < 3 {
            return Err(FrameError::IncompleteTensorHeader);
        }
        let ndims = buf.get_u16_le();
        if ndims > MAX_NDIMS {
            return Err(FrameError::ShapeOverflow);
        }
        let dtype = DType::from_u8(buf.get_u8())?;

        let shape_bytes = (ndims as usize) * 4;
        if buf.len() < shape_bytes + 2 {
            return Err(FrameError::IncompleteTensorHeader);
        }
        let shape = (0..ndims).map(|_| buf.get_u32_le()).collect::<Vec<_>>();

        let name_len = buf.get_u16_le() as usize;
        if buf.len() < name_len {
            return Err(FrameError::IncompleteTensorHeader);
        }
        let name = String::from_utf8(buf.split_to(name_len).to_vec())?;

        let sub_header_len = 2 + 1 + shape_bytes + 2 + name_len;
        let padding = (8 - (sub_header_len % 8)) % 8;
        if buf.len() < padding {
            return Err(FrameError::IncompleteTensorHeader);
        }
        if buf[..padding].iter().any(|&b| b != 0) {
            return Err(FrameError::InvalidPadding);
        }
        buf.advance(padding);

        Ok(Self {
            name,
            dtype,
            shape,
            data: buf,
        })
    }
}
