//! SGX ECDSA quote (version 3) layout.
//!
//! ```text
//! [0..48)     header
//! [48..432)   report body
//! [432..436)  signature length (u32 LE, must be 64)
//! [436..500)  ECDSA-P256 signature, r || s, over [0..432)
//! ```
//!
//! All integers are little-endian.

use crate::error::AttestError;

/// Only supported quote version.
pub const QUOTE_VERSION: u16 = 3;

/// ECDSA-P256 attestation key type.
pub const ATT_KEY_TYPE_P256: u16 = 2;

/// TEE type for SGX enclaves.
pub const TEE_TYPE_SGX: u32 = 0;

pub const HEADER_SIZE: usize = 48;
pub const REPORT_BODY_SIZE: usize = 384;

/// Bytes covered by the quote signature.
pub const SIGNED_SIZE: usize = HEADER_SIZE + REPORT_BODY_SIZE;

/// Size of ECDSA P-256 signature (r || s, 32 + 32 bytes).
pub const ECDSA_SIG_SIZE: usize = 64;

/// Total size of a well-formed quote.
pub const QUOTE_SIZE: usize = SIGNED_SIZE + 4 + ECDSA_SIG_SIZE;

/// Measurement register size (MRENCLAVE, MRSIGNER).
pub const MEASUREMENT_SIZE: usize = 32;

pub const REPORT_DATA_SIZE: usize = 64;

const MISC_SELECT_OFFSET: usize = 16;
const ATTRIBUTES_OFFSET: usize = 48;
const MR_ENCLAVE_OFFSET: usize = 64;
const MR_SIGNER_OFFSET: usize = 128;
const ISV_PROD_ID_OFFSET: usize = 256;
const ISV_SVN_OFFSET: usize = 258;
const REPORT_DATA_OFFSET: usize = 320;

/// Attribute flag set when the enclave was launched in debug mode.
pub const ATTRIBUTE_DEBUG: u64 = 0x2;

fn read_u16(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([data[at], data[at + 1]])
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn read_array<const N: usize>(data: &[u8], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&data[at..at + N]);
    out
}

/// Parsed quote header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteHeader {
    pub version: u16,
    pub att_key_type: u16,
    pub tee_type: u32,
    pub qe_svn: u16,
    pub pce_svn: u16,
    pub qe_vendor_id: [u8; 16],
    pub user_data: [u8; 20],
}

impl QuoteHeader {
    fn parse(data: &[u8]) -> Result<Self, AttestError> {
        let version = read_u16(data, 0);
        if version != QUOTE_VERSION {
            return Err(AttestError::UnsupportedVersion(version));
        }

        let att_key_type = read_u16(data, 2);
        if att_key_type != ATT_KEY_TYPE_P256 {
            return Err(AttestError::UnsupportedKeyType(att_key_type));
        }

        let tee_type = read_u32(data, 4);
        if tee_type != TEE_TYPE_SGX {
            return Err(AttestError::UnsupportedTeeType(tee_type));
        }

        Ok(Self {
            version,
            att_key_type,
            tee_type,
            qe_svn: read_u16(data, 8),
            pce_svn: read_u16(data, 10),
            qe_vendor_id: read_array(data, 12),
            user_data: read_array(data, 28),
        })
    }

    #[cfg(any(test, feature = "mock"))]
    pub(crate) fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..2].copy_from_slice(&self.version.to_le_bytes());
        out[2..4].copy_from_slice(&self.att_key_type.to_le_bytes());
        out[4..8].copy_from_slice(&self.tee_type.to_le_bytes());
        out[8..10].copy_from_slice(&self.qe_svn.to_le_bytes());
        out[10..12].copy_from_slice(&self.pce_svn.to_le_bytes());
        out[12..28].copy_from_slice(&self.qe_vendor_id);
        out[28..48].copy_from_slice(&self.user_data);
        out
    }
}

/// Parsed enclave report body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportBody {
    pub cpu_svn: [u8; 16],
    pub misc_select: u32,
    pub attributes: [u8; 16],
    pub mr_enclave: [u8; MEASUREMENT_SIZE],
    pub mr_signer: [u8; MEASUREMENT_SIZE],
    pub isv_prod_id: u16,
    pub isv_svn: u16,
    pub report_data: [u8; REPORT_DATA_SIZE],
}

impl ReportBody {
    fn parse(body: &[u8]) -> Self {
        Self {
            cpu_svn: read_array(body, 0),
            misc_select: read_u32(body, MISC_SELECT_OFFSET),
            attributes: read_array(body, ATTRIBUTES_OFFSET),
            mr_enclave: read_array(body, MR_ENCLAVE_OFFSET),
            mr_signer: read_array(body, MR_SIGNER_OFFSET),
            isv_prod_id: read_u16(body, ISV_PROD_ID_OFFSET),
            isv_svn: read_u16(body, ISV_SVN_OFFSET),
            report_data: read_array(body, REPORT_DATA_OFFSET),
        }
    }

    /// Low 64 bits of the attributes field.
    pub fn flags(&self) -> u64 {
        let mut low = [0u8; 8];
        low.copy_from_slice(&self.attributes[..8]);
        u64::from_le_bytes(low)
    }

    pub fn debug(&self) -> bool {
        self.flags() & ATTRIBUTE_DEBUG != 0
    }

    #[cfg(any(test, feature = "mock"))]
    pub(crate) fn encode(&self) -> [u8; REPORT_BODY_SIZE] {
        let mut out = [0u8; REPORT_BODY_SIZE];
        out[0..16].copy_from_slice(&self.cpu_svn);
        out[MISC_SELECT_OFFSET..MISC_SELECT_OFFSET + 4]
            .copy_from_slice(&self.misc_select.to_le_bytes());
        out[ATTRIBUTES_OFFSET..ATTRIBUTES_OFFSET + 16].copy_from_slice(&self.attributes);
        out[MR_ENCLAVE_OFFSET..MR_ENCLAVE_OFFSET + MEASUREMENT_SIZE]
            .copy_from_slice(&self.mr_enclave);
        out[MR_SIGNER_OFFSET..MR_SIGNER_OFFSET + MEASUREMENT_SIZE]
            .copy_from_slice(&self.mr_signer);
        out[ISV_PROD_ID_OFFSET..ISV_PROD_ID_OFFSET + 2]
            .copy_from_slice(&self.isv_prod_id.to_le_bytes());
        out[ISV_SVN_OFFSET..ISV_SVN_OFFSET + 2].copy_from_slice(&self.isv_svn.to_le_bytes());
        out[REPORT_DATA_OFFSET..REPORT_DATA_OFFSET + REPORT_DATA_SIZE]
            .copy_from_slice(&self.report_data);
        out
    }
}

/// A structurally valid quote. The signature has not been checked yet.
#[derive(Debug, Clone)]
pub struct Quote<'a> {
    pub header: QuoteHeader,
    pub body: ReportBody,
    /// Header and body bytes, exactly as signed.
    pub signed: &'a [u8],
    /// Raw `r || s`.
    pub signature: [u8; ECDSA_SIG_SIZE],
}

impl<'a> Quote<'a> {
    pub fn parse(raw: &'a [u8]) -> Result<Self, AttestError> {
        if raw.len() < SIGNED_SIZE + 4 {
            return Err(AttestError::Malformed(format!(
                "quote too short: need at least {} bytes, got {}",
                SIGNED_SIZE + 4,
                raw.len()
            )));
        }

        let header = QuoteHeader::parse(&raw[..HEADER_SIZE])?;
        let body = ReportBody::parse(&raw[HEADER_SIZE..SIGNED_SIZE]);

        let sig_len = read_u32(raw, SIGNED_SIZE) as usize;
        if sig_len != ECDSA_SIG_SIZE {
            return Err(AttestError::Malformed(format!(
                "signature length {sig_len}, expected {ECDSA_SIG_SIZE}"
            )));
        }
        if raw.len() != QUOTE_SIZE {
            return Err(AttestError::Malformed(format!(
                "quote length {}, expected {QUOTE_SIZE}",
                raw.len()
            )));
        }

        Ok(Self {
            header,
            body,
            signed: &raw[..SIGNED_SIZE],
            signature: read_array(raw, SIGNED_SIZE + 4),
        })
    }
}

/// Assemble quote bytes from parts and a raw `r || s` signature.
#[cfg(any(test, feature = "mock"))]
pub(crate) fn assemble(
    header: &QuoteHeader,
    body: &ReportBody,
    sign: impl FnOnce(&[u8]) -> [u8; ECDSA_SIG_SIZE],
) -> Vec<u8> {
    let mut quote = Vec::with_capacity(QUOTE_SIZE);
    quote.extend_from_slice(&header.encode());
    quote.extend_from_slice(&body.encode());
    let signature = sign(&quote);
    quote.extend_from_slice(&(ECDSA_SIG_SIZE as u32).to_le_bytes());
    quote.extend_from_slice(&signature);
    quote
}
