//! A software stand-in for the hardware quoting stack.
//!
//! Owns a throwaway P-256 PKI (root CA, PCK intermediate, PCK leaf, TCB
//! signer) and produces quotes and collateral that [`DcapVerifier`] accepts
//! when pinned to [`SyntheticPlatform::root_pem`].
//!
//! [`DcapVerifier`]: crate::attestation::dcap::DcapVerifier

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::ecdsa::EcdsaSig;
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::sign::Signer;
use openssl::x509::extension::{BasicConstraints, KeyUsage};
use openssl::x509::{X509Builder, X509NameBuilder, X509};
use serde_bytes::ByteBuf;
use sha2::{Digest, Sha256};

use crate::attestation::quote::{
    self, QuoteHeader, ReportBody, ATTRIBUTE_DEBUG, ATT_KEY_TYPE_P256, ECDSA_SIG_SIZE,
    QUOTE_VERSION, TEE_TYPE_SGX,
};
use crate::attestation::types::{
    AttestationEvidence, Collateral, TcbInfo, TcbStatus, COLLATERAL_VERSION,
};
use crate::attestation::AttestationProvider;
use crate::error::AttestError;

/// Serial number of every synthetic PCK leaf certificate.
pub const PCK_LEAF_SERIAL: u32 = 0x1A2B_3C4D;

/// What the synthetic platform claims about the enclave and itself.
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    pub mr_enclave: [u8; 32],
    pub mr_signer: [u8; 32],
    pub isv_prod_id: u16,
    pub isv_svn: u16,
    pub debug: bool,
    pub tcb_status: TcbStatus,
    /// List the PCK leaf serial in the collateral's revocation list.
    pub revoke_pck: bool,
    /// Issue collateral whose `next_update` is already in the past.
    pub collateral_expired: bool,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            mr_enclave: [0x5E; 32],
            mr_signer: [0x51; 32],
            isv_prod_id: 1,
            isv_svn: 2,
            debug: false,
            tcb_status: TcbStatus::UpToDate,
            revoke_pck: false,
            collateral_expired: false,
        }
    }
}

pub struct SyntheticPlatform {
    config: PlatformConfig,
    root: X509,
    pck_intermediate: X509,
    pck_leaf: X509,
    pck_key: EcKey<Private>,
    tcb_signer: X509,
    tcb_key: PKey<Private>,
}

fn generation(e: ErrorStack) -> AttestError {
    AttestError::GenerationFailed(e.to_string())
}

fn p256_key() -> Result<EcKey<Private>, ErrorStack> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
    EcKey::generate(&group)
}

/// Issue a certificate for `subject_key`. Self-signed when `issuer` is `None`.
fn issue(
    common_name: &str,
    serial: u32,
    subject_key: &EcKey<Private>,
    issuer: Option<(&X509, &EcKey<Private>)>,
    ca: bool,
) -> Result<X509, ErrorStack> {
    let pkey = PKey::from_ec_key(subject_key.clone())?;

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_text("CN", common_name)?;
    let name = name.build();

    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    let serial = BigNum::from_u32(serial)?.to_asn1_integer()?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_pubkey(&pkey)?;
    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(3650)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;

    if ca {
        builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .critical()
                .key_cert_sign()
                .crl_sign()
                .build()?,
        )?;
    } else {
        builder.append_extension(KeyUsage::new().critical().digital_signature().build()?)?;
    }

    let signing_key = match issuer {
        Some((issuer_cert, issuer_key)) => {
            builder.set_issuer_name(issuer_cert.subject_name())?;
            PKey::from_ec_key(issuer_key.clone())?
        }
        None => {
            builder.set_issuer_name(&name)?;
            pkey
        }
    };
    builder.sign(&signing_key, MessageDigest::sha256())?;
    Ok(builder.build())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl SyntheticPlatform {
    /// Generate a fresh PKI. Every platform has its own root.
    pub fn new(config: PlatformConfig) -> Result<Self, AttestError> {
        let root_key = p256_key().map_err(generation)?;
        let root = issue("Synthetic Attestation Root CA", 1, &root_key, None, true)
            .map_err(generation)?;

        let intermediate_key = p256_key().map_err(generation)?;
        let pck_intermediate = issue(
            "Synthetic PCK Platform CA",
            2,
            &intermediate_key,
            Some((&root, &root_key)),
            true,
        )
        .map_err(generation)?;

        let pck_key = p256_key().map_err(generation)?;
        let pck_leaf = issue(
            "Synthetic PCK Certificate",
            PCK_LEAF_SERIAL,
            &pck_key,
            Some((&pck_intermediate, &intermediate_key)),
            false,
        )
        .map_err(generation)?;

        let tcb_ec_key = p256_key().map_err(generation)?;
        let tcb_signer = issue(
            "Synthetic TCB Signing",
            3,
            &tcb_ec_key,
            Some((&root, &root_key)),
            false,
        )
        .map_err(generation)?;
        let tcb_key = PKey::from_ec_key(tcb_ec_key).map_err(generation)?;

        Ok(Self {
            config,
            root,
            pck_intermediate,
            pck_leaf,
            pck_key,
            tcb_signer,
            tcb_key,
        })
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    /// The root certificate a verifier should pin.
    pub fn root_pem(&self) -> Vec<u8> {
        // PEM encoding of a certificate we built ourselves does not fail.
        self.root.to_pem().unwrap_or_default()
    }

    /// Produce a signed quote over `report_data` plus matching collateral.
    pub fn generate(
        &self,
        report_data: &[u8; 64],
    ) -> Result<(AttestationEvidence, Collateral), AttestError> {
        let evidence = self.quote(report_data)?;
        let collateral = self.collateral()?;
        Ok((evidence, collateral))
    }

    fn quote(&self, report_data: &[u8; 64]) -> Result<AttestationEvidence, AttestError> {
        let header = QuoteHeader {
            version: QUOTE_VERSION,
            att_key_type: ATT_KEY_TYPE_P256,
            tee_type: TEE_TYPE_SGX,
            qe_svn: 1,
            pce_svn: 1,
            qe_vendor_id: [0x93; 16],
            user_data: [0; 20],
        };
        let mut attributes = [0u8; 16];
        // INIT, plus DEBUG when requested.
        attributes[0] = 0x01;
        if self.config.debug {
            attributes[0] |= ATTRIBUTE_DEBUG as u8;
        }
        let body = ReportBody {
            cpu_svn: [0; 16],
            misc_select: 0,
            attributes,
            mr_enclave: self.config.mr_enclave,
            mr_signer: self.config.mr_signer,
            isv_prod_id: self.config.isv_prod_id,
            isv_svn: self.config.isv_svn,
            report_data: *report_data,
        };

        let mut signed = Vec::with_capacity(quote::SIGNED_SIZE);
        signed.extend_from_slice(&header.encode());
        signed.extend_from_slice(&body.encode());
        let signature = self.sign_raw(&signed).map_err(generation)?;

        Ok(AttestationEvidence::new(quote::assemble(
            &header,
            &body,
            |_| signature,
        )))
    }

    /// ECDSA P-256 over SHA-256, as raw `r || s`.
    fn sign_raw(&self, data: &[u8]) -> Result<[u8; ECDSA_SIG_SIZE], ErrorStack> {
        let digest = Sha256::digest(data);
        let sig = EcdsaSig::sign(&digest, &self.pck_key)?;
        let half = ECDSA_SIG_SIZE / 2;
        let mut raw = [0u8; ECDSA_SIG_SIZE];
        raw[..half].copy_from_slice(&sig.r().to_vec_padded(half as i32)?);
        raw[half..].copy_from_slice(&sig.s().to_vec_padded(half as i32)?);
        Ok(raw)
    }

    /// DER ECDSA signature over `data` made with the PCK leaf key.
    #[cfg(test)]
    pub(crate) fn sign_with_pck_key(&self, data: &[u8]) -> Vec<u8> {
        EcdsaSig::sign(&Sha256::digest(data), &self.pck_key)
            .and_then(|sig| sig.to_der())
            .unwrap()
    }

    fn collateral(&self) -> Result<Collateral, AttestError> {
        let now = unix_now();
        let next_update = if self.config.collateral_expired {
            now.saturating_sub(60)
        } else {
            now + 30 * 24 * 3600
        };

        let mut revoked_serials = vec!["DEADBEEF".to_string()];
        if self.config.revoke_pck {
            revoked_serials.push(format!("{PCK_LEAF_SERIAL:X}"));
        }

        let info = TcbInfo {
            version: 1,
            issue_date: now.saturating_sub(3600),
            next_update,
            tcb_status: self.config.tcb_status,
            revoked_serials,
        };
        let tcb_info = serde_json::to_vec(&info)
            .map_err(|e| AttestError::GenerationFailed(format!("TCB info JSON: {e}")))?;

        let mut signer =
            Signer::new(MessageDigest::sha256(), &self.tcb_key).map_err(generation)?;
        let tcb_info_signature = signer.sign_oneshot_to_vec(&tcb_info).map_err(generation)?;

        let der = |cert: &X509| cert.to_der().map(ByteBuf::from).map_err(generation);

        Ok(Collateral {
            version: COLLATERAL_VERSION,
            pck_chain: vec![
                der(&self.pck_leaf)?,
                der(&self.pck_intermediate)?,
                der(&self.root)?,
            ],
            tcb_info: ByteBuf::from(tcb_info),
            tcb_info_signature: ByteBuf::from(tcb_info_signature),
            tcb_signing_chain: vec![der(&self.tcb_signer)?, der(&self.root)?],
        })
    }
}

#[async_trait]
impl AttestationProvider for SyntheticPlatform {
    async fn attest(
        &self,
        report_data: &[u8; 64],
    ) -> Result<(AttestationEvidence, Collateral), AttestError> {
        self.generate(report_data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::quote::Quote;

    #[test]
    fn quote_reflects_config() {
        let platform = SyntheticPlatform::new(PlatformConfig {
            debug: true,
            isv_svn: 9,
            ..Default::default()
        })
        .unwrap();
        let (evidence, collateral) = platform.generate(&[0x33; 64]).unwrap();

        let quote = Quote::parse(evidence.as_bytes()).unwrap();
        assert!(quote.body.debug());
        assert_eq!(quote.body.isv_svn, 9);
        assert_eq!(quote.body.report_data, [0x33; 64]);
        assert_eq!(collateral.pck_chain.len(), 3);
        assert_eq!(collateral.tcb_signing_chain.len(), 2);
    }

    #[test]
    fn revocation_list_names_leaf_serial() {
        let platform = SyntheticPlatform::new(PlatformConfig {
            revoke_pck: true,
            ..Default::default()
        })
        .unwrap();
        let (_, collateral) = platform.generate(&[0; 64]).unwrap();
        let info: TcbInfo = serde_json::from_slice(&collateral.tcb_info).unwrap();
        assert!(info.revoked_serials.contains(&"1A2B3C4D".to_string()));
    }

    #[test]
    fn roots_differ_between_platforms() {
        let a = SyntheticPlatform::new(PlatformConfig::default()).unwrap();
        let b = SyntheticPlatform::new(PlatformConfig::default()).unwrap();
        assert_ne!(a.root_pem(), b.root_pem());
        assert!(a.root_pem().starts_with(b"-----BEGIN CERTIFICATE-----"));
    }
}
