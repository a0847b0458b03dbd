use std::time::{SystemTime, UNIX_EPOCH};

use openssl::bn::BigNum;
use openssl::ecdsa::EcdsaSig;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Public};
use openssl::sign::Verifier;
use openssl::stack::Stack;
use openssl::x509::store::{X509Store, X509StoreBuilder};
use openssl::x509::{X509StoreContext, X509};
use serde_bytes::ByteBuf;

use super::quote::{Quote, ECDSA_SIG_SIZE};
use super::types::{
    AttestationEvidence, Collateral, TcbInfo, TcbPolicy, TcbStatus, VerifiedIdentity,
    COLLATERAL_VERSION,
};
use super::AttestationVerifier;
use crate::error::AttestError;

/// Verifies ECDSA quotes against a pinned hardware root certificate.
///
/// Checks, in order: quote structure, separation of the TCB signer from the
/// PCK chain, PCK chain to the pinned root, TCB signing chain to the pinned
/// root, TCB info signature, collateral
/// freshness, TCB status against policy, PCK revocation, and finally the
/// quote signature under the PCK leaf key.
pub struct DcapVerifier {
    /// `None` only in simulation mode.
    root: Option<X509>,
    policy: TcbPolicy,
}

impl DcapVerifier {
    /// Verifier pinned to the given PEM encoded root certificate.
    pub fn new(root_pem: &[u8], policy: TcbPolicy) -> Result<Self, AttestError> {
        let root = X509::from_pem(root_pem).map_err(|e| AttestError::ChainInvalid {
            chain: "root",
            reason: format!("failed to parse pinned root certificate: {e}"),
        })?;
        Ok(Self {
            root: Some(root),
            policy,
        })
    }

    /// Verifier that skips every hardware check.
    ///
    /// Evidence is only parsed. The resulting identity is flagged as
    /// simulated. Never use against a production enclave.
    pub fn simulation() -> Self {
        tracing::warn!("attestation running in SIMULATION mode: hardware signatures are not checked");
        Self {
            root: None,
            policy: TcbPolicy::default(),
        }
    }

    pub fn is_simulation(&self) -> bool {
        self.root.is_none()
    }

    /// Verify with an explicit clock (unix seconds) for collateral freshness.
    ///
    /// X.509 validity periods are still checked against the system clock.
    pub fn verify_at(
        &self,
        evidence: &AttestationEvidence,
        collateral: &Collateral,
        now: u64,
    ) -> Result<VerifiedIdentity, AttestError> {
        let quote = Quote::parse(evidence.as_bytes())?;

        let Some(root) = &self.root else {
            tracing::warn!(
                evidence_hash = hex::encode(evidence.hash()),
                "accepting evidence without hardware verification (simulation)"
            );
            return Ok(identity_from(&quote, evidence, None, true));
        };

        if collateral.version != COLLATERAL_VERSION {
            return Err(AttestError::MalformedCollateral(format!(
                "unsupported collateral version {}",
                collateral.version
            )));
        }

        check_signer_role(collateral)?;
        let pck_leaf = validate_chain("PCK", &collateral.pck_chain, root)?;
        let tcb_signer = validate_chain("TCB signing", &collateral.tcb_signing_chain, root)?;

        let signer_key = tcb_signer.public_key().map_err(|e| AttestError::ChainInvalid {
            chain: "TCB signing",
            reason: format!("failed to extract public key: {e}"),
        })?;
        if !verify_der_signature(&signer_key, &collateral.tcb_info, &collateral.tcb_info_signature)
        {
            return Err(AttestError::BadSignature("TCB info"));
        }

        let tcb_info: TcbInfo = serde_json::from_slice(&collateral.tcb_info)
            .map_err(|e| AttestError::MalformedCollateral(format!("TCB info JSON: {e}")))?;

        if tcb_info.next_update <= now {
            return Err(AttestError::CollateralExpired {
                next_update: tcb_info.next_update,
                now,
            });
        }

        check_revocation(&pck_leaf, &tcb_info.revoked_serials)?;

        if !self.policy.accepts(tcb_info.tcb_status) {
            return Err(AttestError::TcbStatus(tcb_info.tcb_status));
        }

        verify_quote_signature(&quote, &pck_leaf)?;

        tracing::debug!(
            tcb_status = ?tcb_info.tcb_status,
            isv_svn = quote.body.isv_svn,
            "quote signature verified"
        );

        Ok(identity_from(
            &quote,
            evidence,
            Some(tcb_info.tcb_status),
            false,
        ))
    }
}

impl AttestationVerifier for DcapVerifier {
    fn verify(
        &self,
        evidence: &AttestationEvidence,
        collateral: &Collateral,
    ) -> Result<VerifiedIdentity, AttestError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.verify_at(evidence, collateral, now)
    }
}

fn identity_from(
    quote: &Quote<'_>,
    evidence: &AttestationEvidence,
    tcb_status: Option<TcbStatus>,
    simulated: bool,
) -> VerifiedIdentity {
    VerifiedIdentity::new(
        quote.body.mr_enclave.to_vec(),
        quote.body.mr_signer,
        quote.body.isv_prod_id,
        quote.body.isv_svn,
        quote.body.debug(),
        quote.body.report_data,
        evidence.hash(),
        tcb_status,
        simulated,
    )
}

// -- Certificate Chain Validation --

/// The TCB signer is issued by the root itself and PCK leaves are issued by
/// a platform CA, so no certificate can hold both roles. A platform key
/// must never be able to vouch for its own revocation status.
fn check_signer_role(collateral: &Collateral) -> Result<(), AttestError> {
    let role = |chain: &'static str, reason: &str| AttestError::ChainInvalid {
        chain,
        reason: reason.into(),
    };
    if collateral.pck_chain.len() < 3 {
        return Err(role("PCK", "leaf must be issued by a platform CA"));
    }
    let [signer, _root] = collateral.tcb_signing_chain.as_slice() else {
        return Err(role(
            "TCB signing",
            "signer must be issued directly by the root",
        ));
    };
    let pck_issued = &collateral.pck_chain[..collateral.pck_chain.len() - 1];
    if pck_issued.iter().any(|cert| cert == signer) {
        return Err(role(
            "TCB signing",
            "signer is a certificate of the PCK chain",
        ));
    }
    Ok(())
}

/// Validate a leaf-first chain whose last element must be the pinned root.
/// Returns the parsed leaf.
fn validate_chain(
    name: &'static str,
    chain: &[ByteBuf],
    pinned_root: &X509,
) -> Result<X509, AttestError> {
    let invalid = |reason: String| AttestError::ChainInvalid {
        chain: name,
        reason,
    };

    let (Some(leaf_der), Some(root_der)) = (chain.first(), chain.last()) else {
        return Err(invalid("chain is empty".into()));
    };
    if chain.len() < 2 {
        return Err(invalid("chain has no issuer".into()));
    }

    let pinned_der = pinned_root
        .to_der()
        .map_err(|e| invalid(format!("failed to encode pinned root: {e}")))?;
    if root_der.as_slice() != pinned_der.as_slice() {
        return Err(AttestError::UntrustedRoot(name));
    }

    let mut store_builder =
        X509StoreBuilder::new().map_err(|e| invalid(format!("failed to create X509 store: {e}")))?;
    store_builder
        .add_cert(pinned_root.clone())
        .map_err(|e| invalid(format!("failed to add root cert to store: {e}")))?;
    let store: X509Store = store_builder.build();

    let mut intermediates =
        Stack::new().map_err(|e| invalid(format!("failed to create cert stack: {e}")))?;
    for (i, der) in chain[1..chain.len() - 1].iter().enumerate() {
        let cert = X509::from_der(der)
            .map_err(|e| invalid(format!("failed to parse intermediate {i}: {e}")))?;
        intermediates
            .push(cert)
            .map_err(|e| invalid(format!("failed to push intermediate {i}: {e}")))?;
    }

    let leaf = X509::from_der(leaf_der)
        .map_err(|e| invalid(format!("failed to parse leaf certificate: {e}")))?;

    let mut ctx = X509StoreContext::new()
        .map_err(|e| invalid(format!("failed to create store context: {e}")))?;
    let mut failure = String::new();
    let valid = ctx
        .init(&store, &leaf, &intermediates, |ctx| {
            let ok = ctx.verify_cert()?;
            if !ok {
                failure = ctx.error().to_string();
            }
            Ok(ok)
        })
        .map_err(|e| invalid(format!("verification error: {e}")))?;

    if !valid {
        return Err(invalid(failure));
    }

    Ok(leaf)
}

fn check_revocation(leaf: &X509, revoked_serials: &[String]) -> Result<(), AttestError> {
    let serial = leaf
        .serial_number()
        .to_bn()
        .map_err(|e| AttestError::MalformedCollateral(format!("PCK serial: {e}")))?;

    for entry in revoked_serials {
        let revoked = BigNum::from_hex_str(entry).map_err(|e| {
            AttestError::MalformedCollateral(format!("revoked serial {entry:?}: {e}"))
        })?;
        if revoked == serial {
            return Err(AttestError::Revoked(entry.to_ascii_lowercase()));
        }
    }
    Ok(())
}

// -- Signature Verification --

fn verify_der_signature(key: &PKey<Public>, data: &[u8], der_sig: &[u8]) -> bool {
    let Ok(mut verifier) = Verifier::new(MessageDigest::sha256(), key) else {
        return false;
    };
    verifier.verify_oneshot(der_sig, data).unwrap_or(false)
}

/// Verify the raw `r || s` quote signature under the PCK leaf's P-256 key.
fn verify_quote_signature(quote: &Quote<'_>, pck_leaf: &X509) -> Result<(), AttestError> {
    let pkey = pck_leaf
        .public_key()
        .map_err(|_| AttestError::BadSignature("quote"))?;
    let ec_key = pkey.ec_key().map_err(|_| AttestError::BadSignature("quote"))?;
    if ec_key.group().curve_name() != Some(Nid::X9_62_PRIME256V1) {
        return Err(AttestError::ChainInvalid {
            chain: "PCK",
            reason: "leaf key is not P-256".into(),
        });
    }

    let half = ECDSA_SIG_SIZE / 2;
    let r = BigNum::from_slice(&quote.signature[..half])
        .map_err(|_| AttestError::BadSignature("quote"))?;
    let s = BigNum::from_slice(&quote.signature[half..])
        .map_err(|_| AttestError::BadSignature("quote"))?;
    let der_sig = EcdsaSig::from_private_components(r, s)
        .and_then(|sig| sig.to_der())
        .map_err(|_| AttestError::BadSignature("quote"))?;

    if verify_der_signature(&pkey, quote.signed, &der_sig) {
        Ok(())
    } else {
        Err(AttestError::BadSignature("quote"))
    }
}
