use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use super::SymmetricKey;
use crate::error::CryptoError;

/// An ephemeral X25519 key pair, generated fresh for every connection.
pub struct KeyPair {
    pub secret: StaticSecret,
    pub public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }
}

/// Directional keys for one session.
pub struct SessionKeys {
    pub send: Zeroizing<SymmetricKey>,
    pub recv: Zeroizing<SymmetricKey>,
}

/// Perform X25519 Diffie-Hellman and derive send/recv keys via HKDF.
///
/// The client's send key is the enclave's recv key and vice versa.
pub fn derive_session_keys(
    our_secret: &StaticSecret,
    their_public: &PublicKey,
    transcript_hash: &[u8; 32],
    is_client: bool,
) -> Result<SessionKeys, CryptoError> {
    let shared_secret = our_secret.diffie_hellman(their_public);
    if !shared_secret.was_contributory() {
        return Err(CryptoError::NonContributoryKey);
    }

    let hkdf = Hkdf::<Sha256>::new(Some(transcript_hash), shared_secret.as_bytes());

    let mut client_to_enclave = Zeroizing::new([0u8; 32]);
    let mut enclave_to_client = Zeroizing::new([0u8; 32]);

    hkdf.expand(b"aic-client-to-enclave", &mut client_to_enclave[..])
        .map_err(|_| CryptoError::HkdfExpandFailed)?;
    hkdf.expand(b"aic-enclave-to-client", &mut enclave_to_client[..])
        .map_err(|_| CryptoError::HkdfExpandFailed)?;

    if is_client {
        Ok(SessionKeys {
            send: client_to_enclave,
            recv: enclave_to_client,
        })
    } else {
        Ok(SessionKeys {
            send: enclave_to_client,
            recv: client_to_enclave,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_derivation_symmetry() {
        let client = KeyPair::generate();
        let enclave = KeyPair::generate();
        let transcript = [0xCC; 32];

        let c = derive_session_keys(&client.secret, &enclave.public, &transcript, true).unwrap();
        let e = derive_session_keys(&enclave.secret, &client.public, &transcript, false).unwrap();

        assert_eq!(*c.send, *e.recv);
        assert_eq!(*e.send, *c.recv);
        assert_ne!(*c.send, *c.recv);
    }

    #[test]
    fn transcript_changes_keys() {
        let client = KeyPair::generate();
        let enclave = KeyPair::generate();

        let a = derive_session_keys(&client.secret, &enclave.public, &[1; 32], true).unwrap();
        let b = derive_session_keys(&client.secret, &enclave.public, &[2; 32], true).unwrap();
        assert_ne!(*a.send, *b.send);
    }

    #[test]
    fn identity_point_rejected() {
        let client = KeyPair::generate();
        let zero = PublicKey::from([0u8; 32]);
        let result = derive_session_keys(&client.secret, &zero, &[0; 32], true);
        assert!(matches!(result, Err(CryptoError::NonContributoryKey)));
    }
}
