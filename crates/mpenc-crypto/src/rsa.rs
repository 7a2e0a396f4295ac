//! RSA-PKCS1-v1.5 session-signature authentication.
//!
//! Each participant holds a long-lived static RSA keypair, used for one
//! thing only: signing the session acknowledgement that binds the
//! member's id and ephemeral public key to the session id. Peers verify
//! it against the static public key directory before admitting the
//! ephemeral key.
//!
//! Signatures are PKCS#1 v1.5 over a SHA-256 digest. Padding bytes come
//! from the library's CSPRNG.

use ::rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use rand::rngs::OsRng;
use sha2::Sha256;

use crate::{sha256, CryptoError, Result};

/// Default static key modulus length in bits.
pub const DEFAULT_KEY_BITS: usize = 2048;

/// A static RSA private key.
#[derive(Clone)]
pub struct StaticPrivateKey {
    inner: RsaPrivateKey,
}

/// A static RSA public key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StaticPublicKey {
    inner: RsaPublicKey,
}

impl StaticPrivateKey {
    /// Generate a fresh static keypair.
    pub fn generate(bits: usize) -> Result<Self> {
        let inner = RsaPrivateKey::new(&mut OsRng, bits).map_err(|e| CryptoError::Rsa(e.to_string()))?;
        Ok(Self { inner })
    }

    /// Get the corresponding public key.
    pub fn public_key(&self) -> StaticPublicKey {
        StaticPublicKey {
            inner: self.inner.to_public_key(),
        }
    }

    /// Sign a message (PKCS#1 v1.5 over its SHA-256 digest).
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let digest = sha256::hash(message);
        self.inner
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .map_err(|e| CryptoError::Rsa(e.to_string()))
    }
}

impl StaticPublicKey {
    /// Verify a signature on a message.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        let digest = sha256::hash(message);
        self.inner
            .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
            .map_err(|_| CryptoError::SignatureVerification)
    }
}

impl std::fmt::Debug for StaticPrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticPrivateKey").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 1024-bit keys keep the tests fast; production keys use
    // DEFAULT_KEY_BITS.
    const TEST_KEY_BITS: usize = 1024;

    #[test]
    fn test_sign_verify_roundtrip() {
        let key = StaticPrivateKey::generate(TEST_KEY_BITS).expect("keygen");
        let sig = key.sign(b"session acknowledgement").expect("sign");
        assert!(key
            .public_key()
            .verify(b"session acknowledgement", &sig)
            .is_ok());
    }

    #[test]
    fn test_wrong_message_fails() {
        let key = StaticPrivateKey::generate(TEST_KEY_BITS).expect("keygen");
        let sig = key.sign(b"original").expect("sign");
        assert!(key.public_key().verify(b"tampered", &sig).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let key1 = StaticPrivateKey::generate(TEST_KEY_BITS).expect("keygen");
        let key2 = StaticPrivateKey::generate(TEST_KEY_BITS).expect("keygen");
        let sig = key1.sign(b"message").expect("sign");
        assert!(key2.public_key().verify(b"message", &sig).is_err());
    }
}
