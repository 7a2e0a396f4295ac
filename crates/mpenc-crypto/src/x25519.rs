//! Curve25519 scalar multiplication (RFC 7748).
//!
//! The CLIQUES tree-DH treats Curve25519 points as its group elements:
//! an intermediate key is a point, a private contribution is a scalar,
//! and "multiplying a key into an element" is X25519 scalar
//! multiplication. The chain is seeded with the curve basepoint, which
//! stands in for the group identity in the intermediate-key vector.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret, X25519_BASEPOINT_BYTES};
use zeroize::Zeroize;

use crate::{CryptoError, Result};

/// A private Diffie-Hellman exponent (256 bits).
#[derive(Clone, Serialize, Deserialize, Zeroize)]
#[zeroize(drop)]
pub struct DhSecret {
    bytes: [u8; 32],
}

/// A Curve25519 group element (an intermediate or group key).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhElement {
    bytes: [u8; 32],
}

impl DhSecret {
    /// Generate a fresh random exponent.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Create an exponent from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    /// Get the raw bytes of this exponent.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.bytes
    }

    /// Multiply this exponent into a group element.
    pub fn mult(&self, element: &DhElement) -> DhElement {
        let secret = StaticSecret::from(self.bytes);
        let point = PublicKey::from(element.bytes);
        let shared = secret.diffie_hellman(&point);
        DhElement {
            bytes: *shared.as_bytes(),
        }
    }

    /// Multiply this exponent into the basepoint.
    pub fn base_mult(&self) -> DhElement {
        self.mult(&DhElement::base())
    }
}

impl DhElement {
    /// The curve basepoint, seeding the intermediate-key chain.
    pub fn base() -> Self {
        Self {
            bytes: X25519_BASEPOINT_BYTES,
        }
    }

    /// Create an element from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    /// Create an element from a byte slice.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidLength {
            expected: 32,
            actual: bytes.len(),
        })?;
        Ok(Self { bytes })
    }

    /// Get the raw bytes of this element.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.bytes
    }

    /// Get the raw bytes as a slice.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

impl std::fmt::Debug for DhSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhSecret").finish_non_exhaustive()
    }
}
