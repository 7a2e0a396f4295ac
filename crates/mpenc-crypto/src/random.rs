//! CSPRNG helpers.
//!
//! Every piece of fresh key material in the protocol — DH exponents,
//! session nonces, signing-key seeds, AES nonces — is drawn from the
//! operating system RNG.

use rand::rngs::OsRng;
use rand::RngCore;

/// Fill a fixed-size array with random bytes.
pub fn random_array<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// A fresh 256-bit nonce.
pub fn nonce256() -> [u8; 32] {
    random_array()
}
