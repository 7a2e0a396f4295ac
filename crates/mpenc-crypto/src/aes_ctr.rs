//! AES-128-CTR payload encryption.
//!
//! Data-message payloads are encrypted with the first 16 bytes of the
//! group key and an initial counter block of a fresh 96-bit nonce
//! followed by a 32-bit zero counter. Authentication is a detached
//! Ed25519 signature at the message layer, not an AEAD tag.

use aes::cipher::{KeyIvInit, StreamCipher};

/// AES-128 key length in bytes.
pub const KEY_SIZE: usize = 16;

/// Nonce length in bytes (96 bits).
pub const NONCE_SIZE: usize = 12;

type Aes128Ctr = ctr::Ctr32BE<aes::Aes128>;

fn keystream(key: &[u8; KEY_SIZE], nonce: &[u8; NONCE_SIZE], data: &[u8]) -> Vec<u8> {
    let mut iv = [0u8; 16];
    iv[..NONCE_SIZE].copy_from_slice(nonce);
    let mut cipher = Aes128Ctr::new(key.into(), &iv.into());
    let mut buf = data.to_vec();
    cipher.apply_keystream(&mut buf);
    buf
}

/// Encrypt a padded plaintext.
pub fn encrypt(key: &[u8; KEY_SIZE], nonce: &[u8; NONCE_SIZE], plaintext: &[u8]) -> Vec<u8> {
    keystream(key, nonce, plaintext)
}

/// Decrypt a ciphertext.
pub fn decrypt(key: &[u8; KEY_SIZE], nonce: &[u8; NONCE_SIZE], ciphertext: &[u8]) -> Vec<u8> {
    keystream(key, nonce, ciphertext)
}
