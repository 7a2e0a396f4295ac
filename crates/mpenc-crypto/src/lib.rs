//! # mpenc-crypto
//!
//! Cryptographic primitives for the mpENC protocol engine.
//!
//! mpENC fixes its cipher suite; no algorithm negotiation is permitted.
//! This crate wraps the underlying libraries with mpENC-specific types so
//! that the protocol crates never touch a vendor API directly.
//!
//! ## Modules
//!
//! - [`ed25519`] — Ed25519 signing and verification (RFC 8032), used for
//!   per-message and session-acknowledgement signatures
//! - [`x25519`] — Curve25519 scalar multiplication (RFC 7748), the group
//!   element arithmetic of the CLIQUES key agreement
//! - [`sha256`] — SHA-256 hashing for session ids, key hints and packet ids
//! - [`aes_ctr`] — AES-128-CTR payload encryption
//! - [`rsa`] — RSA-PKCS1-v1.5 session-signature authentication with the
//!   static identity key
//! - [`random`] — CSPRNG helpers for nonces and key seeds

pub mod aes_ctr;
pub mod ed25519;
pub mod random;
pub mod rsa;
pub mod sha256;
pub mod x25519;

/// Error types for cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Signature verification failed (Ed25519 or RSA).
    #[error("signature verification failed")]
    SignatureVerification,

    /// RSA key generation or signing failed.
    #[error("RSA error: {0}")]
    Rsa(String),

    /// Invalid key or nonce length.
    #[error("invalid length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// Invalid input data.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;
