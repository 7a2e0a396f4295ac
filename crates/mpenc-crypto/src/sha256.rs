//! SHA-256 hashing.
//!
//! Used for session ids, the sidkey hash, packet ids and proposal
//! hashes. All protocol digests are full 32-byte SHA-256 outputs; the
//! one-byte session hint is taken from the first byte of the sidkey
//! hash by the caller.

use sha2::{Digest, Sha256};

/// Hash a single byte string.
pub fn hash(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Hash the concatenation of several byte strings.
pub fn hash_parts(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_vector() {
        // SHA-256 of the empty string.
        let expected =
            hex::decode("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855")
                .expect("valid hex");
        assert_eq!(hash(b"").as_slice(), expected.as_slice());
    }

    #[test]
    fn test_abc_vector() {
        // FIPS 180-2 appendix B.1.
        let expected =
            hex::decode("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
                .expect("valid hex");
        assert_eq!(hash(b"abc").as_slice(), expected.as_slice());
    }

    #[test]
    fn test_parts_equal_concatenation() {
        assert_eq!(hash_parts(&[b"ab", b"c"]), hash(b"abc"));
        assert_eq!(hash_parts(&[b"", b"abc", b""]), hash(b"abc"));
    }
}
