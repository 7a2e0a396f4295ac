//! # mpenc-message
//!
//! Authenticated encryption for in-session data messages.
//!
//! Built from a completed session snapshot: payloads are signed with
//! the sender's ephemeral Ed25519 key (domain-separated with the
//! session's sidkey hash, so a signature cannot be replayed into
//! another session), encrypted with AES-128-CTR under the first half of
//! the group key, and padded to exponentially growing size buckets to
//! blunt length analysis.
//!
//! The one-byte `SIDKEY_HINT` prefix lets a receiver pick the right
//! session before committing to the expensive checks.

use mpenc_crypto::ed25519::{SigningKey, VerifyingKey};
use mpenc_crypto::{aes_ctr, random, sha256};
use mpenc_greet::greeter::GreetStore;
use mpenc_wire::{TlvReader, TlvType, TlvWriter, WireMessageType, PROTOCOL_VERSION};

/// Domain separation prefix of data-message signatures; followed by the
/// sidkey hash.
pub const DATA_SIGNATURE_MAGIC: &[u8] = b"datamsgsig";

/// Error types for the data-message layer.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    /// The claimed author has no ephemeral key in this session.
    #[error("unknown author: {0}")]
    UnknownAuthor(String),

    /// The payload signature does not verify.
    #[error("data message signature invalid")]
    BadSignature,

    /// The payload structure is broken.
    #[error("malformed data message: {0}")]
    Malformed(String),

    /// Wire codec failure.
    #[error(transparent)]
    Wire(#[from] mpenc_wire::WireError),

    /// Primitive failure.
    #[error(transparent)]
    Crypto(#[from] mpenc_crypto::CryptoError),
}

pub type Result<T> = std::result::Result<T, MessageError>;

/// A verified and decrypted data message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedMessage {
    /// The sender.
    pub author: String,
    /// Opaque parent packet ids; ordering semantics live above this
    /// layer.
    pub parents: Vec<Vec<u8>>,
    /// Everyone else in the session.
    pub readers: Vec<String>,
    /// The UTF-8 message body.
    pub body: String,
}

/// Data-message encryption/verification context of one READY session.
pub struct MessageSecurity {
    members: Vec<String>,
    ephemeral_key: SigningKey,
    ephemeral_pub_keys: Vec<VerifyingKey>,
    group_key: [u8; 32],
    sidkey_hash: [u8; 32],
    padding_size: usize,
}

impl MessageSecurity {
    /// Build the context from a completed session snapshot.
    ///
    /// `padding_size` is the base size bucket; zero disables padding.
    pub fn new(store: &GreetStore, padding_size: usize) -> Self {
        let sidkey_hash = sha256::hash_parts(&[&store.session_id, &store.group_key]);
        Self {
            members: store.members.clone(),
            ephemeral_key: store.ephemeral_key.clone(),
            ephemeral_pub_keys: store.ephemeral_pub_keys.clone(),
            group_key: store.group_key,
            sidkey_hash,
            padding_size,
        }
    }

    /// The one-byte session hint of this context.
    pub fn sidkey_hint(&self) -> u8 {
        self.sidkey_hash[0]
    }

    /// Sign, encrypt and package a message body with its parent ids.
    pub fn auth_encrypt(&self, parents: &[Vec<u8>], body: &str) -> Result<Vec<u8>> {
        let mut content = TlvWriter::new();
        for parent in parents {
            content.push(TlvType::MessageParent, parent)?;
        }
        content.push(TlvType::MessageBody, body.as_bytes())?;
        let content = content.into_bytes();

        let length = u16::try_from(content.len())
            .map_err(|_| MessageError::Malformed("message content too large".into()))?;
        let mut plaintext = Vec::with_capacity(2 + content.len());
        plaintext.extend_from_slice(&length.to_be_bytes());
        plaintext.extend_from_slice(&content);
        plaintext.resize(padded_size(self.padding_size, plaintext.len()), 0);

        let nonce: [u8; aes_ctr::NONCE_SIZE] = random::random_array();
        let key = self.cipher_key();
        let ciphertext = aes_ctr::encrypt(&key, &nonce, &plaintext);

        let mut inner = TlvWriter::new();
        inner.push(TlvType::ProtocolVersion, &[PROTOCOL_VERSION])?;
        inner.push(TlvType::MessageType, &[WireMessageType::Data as u8])?;
        inner.push(TlvType::MessageIv, &nonce)?;
        inner.push(TlvType::MessagePayload, &ciphertext)?;
        let inner = inner.into_bytes();

        let signed = [DATA_SIGNATURE_MAGIC, &self.sidkey_hash, &inner].concat();
        let signature = self.ephemeral_key.sign(&signed);

        let mut payload = TlvWriter::new();
        payload.push(TlvType::SidkeyHint, &[self.sidkey_hash[0]])?;
        payload.push(TlvType::MessageSignature, &signature.to_bytes())?;
        let mut payload = payload.into_bytes();
        payload.extend_from_slice(&inner);
        Ok(payload)
    }

    /// Verify and decrypt a data payload claimed to come from `author`.
    pub fn decrypt_verify(&self, payload: &[u8], author: &str) -> Result<DecryptedMessage> {
        let author_pos = self
            .members
            .iter()
            .position(|m| m == author)
            .ok_or_else(|| MessageError::UnknownAuthor(author.to_string()))?;
        let author_key = self
            .ephemeral_pub_keys
            .get(author_pos)
            .ok_or_else(|| MessageError::UnknownAuthor(author.to_string()))?;

        let mut reader = TlvReader::new(payload);
        let hint = reader.pop(TlvType::SidkeyHint)?;
        if hint != [self.sidkey_hash[0]] {
            tracing::warn!(
                expected = self.sidkey_hash[0],
                "sidkey hint does not match this session"
            );
        }
        let signature = reader.pop(TlvType::MessageSignature)?;
        let inner = reader.remaining();

        let signed = [DATA_SIGNATURE_MAGIC, &self.sidkey_hash, inner].concat();
        author_key
            .verify_slice(&signed, signature)
            .map_err(|_| MessageError::BadSignature)?;

        let version = reader.pop(TlvType::ProtocolVersion)?;
        if version != [PROTOCOL_VERSION] {
            return Err(MessageError::Malformed(format!(
                "unsupported protocol version {version:02x?}"
            )));
        }
        let message_type = reader.pop(TlvType::MessageType)?;
        if message_type != [WireMessageType::Data as u8] {
            return Err(MessageError::Malformed(
                "payload is not a data message".into(),
            ));
        }
        let nonce: [u8; aes_ctr::NONCE_SIZE] = reader
            .pop(TlvType::MessageIv)?
            .try_into()
            .map_err(|_| MessageError::Malformed("message nonce must be 12 bytes".into()))?;
        let ciphertext = reader.pop(TlvType::MessagePayload)?;
        if !reader.is_empty() {
            return Err(MessageError::Malformed(
                "trailing records after data message".into(),
            ));
        }

        let key = self.cipher_key();
        let plaintext = aes_ctr::decrypt(&key, &nonce, ciphertext);
        if plaintext.len() < 2 {
            return Err(MessageError::Malformed("plaintext too short".into()));
        }
        let length = u16::from_be_bytes([plaintext[0], plaintext[1]]) as usize;
        if 2 + length > plaintext.len() {
            return Err(MessageError::Malformed(format!(
                "cleartext length {length} exceeds plaintext size {}",
                plaintext.len()
            )));
        }
        let content = &plaintext[2..2 + length];

        let mut reader = TlvReader::new(content);
        let parents: Vec<Vec<u8>> = reader
            .pop_all(TlvType::MessageParent)?
            .into_iter()
            .map(<[u8]>::to_vec)
            .collect();
        let body = reader.pop(TlvType::MessageBody)?;
        if !reader.is_empty() {
            return Err(MessageError::Malformed(
                "trailing records inside cleartext".into(),
            ));
        }
        let body = String::from_utf8(body.to_vec())
            .map_err(|_| MessageError::Malformed("message body is not valid UTF-8".into()))?;

        let readers = self
            .members
            .iter()
            .filter(|m| *m != author)
            .cloned()
            .collect();

        Ok(DecryptedMessage {
            author: author.to_string(),
            parents,
            readers,
            body,
        })
    }

    fn cipher_key(&self) -> [u8; aes_ctr::KEY_SIZE] {
        let mut key = [0u8; aes_ctr::KEY_SIZE];
        key.copy_from_slice(&self.group_key[..aes_ctr::KEY_SIZE]);
        key
    }
}

/// The smallest power-of-two multiple of the base bucket that fits.
fn padded_size(padding: usize, length: usize) -> usize {
    if padding == 0 {
        return length;
    }
    let mut size = padding;
    while size < length {
        size *= 2;
    }
    size
}

#[cfg(test)]
mod tests {
    use super::*;
    use mpenc_greet::greeting::GreetingState;

    /// Two snapshots of the same two-member session, one per member.
    fn paired_stores() -> (GreetStore, GreetStore) {
        let alice_key = SigningKey::generate();
        let bob_key = SigningKey::generate();
        let members = vec!["alice".to_string(), "bob".to_string()];
        let pub_keys = vec![alice_key.verifying_key(), bob_key.verifying_key()];
        let nonces = vec![vec![1u8; 32], vec![2u8; 32]];
        let session_id = [0x5Au8; 32];
        let group_key = [0xC3u8; 32];

        let alice = GreetStore::new(
            GreetingState::Ready,
            members.clone(),
            session_id,
            alice_key,
            [1u8; 32],
            pub_keys.clone(),
            nonces.clone(),
            group_key,
            Vec::new(),
            Vec::new(),
        )
        .expect("store");
        let bob = GreetStore::new(
            GreetingState::Ready,
            members,
            session_id,
            bob_key,
            [2u8; 32],
            pub_keys,
            nonces,
            group_key,
            Vec::new(),
            Vec::new(),
        )
        .expect("store");
        (alice, bob)
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let (alice, bob) = paired_stores();
        let sender = MessageSecurity::new(&alice, 0);
        let receiver = MessageSecurity::new(&bob, 0);

        let parents = vec![vec![9u8; 32]];
        let payload = sender
            .auth_encrypt(&parents, "Shout, shout, let it all out!")
            .expect("encrypt");
        let message = receiver.decrypt_verify(&payload, "alice").expect("decrypt");

        assert_eq!(message.author, "alice");
        assert_eq!(message.parents, parents);
        assert_eq!(message.readers, vec!["bob".to_string()]);
        assert_eq!(message.body, "Shout, shout, let it all out!");
    }

    #[test]
    fn test_unknown_author_rejected() {
        let (alice, bob) = paired_stores();
        let sender = MessageSecurity::new(&alice, 0);
        let receiver = MessageSecurity::new(&bob, 0);

        let payload = sender.auth_encrypt(&[], "hi").expect("encrypt");
        assert!(matches!(
            receiver.decrypt_verify(&payload, "mallory"),
            Err(MessageError::UnknownAuthor(_))
        ));
    }

    #[test]
    fn test_wrong_author_fails_signature() {
        let (alice, bob) = paired_stores();
        let sender = MessageSecurity::new(&alice, 0);
        let receiver = MessageSecurity::new(&bob, 0);

        let payload = sender.auth_encrypt(&[], "hi").expect("encrypt");
        // Claiming bob as the author selects the wrong ephemeral key.
        assert!(matches!(
            receiver.decrypt_verify(&payload, "bob"),
            Err(MessageError::BadSignature)
        ));
    }

    #[test]
    fn test_tampered_ciphertext_fails_signature() {
        let (alice, bob) = paired_stores();
        let sender = MessageSecurity::new(&alice, 0);
        let receiver = MessageSecurity::new(&bob, 0);

        let mut payload = sender.auth_encrypt(&[], "hi").expect("encrypt");
        let last = payload.len() - 1;
        payload[last] ^= 0x01;
        assert!(matches!(
            receiver.decrypt_verify(&payload, "alice"),
            Err(MessageError::BadSignature)
        ));
    }

    #[test]
    fn test_padding_buckets() {
        let (alice, bob) = paired_stores();
        let sender = MessageSecurity::new(&alice, 32);
        let receiver = MessageSecurity::new(&bob, 32);

        let small = sender.auth_encrypt(&[], "x").expect("encrypt");
        let larger = sender
            .auth_encrypt(&[], &"y".repeat(40))
            .expect("encrypt");

        // Ciphertext length is the padded plaintext length: one bucket
        // for the short body, the doubled bucket for the longer one.
        let small_ct = extract_ciphertext_len(&small);
        let larger_ct = extract_ciphertext_len(&larger);
        assert_eq!(small_ct, 32);
        assert_eq!(larger_ct, 64);

        assert_eq!(
            receiver.decrypt_verify(&small, "alice").expect("decrypt").body,
            "x"
        );
        assert_eq!(
            receiver
                .decrypt_verify(&larger, "alice")
                .expect("decrypt")
                .body,
            "y".repeat(40)
        );
    }

    fn extract_ciphertext_len(payload: &[u8]) -> usize {
        let mut reader = TlvReader::new(payload);
        reader.pop_until(TlvType::MessagePayload).expect("seek");
        reader.pop(TlvType::MessagePayload).expect("payload").len()
    }

    #[test]
    fn test_padding_disabled() {
        let (alice, bob) = paired_stores();
        let sender = MessageSecurity::new(&alice, 0);
        let _ = bob;

        let payload = sender.auth_encrypt(&[], "x").expect("encrypt");
        // length prefix + MESSAGE_BODY record of one byte
        assert_eq!(extract_ciphertext_len(&payload), 2 + 4 + 1);
    }

    #[test]
    fn test_padded_size() {
        assert_eq!(padded_size(0, 17), 17);
        assert_eq!(padded_size(32, 1), 32);
        assert_eq!(padded_size(32, 32), 32);
        assert_eq!(padded_size(32, 33), 64);
        assert_eq!(padded_size(32, 129), 256);
    }
}
