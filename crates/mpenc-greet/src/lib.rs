//! # mpenc-greet
//!
//! The authenticated group key agreement of mpENC: membership
//! operations ("greetings") negotiated over an untrusted broadcast
//! channel.
//!
//! A greeting couples two sub-protocols that run over the same packets:
//!
//! - **CLIQUES** ([`cliques`]) — a tree Diffie-Hellman deriving the
//!   shared symmetric group key,
//! - **ASKE** ([`aske`]) — an authenticated signature key exchange
//!   establishing per-session ephemeral signing keys and a joint
//!   session id, acknowledged under each member's static RSA key.
//!
//! ## Modules
//!
//! - [`message`] — the typed greet packet and its bitfield greet-type
//! - [`cliques`] — intermediate-key chain and group-key derivation
//! - [`aske`] — nonces, ephemeral signing keys, session acknowledgement
//! - [`greeting`] — the state machine driving one membership operation
//! - [`greeter`] — long-lived dispatcher owning identity and the
//!   completed-session store
//!
//! ## Flows
//!
//! An operation starts with an **upflow** routed member to member along
//! the list, each hop contributing key material, and finishes with a
//! **downflow** broadcast followed by one confirmation broadcast per
//! member. When every member has acknowledged the session id, the
//! greeting snapshots the session into a [`greeter::GreetStore`].

pub mod aske;
pub mod cliques;
pub mod greeter;
pub mod greeting;
pub mod message;

use std::collections::HashMap;

use mpenc_crypto::rsa::{StaticPrivateKey, StaticPublicKey};

/// Error types for greeting operations.
#[derive(Debug, thiserror::Error)]
pub enum GreetError {
    /// A packet violates the protocol (bad TLV layout, unknown greet
    /// type, duplicate member, inconsistent chain position, ...).
    #[error("malformed greet message: {0}")]
    Malformed(String),

    /// A message or session signature failed verification.
    #[error("invalid signature: {0}")]
    BadSignature(String),

    /// A caller action was invoked in a state that does not allow it.
    #[error("illegal caller action: {0}")]
    IllegalCaller(String),

    /// A reserved protocol feature with no specified semantics.
    #[error("not implemented: {0}")]
    Unimplemented(&'static str),

    /// Wire codec failure.
    #[error(transparent)]
    Wire(#[from] mpenc_wire::WireError),

    /// Primitive failure.
    #[error(transparent)]
    Crypto(#[from] mpenc_crypto::CryptoError),
}

pub type Result<T> = std::result::Result<T, GreetError>;

/// Routing direction of a sub-protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Routed to the next member in list order.
    Up,
    /// Broadcast to all members.
    Down,
}

/// The local participant: stable id plus the static RSA signing key.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    id: String,
    static_key: StaticPrivateKey,
}

impl LocalIdentity {
    pub fn new(id: impl Into<String>, static_key: StaticPrivateKey) -> Self {
        Self {
            id: id.into(),
            static_key,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn static_key(&self) -> &StaticPrivateKey {
        &self.static_key
    }
}

/// Directory mapping member ids to their static public keys.
#[derive(Debug, Clone, Default)]
pub struct StaticKeyDirectory {
    keys: HashMap<String, StaticPublicKey>,
}

impl StaticKeyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl Into<String>, key: StaticPublicKey) {
        self.keys.insert(id.into(), key);
    }

    pub fn get(&self, id: &str) -> Option<&StaticPublicKey> {
        self.keys.get(id)
    }
}

/// Reject member lists with repeated ids.
pub(crate) fn check_no_duplicates(members: &[String]) -> Result<()> {
    for (i, member) in members.iter().enumerate() {
        if members[..i].contains(member) {
            return Err(GreetError::Malformed(format!(
                "duplicate member in list: {member}"
            )));
        }
    }
    Ok(())
}
