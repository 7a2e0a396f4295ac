//! Authenticated Signature Key Exchange.
//!
//! ASKE gives every member a per-session ephemeral Ed25519 signing key
//! and binds the whole set to a joint session id. The upflow collects a
//! fresh nonce and ephemeral public key from each member; the downflow
//! carries each member's **session signature** — an RSA-PKCS1-v1.5
//! acknowledgement over the member id, its ephemeral public key and the
//! session id, made with the static identity key. A session counts as
//! acknowledged once every member's signature has verified.
//!
//! The session id depends only on the id→nonce mapping: the pairs are
//! jointly sorted by id before hashing, so wire order does not matter.

use std::collections::BTreeSet;

use mpenc_crypto::ed25519::{SigningKey, VerifyingKey};
use mpenc_crypto::{random, sha256};

use crate::{check_no_duplicates, Flow, GreetError, LocalIdentity, Result, StaticKeyDirectory};

/// Domain separation prefix of session acknowledgement signatures.
pub const SESSION_SIGNATURE_MAGIC: &[u8] = b"sessionsig";

/// An ASKE sub-message exchanged within a greeting.
#[derive(Debug, Clone)]
pub struct AskeMessage {
    pub source: String,
    /// Empty string means broadcast.
    pub dest: String,
    pub flow: Flow,
    pub members: Vec<String>,
    pub nonces: Vec<Vec<u8>>,
    pub pub_keys: Vec<VerifyingKey>,
    pub session_signature: Option<Vec<u8>>,
}

/// Per-participant ASKE state.
#[derive(Debug, Clone)]
pub struct AskeMember {
    id: String,
    members: Vec<String>,
    nonce: Option<[u8; 32]>,
    ephemeral_key: Option<SigningKey>,
    nonces: Vec<Vec<u8>>,
    pub_keys: Vec<VerifyingKey>,
    session_id: Option<[u8; 32]>,
    authenticated: BTreeSet<String>,
}

impl AskeMember {
    /// A fresh member with no session.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            members: Vec::new(),
            nonce: None,
            ephemeral_key: None,
            nonces: Vec::new(),
            pub_keys: Vec::new(),
            session_id: None,
            authenticated: BTreeSet::new(),
        }
    }

    /// Resume from a completed session snapshot.
    ///
    /// The prior session was fully acknowledged, so every member starts
    /// out authenticated; a membership change resets that when the
    /// session id changes.
    pub fn resume(
        id: impl Into<String>,
        members: Vec<String>,
        nonce: [u8; 32],
        ephemeral_key: SigningKey,
        nonces: Vec<Vec<u8>>,
        pub_keys: Vec<VerifyingKey>,
        session_id: [u8; 32],
    ) -> Self {
        let authenticated = members.iter().cloned().collect();
        Self {
            id: id.into(),
            members,
            nonce: Some(nonce),
            ephemeral_key: Some(ephemeral_key),
            nonces,
            pub_keys,
            session_id: Some(session_id),
            authenticated,
        }
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn nonce(&self) -> Option<&[u8; 32]> {
        self.nonce.as_ref()
    }

    pub fn nonces(&self) -> &[Vec<u8>] {
        &self.nonces
    }

    pub fn pub_keys(&self) -> &[VerifyingKey] {
        &self.pub_keys
    }

    pub fn session_id(&self) -> Option<&[u8; 32]> {
        self.session_id.as_ref()
    }

    pub fn ephemeral_key(&self) -> Option<&SigningKey> {
        self.ephemeral_key.as_ref()
    }

    /// The ephemeral public key recorded for a member, if any.
    pub fn pub_key_of(&self, member: &str) -> Option<&VerifyingKey> {
        let pos = self.members.iter().position(|m| m == member)?;
        self.pub_keys.get(pos)
    }

    fn my_pos(&self) -> Result<usize> {
        self.members
            .iter()
            .position(|m| *m == self.id)
            .ok_or_else(|| GreetError::Malformed(format!("{} not in member list", self.id)))
    }

    /// Start the exchange with the given other members.
    pub fn commit(
        &mut self,
        identity: &LocalIdentity,
        others: &[String],
    ) -> Result<AskeMessage> {
        if others.is_empty() {
            return Err(GreetError::IllegalCaller(
                "signature key exchange needs at least one other member".into(),
            ));
        }
        let mut members = vec![self.id.clone()];
        members.extend_from_slice(others);
        check_no_duplicates(&members)?;

        self.members = members;
        self.nonces.clear();
        self.pub_keys.clear();
        self.session_id = None;
        self.authenticated.clear();
        self.contribute(identity)
    }

    /// Process an upflow addressed to this member.
    pub fn upflow(&mut self, identity: &LocalIdentity, message: &AskeMessage) -> Result<AskeMessage> {
        check_no_duplicates(&message.members)?;
        let my_pos = message
            .members
            .iter()
            .position(|m| *m == self.id)
            .ok_or_else(|| GreetError::Malformed("upflow member list omits self".into()))?;
        if message.nonces.len() != my_pos || message.pub_keys.len() != my_pos {
            return Err(GreetError::Malformed(format!(
                "upflow carries {} nonces and {} keys at chain position {}",
                message.nonces.len(),
                message.pub_keys.len(),
                my_pos
            )));
        }

        self.members = message.members.clone();
        self.nonces = message.nonces.clone();
        self.pub_keys = message.pub_keys.clone();
        self.session_id = None;
        self.authenticated.clear();
        self.contribute(identity)
    }

    /// Append the own nonce and ephemeral key, then route onward.
    fn contribute(&mut self, identity: &LocalIdentity) -> Result<AskeMessage> {
        let my_pos = self.my_pos()?;
        let nonce = random::nonce256();
        let ephemeral_key = SigningKey::generate();
        self.nonce = Some(nonce);
        self.nonces.push(nonce.to_vec());
        self.pub_keys.push(ephemeral_key.verifying_key());
        self.ephemeral_key = Some(ephemeral_key);

        if my_pos == self.members.len() - 1 {
            let session_signature = self.acknowledge(identity)?;
            Ok(AskeMessage {
                source: self.id.clone(),
                dest: String::new(),
                flow: Flow::Down,
                members: self.members.clone(),
                nonces: self.nonces.clone(),
                pub_keys: self.pub_keys.clone(),
                session_signature: Some(session_signature),
            })
        } else {
            Ok(AskeMessage {
                source: self.id.clone(),
                dest: self.members[my_pos + 1].clone(),
                flow: Flow::Up,
                members: self.members.clone(),
                nonces: self.nonces.clone(),
                pub_keys: self.pub_keys.clone(),
                session_signature: None,
            })
        }
    }

    /// Compute the session id and the own session signature, and mark
    /// self authenticated.
    fn acknowledge(&mut self, identity: &LocalIdentity) -> Result<Vec<u8>> {
        if self.nonces.len() != self.members.len() || self.pub_keys.len() != self.members.len() {
            return Err(GreetError::Malformed(format!(
                "cannot acknowledge with {} nonces and {} keys for {} members",
                self.nonces.len(),
                self.pub_keys.len(),
                self.members.len()
            )));
        }
        let session_id = compute_session_id(&self.members, &self.nonces);
        self.session_id = Some(session_id);

        let my_pos = self.my_pos()?;
        let content = session_signature_content(&self.id, &self.pub_keys[my_pos], &session_id);
        let signature = identity.static_key().sign(&content)?;
        self.authenticated.insert(self.id.clone());
        Ok(signature)
    }

    /// Process a downflow broadcast.
    ///
    /// Verifies the sender's session signature and, when this member
    /// has not acknowledged the session yet, answers with a
    /// confirmation broadcast carrying the own signature.
    pub fn downflow(
        &mut self,
        identity: &LocalIdentity,
        directory: &StaticKeyDirectory,
        message: &AskeMessage,
    ) -> Result<Option<AskeMessage>> {
        check_no_duplicates(&message.members)?;
        if !message.members.contains(&self.id) {
            return Err(GreetError::Malformed("downflow member list omits self".into()));
        }

        if !message.nonces.is_empty() || !message.pub_keys.is_empty() {
            self.adopt(message)?;
        }
        let session_id = *self
            .session_id
            .as_ref()
            .ok_or_else(|| GreetError::Malformed("downflow before session content".into()))?;

        let signature = message
            .session_signature
            .as_ref()
            .ok_or_else(|| GreetError::Malformed("downflow without session signature".into()))?;
        let sender_key = self.pub_key_of(&message.source).ok_or_else(|| {
            GreetError::Malformed(format!("no ephemeral key for sender {}", message.source))
        })?;
        let static_key = directory.get(&message.source).ok_or_else(|| {
            GreetError::Malformed(format!("no static key for sender {}", message.source))
        })?;
        let content = session_signature_content(&message.source, sender_key, &session_id);
        static_key.verify(&content, signature).map_err(|_| {
            GreetError::BadSignature(format!(
                "session signature of {} does not verify",
                message.source
            ))
        })?;
        self.authenticated.insert(message.source.clone());
        tracing::debug!(
            member = %message.source,
            session = %hex::encode(&session_id[..8]),
            "session signature verified"
        );

        if self.authenticated.contains(&self.id) {
            return Ok(None);
        }
        let session_signature = self.acknowledge(identity)?;
        Ok(Some(AskeMessage {
            source: self.id.clone(),
            dest: String::new(),
            flow: Flow::Down,
            members: self.members.clone(),
            nonces: self.nonces.clone(),
            pub_keys: self.pub_keys.clone(),
            session_signature: Some(session_signature),
        }))
    }

    /// Take over the member/nonce/key lists of a full downflow.
    fn adopt(&mut self, message: &AskeMessage) -> Result<()> {
        if message.nonces.len() != message.members.len()
            || message.pub_keys.len() != message.members.len()
        {
            return Err(GreetError::Malformed(format!(
                "downflow carries {} nonces and {} keys for {} members",
                message.nonces.len(),
                message.pub_keys.len(),
                message.members.len()
            )));
        }
        let my_pos = message
            .members
            .iter()
            .position(|m| *m == self.id)
            .ok_or_else(|| GreetError::Malformed("downflow member list omits self".into()))?;

        // The own contribution must survive any relist untouched.
        if let Some(own_nonce) = &self.nonce {
            if message.nonces[my_pos] != own_nonce.as_slice() {
                return Err(GreetError::Malformed("downflow replaces own nonce".into()));
            }
        }
        if let Some(key) = &self.ephemeral_key {
            if message.pub_keys[my_pos] != key.verifying_key() {
                return Err(GreetError::Malformed(
                    "downflow replaces own ephemeral key".into(),
                ));
            }
        }

        let session_id = compute_session_id(&message.members, &message.nonces);
        if self.session_id != Some(session_id) {
            // New member set or nonces: every acknowledgement so far is
            // void, including our own.
            self.authenticated.clear();
            self.session_id = Some(session_id);
        }
        self.members = message.members.clone();
        self.nonces = message.nonces.clone();
        self.pub_keys = message.pub_keys.clone();
        Ok(())
    }

    /// Extend the member list and hand the upflow to the first newcomer.
    ///
    /// Kept members keep their nonces and ephemeral keys; the newcomers
    /// append theirs, and the final downflow recomputes the session id.
    pub fn join(&mut self, new_members: &[String]) -> Result<AskeMessage> {
        if new_members.is_empty() {
            return Err(GreetError::IllegalCaller("no members to include".into()));
        }
        let first_new = self.members.len();
        let mut members = self.members.clone();
        members.extend_from_slice(new_members);
        check_no_duplicates(&members)?;
        self.members = members;
        self.session_id = None;
        self.authenticated.clear();

        Ok(AskeMessage {
            source: self.id.clone(),
            dest: self.members[first_new].clone(),
            flow: Flow::Up,
            members: self.members.clone(),
            nonces: self.nonces.clone(),
            pub_keys: self.pub_keys.clone(),
            session_signature: None,
        })
    }

    /// Drop members and broadcast the recomputed session
    /// acknowledgement; kept members re-acknowledge in turn.
    pub fn exclude(&mut self, identity: &LocalIdentity, exclude: &[String]) -> Result<AskeMessage> {
        if exclude.is_empty() {
            return Err(GreetError::IllegalCaller("no members to exclude".into()));
        }
        if exclude.contains(&self.id) {
            return Err(GreetError::IllegalCaller("cannot exclude self".into()));
        }
        if let Some(missing) = exclude.iter().find(|m| !self.members.contains(m)) {
            return Err(GreetError::IllegalCaller(format!(
                "cannot exclude non-member {missing}"
            )));
        }

        let mut members = Vec::with_capacity(self.members.len());
        let mut nonces = Vec::with_capacity(self.nonces.len());
        let mut pub_keys = Vec::with_capacity(self.pub_keys.len());
        for ((member, nonce), pub_key) in self
            .members
            .iter()
            .zip(&self.nonces)
            .zip(&self.pub_keys)
        {
            if !exclude.contains(member) {
                members.push(member.clone());
                nonces.push(nonce.clone());
                pub_keys.push(pub_key.clone());
            }
        }
        self.members = members;
        self.nonces = nonces;
        self.pub_keys = pub_keys;
        self.authenticated.clear();

        let session_signature = self.acknowledge(identity)?;
        Ok(AskeMessage {
            source: self.id.clone(),
            dest: String::new(),
            flow: Flow::Down,
            members: self.members.clone(),
            nonces: self.nonces.clone(),
            pub_keys: self.pub_keys.clone(),
            session_signature: Some(session_signature),
        })
    }

    /// True once every member's session signature has verified.
    pub fn is_session_acknowledged(&self) -> bool {
        !self.members.is_empty()
            && self
                .members
                .iter()
                .all(|member| self.authenticated.contains(member))
    }

    /// Members whose acknowledgement is still outstanding.
    pub fn yet_to_authenticate(&self) -> Vec<&str> {
        self.members
            .iter()
            .filter(|member| !self.authenticated.contains(*member))
            .map(String::as_str)
            .collect()
    }

    /// Give up the session: surrender the ephemeral private key so past
    /// signatures stay auditable, and wipe local state.
    pub fn quit(&mut self) -> Result<SigningKey> {
        let key = self
            .ephemeral_key
            .take()
            .ok_or_else(|| GreetError::IllegalCaller("no session to quit".into()))?;
        self.members.clear();
        self.nonce = None;
        self.nonces.clear();
        self.pub_keys.clear();
        self.session_id = None;
        self.authenticated.clear();
        Ok(key)
    }
}

/// Session id: SHA-256 over ids and nonces, jointly sorted by id.
pub fn compute_session_id(members: &[String], nonces: &[Vec<u8>]) -> [u8; 32] {
    let mut pairs: Vec<(&String, &Vec<u8>)> = members.iter().zip(nonces.iter()).collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));

    let mut parts: Vec<&[u8]> = Vec::with_capacity(pairs.len() * 2);
    for (member, _) in &pairs {
        parts.push(member.as_bytes());
    }
    for (_, nonce) in &pairs {
        parts.push(nonce.as_slice());
    }
    sha256::hash_parts(&parts)
}

fn session_signature_content(id: &str, pub_key: &VerifyingKey, session_id: &[u8; 32]) -> Vec<u8> {
    [
        SESSION_SIGNATURE_MAGIC,
        id.as_bytes(),
        pub_key.as_bytes(),
        session_id,
    ]
    .concat()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mpenc_crypto::rsa::StaticPrivateKey;

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    struct Party {
        identity: LocalIdentity,
        member: AskeMember,
    }

    fn setup(names: &[&str]) -> (Vec<Party>, StaticKeyDirectory) {
        let mut directory = StaticKeyDirectory::new();
        let mut parties = Vec::new();
        for name in names {
            let key = StaticPrivateKey::generate(1024).expect("keygen");
            directory.insert(*name, key.public_key());
            parties.push(Party {
                identity: LocalIdentity::new(*name, key),
                member: AskeMember::new(*name),
            });
        }
        (parties, directory)
    }

    /// Run an upflow to completion, then exchange downflows until no
    /// party has anything left to say.
    fn converge(start: AskeMessage, parties: &mut [Party], directory: &StaticKeyDirectory) {
        let mut message = start;
        while message.flow == Flow::Up {
            let next = parties
                .iter_mut()
                .find(|p| p.member.id == message.dest)
                .expect("dest member");
            message = next.member.upflow(&next.identity, &message).expect("upflow");
        }

        let mut pending = vec![message];
        while let Some(message) = pending.pop() {
            for party in parties.iter_mut() {
                if party.member.id == message.source
                    || !message.members.contains(&party.member.id)
                {
                    continue;
                }
                if let Some(reply) = party
                    .member
                    .downflow(&party.identity, directory, &message)
                    .expect("downflow")
                {
                    pending.push(reply);
                }
            }
        }
    }

    #[test]
    fn test_commit_converges_three_members() {
        let (mut parties, directory) = setup(&["1", "2", "3"]);
        let others = ids(&["2", "3"]);
        let start = {
            let party = &mut parties[0];
            party.member.commit(&party.identity, &others).expect("commit")
        };
        assert_eq!(start.dest, "2");
        converge(start, &mut parties, &directory);

        let sid = *parties[0].member.session_id().expect("sid");
        for party in &parties {
            assert!(party.member.is_session_acknowledged());
            assert!(party.member.yet_to_authenticate().is_empty());
            assert_eq!(party.member.session_id(), Some(&sid));
        }
    }

    #[test]
    fn test_session_id_ignores_member_order() {
        let members_a = ids(&["1", "2", "3"]);
        let members_b = ids(&["3", "1", "2"]);
        let nonces_a = vec![vec![1u8; 32], vec![2u8; 32], vec![3u8; 32]];
        let nonces_b = vec![vec![3u8; 32], vec![1u8; 32], vec![2u8; 32]];

        assert_eq!(
            compute_session_id(&members_a, &nonces_a),
            compute_session_id(&members_b, &nonces_b)
        );
    }

    #[test]
    fn test_session_id_depends_on_mapping() {
        let members = ids(&["1", "2"]);
        let nonces = vec![vec![1u8; 32], vec![2u8; 32]];
        let swapped = vec![vec![2u8; 32], vec![1u8; 32]];
        assert_ne!(
            compute_session_id(&members, &nonces),
            compute_session_id(&members, &swapped)
        );
    }

    #[test]
    fn test_bad_session_signature_rejected() {
        let (mut parties, directory) = setup(&["1", "2"]);
        let others = ids(&["2"]);
        let start = {
            let party = &mut parties[0];
            party.member.commit(&party.identity, &others).expect("commit")
        };
        let mut down = {
            let party = &mut parties[1];
            party.member.upflow(&party.identity, &start).expect("upflow")
        };
        assert_eq!(down.flow, Flow::Down);

        let signature = down.session_signature.as_mut().expect("signature");
        signature[0] ^= 0x01;
        let party = &mut parties[0];
        assert!(matches!(
            party.member.downflow(&party.identity, &directory, &down),
            Err(GreetError::BadSignature(_))
        ));
    }

    #[test]
    fn test_upflow_rejects_duplicates() {
        let (mut parties, _directory) = setup(&["1", "2"]);
        let others = ids(&["2"]);
        let mut start = {
            let party = &mut parties[0];
            party.member.commit(&party.identity, &others).expect("commit")
        };
        start.members = ids(&["1", "2", "2"]);
        let party = &mut parties[1];
        assert!(party.member.upflow(&party.identity, &start).is_err());
    }

    #[test]
    fn test_exclude_keeps_nonces_changes_sid() {
        let (mut parties, directory) = setup(&["1", "2", "3"]);
        let others = ids(&["2", "3"]);
        let start = {
            let party = &mut parties[0];
            party.member.commit(&party.identity, &others).expect("commit")
        };
        converge(start, &mut parties, &directory);
        let old_sid = *parties[0].member.session_id().expect("sid");
        let old_nonce = *parties[0].member.nonce().expect("nonce");

        let down = {
            let party = &mut parties[0];
            party
                .member
                .exclude(&party.identity, &ids(&["2"]))
                .expect("exclude")
        };
        assert_eq!(down.members, ids(&["1", "3"]));

        // Member 3 re-acknowledges against the new session id.
        let reply = {
            let party = &mut parties[2];
            party
                .member
                .downflow(&party.identity, &directory, &down)
                .expect("downflow")
                .expect("confirmation")
        };
        {
            let party = &mut parties[0];
            let silent = party
                .member
                .downflow(&party.identity, &directory, &reply)
                .expect("downflow");
            assert!(silent.is_none());
        }

        assert!(parties[0].member.is_session_acknowledged());
        assert!(parties[2].member.is_session_acknowledged());
        let new_sid = *parties[0].member.session_id().expect("sid");
        assert_ne!(old_sid, new_sid);
        assert_eq!(parties[0].member.nonce(), Some(&old_nonce));
    }

    #[test]
    fn test_quit_surrenders_ephemeral_key() {
        let (mut parties, directory) = setup(&["1", "2"]);
        let others = ids(&["2"]);
        let start = {
            let party = &mut parties[0];
            party.member.commit(&party.identity, &others).expect("commit")
        };
        converge(start, &mut parties, &directory);

        let public = parties[0]
            .member
            .ephemeral_key()
            .expect("key")
            .verifying_key();
        let surrendered = parties[0].member.quit().expect("quit");
        assert_eq!(surrendered.verifying_key(), public);
        assert!(parties[0].member.ephemeral_key().is_none());
        assert!(parties[0].member.quit().is_err());
    }
}
