//! The greeter: long-lived dispatcher for membership operations.
//!
//! A [`Greeter`] owns the participant's identity, the static public key
//! directory, the snapshot of the last completed session, and at most
//! one proposed plus one current [`Greeting`]. Outbound operations are
//! cached by payload hash so the proposer recognises its own packet
//! when the channel echoes it back.

use mpenc_crypto::ed25519::{SigningKey, VerifyingKey};
use mpenc_crypto::sha256;
use mpenc_crypto::x25519::{DhElement, DhSecret};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::greeting::{Greeting, GreetingState};
use crate::message::{GreetMessage, GreetingMetadata};
use crate::{GreetError, LocalIdentity, Result, StaticKeyDirectory};

/// Immutable snapshot of a completed session.
///
/// Holds everything a later operation or the data-message layer needs:
/// member list, session id, own ephemeral keypair and nonce, everyone's
/// ephemeral public keys and nonces, the group key, and the CLIQUES
/// key material to resume from. Serializable so the host may persist it
/// across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GreetStore {
    /// State tag at snapshot time.
    pub state: GreetingState,
    /// Ordered member list.
    pub members: Vec<String>,
    /// Joint session id.
    pub session_id: [u8; 32],
    /// Own ephemeral signing key.
    pub ephemeral_key: SigningKey,
    /// Own session nonce.
    pub nonce: [u8; 32],
    /// Ephemeral public keys, aligned with `members`.
    pub ephemeral_pub_keys: Vec<VerifyingKey>,
    /// Session nonces, aligned with `members`.
    pub nonces: Vec<Vec<u8>>,
    /// The shared group key.
    pub group_key: [u8; 32],
    /// Own private exponents, newest last.
    pub priv_key_list: Vec<DhSecret>,
    /// CLIQUES intermediate keys, aligned with `members`.
    pub int_keys: Vec<DhElement>,
}

impl GreetStore {
    /// Assemble a snapshot, enforcing the list-alignment invariant.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: GreetingState,
        members: Vec<String>,
        session_id: [u8; 32],
        ephemeral_key: SigningKey,
        nonce: [u8; 32],
        ephemeral_pub_keys: Vec<VerifyingKey>,
        nonces: Vec<Vec<u8>>,
        group_key: [u8; 32],
        priv_key_list: Vec<DhSecret>,
        int_keys: Vec<DhElement>,
    ) -> Result<Self> {
        if members.len() != ephemeral_pub_keys.len() || members.len() != nonces.len() {
            return Err(GreetError::Malformed(format!(
                "snapshot lists diverge: {} members, {} keys, {} nonces",
                members.len(),
                ephemeral_pub_keys.len(),
                nonces.len()
            )));
        }
        Ok(Self {
            state,
            members,
            session_id,
            ephemeral_key,
            nonce,
            ephemeral_pub_keys,
            nonces,
            group_key,
            priv_key_list,
            int_keys,
        })
    }

    /// The group key as a curve element, for resuming CLIQUES.
    pub fn group_key_element(&self) -> DhElement {
        DhElement::from_bytes(self.group_key)
    }

    /// The ephemeral public key recorded for a member, if any.
    pub fn ephemeral_pub_key_of(&self, member: &str) -> Option<&VerifyingKey> {
        let pos = self.members.iter().position(|m| m == member)?;
        self.ephemeral_pub_keys.get(pos)
    }
}

impl Drop for GreetStore {
    fn drop(&mut self) {
        self.group_key.zeroize();
        self.nonce.zeroize();
    }
}

/// An outbound greet packet: signed payload plus its routing hint.
#[derive(Debug, Clone)]
pub struct OutboundGreet {
    /// Recipient id; empty string means broadcast.
    pub dest: String,
    /// Signed TLV payload (not yet wire-framed).
    pub payload: Vec<u8>,
}

/// Result of dispatching one inbound greet packet.
#[derive(Debug)]
pub struct GreeterOutcome {
    /// Response packet, if the state machine produced one.
    pub outbound: Option<OutboundGreet>,
    /// Greeter state after processing.
    pub state: GreetingState,
    /// True when the packet completed an operation and the store was
    /// replaced.
    pub completed: bool,
    /// Channel-scoped packet id of the inbound packet.
    pub packet_id: [u8; 32],
}

struct Proposal {
    hash: [u8; 32],
    greeting: Greeting,
}

/// Long-lived per-participant greeting dispatcher.
pub struct Greeter {
    identity: LocalIdentity,
    directory: StaticKeyDirectory,
    store: Option<GreetStore>,
    proposal: Option<Proposal>,
    current: Option<Greeting>,
    quit: bool,
}

impl Greeter {
    pub fn new(identity: LocalIdentity, directory: StaticKeyDirectory) -> Self {
        Self {
            identity,
            directory,
            store: None,
            proposal: None,
            current: None,
            quit: false,
        }
    }

    pub fn id(&self) -> &str {
        self.identity.id()
    }

    /// The last completed session, if any.
    pub fn store(&self) -> Option<&GreetStore> {
        self.store.as_ref()
    }

    /// The observable state: the live operation's state, else READY
    /// with a completed session, else NULL (or QUIT after leaving).
    pub fn state(&self) -> GreetingState {
        if let Some(greeting) = &self.current {
            return greeting.state();
        }
        if let Some(proposal) = &self.proposal {
            return proposal.greeting.state();
        }
        if self.store.is_some() {
            return GreetingState::Ready;
        }
        if self.quit {
            return GreetingState::Quit;
        }
        GreetingState::Null
    }

    /// Choose and start the operation turning the current member list
    /// into `new_members`: strictly one of include, exclude or refresh
    /// (or the initial start when there is no session yet).
    ///
    /// Returns `None` when an exclusion leaves this member alone and
    /// the greeter goes straight to QUIT without emitting anything.
    pub fn propose(
        &mut self,
        new_members: &[String],
        metadata: Option<GreetingMetadata>,
    ) -> Result<Option<OutboundGreet>> {
        match &self.store {
            None => {
                let others: Vec<String> = new_members
                    .iter()
                    .filter(|m| *m != self.identity.id())
                    .cloned()
                    .collect();
                Ok(Some(self.start(&others, metadata)?))
            }
            Some(store) => {
                let added: Vec<String> = new_members
                    .iter()
                    .filter(|m| !store.members.contains(m))
                    .cloned()
                    .collect();
                let removed: Vec<String> = store
                    .members
                    .iter()
                    .filter(|m| !new_members.contains(m))
                    .cloned()
                    .collect();
                if !added.is_empty() && !removed.is_empty() {
                    return Err(GreetError::IllegalCaller(
                        "cannot include and exclude in one operation".into(),
                    ));
                }
                if !added.is_empty() {
                    Ok(Some(self.include(&added, metadata)?))
                } else if !removed.is_empty() {
                    self.exclude(&removed, metadata)
                } else {
                    Ok(Some(self.refresh()?))
                }
            }
        }
    }

    /// Start the initial key agreement (NULL only).
    pub fn start(
        &mut self,
        others: &[String],
        metadata: Option<GreetingMetadata>,
    ) -> Result<OutboundGreet> {
        if self.state() != GreetingState::Null {
            return Err(GreetError::IllegalCaller(format!(
                "start() in state {:?}",
                self.state()
            )));
        }
        let mut greeting = Greeting::new(self.identity.id());
        let message = greeting.start(&self.identity, others, metadata)?;
        self.stash_proposal(greeting, &message)
    }

    /// Include new members (READY only).
    pub fn include(
        &mut self,
        new_members: &[String],
        metadata: Option<GreetingMetadata>,
    ) -> Result<OutboundGreet> {
        let mut greeting = self.resumed_greeting("include")?;
        let message = greeting.include(new_members, metadata)?;
        self.stash_proposal(greeting, &message)
    }

    /// Exclude members (READY only). `None` means last man standing:
    /// straight to QUIT, nothing emitted.
    pub fn exclude(
        &mut self,
        exclude: &[String],
        metadata: Option<GreetingMetadata>,
    ) -> Result<Option<OutboundGreet>> {
        let mut greeting = self.resumed_greeting("exclude")?;
        match greeting.exclude(&self.identity, exclude, metadata)? {
            Some(message) => Ok(Some(self.stash_proposal(greeting, &message)?)),
            None => {
                self.store = None;
                self.proposal = None;
                self.current = None;
                self.quit = true;
                Ok(None)
            }
        }
    }

    /// Refresh the group key (READY, or mid-downflow on the live
    /// operation).
    pub fn refresh(&mut self) -> Result<OutboundGreet> {
        if let Some(greeting) = self.current.as_mut() {
            let message = greeting.refresh(None)?;
            let payload = greeting.encode_message(&message)?;
            return Ok(OutboundGreet {
                dest: message.dest,
                payload,
            });
        }
        let mut greeting = self.resumed_greeting("refresh")?;
        let message = greeting.refresh(None)?;
        let payload = greeting.encode_message(&message)?;
        // A refresh from READY completes on the spot; adopt the new
        // snapshot immediately.
        if greeting.state() == GreetingState::Ready {
            self.store = greeting.take_store();
        }
        Ok(OutboundGreet {
            dest: message.dest,
            payload,
        })
    }

    /// Leave the session, publishing the own ephemeral private key.
    pub fn quit(&mut self) -> Result<OutboundGreet> {
        let mut greeting = match self.current.take() {
            Some(greeting) => greeting,
            None => self.resumed_greeting("quit")?,
        };
        let message = greeting.quit()?;
        let payload = greeting.encode_message(&message)?;
        self.store = None;
        self.proposal = None;
        self.current = None;
        self.quit = true;
        Ok(OutboundGreet {
            dest: message.dest,
            payload,
        })
    }

    /// Dispatch one inbound greet payload.
    pub fn process_incoming(
        &mut self,
        from: &str,
        payload: &[u8],
        channel_members: &[String],
    ) -> Result<GreeterOutcome> {
        let packet_id = packet_id(from, channel_members, payload);
        let packet_hash = sha256::hash(payload);
        let signed = GreetMessage::decode(payload)?;

        self.verify_signature(&signed)?;
        self.route_greeting(from, &signed.message, &packet_hash);

        if self.current.is_none() {
            // Stale echoes of our own packets, stragglers of a completed
            // operation, and anything after QUIT are consumed silently.
            if from == self.identity.id() || self.quit || self.store.is_some() {
                tracing::debug!(from = %from, "dropping greet packet with no live operation");
                return Ok(GreeterOutcome {
                    outbound: None,
                    state: self.state(),
                    completed: false,
                    packet_id,
                });
            }
            tracing::warn!(from = %from, "greet packet with no operation in progress");
            return Err(GreetError::Malformed(
                "no membership operation in progress".into(),
            ));
        }
        let greeting = self.current.as_mut().ok_or_else(|| {
            GreetError::Malformed("no membership operation in progress".into())
        })?;

        let outcome = match greeting.process_message(&self.identity, &self.directory, &signed.message)
        {
            Ok(outcome) => outcome,
            Err(e) => {
                // A rejected packet must not leave behind an operation
                // that never actually started.
                let untouched = greeting.state() == GreetingState::Ready;
                if untouched {
                    self.current = None;
                }
                return Err(e);
            }
        };
        let state = greeting.state();
        let outbound = match outcome.outbound {
            Some(message) => {
                let payload = greeting.encode_message(&message)?;
                Some(OutboundGreet {
                    dest: message.dest,
                    payload,
                })
            }
            None => None,
        };

        if outcome.completed {
            self.store = greeting.take_store();
            self.current = None;
        } else if state == GreetingState::Quit {
            self.current = None;
            self.proposal = None;
            self.store = None;
            self.quit = true;
        }

        Ok(GreeterOutcome {
            outbound,
            state,
            completed: outcome.completed,
            packet_id,
        })
    }

    /// Decide which greeting handles the packet: the echoed proposal,
    /// the live operation, or a fresh one for a peer-initiated
    /// operation.
    fn route_greeting(&mut self, from: &str, message: &GreetMessage, packet_hash: &[u8; 32]) {
        if self
            .proposal
            .as_ref()
            .is_some_and(|p| p.hash == *packet_hash)
        {
            if let Some(proposal) = self.proposal.take() {
                self.current = Some(proposal.greeting);
            }
            return;
        }
        if message.greet_type.is_initiator() && from != self.identity.id() {
            // A peer starts an operation; any local proposal lost the
            // race and higher-layer recovery is out of scope here.
            let greeting = match &self.store {
                Some(store) => Greeting::resume(self.identity.id(), store),
                None => Greeting::new(self.identity.id()),
            };
            self.current = Some(greeting);
            return;
        }
        if self.current.is_none() {
            // A response to our proposal may arrive before the echo of
            // the proposal itself.
            if let Some(proposal) = self.proposal.take() {
                self.current = Some(proposal.greeting);
            }
        }
    }

    /// Verify the detached packet signature against the best-known
    /// ephemeral key for the source.
    fn verify_signature(&self, signed: &crate::message::SignedGreetMessage) -> Result<()> {
        let source = signed.message.source.clone();
        let known = self
            .current
            .as_ref()
            .and_then(|g| g.ephemeral_pub_key_of(&source))
            .or_else(|| {
                self.proposal
                    .as_ref()
                    .and_then(|p| p.greeting.ephemeral_pub_key_of(&source))
            })
            .or_else(|| {
                self.store
                    .as_ref()
                    .and_then(|s| s.ephemeral_pub_key_of(&source))
            })
            .or_else(|| signed.carried_source_key());
        let key = known.ok_or_else(|| {
            GreetError::BadSignature(format!("no ephemeral key known for {source}"))
        })?;
        signed.verify(key)
    }

    fn resumed_greeting(&self, action: &str) -> Result<Greeting> {
        if self.current.is_some() || self.proposal.is_some() {
            return Err(GreetError::IllegalCaller(format!(
                "{action}() while an operation is in progress"
            )));
        }
        let store = self.store.as_ref().ok_or_else(|| {
            GreetError::IllegalCaller(format!("{action}() without an established session"))
        })?;
        Ok(Greeting::resume(self.identity.id(), store))
    }

    fn stash_proposal(
        &mut self,
        greeting: Greeting,
        message: &GreetMessage,
    ) -> Result<OutboundGreet> {
        let payload = greeting.encode_message(message)?;
        self.proposal = Some(Proposal {
            hash: sha256::hash(&payload),
            greeting,
        });
        Ok(OutboundGreet {
            dest: message.dest.clone(),
            payload,
        })
    }
}

/// Channel-scoped packet id:
/// `SHA256(sender ‖ "\n" ‖ other-members joined by "\n" ‖ "\n\n" ‖ payload)`.
pub fn packet_id(sender: &str, channel_members: &[String], payload: &[u8]) -> [u8; 32] {
    let others: Vec<&str> = channel_members
        .iter()
        .filter(|m| *m != sender)
        .map(String::as_str)
        .collect();
    let others = others.join("\n");
    sha256::hash_parts(&[sender.as_bytes(), b"\n", others.as_bytes(), b"\n\n", payload])
}

#[cfg(test)]
mod tests {
    use super::*;
    use mpenc_crypto::rsa::StaticPrivateKey;

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn setup(names: &[&str]) -> Vec<Greeter> {
        let mut directory = StaticKeyDirectory::new();
        let mut identities = Vec::new();
        for name in names {
            let key = StaticPrivateKey::generate(1024).expect("keygen");
            directory.insert(*name, key.public_key());
            identities.push(LocalIdentity::new(*name, key));
        }
        identities
            .into_iter()
            .map(|identity| Greeter::new(identity, directory.clone()))
            .collect()
    }

    /// Deliver a packet to every greeter (broadcast channel semantics:
    /// the sender sees its own packet too) and collect the responses.
    fn deliver(
        greeters: &mut [Greeter],
        channel: &[String],
        from: &str,
        payload: &[u8],
    ) -> Vec<(String, Vec<u8>)> {
        let mut responses = Vec::new();
        for greeter in greeters.iter_mut() {
            let outcome = greeter
                .process_incoming(from, payload, channel)
                .expect("process");
            if let Some(out) = outcome.outbound {
                responses.push((greeter.id().to_string(), out.payload));
            }
        }
        responses
    }

    fn converge(
        greeters: &mut [Greeter],
        channel: &[String],
        first: (String, Vec<u8>),
    ) {
        let mut pending = vec![first];
        while let Some((from, payload)) = pending.pop() {
            pending.extend(deliver(greeters, channel, &from, &payload));
        }
    }

    #[test]
    fn test_full_agreement_via_greeters() {
        let mut greeters = setup(&["1", "2", "3"]);
        let channel = ids(&["1", "2", "3"]);

        let out = greeters[0]
            .start(&ids(&["2", "3"]), None)
            .expect("start");
        assert_eq!(out.dest, "2");
        assert_eq!(greeters[0].state(), GreetingState::InitUpflow);

        converge(&mut greeters, &channel, ("1".into(), out.payload));

        let session_id = greeters[0].store().expect("store").session_id;
        let group_key = greeters[0].store().expect("store").group_key;
        for greeter in &greeters {
            assert_eq!(greeter.state(), GreetingState::Ready);
            let store = greeter.store().expect("store");
            assert_eq!(store.session_id, session_id);
            assert_eq!(store.group_key, group_key);
            assert_eq!(store.members, channel);
        }
    }

    #[test]
    fn test_start_twice_rejected() {
        let mut greeters = setup(&["1", "2"]);
        greeters[0].start(&ids(&["2"]), None).expect("start");
        assert!(matches!(
            greeters[0].start(&ids(&["2"]), None),
            Err(GreetError::IllegalCaller(_))
        ));
    }

    #[test]
    fn test_include_without_session_rejected() {
        let mut greeters = setup(&["1", "2"]);
        assert!(matches!(
            greeters[0].include(&ids(&["2"]), None),
            Err(GreetError::IllegalCaller(_))
        ));
    }

    #[test]
    fn test_propose_refuses_mixed_membership_change() {
        let mut greeters = setup(&["1", "2", "3"]);
        let channel = ids(&["1", "2", "3"]);
        let out = greeters[0].start(&ids(&["2", "3"]), None).expect("start");
        converge(&mut greeters, &channel, ("1".into(), out.payload));

        // Adding "4" while dropping "3" must be two operations.
        assert!(matches!(
            greeters[0].propose(&ids(&["1", "2", "4"]), None),
            Err(GreetError::IllegalCaller(_))
        ));
    }

    #[test]
    fn test_propose_picks_refresh_for_same_members() {
        let mut greeters = setup(&["1", "2"]);
        let channel = ids(&["1", "2"]);
        let out = greeters[0].start(&ids(&["2"]), None).expect("start");
        converge(&mut greeters, &channel, ("1".into(), out.payload));
        let old_key = greeters[0].store().expect("store").group_key;

        let out = greeters[0]
            .propose(&channel, None)
            .expect("propose")
            .expect("message");
        assert_eq!(out.dest, "");
        // Refresh completes locally right away.
        assert_eq!(greeters[0].state(), GreetingState::Ready);
        assert_ne!(greeters[0].store().expect("store").group_key, old_key);

        converge(&mut greeters, &channel, ("1".into(), out.payload));
        assert_eq!(
            greeters[0].store().expect("store").group_key,
            greeters[1].store().expect("store").group_key
        );
    }

    #[test]
    fn test_exclude_last_man_standing() {
        let mut greeters = setup(&["A", "B"]);
        let channel = ids(&["A", "B"]);
        let out = greeters[0].start(&ids(&["B"]), None).expect("start");
        converge(&mut greeters, &channel, ("A".into(), out.payload));

        let out = greeters[0].exclude(&ids(&["B"]), None).expect("exclude");
        assert!(out.is_none());
        assert_eq!(greeters[0].state(), GreetingState::Quit);
        assert!(greeters[0].store().is_none());
    }

    #[test]
    fn test_bad_packet_signature_rejected() {
        let mut greeters = setup(&["1", "2"]);
        let channel = ids(&["1", "2"]);
        let out = greeters[0].start(&ids(&["2"]), None).expect("start");

        // Corrupt a byte inside the detached signature record.
        let mut payload = out.payload;
        payload[4] ^= 0x01;
        assert!(matches!(
            greeters[1].process_incoming("1", &payload, &channel),
            Err(GreetError::BadSignature(_))
        ));
    }

    #[test]
    fn test_packet_id_depends_on_channel() {
        let payload = b"payload";
        let a = packet_id("1", &ids(&["1", "2"]), payload);
        let b = packet_id("1", &ids(&["1", "2", "3"]), payload);
        let c = packet_id("2", &ids(&["1", "2"]), payload);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}
