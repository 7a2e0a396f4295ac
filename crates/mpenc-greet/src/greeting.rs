//! The greeting state machine.
//!
//! A [`Greeting`] owns all mutable state of one in-progress membership
//! operation: the CLIQUES member, the ASKE member, and the operation
//! metadata. It never mutates the prior session snapshot it was resumed
//! from; on completion it produces a fresh [`GreetStore`].
//!
//! Inbound packets are split into their CLIQUES and ASKE sub-messages
//! according to the greet-type bits, fed to the sub-protocols, and the
//! outputs merged back into a single outbound packet whose greet-type
//! is derived from the inbound one (INIT cleared, DOWN set on
//! broadcasts, GKA cleared on confirmation downflows).

use mpenc_crypto::ed25519::VerifyingKey;
use serde::{Deserialize, Serialize};

use crate::aske::{AskeMember, AskeMessage};
use crate::cliques::{CliquesMember, CliquesMessage};
use crate::greeter::GreetStore;
use crate::message::{bits, GreetMessage, GreetType, GreetingMetadata, Operation};
use crate::{Flow, GreetError, LocalIdentity, Result, StaticKeyDirectory};

/// States of a greeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GreetingState {
    /// No session and no operation in progress.
    Null,
    /// Initial upflow passing along the member list.
    InitUpflow,
    /// Initial downflow; collecting acknowledgements.
    InitDownflow,
    /// Session established.
    Ready,
    /// Auxiliary (include) upflow in progress.
    AuxUpflow,
    /// Auxiliary downflow; collecting acknowledgements.
    AuxDownflow,
    /// Terminal: left, excluded, or last man standing.
    Quit,
}

/// Result of feeding one inbound packet to a greeting.
#[derive(Debug)]
pub struct GreetingOutcome {
    /// Response packet to put on the channel, if any.
    pub outbound: Option<GreetMessage>,
    /// True when this packet completed the operation (state READY and a
    /// fresh snapshot is available).
    pub completed: bool,
}

impl GreetingOutcome {
    fn silent() -> Self {
        Self {
            outbound: None,
            completed: false,
        }
    }
}

/// One membership operation in progress.
#[derive(Debug)]
pub struct Greeting {
    id: String,
    cliques: CliquesMember,
    aske: AskeMember,
    state: GreetingState,
    metadata: Option<GreetingMetadata>,
    store: Option<GreetStore>,
}

impl Greeting {
    /// A greeting for a participant with no prior session.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            cliques: CliquesMember::new(id.clone()),
            aske: AskeMember::new(id.clone()),
            id,
            state: GreetingState::Null,
            metadata: None,
            store: None,
        }
    }

    /// A greeting continuing from a completed session.
    ///
    /// The snapshot is cloned, never mutated.
    pub fn resume(id: impl Into<String>, store: &GreetStore) -> Self {
        let id = id.into();
        Self {
            cliques: CliquesMember::resume(
                id.clone(),
                store.members.clone(),
                store.int_keys.clone(),
                store.priv_key_list.clone(),
                store.group_key_element(),
            ),
            aske: AskeMember::resume(
                id.clone(),
                store.members.clone(),
                store.nonce,
                store.ephemeral_key.clone(),
                store.nonces.clone(),
                store.ephemeral_pub_keys.clone(),
                store.session_id,
            ),
            id,
            state: GreetingState::Ready,
            metadata: None,
            store: None,
        }
    }

    pub fn state(&self) -> GreetingState {
        self.state
    }

    pub fn metadata(&self) -> Option<&GreetingMetadata> {
        self.metadata.as_ref()
    }

    /// The completed-session snapshot, once READY was reached.
    pub fn store(&self) -> Option<&GreetStore> {
        self.store.as_ref()
    }

    pub fn take_store(&mut self) -> Option<GreetStore> {
        self.store.take()
    }

    /// The ephemeral key recorded for a member in this operation.
    pub fn ephemeral_pub_key_of(&self, member: &str) -> Option<&VerifyingKey> {
        self.aske.pub_key_of(member)
    }

    /// Sign and serialize an outbound message of this greeting.
    ///
    /// QUIT packets are signed with the very key they surrender.
    pub fn encode_message(&self, message: &GreetMessage) -> Result<Vec<u8>> {
        let key = self
            .aske
            .ephemeral_key()
            .or(message.signing_key.as_ref())
            .ok_or_else(|| {
                GreetError::IllegalCaller("no ephemeral key to sign with".into())
            })?;
        message.encode(key)
    }

    /// Start the initial key agreement (NULL → INIT_UPFLOW).
    pub fn start(
        &mut self,
        identity: &LocalIdentity,
        others: &[String],
        metadata: Option<GreetingMetadata>,
    ) -> Result<GreetMessage> {
        if self.state != GreetingState::Null {
            return Err(GreetError::IllegalCaller(format!(
                "start() in state {:?}",
                self.state
            )));
        }
        let cliques = self.cliques.ika(others)?;
        let aske = self.aske.commit(identity, others)?;
        let message = self.compose(GreetType::INIT_INITIATOR_UP, Some(cliques), Some(aske), metadata)?;
        self.state = GreetingState::InitUpflow;
        tracing::debug!(member = %self.id, others = others.len(), "starting initial key agreement");
        Ok(message)
    }

    /// Include new members (READY → AUX_UPFLOW).
    pub fn include(
        &mut self,
        new_members: &[String],
        metadata: Option<GreetingMetadata>,
    ) -> Result<GreetMessage> {
        if self.state != GreetingState::Ready {
            return Err(GreetError::IllegalCaller(format!(
                "include() in state {:?}",
                self.state
            )));
        }
        let cliques = self.cliques.aka_join(new_members)?;
        let aske = self.aske.join(new_members)?;
        let message = self.compose(
            GreetType::INCLUDE_AUX_INITIATOR_UP,
            Some(cliques),
            Some(aske),
            metadata,
        )?;
        self.state = GreetingState::AuxUpflow;
        tracing::debug!(member = %self.id, new = new_members.len(), "including members");
        Ok(message)
    }

    /// Exclude members (READY → AUX_DOWNFLOW).
    ///
    /// Returns `None` when the exclusion leaves this member alone: the
    /// greeting transitions straight to QUIT and emits nothing.
    pub fn exclude(
        &mut self,
        identity: &LocalIdentity,
        exclude: &[String],
        metadata: Option<GreetingMetadata>,
    ) -> Result<Option<GreetMessage>> {
        if self.state != GreetingState::Ready {
            return Err(GreetError::IllegalCaller(format!(
                "exclude() in state {:?}",
                self.state
            )));
        }
        if exclude.is_empty() {
            return Err(GreetError::IllegalCaller("no members to exclude".into()));
        }
        if exclude.iter().any(|m| *m == self.id) {
            return Err(GreetError::IllegalCaller("cannot exclude self".into()));
        }
        let remaining: Vec<&String> = self
            .cliques
            .members()
            .iter()
            .filter(|m| !exclude.contains(m))
            .collect();
        if remaining.len() <= 1 {
            // Last man standing.
            self.quit_local();
            return Ok(None);
        }

        let cliques = self.cliques.aka_exclude(exclude)?;
        let aske = self.aske.exclude(identity, exclude)?;
        let message = self.compose(
            GreetType::EXCLUDE_AUX_INITIATOR_DOWN,
            Some(cliques),
            Some(aske),
            metadata,
        )?;
        self.state = GreetingState::AuxDownflow;
        tracing::debug!(member = %self.id, excluded = exclude.len(), "excluding members");
        Ok(Some(message))
    }

    /// Refresh the group key; state unchanged.
    pub fn refresh(&mut self, metadata: Option<GreetingMetadata>) -> Result<GreetMessage> {
        if !matches!(
            self.state,
            GreetingState::Ready | GreetingState::InitDownflow | GreetingState::AuxDownflow
        ) {
            return Err(GreetError::IllegalCaller(format!(
                "refresh() in state {:?}",
                self.state
            )));
        }
        let cliques = self.cliques.aka_refresh()?;
        let message = self.compose(
            GreetType::REFRESH_AUX_INITIATOR_DOWN,
            Some(cliques),
            None,
            metadata,
        )?;
        self.maybe_complete()?;
        tracing::debug!(member = %self.id, "refreshed group key");
        Ok(message)
    }

    /// Leave the session, surrendering the ephemeral private key.
    pub fn quit(&mut self) -> Result<GreetMessage> {
        if self.state == GreetingState::Quit {
            return Err(GreetError::IllegalCaller("already quit".into()));
        }
        let signing_key = self.aske.quit()?;
        self.cliques.aka_quit();
        self.store = None;
        self.state = GreetingState::Quit;
        tracing::debug!(member = %self.id, "quitting session");
        Ok(GreetMessage {
            source: self.id.clone(),
            dest: String::new(),
            greet_type: GreetType::QUIT_DOWN,
            members: Vec::new(),
            int_keys: Vec::new(),
            nonces: Vec::new(),
            pub_keys: Vec::new(),
            session_signature: None,
            signing_key: Some(signing_key),
            metadata: None,
        })
    }

    /// Feed one inbound greet packet through the state machine.
    pub fn process_message(
        &mut self,
        identity: &LocalIdentity,
        directory: &StaticKeyDirectory,
        message: &GreetMessage,
    ) -> Result<GreetingOutcome> {
        // Terminal state consumes everything silently.
        if self.state == GreetingState::Quit {
            return Ok(GreetingOutcome::silent());
        }
        // A non-empty member list that omits us means we were excluded.
        if !message.members.is_empty() && !message.members.contains(&self.id) {
            tracing::debug!(member = %self.id, source = %message.source, "excluded from session");
            self.quit_local();
            return Ok(GreetingOutcome::silent());
        }
        // Not for us.
        if !message.dest.is_empty() && message.dest != self.id {
            return Ok(GreetingOutcome::silent());
        }
        // Our own reflection.
        if message.source == self.id {
            return Ok(GreetingOutcome::silent());
        }

        if let Some(metadata) = &message.metadata {
            if self.metadata.is_some() {
                return Err(GreetError::Malformed(
                    "operation metadata on a non-initial packet".into(),
                ));
            }
            self.metadata = Some(metadata.clone());
        }

        let greet_type = message.greet_type;
        if greet_type.operation() == Operation::Quit {
            // The QUIT-driven recovery flow has no specified semantics.
            return Err(GreetError::Unimplemented("recovery after quit"));
        }

        let (cliques_out, aske_out) = if greet_type.is_downflow() {
            if greet_type.has_gka() {
                self.cliques.downflow(&to_cliques(message))?;
            }
            let aske_out = if greet_type.has_ske() {
                self.aske.downflow(identity, directory, &to_aske(message))?
            } else {
                None
            };
            (None, aske_out)
        } else {
            let cliques_out = if greet_type.has_gka() {
                Some(self.cliques.upflow(&to_cliques(message))?)
            } else {
                None
            };
            let aske_out = if greet_type.has_ske() {
                Some(self.aske.upflow(identity, &to_aske(message))?)
            } else {
                None
            };
            (cliques_out, aske_out)
        };

        let outbound = self.derive_response(greet_type, cliques_out, aske_out)?;

        // Last man standing.
        let own = std::slice::from_ref(&self.id);
        if self.cliques.members() == own || self.aske.members() == own {
            self.quit_local();
            return Ok(GreetingOutcome::silent());
        }

        match &outbound {
            Some(out) if !out.dest.is_empty() => {
                self.state = if greet_type.is_auxiliary() {
                    GreetingState::AuxUpflow
                } else {
                    GreetingState::InitUpflow
                };
            }
            Some(_) => {
                self.state = if greet_type.is_auxiliary() {
                    GreetingState::AuxDownflow
                } else {
                    GreetingState::InitDownflow
                };
            }
            None if greet_type.is_downflow() && greet_type.has_ske() => {
                self.state = if greet_type.is_auxiliary() {
                    GreetingState::AuxDownflow
                } else {
                    GreetingState::InitDownflow
                };
            }
            None => {}
        }

        let completed = self.maybe_complete()?;
        Ok(GreetingOutcome { outbound, completed })
    }

    /// Snapshot the session and go READY once both sub-protocols are
    /// done.
    fn maybe_complete(&mut self) -> Result<bool> {
        if !self.aske.is_session_acknowledged() || self.cliques.group_key().is_none() {
            return Ok(false);
        }
        self.state = GreetingState::Ready;
        self.store = Some(self.build_store()?);
        tracing::debug!(
            member = %self.id,
            members = self.cliques.members().len(),
            "session established"
        );
        Ok(true)
    }

    fn build_store(&self) -> Result<GreetStore> {
        if self.cliques.members() != self.aske.members() {
            return Err(GreetError::Malformed(
                "sub-protocol member lists diverge".into(),
            ));
        }
        let group_key = self
            .cliques
            .group_key()
            .ok_or_else(|| GreetError::Malformed("no group key".into()))?;
        let session_id = self
            .aske
            .session_id()
            .ok_or_else(|| GreetError::Malformed("no session id".into()))?;
        let ephemeral_key = self
            .aske
            .ephemeral_key()
            .ok_or_else(|| GreetError::Malformed("no ephemeral key".into()))?;
        let nonce = self
            .aske
            .nonce()
            .ok_or_else(|| GreetError::Malformed("no own nonce".into()))?;

        GreetStore::new(
            self.state,
            self.cliques.members().to_vec(),
            *session_id,
            ephemeral_key.clone(),
            *nonce,
            self.aske.pub_keys().to_vec(),
            self.aske.nonces().to_vec(),
            group_key.to_bytes(),
            self.cliques.priv_key_list().to_vec(),
            self.cliques.int_keys().to_vec(),
        )
    }

    fn quit_local(&mut self) {
        self.cliques.aka_quit();
        self.store = None;
        self.state = GreetingState::Quit;
    }

    /// Merge caller-initiated sub-messages into a greet packet.
    fn compose(
        &mut self,
        greet_type: GreetType,
        cliques: Option<CliquesMessage>,
        aske: Option<AskeMessage>,
        metadata: Option<GreetingMetadata>,
    ) -> Result<GreetMessage> {
        if metadata.is_some() {
            self.metadata = metadata.clone();
        }
        let merged = merge(&self.id, greet_type, cliques, aske, metadata)?;
        merged.ok_or_else(|| GreetError::Malformed("empty caller operation".into()))
    }

    /// Derive the response packet from an inbound one: clear INIT, set
    /// DOWN on broadcasts, drop GKA from confirmation downflows.
    fn derive_response(
        &self,
        inbound: GreetType,
        cliques: Option<CliquesMessage>,
        aske: Option<AskeMessage>,
    ) -> Result<Option<GreetMessage>> {
        if cliques.is_none() && aske.is_none() {
            return Ok(None);
        }
        let dest = cliques
            .as_ref()
            .map(|m| m.dest.clone())
            .or_else(|| aske.as_ref().map(|m| m.dest.clone()))
            .unwrap_or_default();
        let has_int_keys = cliques.as_ref().is_some_and(|m| !m.int_keys.is_empty());

        let mut raw = inbound.with_bit_forced(bits::INIT, false);
        if dest.is_empty() {
            raw |= bits::DOWN;
            if !has_int_keys {
                raw &= !bits::GKA;
            }
        }
        let greet_type = GreetType::from_u16(raw)?;
        merge(&self.id, greet_type, cliques, aske, None)
    }
}

/// Merge sub-protocol outputs into one greet message.
fn merge(
    id: &str,
    greet_type: GreetType,
    cliques: Option<CliquesMessage>,
    aske: Option<AskeMessage>,
    metadata: Option<GreetingMetadata>,
) -> Result<Option<GreetMessage>> {
    if cliques.is_none() && aske.is_none() {
        return Ok(None);
    }
    if let (Some(cliques), Some(aske)) = (&cliques, &aske) {
        if cliques.members != aske.members || cliques.dest != aske.dest {
            return Err(GreetError::Malformed(
                "sub-protocol outputs diverge".into(),
            ));
        }
    }
    let (dest, members) = match (&cliques, &aske) {
        (Some(m), _) => (m.dest.clone(), m.members.clone()),
        (_, Some(m)) => (m.dest.clone(), m.members.clone()),
        _ => (String::new(), Vec::new()),
    };
    let int_keys = cliques.map(|m| m.int_keys).unwrap_or_default();
    let (nonces, pub_keys, session_signature) = match aske {
        Some(m) => (m.nonces, m.pub_keys, m.session_signature),
        None => (Vec::new(), Vec::new(), None),
    };

    Ok(Some(GreetMessage {
        source: id.to_string(),
        dest,
        greet_type,
        members,
        int_keys,
        nonces,
        pub_keys,
        session_signature,
        signing_key: None,
        metadata,
    }))
}

fn to_cliques(message: &GreetMessage) -> CliquesMessage {
    CliquesMessage {
        source: message.source.clone(),
        dest: message.dest.clone(),
        flow: if message.greet_type.is_downflow() {
            Flow::Down
        } else {
            Flow::Up
        },
        members: message.members.clone(),
        int_keys: message.int_keys.clone(),
    }
}

fn to_aske(message: &GreetMessage) -> AskeMessage {
    AskeMessage {
        source: message.source.clone(),
        dest: message.dest.clone(),
        flow: if message.greet_type.is_downflow() {
            Flow::Down
        } else {
            Flow::Up
        },
        members: message.members.clone(),
        nonces: message.nonces.clone(),
        pub_keys: message.pub_keys.clone(),
        session_signature: message.session_signature.clone(),
    }
}
