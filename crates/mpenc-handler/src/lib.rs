//! # mpenc-handler
//!
//! The top-level mpENC protocol handler: one instance per participant,
//! sitting between the application, the broadcast transport and the
//! protocol engine.
//!
//! The handler classifies every inbound channel message by its frame
//! prefix, drives the greeter or the data-message layer accordingly,
//! and communicates results through three owned FIFO queues the
//! application drains:
//!
//! - `protocol_out_queue` — wire-framed greet packets and queries
//! - `message_out_queue` — wire-framed data packets
//! - `ui_queue` — decrypted messages, info and error events
//!
//! The engine is single-threaded and synchronous: every entry point
//! returns after the state transition and any emitted packets are
//! enqueued. Inbound protocol violations never bubble out of
//! [`ProtocolHandler::process_message`]; the offending packet is
//! dropped and, where the protocol prescribes it, an error event is
//! queued.

use std::collections::VecDeque;

use mpenc_greet::greeter::{GreetStore, Greeter};
use mpenc_greet::greeting::GreetingState;
use mpenc_greet::{GreetError, LocalIdentity, StaticKeyDirectory};
use mpenc_message::{MessageError, MessageSecurity};
use mpenc_wire::{frame, tlv, WireFrame, WireMessageType};
use serde::{Deserialize, Serialize};

/// Error types for caller-initiated handler actions.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The action is not legal in the current state.
    #[error("{action}() is not allowed in state {state:?}")]
    IllegalState {
        action: &'static str,
        state: GreetingState,
    },

    /// Greeting layer failure.
    #[error(transparent)]
    Greet(#[from] GreetError),

    /// Data-message layer failure.
    #[error(transparent)]
    Message(#[from] MessageError),

    /// Wire codec failure.
    #[error(transparent)]
    Wire(#[from] mpenc_wire::WireError),
}

pub type Result<T> = std::result::Result<T, HandlerError>;

/// A wire-framed packet waiting for the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundPacket {
    /// Sender id.
    pub from: String,
    /// Recipient id; empty string means broadcast.
    pub to: String,
    /// The framed channel message.
    pub message: String,
}

/// An event for the application UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UiEvent {
    /// A decrypted data message.
    Message { from: String, body: String },
    /// An informational notice.
    Info(String),
    /// A protocol error notice.
    Error(String),
}

/// Per-participant protocol handler.
pub struct ProtocolHandler {
    id: String,
    greeter: Greeter,
    security: Option<MessageSecurity>,
    padding_size: usize,
    protocol_out_queue: VecDeque<OutboundPacket>,
    message_out_queue: VecDeque<OutboundPacket>,
    ui_queue: VecDeque<UiEvent>,
}

impl ProtocolHandler {
    /// Create a handler for a participant.
    ///
    /// `padding_size` is the data-message padding base bucket; zero
    /// disables padding.
    pub fn new(
        identity: LocalIdentity,
        directory: StaticKeyDirectory,
        padding_size: usize,
    ) -> Self {
        let id = identity.id().to_string();
        Self {
            id,
            greeter: Greeter::new(identity, directory),
            security: None,
            padding_size,
            protocol_out_queue: VecDeque::new(),
            message_out_queue: VecDeque::new(),
            ui_queue: VecDeque::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The observable engine state.
    pub fn state(&self) -> GreetingState {
        self.greeter.state()
    }

    /// The member list of the established session, if any.
    pub fn members(&self) -> Vec<String> {
        self.greeter
            .store()
            .map(|store| store.members.clone())
            .unwrap_or_default()
    }

    /// The completed-session snapshot, for the host to persist.
    pub fn session_store(&self) -> Option<&GreetStore> {
        self.greeter.store()
    }

    /// Wire-framed greet packets and queries for the transport.
    pub fn protocol_out_queue(&mut self) -> &mut VecDeque<OutboundPacket> {
        &mut self.protocol_out_queue
    }

    /// Wire-framed data packets for the transport.
    pub fn message_out_queue(&mut self) -> &mut VecDeque<OutboundPacket> {
        &mut self.message_out_queue
    }

    /// Events for the application UI.
    pub fn ui_queue(&mut self) -> &mut VecDeque<UiEvent> {
        &mut self.ui_queue
    }

    /// Start a session with the given other members (NULL only).
    pub fn start(&mut self, others: &[String]) -> Result<()> {
        self.require_state("start", GreetingState::Null)?;
        let out = self.greeter.start(others, None)?;
        self.queue_protocol(out.dest, &out.payload);
        Ok(())
    }

    /// Include new members into the session (READY only).
    pub fn join(&mut self, new_members: &[String]) -> Result<()> {
        self.require_state("join", GreetingState::Ready)?;
        let out = self.greeter.include(new_members, None)?;
        self.queue_protocol(out.dest, &out.payload);
        Ok(())
    }

    /// Exclude members from the session (READY only).
    pub fn exclude(&mut self, exclude: &[String]) -> Result<()> {
        self.require_state("exclude", GreetingState::Ready)?;
        match self.greeter.exclude(exclude, None)? {
            Some(out) => self.queue_protocol(out.dest, &out.payload),
            None => {
                // Last man standing: the session is gone.
                self.security = None;
            }
        }
        Ok(())
    }

    /// Refresh the group key (READY only).
    pub fn refresh(&mut self) -> Result<()> {
        self.require_state("refresh", GreetingState::Ready)?;
        let out = self.greeter.refresh()?;
        self.queue_protocol(out.dest, &out.payload);
        self.adopt_session();
        Ok(())
    }

    /// Leave the session (READY only).
    pub fn quit(&mut self) -> Result<()> {
        self.require_state("quit", GreetingState::Ready)?;
        let out = self.greeter.quit()?;
        self.queue_protocol(out.dest, &out.payload);
        self.security = None;
        Ok(())
    }

    /// Encrypt and queue a data message (READY only).
    pub fn send(&mut self, body: &str) -> Result<()> {
        self.send_with_parents(&[], body)
    }

    /// Encrypt and queue a data message with parent packet ids.
    pub fn send_with_parents(&mut self, parents: &[Vec<u8>], body: &str) -> Result<()> {
        self.require_state("send", GreetingState::Ready)?;
        let security = self.security.as_ref().ok_or(HandlerError::IllegalState {
            action: "send",
            state: self.greeter.state(),
        })?;
        let payload = security.auth_encrypt(parents, body)?;
        self.message_out_queue.push_back(OutboundPacket {
            from: self.id.clone(),
            to: String::new(),
            message: frame::encode_message(&payload),
        });
        Ok(())
    }

    /// Queue a signed error notice for the channel.
    pub fn send_error(&mut self, text: &str) -> Result<()> {
        let signature = match self.greeter.store() {
            Some(store) => {
                let signed = [frame::ERROR_SIGNATURE_MAGIC, text.as_bytes()].concat();
                store.ephemeral_key.sign(&signed).to_bytes().to_vec()
            }
            None => Vec::new(),
        };
        self.protocol_out_queue.push_back(OutboundPacket {
            from: self.id.clone(),
            to: String::new(),
            message: frame::encode_error(&signature, text),
        });
        Ok(())
    }

    /// Classify and process one inbound channel message.
    ///
    /// Protocol violations in inbound traffic are absorbed: the packet
    /// is dropped and an event queued or a warning logged.
    pub fn process_message(&mut self, from: &str, message: &str) {
        match frame::classify(message) {
            Ok(WireFrame::Plain(_)) => {
                self.ui_queue.push_back(UiEvent::Info(
                    "Received unencrypted message, requesting encryption.".into(),
                ));
                self.protocol_out_queue.push_back(OutboundPacket {
                    from: self.id.clone(),
                    to: from.to_string(),
                    message: frame::encode_query(""),
                });
            }
            Ok(WireFrame::Error { text, .. }) => {
                self.ui_queue
                    .push_back(UiEvent::Error(format!("Error in mpEnc protocol: {text}")));
            }
            Ok(WireFrame::Query { version, .. }) => self.process_query(from, version),
            Ok(WireFrame::Message(payload)) => self.process_payload(from, &payload),
            Err(e) => {
                tracing::warn!(from = %from, error = %e, "unparseable frame");
                self.ui_queue
                    .push_back(UiEvent::Error(format!("Error in mpEnc protocol: {e}")));
            }
        }
    }

    fn process_query(&mut self, from: &str, version: u8) {
        if version != mpenc_wire::PROTOCOL_VERSION {
            tracing::warn!(from = %from, version, "query for unsupported protocol version");
            return;
        }
        if self.state() != GreetingState::Null {
            tracing::debug!(from = %from, state = ?self.state(), "ignoring query");
            return;
        }
        if let Err(e) = self.start(&[from.to_string()]) {
            tracing::warn!(from = %from, error = %e, "cannot start session on query");
        }
    }

    fn process_payload(&mut self, from: &str, payload: &[u8]) {
        match tlv::peek_message_type(payload) {
            Ok(WireMessageType::Greet) => self.process_greet(from, payload),
            Ok(WireMessageType::Data) => self.process_data(from, payload),
            Err(e) => {
                tracing::warn!(from = %from, error = %e, "payload without message type");
                self.ui_queue
                    .push_back(UiEvent::Error(format!("Error in mpEnc protocol: {e}")));
            }
        }
    }

    fn process_greet(&mut self, from: &str, payload: &[u8]) {
        let channel_members = self.members();
        match self.greeter.process_incoming(from, payload, &channel_members) {
            Ok(outcome) => {
                if let Some(out) = outcome.outbound {
                    self.queue_protocol(out.dest, &out.payload);
                }
                if outcome.completed {
                    self.adopt_session();
                }
                if outcome.state == GreetingState::Quit {
                    self.security = None;
                }
            }
            Err(GreetError::Unimplemented(what)) => {
                tracing::warn!(from = %from, what, "unimplemented protocol path");
                self.ui_queue
                    .push_back(UiEvent::Error(format!("Error in mpEnc protocol: {what}")));
            }
            Err(e) => {
                tracing::warn!(from = %from, error = %e, "greet packet rejected");
                self.ui_queue
                    .push_back(UiEvent::Error(format!("Error in mpEnc protocol: {e}")));
            }
        }
    }

    fn process_data(&mut self, from: &str, payload: &[u8]) {
        let Some(security) = self.security.as_ref() else {
            tracing::warn!(from = %from, "data message without an established session");
            return;
        };
        match security.decrypt_verify(payload, from) {
            Ok(message) => {
                self.ui_queue.push_back(UiEvent::Message {
                    from: message.author,
                    body: message.body,
                });
            }
            Err(MessageError::UnknownAuthor(author)) => {
                tracing::warn!(%author, "data message from unknown author");
            }
            Err(MessageError::BadSignature) => {
                self.ui_queue.push_back(UiEvent::Error(
                    "Signature of received message invalid.".into(),
                ));
            }
            Err(e) => {
                tracing::warn!(from = %from, error = %e, "data message rejected");
                self.ui_queue
                    .push_back(UiEvent::Error(format!("Error in mpEnc protocol: {e}")));
            }
        }
    }

    /// Rebuild the data-message context from the freshly completed
    /// session.
    fn adopt_session(&mut self) {
        self.security = self
            .greeter
            .store()
            .map(|store| MessageSecurity::new(store, self.padding_size));
    }

    fn queue_protocol(&mut self, to: String, payload: &[u8]) {
        self.protocol_out_queue.push_back(OutboundPacket {
            from: self.id.clone(),
            to,
            message: frame::encode_message(payload),
        });
    }

    fn require_state(&self, action: &'static str, expected: GreetingState) -> Result<()> {
        let state = self.state();
        if state != expected {
            return Err(HandlerError::IllegalState { action, state });
        }
        Ok(())
    }
}
