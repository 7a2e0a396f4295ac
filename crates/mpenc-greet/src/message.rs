//! The typed greet packet.
//!
//! A greet message is the transport unit of a membership operation. Its
//! greet-type is a 16-bit bitfield; only the enumerated codes below are
//! valid on the wire, and bit surgery that would leave the enumeration
//! fails unless explicitly forced (forcing is confined to the state
//! machine, which clears INIT/GKA while deriving a response type from
//! an inbound one).

use mpenc_crypto::ed25519::{SigningKey, VerifyingKey};
use mpenc_crypto::x25519::DhElement;
use mpenc_wire::{TlvReader, TlvType, TlvWriter, WireMessageType, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};

use crate::{check_no_duplicates, GreetError, Result};

/// Domain separation prefix of greet-message signatures.
pub const GREET_SIGNATURE_MAGIC: &[u8] = b"greetmsgsig";

/// Named bits of the greet-type bitfield.
pub mod bits {
    /// Auxiliary operation (join/exclude/refresh), not initial.
    pub const AUX: u16 = 1 << 0;
    /// Downflow (broadcast); cleared means upflow.
    pub const DOWN: u16 = 1 << 1;
    /// Carries CLIQUES content (intermediate keys).
    pub const GKA: u16 = 1 << 2;
    /// Carries ASKE content (nonces, public keys, session signature).
    pub const SKE: u16 = 1 << 3;
    /// Sender is the initiator of this operation.
    pub const INIT: u16 = 1 << 7;
    /// Reserved recovery flag; no specified semantics.
    pub const RECOVER: u16 = 1 << 8;
}

const OP_SHIFT: u16 = 4;
const OP_MASK: u16 = 0b0111 << OP_SHIFT;

/// Operation code occupying bits 4-6 of a greet-type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Operation {
    Data = 0,
    Start = 1,
    Include = 2,
    Exclude = 3,
    Refresh = 4,
    Quit = 5,
}

/// A validated greet-type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GreetType(u16);

impl GreetType {
    pub const INIT_INITIATOR_UP: GreetType = GreetType(0x009C);
    pub const INIT_PARTICIPANT_UP: GreetType = GreetType(0x001C);
    pub const INIT_PARTICIPANT_DOWN: GreetType = GreetType(0x001E);
    pub const INIT_PARTICIPANT_CONFIRM_DOWN: GreetType = GreetType(0x001A);
    pub const INCLUDE_AUX_INITIATOR_UP: GreetType = GreetType(0x00AD);
    pub const INCLUDE_AUX_PARTICIPANT_UP: GreetType = GreetType(0x002D);
    pub const INCLUDE_AUX_PARTICIPANT_DOWN: GreetType = GreetType(0x002F);
    pub const INCLUDE_AUX_PARTICIPANT_CONFIRM_DOWN: GreetType = GreetType(0x002B);
    pub const EXCLUDE_AUX_INITIATOR_DOWN: GreetType = GreetType(0x00BF);
    pub const EXCLUDE_AUX_PARTICIPANT_CONFIRM_DOWN: GreetType = GreetType(0x003B);
    pub const REFRESH_AUX_INITIATOR_DOWN: GreetType = GreetType(0x00C7);
    pub const QUIT_DOWN: GreetType = GreetType(0x00D3);

    const ENUMERATION: [GreetType; 12] = [
        Self::INIT_INITIATOR_UP,
        Self::INIT_PARTICIPANT_UP,
        Self::INIT_PARTICIPANT_DOWN,
        Self::INIT_PARTICIPANT_CONFIRM_DOWN,
        Self::INCLUDE_AUX_INITIATOR_UP,
        Self::INCLUDE_AUX_PARTICIPANT_UP,
        Self::INCLUDE_AUX_PARTICIPANT_DOWN,
        Self::INCLUDE_AUX_PARTICIPANT_CONFIRM_DOWN,
        Self::EXCLUDE_AUX_INITIATOR_DOWN,
        Self::EXCLUDE_AUX_PARTICIPANT_CONFIRM_DOWN,
        Self::REFRESH_AUX_INITIATOR_DOWN,
        Self::QUIT_DOWN,
    ];

    /// Validate a raw greet-type code.
    pub fn from_u16(raw: u16) -> Result<Self> {
        if raw & bits::RECOVER != 0 {
            return Err(GreetError::Unimplemented("recovery greet types"));
        }
        let candidate = GreetType(raw);
        if Self::ENUMERATION.contains(&candidate) {
            Ok(candidate)
        } else {
            Err(GreetError::Malformed(format!(
                "greet type 0x{raw:04x} is not in the enumerated set"
            )))
        }
    }

    pub fn to_u16(self) -> u16 {
        self.0
    }

    /// Set or clear one bit; fails if the result leaves the enumeration.
    pub fn with_bit(self, bit: u16, on: bool) -> Result<Self> {
        Self::from_u16(self.with_bit_forced(bit, on))
    }

    /// Set or clear one bit without revalidating.
    ///
    /// Only for deriving a response type step by step from an inbound
    /// one; the final code must go back through [`GreetType::from_u16`].
    pub(crate) fn with_bit_forced(self, bit: u16, on: bool) -> u16 {
        if on {
            self.0 | bit
        } else {
            self.0 & !bit
        }
    }

    /// Auxiliary operation (join/exclude/refresh) rather than initial.
    pub fn is_auxiliary(self) -> bool {
        self.0 & bits::AUX != 0
    }

    /// Broadcast downflow rather than member-to-member upflow.
    pub fn is_downflow(self) -> bool {
        self.0 & bits::DOWN != 0
    }

    /// Carries CLIQUES (group key agreement) content.
    pub fn has_gka(self) -> bool {
        self.0 & bits::GKA != 0
    }

    /// Carries ASKE (signature key exchange) content.
    pub fn has_ske(self) -> bool {
        self.0 & bits::SKE != 0
    }

    /// Sender initiated the operation.
    pub fn is_initiator(self) -> bool {
        self.0 & bits::INIT != 0
    }

    /// The membership operation encoded in bits 4-6.
    pub fn operation(self) -> Operation {
        match (self.0 & OP_MASK) >> OP_SHIFT {
            0 => Operation::Data,
            1 => Operation::Start,
            2 => Operation::Include,
            3 => Operation::Exclude,
            4 => Operation::Refresh,
            // Enumerated codes only reach 5.
            _ => Operation::Quit,
        }
    }
}

/// Metadata tagging a packet as the first of a new operation.
///
/// The packet author is the message source; parents are opaque packet
/// ids whose ordering semantics belong to a higher layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GreetingMetadata {
    /// Packet id of the previous operation's final packet.
    pub prev_pf: Vec<u8>,
    /// Transcript chain hash at the point this operation begins.
    pub prev_chain_hash: Vec<u8>,
    /// Latest seen message packet ids.
    pub parents: Vec<Vec<u8>>,
}

/// A decoded or to-be-sent greet message.
#[derive(Debug, Clone)]
pub struct GreetMessage {
    pub source: String,
    /// Empty string means broadcast.
    pub dest: String,
    pub greet_type: GreetType,
    pub members: Vec<String>,
    pub int_keys: Vec<DhElement>,
    pub nonces: Vec<Vec<u8>>,
    pub pub_keys: Vec<VerifyingKey>,
    pub session_signature: Option<Vec<u8>>,
    /// Own ephemeral private key, published only on QUIT.
    pub signing_key: Option<SigningKey>,
    pub metadata: Option<GreetingMetadata>,
}

impl GreetMessage {
    /// Serialize the signed-over portion of the payload.
    fn encode_content(&self) -> Result<Vec<u8>> {
        let mut writer = TlvWriter::new();
        writer.push(TlvType::ProtocolVersion, &[PROTOCOL_VERSION])?;
        writer.push(TlvType::MessageType, &[WireMessageType::Greet as u8])?;
        writer.push(TlvType::GreetType, &self.greet_type.to_u16().to_be_bytes())?;
        writer.push(TlvType::Source, self.source.as_bytes())?;
        writer.push(TlvType::Dest, self.dest.as_bytes())?;
        for member in &self.members {
            writer.push(TlvType::Member, member.as_bytes())?;
        }
        for int_key in &self.int_keys {
            writer.push(TlvType::IntKey, int_key.as_bytes())?;
        }
        for nonce in &self.nonces {
            writer.push(TlvType::Nonce, nonce)?;
        }
        for pub_key in &self.pub_keys {
            writer.push(TlvType::PubKey, &pub_key.to_bytes())?;
        }
        if let Some(metadata) = &self.metadata {
            writer.push(TlvType::PrevPf, &metadata.prev_pf)?;
            writer.push(TlvType::ChainHash, &metadata.prev_chain_hash)?;
            for parent in &metadata.parents {
                writer.push(TlvType::LatestPm, parent)?;
            }
        }
        if let Some(session_signature) = &self.session_signature {
            writer.push(TlvType::SessionSignature, session_signature)?;
        }
        if let Some(signing_key) = &self.signing_key {
            writer.push(TlvType::SigningKey, &signing_key.to_bytes())?;
        }
        Ok(writer.into_bytes())
    }

    /// Encode and sign the payload with the sender's ephemeral key.
    pub fn encode(&self, key: &SigningKey) -> Result<Vec<u8>> {
        let content = self.encode_content()?;
        let signed = [GREET_SIGNATURE_MAGIC, &content].concat();
        let signature = key.sign(&signed);

        let mut writer = TlvWriter::new();
        writer.push(TlvType::MessageSignature, &signature.to_bytes())?;
        let mut payload = writer.into_bytes();
        payload.extend_from_slice(&content);
        Ok(payload)
    }

    /// Decode a payload into a message plus its detached signature.
    pub fn decode(payload: &[u8]) -> Result<SignedGreetMessage> {
        let mut reader = TlvReader::new(payload);
        let signature = reader.pop(TlvType::MessageSignature)?.to_vec();
        let signed_content = reader.remaining().to_vec();

        let version = reader.pop(TlvType::ProtocolVersion)?;
        if version != [PROTOCOL_VERSION] {
            return Err(GreetError::Malformed(format!(
                "unsupported protocol version {version:02x?}"
            )));
        }
        let message_type = reader.pop(TlvType::MessageType)?;
        if message_type != [WireMessageType::Greet as u8] {
            return Err(GreetError::Malformed(
                "payload is not a greet message".into(),
            ));
        }
        let greet_type = reader.pop(TlvType::GreetType)?;
        let greet_type: [u8; 2] = greet_type
            .try_into()
            .map_err(|_| GreetError::Malformed("greet type record must be 2 bytes".into()))?;
        let greet_type = GreetType::from_u16(u16::from_be_bytes(greet_type))?;

        let source = pop_string(&mut reader, TlvType::Source)?;
        let dest = pop_string(&mut reader, TlvType::Dest)?;

        let mut members = Vec::new();
        for raw in reader.pop_all(TlvType::Member)? {
            members.push(utf8(raw, "member id")?);
        }
        check_no_duplicates(&members)?;

        let mut int_keys = Vec::new();
        for raw in reader.pop_all(TlvType::IntKey)? {
            int_keys.push(DhElement::from_slice(raw)?);
        }
        let nonces: Vec<Vec<u8>> = reader
            .pop_all(TlvType::Nonce)?
            .into_iter()
            .map(<[u8]>::to_vec)
            .collect();
        let mut pub_keys = Vec::new();
        for raw in reader.pop_all(TlvType::PubKey)? {
            pub_keys.push(VerifyingKey::from_slice(raw)?);
        }

        let metadata = match reader.pop_maybe(TlvType::PrevPf)? {
            Some(prev_pf) => {
                let prev_chain_hash = reader.pop(TlvType::ChainHash)?.to_vec();
                let parents = reader
                    .pop_all(TlvType::LatestPm)?
                    .into_iter()
                    .map(<[u8]>::to_vec)
                    .collect();
                Some(GreetingMetadata {
                    prev_pf: prev_pf.to_vec(),
                    prev_chain_hash,
                    parents,
                })
            }
            None => None,
        };

        let session_signature = reader
            .pop_maybe(TlvType::SessionSignature)?
            .map(<[u8]>::to_vec);
        let signing_key = match reader.pop_maybe(TlvType::SigningKey)? {
            Some(raw) => Some(SigningKey::from_slice(raw)?),
            None => None,
        };

        if !reader.is_empty() {
            return Err(GreetError::Malformed(
                "trailing records after greet message".into(),
            ));
        }

        Ok(SignedGreetMessage {
            message: GreetMessage {
                source,
                dest,
                greet_type,
                members,
                int_keys,
                nonces,
                pub_keys,
                session_signature,
                signing_key,
                metadata,
            },
            signature,
            signed_content,
        })
    }
}

/// A decoded greet message whose signature has not been verified yet.
#[derive(Debug, Clone)]
pub struct SignedGreetMessage {
    pub message: GreetMessage,
    signature: Vec<u8>,
    signed_content: Vec<u8>,
}

impl SignedGreetMessage {
    /// Verify the detached signature against a candidate public key.
    pub fn verify(&self, key: &VerifyingKey) -> Result<()> {
        let signed = [GREET_SIGNATURE_MAGIC, &self.signed_content].concat();
        key.verify_slice(&signed, &self.signature)
            .map_err(|_| GreetError::BadSignature("greet message signature invalid".into()))
    }

    /// The ephemeral key the message itself claims for its source, if
    /// the carried lists cover the source's position.
    pub fn carried_source_key(&self) -> Option<&VerifyingKey> {
        let message = &self.message;
        let pos = message.members.iter().position(|m| *m == message.source)?;
        message.pub_keys.get(pos)
    }
}

fn pop_string(reader: &mut TlvReader<'_>, record_type: TlvType) -> Result<String> {
    utf8(reader.pop(record_type)?, "id record")
}

fn utf8(raw: &[u8], what: &str) -> Result<String> {
    String::from_utf8(raw.to_vec())
        .map_err(|_| GreetError::Malformed(format!("{what} is not valid UTF-8")))
}
