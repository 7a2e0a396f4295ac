//! # mpenc-wire
//!
//! The mpENC wire codec: type-length-value records and the ASCII frame
//! layer that carries them.
//!
//! Everything a peer sees on the channel is one of three frames:
//!
//! - `?mpENC:<base64(records)>.` — an encrypted protocol or data message
//! - `?mpENCv<verByte>?<text>` — a protocol query (upgrade request)
//! - `?mpENC Error:<base64 sig>:<text>` — a signed error notice
//!
//! Records are `(u16 type, u16 length, bytes value)`, big-endian, and
//! must be bit-compatible with peer implementations.
//!
//! ## Modules
//!
//! - [`tlv`] — record types, the writer and the cursor-style reader
//! - [`frame`] — frame prefixes, classification, and assembly

pub mod frame;
pub mod tlv;

pub use frame::WireFrame;
pub use tlv::{TlvReader, TlvType, TlvWriter, WireMessageType};

/// The protocol version byte carried in every payload and query frame.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Error types for wire encoding and decoding.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// A record or frame failed to parse.
    #[error("malformed wire data: {0}")]
    Malformed(String),

    /// A record value exceeds the u16 length field.
    #[error("record value exceeds 65535 bytes: {0}")]
    Oversized(usize),

    /// Base64 decoding of a frame body failed.
    #[error("invalid base64 in frame: {0}")]
    Base64(#[from] base64::DecodeError),
}

pub type Result<T> = std::result::Result<T, WireError>;
