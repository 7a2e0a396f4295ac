//! Wire frame layer.
//!
//! Classifies raw channel text into protocol frames and assembles
//! outbound frames. Anything that carries none of the mpENC prefixes is
//! plain text as far as the engine is concerned.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::{Result, WireError, PROTOCOL_VERSION};

/// Prefix of an encrypted message frame.
pub const MESSAGE_PREFIX: &str = "?mpENC:";

/// Terminator of an encrypted message frame.
pub const MESSAGE_SUFFIX: char = '.';

/// Prefix of an error frame.
pub const ERROR_PREFIX: &str = "?mpENC Error:";

/// Prefix of a protocol query frame; followed by the version byte.
pub const QUERY_PREFIX: &str = "?mpENCv";

/// Domain separation prefix of error-frame signatures.
pub const ERROR_SIGNATURE_MAGIC: &[u8] = b"errormsgsig";

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    /// An encrypted greet or data payload (decoded record stream).
    Message(Vec<u8>),
    /// A protocol query: "please speak mpENC version `version`".
    Query { version: u8, text: String },
    /// An error notice with a detached signature (possibly empty).
    Error { signature: Vec<u8>, text: String },
    /// Unprotected plain text.
    Plain(String),
}

/// Classify one raw channel message.
pub fn classify(raw: &str) -> Result<WireFrame> {
    if let Some(rest) = raw.strip_prefix(ERROR_PREFIX) {
        // Lenient on inbound: a missing or undecodable signature segment
        // degrades to an unsigned error notice.
        let (signature, text) = match rest.split_once(':') {
            Some((sig, text)) => match BASE64.decode(sig) {
                Ok(signature) => (signature, text.to_string()),
                Err(_) => (Vec::new(), rest.to_string()),
            },
            None => (Vec::new(), rest.to_string()),
        };
        return Ok(WireFrame::Error { signature, text });
    }
    if let Some(rest) = raw.strip_prefix(MESSAGE_PREFIX) {
        let body = rest
            .strip_suffix(MESSAGE_SUFFIX)
            .ok_or_else(|| WireError::Malformed("message frame not terminated with '.'".into()))?;
        return Ok(WireFrame::Message(BASE64.decode(body)?));
    }
    if let Some(rest) = raw.strip_prefix(QUERY_PREFIX) {
        let mut chars = rest.chars();
        let version = chars
            .next()
            .ok_or_else(|| WireError::Malformed("query frame missing version byte".into()))?;
        let version = u8::try_from(u32::from(version))
            .map_err(|_| WireError::Malformed("query version byte out of range".into()))?;
        let text = chars.as_str();
        let text = text
            .strip_prefix('?')
            .ok_or_else(|| WireError::Malformed("query frame missing '?' separator".into()))?;
        return Ok(WireFrame::Query {
            version,
            text: text.to_string(),
        });
    }
    Ok(WireFrame::Plain(raw.to_string()))
}

/// Assemble an encrypted message frame around a record stream.
pub fn encode_message(payload: &[u8]) -> String {
    format!("{MESSAGE_PREFIX}{}{MESSAGE_SUFFIX}", BASE64.encode(payload))
}

/// Assemble a protocol query frame for the current version.
pub fn encode_query(text: &str) -> String {
    format!("{QUERY_PREFIX}{}?{text}", char::from(PROTOCOL_VERSION))
}

/// Assemble an error frame.
pub fn encode_error(signature: &[u8], text: &str) -> String {
    format!("{ERROR_PREFIX}{}:{text}", BASE64.encode(signature))
}
