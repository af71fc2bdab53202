//! Wire codec for [`Message`] values.
//!
//! JSON is the default because both historical host bridges move JSON
//! strings. `MsgPack` uses named-field encoding (`rmp_serde::to_vec_named`)
//! so field names survive on the wire.

use bytes::Bytes;

use crate::message::Message;

/// Serialization format used on the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    #[default]
    Json,
    MsgPack,
}

/// Errors from encoding or decoding a message.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Encode(String),
    #[error("failed to decode message: {0}")]
    Decode(String),
    #[error("decoded message is missing a destination")]
    MissingDestination,
}

impl WireFormat {
    /// Encodes a message for the transport.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Encode` if the body cannot be represented in this format.
    pub fn encode(self, message: &Message) -> Result<Bytes, CodecError> {
        let encoded = match self {
            Self::Json => {
                serde_json::to_vec(message).map_err(|e| CodecError::Encode(e.to_string()))?
            }
            Self::MsgPack => {
                rmp_serde::to_vec_named(message).map_err(|e| CodecError::Encode(e.to_string()))?
            }
        };
        Ok(Bytes::from(encoded))
    }

    /// Decodes a message received from the transport.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Decode` for malformed payloads and
    /// `CodecError::MissingDestination` for messages that cannot be routed.
    pub fn decode(self, raw: &[u8]) -> Result<Message, CodecError> {
        let message: Message = match self {
            Self::Json => {
                serde_json::from_slice(raw).map_err(|e| CodecError::Decode(e.to_string()))?
            }
            Self::MsgPack => {
                rmp_serde::from_slice(raw).map_err(|e| CodecError::Decode(e.to_string()))?
            }
        };
        if message.header.destination.is_empty() {
            return Err(CodecError::MissingDestination);
        }
        Ok(message)
    }
}
