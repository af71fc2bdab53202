//! Error types for the connection, its requests, and the handshake.
//!
//! Failures are scoped: a `RequestError` rejects exactly one pending request,
//! a `HandshakeError` rejects only the handshake's outer completion, and
//! neither affects other in-flight requests.

use hostbridge_core::{CodecError, Message};

/// Errors returned synchronously by `Connection::send`.
///
/// When one of these is returned nothing was registered for the message.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The host exposes no working send primitive.
    #[error("host transport is not available")]
    TransportUnavailable,
    /// A request with this correlation id is already outstanding.
    #[error("correlation id already pending: {0}")]
    DuplicateCorrelationId(String),
    /// The outbound message could not be encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The message has a deadline but no Tokio runtime is available to enforce it.
    #[error("no Tokio runtime to enforce the message expiration")]
    NoRuntime,
}

/// Reasons a pending request is rejected.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RequestError {
    /// The host reported a failure for this specific send.
    #[error("transport failure {code}: {message}")]
    TransportFailure { code: i32, message: String },
    /// No reply arrived before the message's deadline.
    ///
    /// Carries the expiration message built from the request.
    #[error("request to {} expired", .0.destination())]
    Expired(Box<Message>),
    /// The host answered a query with a payload that could not be decoded.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    /// The connection was closed while the request was outstanding.
    #[error("connection closed")]
    Closed,
}

impl RequestError {
    #[must_use]
    pub fn is_expired(&self) -> bool {
        matches!(self, Self::Expired(_))
    }

    /// The expiration message, if this rejection is an expiry.
    #[must_use]
    pub fn expiration_message(&self) -> Option<&Message> {
        match self {
            Self::Expired(message) => Some(message),
            _ => None,
        }
    }
}

/// Why a round of the handshake failed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RoundFailure {
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error("host transport is not available")]
    TransportUnavailable,
    #[error("could not send handshake message: {0}")]
    Send(String),
}

/// Errors that reject a handshake.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandshakeError {
    /// Every allowed round failed.
    #[error("handshake failed after {rounds} rounds: {last}")]
    Exhausted { rounds: u32, last: RoundFailure },
    /// A newer `handshake()` call took over before this one finished.
    #[error("handshake superseded by a newer attempt")]
    Superseded,
    /// The task driving the handshake stopped without a result.
    #[error("handshake task aborted")]
    Aborted,
    /// `handshake()` was called outside a Tokio runtime; nothing was sent.
    #[error("no Tokio runtime to drive the handshake")]
    NoRuntime,
}
