//! The message value type exchanged with the remote peer.
//!
//! A message is a header (routing destination, correlation id, absolute
//! expiration deadline, kind marker) plus an opaque JSON body. Header field
//! names match the wire format the host-side peers already speak, so
//! `correlation_id` travels as `correlationID`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::{ClockSource, SystemClock};

// ---------------------------------------------------------------------------
// MessageKind
// ---------------------------------------------------------------------------

/// Distinguishes requests from replies and from locally produced expirations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// A message initiated by either side. Also the kind of unsolicited pushes.
    #[default]
    Request,
    /// A reply carrying the correlation id of the request it answers.
    Response,
    /// Produced locally when a request's deadline passes without a reply.
    Expiration,
}

// ---------------------------------------------------------------------------
// MessageHeader
// ---------------------------------------------------------------------------

/// Routing and correlation metadata of a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageHeader {
    /// Path-like destination, used both for reply routing and consumer lookup.
    pub destination: String,
    /// Opaque id linking a reply to its request.
    #[serde(rename = "correlationID")]
    pub correlation_id: String,
    /// Absolute deadline in ms since Unix epoch. `0` means the message never expires.
    #[serde(default)]
    pub expiration: u64,
    #[serde(default)]
    pub kind: MessageKind,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Immutable unit of exchange: header plus opaque body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub header: MessageHeader,
    #[serde(default)]
    pub body: serde_json::Value,
}

impl Message {
    /// Creates a request with a fresh correlation id.
    ///
    /// The expiration deadline is fixed here, not at send time: a message that
    /// waits before being sent has correspondingly less time left.
    #[must_use]
    pub fn create(
        destination: impl Into<String>,
        body: serde_json::Value,
        time_to_live: Option<Duration>,
    ) -> Self {
        Self::create_with_clock(&SystemClock, destination, body, time_to_live)
    }

    /// Same as [`Message::create`], reading "now" from `clock`.
    #[must_use]
    pub fn create_with_clock(
        clock: &dyn ClockSource,
        destination: impl Into<String>,
        body: serde_json::Value,
        time_to_live: Option<Duration>,
    ) -> Self {
        Self {
            header: MessageHeader {
                destination: destination.into(),
                correlation_id: Uuid::new_v4().to_string(),
                expiration: deadline(clock, time_to_live),
                kind: MessageKind::Request,
            },
            body,
        }
    }

    /// Creates the reply to `request`: same destination and correlation id.
    #[must_use]
    pub fn create_response(
        request: &Message,
        body: serde_json::Value,
        time_to_live: Option<Duration>,
    ) -> Self {
        Self {
            header: MessageHeader {
                destination: request.header.destination.clone(),
                correlation_id: request.header.correlation_id.clone(),
                expiration: deadline(&SystemClock, time_to_live),
                kind: MessageKind::Response,
            },
            body,
        }
    }

    /// Replaces the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.header.correlation_id = correlation_id.into();
        self
    }

    /// Builds the message a request is rejected with when its deadline passes.
    ///
    /// It has the shape of a normal reply but kind [`MessageKind::Expiration`]
    /// and an empty body, so diagnostics can tell it apart from a remote failure.
    #[must_use]
    pub fn create_expiration_message(&self) -> Self {
        Self {
            header: MessageHeader {
                destination: self.header.destination.clone(),
                correlation_id: self.header.correlation_id.clone(),
                expiration: 0,
                kind: MessageKind::Expiration,
            },
            body: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    #[must_use]
    pub fn destination(&self) -> &str {
        &self.header.destination
    }

    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.header.correlation_id
    }

    #[must_use]
    pub fn is_expiration(&self) -> bool {
        self.header.kind == MessageKind::Expiration
    }

    /// Returns `false` for messages with no deadline.
    #[must_use]
    pub fn expires(&self) -> bool {
        self.header.expiration != 0
    }

    /// Whether the deadline has passed at `now_ms`. Never true for `expiration == 0`.
    #[must_use]
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        self.expires() && now_ms >= self.header.expiration
    }
}

fn deadline(clock: &dyn ClockSource, time_to_live: Option<Duration>) -> u64 {
    match time_to_live {
        Some(ttl) => {
            let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
            // A zero result would read as "never expires".
            clock.now().saturating_add(ttl_ms).max(1)
        }
        None => 0,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
