//! Host transport capability.
//!
//! The host environment is injected into the connection rather than looked
//! up globally. It may expose one of two native bridge shapes:
//!
//! - a query bridge: request/response shaped, each submitted request gets a
//!   [`QueryReply`] that the host answers with success or failure;
//! - a post bridge: fire-and-forget, replies come back as ordinary inbound
//!   messages through the [`InboundSink`].
//!
//! Either way the host may also drop a message silently, in which case only
//! the expiration watchdog will complete the request.

use std::sync::Arc;

use bytes::Bytes;
use hostbridge_core::WireFormat;
use tracing::error;

use crate::dispatch::InboundSink;
use crate::error::RequestError;
use crate::pending::PendingRequests;

/// Failure reported synchronously by a host bridge.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("host bridge failure {code}: {message}")]
pub struct BridgeFailure {
    pub code: i32,
    pub message: String,
}

impl BridgeFailure {
    #[must_use]
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Request/response shaped native bridge.
pub trait QueryBridge: Send + Sync {
    /// Submits an encoded request.
    ///
    /// The host answers through `reply` at any later time, or right away, or
    /// never (dropping `reply` unanswered).
    fn query(&self, request: Bytes, reply: QueryReply);
}

/// Fire-and-forget native bridge.
pub trait PostBridge: Send + Sync {
    /// Posts an encoded message. Replies arrive through the inbound sink.
    ///
    /// # Errors
    ///
    /// Returns a `BridgeFailure` when the host refuses the message outright.
    fn post(&self, message: Bytes) -> Result<(), BridgeFailure>;
}

/// The host process the connection runs inside.
pub trait HostEnvironment: Send + Sync {
    /// The request/response bridge, if this host has one.
    fn query_bridge(&self) -> Option<Arc<dyn QueryBridge>> {
        None
    }

    /// The fire-and-forget bridge, if this host has one.
    fn post_bridge(&self) -> Option<Arc<dyn PostBridge>> {
        None
    }

    /// Receives the connection's inbound entry point, once, at construction.
    fn attach(&self, sink: InboundSink);
}

// ---------------------------------------------------------------------------
// QueryReply
// ---------------------------------------------------------------------------

/// Single-shot answer slot for one query-bridge request.
///
/// Consumed by [`QueryReply::succeed`] or [`QueryReply::fail`]; dropping it
/// unanswered leaves the request to its expiration watchdog.
#[derive(Debug)]
pub struct QueryReply {
    correlation_id: String,
    destination: String,
    registry: Arc<PendingRequests>,
    wire_format: WireFormat,
}

impl QueryReply {
    pub(crate) fn new(
        correlation_id: &str,
        destination: &str,
        registry: Arc<PendingRequests>,
        wire_format: WireFormat,
    ) -> Self {
        Self {
            correlation_id: correlation_id.to_string(),
            destination: destination.to_string(),
            registry,
            wire_format,
        }
    }

    /// Correlation id of the request this reply answers.
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Completes the request with the host's raw response.
    ///
    /// A response that cannot be decoded rejects the request instead.
    pub fn succeed(self, raw: &[u8]) {
        match self.wire_format.decode(raw) {
            Ok(response) => {
                self.registry.complete(&self.correlation_id, response);
            }
            Err(e) => {
                error!(
                    destination = %self.destination,
                    correlation_id = %self.correlation_id,
                    error = %e,
                    "Host query returned an undecodable response"
                );
                self.registry.fail(
                    &self.correlation_id,
                    RequestError::MalformedResponse(e.to_string()),
                );
            }
        }
    }

    /// Rejects the request with the host's error code and message.
    pub fn fail(self, code: i32, message: impl Into<String>) {
        let message = message.into();
        error!(
            destination = %self.destination,
            correlation_id = %self.correlation_id,
            error_code = code,
            error_message = %message,
            "Host query failed"
        );
        self.registry.fail(
            &self.correlation_id,
            RequestError::TransportFailure { code, message },
        );
    }
}

// ---------------------------------------------------------------------------
// SendFunction
// ---------------------------------------------------------------------------

/// The bridge shape selected for a connection.
#[derive(Clone)]
pub(crate) enum SendFunction {
    Query(Arc<dyn QueryBridge>),
    Post(Arc<dyn PostBridge>),
}

impl SendFunction {
    /// Picks the bridge to use, preferring the query bridge.
    pub(crate) fn probe(host: &dyn HostEnvironment) -> Option<Self> {
        host.query_bridge()
            .map(Self::Query)
            .or_else(|| host.post_bridge().map(Self::Post))
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Query(_) => "query",
            Self::Post(_) => "post",
        }
    }
}
