//! Inbound dispatch: replies go to the pending-request registry, everything
//! else goes to the queue or topic named by its destination.
//!
//! The host calls in through [`InboundSink`] with untrusted bytes at
//! arbitrary times. Nothing that happens here is allowed to reach back into
//! the host: decode errors are logged and swallowed, and topic subscribers
//! are isolated from each other's panics.

use std::sync::Arc;

use hostbridge_core::WireFormat;
use tracing::{debug, error, warn};

use crate::consumer::{ConsumerRegistry, Delivery};
use crate::pending::PendingRequests;

/// Outcome of dispatching one inbound payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Completed a pending request.
    Reply,
    /// Matched a request that completed while this reply was being routed.
    Late,
    /// Not a reply; handed to a consumer (or found none).
    Unsolicited(Delivery),
    /// Could not be decoded.
    Malformed,
}

/// Routes decoded inbound messages.
#[derive(Debug)]
pub struct Dispatcher {
    registry: Arc<PendingRequests>,
    consumers: Arc<ConsumerRegistry>,
    wire_format: WireFormat,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        registry: Arc<PendingRequests>,
        consumers: Arc<ConsumerRegistry>,
        wire_format: WireFormat,
    ) -> Self {
        Self {
            registry,
            consumers,
            wire_format,
        }
    }

    /// Decodes and routes one inbound payload.
    pub fn on_inbound(&self, raw: &[u8]) -> Dispatch {
        let message = match self.wire_format.decode(raw) {
            Ok(message) => message,
            Err(e) => {
                error!(error = %e, bytes = raw.len(), "Dropping malformed inbound message");
                return Dispatch::Malformed;
            }
        };

        let correlation_id = message.correlation_id().to_string();
        if self.registry.has(&correlation_id) {
            debug!(
                destination = %message.destination(),
                correlation_id = %correlation_id,
                body = %message.body,
                "Receiving response"
            );
            if self.registry.complete(&correlation_id, message) {
                return Dispatch::Reply;
            }
            warn!(correlation_id = %correlation_id, "Reply arrived after its request completed");
            return Dispatch::Late;
        }

        Dispatch::Unsolicited(self.consumers.deliver(message))
    }
}

/// The connection's inbound entry point, handed to the host.
///
/// Cheap to clone; safe to call from any thread at any time.
#[derive(Debug, Clone)]
pub struct InboundSink {
    dispatcher: Arc<Dispatcher>,
}

impl InboundSink {
    pub(crate) fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Delivers a raw inbound payload. Never fails from the host's point of view.
    pub fn deliver(&self, raw: &[u8]) {
        self.dispatcher.on_inbound(raw);
    }

    /// Like [`InboundSink::deliver`], reporting where the payload went.
    #[must_use]
    pub fn dispatch(&self, raw: &[u8]) -> Dispatch {
        self.dispatcher.on_inbound(raw)
    }
}
