use hostbridge_core::Message;

use crate::consumer::{Queue, Topic};
use crate::dispatch::InboundSink;
use crate::error::ConnectionError;
use crate::pending::PendingResponse;

/// What a messaging bus needs from a connection.
/// Implementations: [`crate::Connection`] (host bridge), test doubles.
pub trait BusConnection: Send + Sync {
    /// Send a request and get a handle that completes with its reply.
    ///
    /// # Errors
    ///
    /// Fails when the message cannot be handed to the transport at all.
    fn send(&self, message: Message) -> Result<PendingResponse, ConnectionError>;

    /// Open a point-to-point destination.
    fn create_queue(&self, name: &str) -> Queue;

    /// Open a publish/subscribe destination.
    fn create_topic(&self, name: &str) -> Topic;

    /// The entry point inbound payloads are delivered to.
    fn inbound(&self) -> InboundSink;
}

impl BusConnection for crate::Connection {
    fn send(&self, message: Message) -> Result<PendingResponse, ConnectionError> {
        crate::Connection::send(self, message)
    }

    fn create_queue(&self, name: &str) -> Queue {
        crate::Connection::create_queue(self, name)
    }

    fn create_topic(&self, name: &str) -> Topic {
        crate::Connection::create_topic(self, name)
    }

    fn inbound(&self) -> InboundSink {
        crate::Connection::inbound(self)
    }
}
