//! Host bridge connection: request/response correlation, expiration, and
//! the two-phase handshake over an injected host transport.

pub mod config;
pub mod connection;
pub mod consumer;
pub mod dispatch;
pub mod error;
pub mod expiration;
pub mod handshake;
pub mod pending;
pub mod traits;
pub mod transport;

pub use config::{ConnectionArgs, ConnectionConfig};
pub use connection::Connection;
pub use consumer::{Delivery, Queue, SubscriptionId, Topic};
pub use dispatch::{Dispatch, InboundSink};
pub use error::{ConnectionError, HandshakeError, RequestError, RoundFailure};
pub use handshake::{
    HandshakeHandle, HandshakeState, HANDSHAKE_CLIENT_READY, HANDSHAKE_INIT,
    HANDSHAKE_SERVER_READY,
};
pub use hostbridge_core::{Message, MessageKind, WireFormat};
pub use pending::PendingResponse;
pub use traits::BusConnection;
pub use transport::{BridgeFailure, HostEnvironment, PostBridge, QueryBridge, QueryReply};
