//! The connection: outbound send, inbound entry point, and destinations.
//!
//! `send` registers the request before handing it to the host, so a host
//! that answers synchronously (inside the bridge call) still finds it
//! pending. The expiration watchdog is armed afterwards and is aborted on
//! the spot if the request already completed.

use std::sync::{Arc, OnceLock};

use hostbridge_core::{ClockSource, Message, SystemClock};
use tokio::runtime::Handle;
use tracing::{debug, error, info};

use crate::config::ConnectionConfig;
use crate::consumer::{ConsumerRegistry, Queue, Topic};
use crate::dispatch::{Dispatcher, InboundSink};
use crate::error::{ConnectionError, RequestError};
use crate::expiration::ExpirationManager;
use crate::handshake::{self, HandshakeController, HandshakeHandle, HandshakeState};
use crate::pending::{PendingRequests, PendingResponse};
use crate::transport::{HostEnvironment, QueryReply, SendFunction};

struct Inner {
    config: ConnectionConfig,
    host: Arc<dyn HostEnvironment>,
    send_function: OnceLock<SendFunction>,
    registry: Arc<PendingRequests>,
    consumers: Arc<ConsumerRegistry>,
    expiration: ExpirationManager,
    clock: Arc<dyn ClockSource>,
    sink: InboundSink,
    handshake: HandshakeController,
}

/// A connection to the remote peer behind a host bridge.
///
/// Cloning is cheap; clones share all state.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("config", &self.inner.config)
            .field("pending", &self.inner.registry.len())
            .field("handshake", &self.handshake_state())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Creates a connection and hands its inbound entry point to `host`.
    #[must_use]
    pub fn new(host: Arc<dyn HostEnvironment>, config: ConnectionConfig) -> Self {
        Self::with_clock(host, config, Arc::new(SystemClock))
    }

    /// Same as [`Connection::new`] with an explicit clock for deadlines.
    #[must_use]
    pub fn with_clock(
        host: Arc<dyn HostEnvironment>,
        config: ConnectionConfig,
        clock: Arc<dyn ClockSource>,
    ) -> Self {
        let registry = Arc::new(PendingRequests::new());
        let consumers = Arc::new(ConsumerRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&consumers),
            config.wire_format,
        ));
        let sink = InboundSink::new(dispatcher);
        host.attach(sink.clone());

        Self {
            inner: Arc::new(Inner {
                config,
                host,
                send_function: OnceLock::new(),
                registry,
                consumers,
                expiration: ExpirationManager::new(Arc::clone(&clock)),
                clock,
                sink,
                handshake: HandshakeController::new(),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn clock(&self) -> &dyn ClockSource {
        self.inner.clock.as_ref()
    }

    /// The entry point the host invokes with inbound payloads.
    #[must_use]
    pub fn inbound(&self) -> InboundSink {
        self.inner.sink.clone()
    }

    /// Number of requests still waiting for a reply.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Returns the memoized bridge, probing the host on first use.
    ///
    /// A failed probe is not remembered; the host may expose a bridge later.
    fn send_function(&self) -> Option<SendFunction> {
        if let Some(send_function) = self.inner.send_function.get() {
            return Some(send_function.clone());
        }
        let probed = SendFunction::probe(self.inner.host.as_ref())?;
        let selected = self.inner.send_function.get_or_init(|| probed);
        info!(bridge = selected.kind(), "Selected host bridge");
        Some(selected.clone())
    }

    /// Sends a request and returns the handle that completes with its reply.
    ///
    /// The request is rejected (through the handle) by a transport failure or
    /// by its expiration deadline, whichever comes first. Messages with
    /// `expiration == 0` wait indefinitely.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::TransportUnavailable` if the host has no
    /// bridge, `ConnectionError::Codec` if the message cannot be encoded,
    /// `ConnectionError::NoRuntime` if the message expires but there is no
    /// Tokio runtime to run its watchdog, and
    /// `ConnectionError::DuplicateCorrelationId` if its id is already pending.
    /// Nothing is registered in any of these cases.
    pub fn send(&self, message: Message) -> Result<PendingResponse, ConnectionError> {
        let send_function = self
            .send_function()
            .ok_or(ConnectionError::TransportUnavailable)?;
        let encoded = self.inner.config.wire_format.encode(&message)?;
        let runtime = if message.expires() {
            Some(Handle::try_current().map_err(|_| ConnectionError::NoRuntime)?)
        } else {
            None
        };

        debug!(
            destination = %message.destination(),
            correlation_id = %message.correlation_id(),
            body = %message.body,
            "Sending request"
        );

        let correlation_id = message.correlation_id();
        let destination = message.destination();
        let response = self.inner.registry.register(correlation_id, destination)?;

        match send_function {
            SendFunction::Query(bridge) => {
                let reply = QueryReply::new(
                    correlation_id,
                    destination,
                    Arc::clone(&self.inner.registry),
                    self.inner.config.wire_format,
                );
                bridge.query(encoded, reply);
            }
            SendFunction::Post(bridge) => {
                if let Err(failure) = bridge.post(encoded) {
                    error!(
                        destination = %destination,
                        correlation_id = %correlation_id,
                        error_code = failure.code,
                        error_message = %failure.message,
                        "Host post failed"
                    );
                    self.inner.registry.fail(
                        correlation_id,
                        RequestError::TransportFailure {
                            code: failure.code,
                            message: failure.message,
                        },
                    );
                }
            }
        }

        if let Some(runtime) = &runtime {
            self.inner
                .expiration
                .arm(runtime, &self.inner.registry, &message);
        }
        Ok(response)
    }

    /// Builds a request with the default time-to-live and sends it.
    ///
    /// # Errors
    ///
    /// See [`Connection::send`].
    pub fn request(
        &self,
        destination: &str,
        body: serde_json::Value,
    ) -> Result<PendingResponse, ConnectionError> {
        let message = Message::create_with_clock(
            self.clock(),
            destination,
            body,
            Some(self.inner.config.default_time_to_live),
        );
        self.send(message)
    }

    /// Opens (or reopens) a queue served by this connection.
    #[must_use]
    pub fn create_queue(&self, name: &str) -> Queue {
        Queue::open(&self.inner.consumers, name, self.clone())
    }

    /// Opens (or reopens) a topic served by this connection.
    #[must_use]
    pub fn create_topic(&self, name: &str) -> Topic {
        Topic::open(&self.inner.consumers, name)
    }

    /// Starts the handshake, superseding any handshake already running.
    ///
    /// Outside a Tokio runtime the returned handle resolves to
    /// `HandshakeError::NoRuntime` and nothing is sent.
    pub fn handshake(&self) -> HandshakeHandle {
        handshake::start(self.clone())
    }

    #[must_use]
    pub fn handshake_state(&self) -> HandshakeState {
        self.inner.handshake.state()
    }

    pub(crate) fn handshake_controller(&self) -> &HandshakeController {
        &self.inner.handshake
    }

    /// Rejects every pending request with `RequestError::Closed` and closes all queues.
    pub fn close(&self) {
        let failed = self.inner.registry.fail_all(&RequestError::Closed);
        self.inner.consumers.close_all();
        self.inner.handshake.supersede();
        info!(failed, "Connection closed");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
