//! Scripted fake peer shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hostbridge::{
    BridgeFailure, HostEnvironment, InboundSink, Message, PostBridge, QueryBridge, QueryReply,
    WireFormat, HANDSHAKE_CLIENT_READY, HANDSHAKE_INIT, HANDSHAKE_SERVER_READY,
};
use parking_lot::Mutex;
use serde_json::json;

/// Which native bridge the fake host exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Query,
    Post,
}

/// How the peer treats requests that are not part of the handshake.
#[derive(Debug, Clone, Copy)]
pub enum OtherRequests {
    /// Reply with `{"response": "PONG"}`.
    Pong,
    /// Report a transport failure with this code and message.
    Fail(i32, &'static str),
    /// Drop the request silently.
    Ignore,
}

#[derive(Debug, Clone)]
pub struct PeerScript {
    pub shape: Shape,
    /// Answer query-bridge requests through the reply slot instead of
    /// pushing the response through the inbound sink.
    pub answer_via_reply: bool,
    pub fail_inits: u32,
    pub fail_server_readies: u32,
    pub other: OtherRequests,
    pub wire_format: WireFormat,
    /// Zero means the peer answers inside the bridge call.
    pub reply_delay: Duration,
}

impl Default for PeerScript {
    fn default() -> Self {
        Self {
            shape: Shape::Query,
            answer_via_reply: false,
            fail_inits: 0,
            fail_server_readies: 0,
            other: OtherRequests::Pong,
            wire_format: WireFormat::Json,
            reply_delay: Duration::ZERO,
        }
    }
}

/// The remote side of the channel, driven by a [`PeerScript`].
pub struct FakePeer {
    script: PeerScript,
    sink: Mutex<Option<InboundSink>>,
    inits: AtomicU32,
    server_readies: AtomicU32,
    others: AtomicU32,
}

impl FakePeer {
    pub fn new(script: PeerScript) -> Arc<Self> {
        Arc::new(Self {
            script,
            sink: Mutex::new(None),
            inits: AtomicU32::new(0),
            server_readies: AtomicU32::new(0),
            others: AtomicU32::new(0),
        })
    }

    pub fn host(self: &Arc<Self>) -> Arc<dyn HostEnvironment> {
        Arc::new(FakeHost(Arc::clone(self)))
    }

    pub fn inits(&self) -> u32 {
        self.inits.load(Ordering::SeqCst)
    }

    pub fn server_readies(&self) -> u32 {
        self.server_readies.load(Ordering::SeqCst)
    }

    pub fn others(&self) -> u32 {
        self.others.load(Ordering::SeqCst)
    }

    /// Pushes an unsolicited message to the connection.
    pub fn push(&self, message: &Message) {
        let raw = self.script.wire_format.encode(message).unwrap();
        self.sink().deliver(&raw);
    }

    /// Pushes raw bytes to the connection.
    pub fn push_raw(&self, raw: &[u8]) {
        self.sink().deliver(raw);
    }

    fn sink(&self) -> InboundSink {
        self.sink.lock().clone().expect("connection attached")
    }

    fn handle(&self, raw: &[u8], reply: Option<QueryReply>) -> Result<(), BridgeFailure> {
        let request = self.script.wire_format.decode(raw).unwrap();

        let answer = match request.destination() {
            HANDSHAKE_INIT => {
                let n = self.inits.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= self.script.fail_inits {
                    return Ok(());
                }
                // The peer proves its outbound direction by pushing a
                // CLIENT-READY that carries the INIT's correlation id.
                Message::create(HANDSHAKE_CLIENT_READY, json!({}), None)
                    .with_correlation_id(request.correlation_id())
            }
            HANDSHAKE_SERVER_READY => {
                let n = self.server_readies.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= self.script.fail_server_readies {
                    return Ok(());
                }
                Message::create_response(&request, json!({"ready": true}), None)
            }
            _ => {
                self.others.fetch_add(1, Ordering::SeqCst);
                match self.script.other {
                    OtherRequests::Pong => {
                        Message::create_response(&request, json!({"response": "PONG"}), None)
                    }
                    OtherRequests::Fail(code, message) => {
                        return match reply {
                            Some(reply) => {
                                reply.fail(code, message);
                                Ok(())
                            }
                            None => Err(BridgeFailure::new(code, message)),
                        };
                    }
                    OtherRequests::Ignore => return Ok(()),
                }
            }
        };

        self.respond(answer, reply);
        Ok(())
    }

    fn respond(&self, answer: Message, reply: Option<QueryReply>) {
        let raw = self.script.wire_format.encode(&answer).unwrap();
        let via_reply = reply.filter(|_| self.script.answer_via_reply);
        let sink = self.sink();
        let deliver = move || match via_reply {
            Some(reply) => reply.succeed(&raw),
            None => sink.deliver(&raw),
        };

        if self.script.reply_delay.is_zero() {
            deliver();
        } else {
            let delay = self.script.reply_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                deliver();
            });
        }
    }
}

struct FakeHost(Arc<FakePeer>);

struct FakeBridge(Arc<FakePeer>);

impl QueryBridge for FakeBridge {
    fn query(&self, request: Bytes, reply: QueryReply) {
        let _ = self.0.handle(&request, Some(reply));
    }
}

impl PostBridge for FakeBridge {
    fn post(&self, message: Bytes) -> Result<(), BridgeFailure> {
        self.0.handle(&message, None)
    }
}

impl HostEnvironment for FakeHost {
    fn query_bridge(&self) -> Option<Arc<dyn QueryBridge>> {
        (self.0.script.shape == Shape::Query)
            .then(|| Arc::new(FakeBridge(Arc::clone(&self.0))) as Arc<dyn QueryBridge>)
    }

    fn post_bridge(&self) -> Option<Arc<dyn PostBridge>> {
        (self.0.script.shape == Shape::Post)
            .then(|| Arc::new(FakeBridge(Arc::clone(&self.0))) as Arc<dyn PostBridge>)
    }

    fn attach(&self, sink: InboundSink) {
        *self.0.sink.lock() = Some(sink);
    }
}
