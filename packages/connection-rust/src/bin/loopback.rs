//! Loopback demo: runs a connection against an in-process peer.
//!
//! The peer answers the handshake (optionally ignoring the first few INIT
//! messages) and echoes every other request back as a response. Exits with
//! an error if the handshake or the echo request fails.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use hostbridge::{
    BridgeFailure, Connection, ConnectionArgs, ConnectionConfig, HostEnvironment, InboundSink,
    Message, PostBridge, WireFormat, HANDSHAKE_INIT,
};
use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hostbridge-loopback")]
#[command(about = "Handshake and echo a request against an in-process peer")]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Number of INIT messages the peer ignores before answering.
    #[arg(long, default_value_t = 0)]
    fail_inits: u32,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

/// Peer living in the same process; replies arrive through the inbound sink.
struct LoopbackPeer {
    sink: Mutex<Option<InboundSink>>,
    wire_format: WireFormat,
    inits_to_ignore: AtomicU32,
}

impl LoopbackPeer {
    fn answer(&self, request: &Message) -> Option<Message> {
        if request.destination() == HANDSHAKE_INIT
            && self
                .inits_to_ignore
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            debug!(correlation_id = %request.correlation_id(), "Peer ignoring INIT");
            return None;
        }
        let body = if request.destination() == HANDSHAKE_INIT {
            json!({})
        } else {
            json!({ "echo": request.body })
        };
        Some(Message::create_response(request, body, None))
    }
}

struct PeerBridge(Arc<LoopbackPeer>);

impl PostBridge for PeerBridge {
    fn post(&self, message: Bytes) -> Result<(), BridgeFailure> {
        let peer = &self.0;
        let request = peer
            .wire_format
            .decode(&message)
            .map_err(|e| BridgeFailure::new(-1, e.to_string()))?;
        let Some(reply) = peer.answer(&request) else {
            return Ok(());
        };
        let encoded = peer
            .wire_format
            .encode(&reply)
            .map_err(|e| BridgeFailure::new(-1, e.to_string()))?;
        let Some(sink) = peer.sink.lock().clone() else {
            return Err(BridgeFailure::new(-2, "peer not attached"));
        };
        // Reply asynchronously, like a real host would.
        tokio::spawn(async move { sink.deliver(&encoded) });
        Ok(())
    }
}

struct LoopbackHost(Arc<LoopbackPeer>);

impl HostEnvironment for LoopbackHost {
    fn post_bridge(&self) -> Option<Arc<dyn PostBridge>> {
        Some(Arc::new(PeerBridge(Arc::clone(&self.0))))
    }

    fn attach(&self, sink: InboundSink) {
        *self.0.sink.lock() = Some(sink);
    }
}

fn init_tracing(json_logs: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json_logs {
        let _ = builder.json().try_init();
    } else {
        let _ = builder.try_init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = ConnectionConfig::from(cli.connection);
    let peer = Arc::new(LoopbackPeer {
        sink: Mutex::new(None),
        wire_format: config.wire_format,
        inits_to_ignore: AtomicU32::new(cli.fail_inits),
    });
    let connection = Connection::new(Arc::new(LoopbackHost(peer)), config);

    let ack = connection.handshake().await.context("handshake failed")?;
    info!(correlation_id = %ack.correlation_id(), "Connection established");

    let queue = connection.create_queue("/loopback/echo");
    let reply = queue
        .send(json!({ "request": "PING" }))
        .context("could not send echo request")?
        .await
        .context("echo request failed")?;
    info!(body = %reply.body, "Echo received");

    connection.close();
    Ok(())
}
