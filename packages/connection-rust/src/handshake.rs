//! Two-phase handshake proving both directions of the channel.
//!
//! Each round sends INIT and, once the peer answered it, SERVER-READY. A
//! failure in either phase restarts the whole round after a fixed delay,
//! until the retry budget is spent.
//!
//! State is kept per connection in an `ArcSwap` so it can be read without
//! locking from anywhere. Each `handshake()` call takes a new generation;
//! a run whose generation is no longer current stops at its next step and
//! never touches the shared state again. Retry counts are local to a run.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use arc_swap::ArcSwap;
use hostbridge_core::Message;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

use crate::connection::Connection;
use crate::error::{ConnectionError, HandshakeError, RoundFailure};

/// Destination of the first handshake message.
pub const HANDSHAKE_INIT: &str = "/cef/handshake/init";
/// Destination of the second handshake message.
pub const HANDSHAKE_SERVER_READY: &str = "/cef/handshake/server/ready";
/// Destination the peer uses when it answers INIT by pushing a message back.
pub const HANDSHAKE_CLIENT_READY: &str = "/cef/handshake/client/ready";

/// Where a connection's handshake currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// No handshake has been started.
    Idle,
    /// INIT sent, waiting for the peer.
    AwaitingInit,
    /// SERVER-READY sent, waiting for the acknowledgment.
    AwaitingServerReady,
    /// Both directions proven.
    Established,
    /// Retries exhausted.
    Failed,
}

/// Per-connection handshake bookkeeping shared by all runs.
#[derive(Debug)]
pub(crate) struct HandshakeController {
    state: ArcSwap<HandshakeState>,
    generation: AtomicU64,
}

impl HandshakeController {
    pub(crate) fn new() -> Self {
        Self {
            state: ArcSwap::from_pointee(HandshakeState::Idle),
            generation: AtomicU64::new(0),
        }
    }

    pub(crate) fn state(&self) -> HandshakeState {
        **self.state.load()
    }

    /// Starts a new run and invalidates older ones.
    fn begin(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Invalidates whatever run is in flight without starting a new one.
    pub(crate) fn supersede(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Stores `next` if `generation` still owns the handshake.
    fn transition(&self, generation: u64, next: HandshakeState) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        let previous = *self.state.swap(Arc::new(next));
        if previous != next {
            info!(from = ?previous, to = ?next, "Handshake state changed");
        }
        true
    }
}

// ---------------------------------------------------------------------------
// HandshakeHandle
// ---------------------------------------------------------------------------

/// Outer completion of one `handshake()` call.
///
/// Resolves with the SERVER-READY acknowledgment. Dropping the handle does
/// not stop the handshake.
#[must_use = "the handshake result is only observable through the handle"]
#[derive(Debug)]
pub struct HandshakeHandle {
    inner: HandleInner,
}

#[derive(Debug)]
enum HandleInner {
    Running(JoinHandle<Result<Message, HandshakeError>>),
    Refused(Option<HandshakeError>),
}

impl Future for HandshakeHandle {
    type Output = Result<Message, HandshakeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.inner {
            HandleInner::Running(task) => Pin::new(task)
                .poll(cx)
                .map(|joined| joined.unwrap_or(Err(HandshakeError::Aborted))),
            HandleInner::Refused(error) => {
                Poll::Ready(Err(error.take().unwrap_or(HandshakeError::Aborted)))
            }
        }
    }
}

/// Spawns a handshake run on the current runtime.
///
/// Without a runtime nothing is started and the handle resolves to
/// `HandshakeError::NoRuntime`.
pub(crate) fn start(connection: Connection) -> HandshakeHandle {
    let Ok(runtime) = Handle::try_current() else {
        error!("No Tokio runtime, handshake not started");
        return HandshakeHandle {
            inner: HandleInner::Refused(Some(HandshakeError::NoRuntime)),
        };
    };
    let generation = connection.handshake_controller().begin();
    info!(generation, "Beginning handshake");
    HandshakeHandle {
        inner: HandleInner::Running(runtime.spawn(run(connection, generation))),
    }
}

// ---------------------------------------------------------------------------
// Rounds
// ---------------------------------------------------------------------------

async fn run(connection: Connection, generation: u64) -> Result<Message, HandshakeError> {
    let controller = connection.handshake_controller();
    let max_retries = connection.config().max_handshake_retries;
    let retry_delay = connection.config().handshake_retry_delay;
    let mut round: u32 = 1;
    let mut failed_rounds: u32 = 0;

    loop {
        let outcome = attempt_round(&connection, generation)
            .instrument(info_span!("handshake_round", round))
            .await;

        if !controller.is_current(generation) {
            return Err(HandshakeError::Superseded);
        }

        let last = match outcome {
            Ok(ack) => {
                controller.transition(generation, HandshakeState::Established);
                info!(rounds = round, "Handshake successful");
                return Ok(ack);
            }
            Err(failure) => failure,
        };

        failed_rounds += 1;
        if failed_rounds >= max_retries {
            controller.transition(generation, HandshakeState::Failed);
            error!(rounds = round, error = %last, "Handshake failed");
            return Err(HandshakeError::Exhausted {
                rounds: round,
                last,
            });
        }

        warn!(failed_rounds, max_retries, error = %last, "Handshake round failed, retrying");
        tokio::time::sleep(retry_delay).await;
        if !controller.is_current(generation) {
            return Err(HandshakeError::Superseded);
        }
        round += 1;
    }
}

async fn attempt_round(connection: &Connection, generation: u64) -> Result<Message, RoundFailure> {
    let controller = connection.handshake_controller();

    controller.transition(generation, HandshakeState::AwaitingInit);
    let init = exchange(connection, HANDSHAKE_INIT).await.inspect_err(|e| {
        error!(error = %e, "Handshake INIT timed out or failed");
    })?;
    info!(correlation_id = %init.correlation_id(), "Handshake INIT answered");

    if !controller.transition(generation, HandshakeState::AwaitingServerReady) {
        // Superseded; the caller notices and stops.
        return Ok(init);
    }
    exchange(connection, HANDSHAKE_SERVER_READY)
        .await
        .inspect_err(|e| {
            error!(error = %e, "Handshake SERVER-READY timed out or failed");
        })
}

/// Sends one empty handshake message and waits for its reply.
async fn exchange(connection: &Connection, destination: &str) -> Result<Message, RoundFailure> {
    let response = connection
        .request(destination, serde_json::json!({}))
        .map_err(|e| match e {
            ConnectionError::TransportUnavailable => RoundFailure::TransportUnavailable,
            other => RoundFailure::Send(other.to_string()),
        })?;
    Ok(response.await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::dispatch::InboundSink;
    use crate::transport::HostEnvironment;

    #[test]
    fn controller_starts_idle() {
        let controller = HandshakeController::new();
        assert_eq!(controller.state(), HandshakeState::Idle);
    }

    #[test]
    fn begin_bumps_generation() {
        let controller = HandshakeController::new();
        let first = controller.begin();
        let second = controller.begin();

        assert!(second > first);
        assert!(!controller.is_current(first));
        assert!(controller.is_current(second));
    }

    #[test]
    fn stale_generation_cannot_transition() {
        let controller = HandshakeController::new();
        let stale = controller.begin();
        let current = controller.begin();

        assert!(!controller.transition(stale, HandshakeState::Failed));
        assert_eq!(controller.state(), HandshakeState::Idle);
        assert!(controller.transition(current, HandshakeState::AwaitingInit));
        assert_eq!(controller.state(), HandshakeState::AwaitingInit);
    }

    #[test]
    fn supersede_invalidates_current_run() {
        let controller = HandshakeController::new();
        let generation = controller.begin();
        controller.supersede();
        assert!(!controller.is_current(generation));
    }

    #[tokio::test]
    async fn aborted_task_resolves_as_aborted() {
        let task = tokio::spawn(std::future::pending::<Result<Message, HandshakeError>>());
        task.abort();
        let handle = HandshakeHandle {
            inner: HandleInner::Running(task),
        };
        assert!(matches!(handle.await, Err(HandshakeError::Aborted)));
    }

    #[test]
    fn handshake_outside_runtime_is_refused() {
        struct Bare;
        impl HostEnvironment for Bare {
            fn attach(&self, _sink: InboundSink) {}
        }

        let connection = Connection::new(Arc::new(Bare), ConnectionConfig::default());
        let handle = connection.handshake();
        assert_eq!(connection.handshake_state(), HandshakeState::Idle);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        assert!(matches!(
            runtime.block_on(handle),
            Err(HandshakeError::NoRuntime)
        ));
    }
}
