//! Registry of outstanding requests keyed by correlation id.
//!
//! Every completion path (reply, transport failure, expiry, close) goes
//! through a `DashMap::remove`, so whichever path removes the entry first
//! is the only one that reaches the caller. Later arrivals find nothing
//! and become no-ops.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hostbridge_core::Message;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::error::{ConnectionError, RequestError};

type Completion = Result<Message, RequestError>;

/// A request waiting for its reply.
#[derive(Debug)]
struct PendingRequest {
    sender: oneshot::Sender<Completion>,
    destination: String,
    registered_at: Instant,
    watchdog: Option<AbortHandle>,
}

impl PendingRequest {
    fn finish(self, correlation_id: &str, result: Completion) {
        if let Some(watchdog) = self.watchdog {
            watchdog.abort();
        }
        let outcome = if result.is_ok() { "resolved" } else { "rejected" };
        if self.sender.send(result).is_err() {
            debug!(
                correlation_id = %correlation_id,
                destination = %self.destination,
                "Caller stopped waiting before completion"
            );
            return;
        }
        debug!(
            correlation_id = %correlation_id,
            destination = %self.destination,
            outcome,
            elapsed_ms = u64::try_from(self.registered_at.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Pending request completed"
        );
    }
}

/// Connection-scoped map from correlation id to pending request.
#[derive(Debug, Default)]
pub struct PendingRequests {
    pending: DashMap<String, PendingRequest>,
}

impl PendingRequests {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a request and returns the handle its caller awaits.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::DuplicateCorrelationId` if the id is already
    /// outstanding. With generated ids this indicates a caller bug.
    pub fn register(
        &self,
        correlation_id: &str,
        destination: &str,
    ) -> Result<PendingResponse, ConnectionError> {
        match self.pending.entry(correlation_id.to_string()) {
            Entry::Occupied(_) => Err(ConnectionError::DuplicateCorrelationId(
                correlation_id.to_string(),
            )),
            Entry::Vacant(vacant) => {
                let (tx, rx) = oneshot::channel();
                vacant.insert(PendingRequest {
                    sender: tx,
                    destination: destination.to_string(),
                    registered_at: Instant::now(),
                    watchdog: None,
                });
                Ok(PendingResponse {
                    correlation_id: correlation_id.to_string(),
                    rx,
                })
            }
        }
    }

    /// Resolves the request with `message`. Returns `false` if nothing was pending.
    pub fn complete(&self, correlation_id: &str, message: Message) -> bool {
        match self.pending.remove(correlation_id) {
            Some((id, request)) => {
                request.finish(&id, Ok(message));
                true
            }
            None => false,
        }
    }

    /// Rejects the request with `error`. Returns `false` if nothing was pending.
    pub fn fail(&self, correlation_id: &str, error: RequestError) -> bool {
        match self.pending.remove(correlation_id) {
            Some((id, request)) => {
                request.finish(&id, Err(error));
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn has(&self, correlation_id: &str) -> bool {
        self.pending.contains_key(correlation_id)
    }

    /// Associates an expiration watchdog with a pending request.
    ///
    /// If the request already completed, the watchdog is aborted on the spot.
    pub fn attach_watchdog(&self, correlation_id: &str, watchdog: AbortHandle) {
        match self.pending.get_mut(correlation_id) {
            Some(mut request) => request.watchdog = Some(watchdog),
            None => watchdog.abort(),
        }
    }

    /// Rejects every outstanding request with a clone of `error`.
    pub fn fail_all(&self, error: &RequestError) -> usize {
        let ids: Vec<String> = self
            .pending
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        ids.iter()
            .filter(|id| self.fail(id, error.clone()))
            .count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

// ---------------------------------------------------------------------------
// PendingResponse
// ---------------------------------------------------------------------------

/// Completion handle for one outstanding request.
///
/// Resolves exactly once: with the reply, or with the first failure among
/// transport failure, expiry, and connection close.
#[derive(Debug)]
#[must_use = "a pending response does nothing unless awaited"]
pub struct PendingResponse {
    correlation_id: String,
    rx: oneshot::Receiver<Completion>,
}

impl PendingResponse {
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

impl Future for PendingResponse {
    type Output = Result<Message, RequestError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| match received {
            Ok(result) => result,
            // Sender dropped without completing: the registry went away.
            Err(_) => Err(RequestError::Closed),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn reply(id: &str) -> Message {
        Message::create("/q", json!({"response": "PONG"}), None).with_correlation_id(id)
    }

    #[tokio::test]
    async fn register_then_complete_resolves() {
        let registry = PendingRequests::new();
        let response = registry.register("c-1", "/q").unwrap();
        assert!(registry.has("c-1"));
        assert_eq!(response.correlation_id(), "c-1");

        assert!(registry.complete("c-1", reply("c-1")));
        assert!(!registry.has("c-1"));

        let message = response.await.unwrap();
        assert_eq!(message.body, json!({"response": "PONG"}));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = PendingRequests::new();
        let _first = registry.register("c-1", "/q").unwrap();
        let err = registry.register("c-1", "/q").unwrap_err();
        assert!(matches!(err, ConnectionError::DuplicateCorrelationId(id) if id == "c-1"));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn fail_rejects_with_error() {
        let registry = PendingRequests::new();
        let response = registry.register("c-1", "/q").unwrap();

        assert!(registry.fail(
            "c-1",
            RequestError::TransportFailure {
                code: 4711,
                message: "boom".to_string()
            }
        ));

        let err = response.await.unwrap_err();
        assert!(matches!(err, RequestError::TransportFailure { code: 4711, .. }));
    }

    #[tokio::test]
    async fn second_completion_is_noop() {
        let registry = PendingRequests::new();
        let response = registry.register("c-1", "/q").unwrap();

        assert!(registry.complete("c-1", reply("c-1")));
        assert!(!registry.complete("c-1", reply("c-1")));
        assert!(!registry.fail("c-1", RequestError::Closed));

        assert!(response.await.is_ok());
    }

    #[test]
    fn unknown_ids_are_noops() {
        let registry = PendingRequests::new();
        assert!(!registry.complete("missing", reply("missing")));
        assert!(!registry.fail("missing", RequestError::Closed));
        assert!(!registry.has("missing"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn completing_aborts_watchdog() {
        let registry = PendingRequests::new();
        let _response = registry.register("c-1", "/q").unwrap();

        let watchdog = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        registry.attach_watchdog("c-1", watchdog.abort_handle());
        registry.complete("c-1", reply("c-1"));

        let joined = watchdog.await;
        assert!(joined.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn watchdog_for_completed_request_is_aborted_immediately() {
        let registry = PendingRequests::new();
        let watchdog = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        registry.attach_watchdog("gone", watchdog.abort_handle());
        assert!(watchdog.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn fail_all_rejects_every_request() {
        let registry = PendingRequests::new();
        let a = registry.register("a", "/q").unwrap();
        let b = registry.register("b", "/q").unwrap();

        assert_eq!(registry.fail_all(&RequestError::Closed), 2);
        assert!(registry.is_empty());
        assert!(matches!(a.await, Err(RequestError::Closed)));
        assert!(matches!(b.await, Err(RequestError::Closed)));
    }

    #[tokio::test]
    async fn dropped_registry_resolves_closed() {
        let registry = PendingRequests::new();
        let response = registry.register("c-1", "/q").unwrap();
        drop(registry);
        assert!(matches!(response.await, Err(RequestError::Closed)));
    }

    #[test]
    fn complete_after_caller_dropped_still_removes() {
        let registry = PendingRequests::new();
        drop(registry.register("c-1", "/q").unwrap());
        assert!(registry.complete("c-1", reply("c-1")));
        assert!(registry.is_empty());
    }

    #[derive(Debug, Clone)]
    enum Arrival {
        Reply,
        Failure,
        Expiry,
    }

    fn arrival() -> impl Strategy<Value = Arrival> {
        prop_oneof![
            Just(Arrival::Reply),
            Just(Arrival::Failure),
            Just(Arrival::Expiry),
        ]
    }

    proptest! {
        /// However completions interleave, only the first one takes effect.
        #[test]
        fn first_arrival_wins(arrivals in proptest::collection::vec(arrival(), 1..8)) {
            let registry = PendingRequests::new();
            let mut response = registry.register("c", "/q").unwrap();

            let applied: Vec<bool> = arrivals
                .iter()
                .map(|arrival| match arrival {
                    Arrival::Reply => registry.complete("c", reply("c")),
                    Arrival::Failure => registry.fail(
                        "c",
                        RequestError::TransportFailure { code: 1, message: "x".to_string() },
                    ),
                    Arrival::Expiry => registry.fail(
                        "c",
                        RequestError::Expired(Box::new(reply("c").create_expiration_message())),
                    ),
                })
                .collect();

            prop_assert_eq!(applied.iter().filter(|applied| **applied).count(), 1);
            prop_assert!(applied[0]);

            let result = response.rx.try_recv().unwrap();
            match arrivals[0] {
                Arrival::Reply => prop_assert!(result.is_ok()),
                Arrival::Failure => prop_assert!(
                    matches!(result, Err(RequestError::TransportFailure { .. })),
                    "expected a transport failure, got {:?}",
                    result
                ),
                Arrival::Expiry => prop_assert!(
                    result.as_ref().is_err_and(RequestError::is_expired),
                    "expected an expiry, got {:?}",
                    result
                ),
            }
        }
    }
}
