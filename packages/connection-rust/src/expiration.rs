//! Per-request expiration watchdogs.
//!
//! A message's `expiration` is an absolute deadline fixed when the message
//! was built. The watchdog sleeps for whatever is left of it and then fails
//! the request, unless a reply or transport failure got there first.

use std::sync::Arc;
use std::time::Duration;

use hostbridge_core::{ClockSource, Message};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::error::RequestError;
use crate::pending::PendingRequests;

/// Arms expiration timers against the connection's pending-request registry.
pub struct ExpirationManager {
    clock: Arc<dyn ClockSource>,
}

impl std::fmt::Debug for ExpirationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpirationManager").finish_non_exhaustive()
    }
}

impl ExpirationManager {
    #[must_use]
    pub fn new(clock: Arc<dyn ClockSource>) -> Self {
        Self { clock }
    }

    /// Time left until `expiration`, clamped at zero.
    ///
    /// Returns `None` for `expiration == 0`, which never expires.
    #[must_use]
    pub fn time_to_live(&self, expiration: u64) -> Option<Duration> {
        if expiration == 0 {
            return None;
        }
        Some(Duration::from_millis(
            expiration.saturating_sub(self.clock.now()),
        ))
    }

    /// Spawns the watchdog for `request` and attaches it to the registry entry.
    ///
    /// Returns `None` when the request never expires.
    pub fn arm(
        &self,
        runtime: &Handle,
        registry: &Arc<PendingRequests>,
        request: &Message,
    ) -> Option<AbortHandle> {
        let time_to_live = self.time_to_live(request.header.expiration)?;
        let correlation_id = request.correlation_id().to_string();
        let expired = request.create_expiration_message();
        let registry_for_timer = Arc::clone(registry);

        debug!(
            correlation_id = %correlation_id,
            ttl_ms = u64::try_from(time_to_live.as_millis()).unwrap_or(u64::MAX),
            "Arming expiration watchdog"
        );

        let handle = runtime
            .spawn(async move {
                tokio::time::sleep(time_to_live).await;
                // The reply may have arrived while we slept.
                if registry_for_timer.has(&correlation_id)
                    && registry_for_timer
                        .fail(&correlation_id, RequestError::Expired(Box::new(expired)))
                {
                    warn!(correlation_id = %correlation_id, "Request expired without a response");
                }
            })
            .abort_handle();

        registry.attach_watchdog(request.correlation_id(), handle.clone());
        Some(handle)
    }
}
