//! Background eviction of expired counters.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::policy::PolicyRegistry;
use super::store::CounterStore;
use crate::metrics::{ACTIVE_COUNTERS, REAPED_TOTAL};

/// Shortest pause between two reap passes.
pub const MIN_REAP_INTERVAL: Duration = Duration::from_millis(10);

/// Handle to the running reaper task.
///
/// The reaper runs until [`Reaper::shutdown`] is called or the handle is dropped.
/// Its interval follows the policy table: every pass is scheduled no later than
/// the shortest window currently registered, and a table swap re-arms the
/// pending pass.
pub struct Reaper {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    configured: Duration,
}

impl Reaper {
    /// Start reaping `store`, at most every `configured` and at least once per
    /// shortest window in `registry`.
    pub fn spawn(
        store: Arc<dyn CounterStore>,
        registry: Arc<PolicyRegistry>,
        configured: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        info!(
            interval_secs = Self::effective_interval(configured, registry.shortest_window()).as_secs_f64(),
            "Starting counter reaper"
        );

        let handle = tokio::spawn(async move {
            loop {
                let changed = registry.changed();
                let interval = Self::effective_interval(configured, registry.shortest_window());

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = changed => {
                        debug!("Policy table changed, rescheduling reaper");
                        continue;
                    }
                    _ = tokio::time::sleep(interval) => {
                        match store.reap_expired().await {
                            Ok(removed) => {
                                REAPED_TOTAL.inc_by(removed as f64);
                                ACTIVE_COUNTERS.set(store.len() as f64);
                                debug!(removed = removed, remaining = store.len(), "Reaped expired counters");
                            }
                            Err(e) => warn!(error = %e, "Counter reap failed"),
                        }
                    }
                }
            }
        });

        Self {
            cancel,
            handle: Some(handle),
            configured,
        }
    }

    /// The reap interval that keeps every counter bounded: the configured
    /// interval, shortened to the shortest policy window if that is smaller,
    /// and never below [`MIN_REAP_INTERVAL`].
    pub fn effective_interval(configured: Duration, shortest_window: Option<Duration>) -> Duration {
        let interval = match shortest_window {
            Some(window) if window < configured => window,
            _ => configured,
        };
        interval.max(MIN_REAP_INTERVAL)
    }

    /// The interval the reaper was started with, before clamping.
    pub fn configured_interval(&self) -> Duration {
        self.configured
    }

    /// Stop the reaper and wait for it to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            join_background_task("counter reaper", handle).await;
        }
        info!("Counter reaper stopped");
    }
}

/// Wait for a background task, logging a panic or cancellation instead of
/// propagating it. Returns whether the task finished cleanly.
pub async fn join_background_task(task: &str, handle: JoinHandle<()>) -> bool {
    match handle.await {
        Ok(()) => true,
        Err(e) => {
            warn!(task = task, error = %e, "Background task failed");
            false
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
