use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

use super::controller::AdmissionController;
use crate::metrics::{EVICTED_ENTRIES, TRACKED_KEYS};

/// Background sweep for one controller. Aborted when dropped.
pub struct EvictionTask {
    policy: String,
    handle: Option<JoinHandle<()>>,
}

impl EvictionTask {
    pub fn spawn(controller: Arc<AdmissionController>, every: Duration) -> Self {
        let policy = controller.name().to_string();
        let handle = tokio::spawn(sweep_loop(controller, every));
        Self {
            policy,
            handle: Some(handle),
        }
    }

    pub fn policy(&self) -> &str {
        &self.policy
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Stops the sweep and waits for the task to wind down.
    pub async fn shutdown(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
        tracing::debug!(policy = %self.policy, "Eviction task stopped");
    }
}

impl Drop for EvictionTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn sweep_loop(controller: Arc<AdmissionController>, every: Duration) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // first tick completes immediately
    ticker.tick().await;

    tracing::info!(policy = %controller.name(), interval = ?every, "Eviction task started");

    loop {
        ticker.tick().await;

        // a panicking sweep skips this tick, the task stays alive
        let removed = match catch_unwind(AssertUnwindSafe(|| controller.sweep())) {
            Ok(removed) => removed,
            Err(_) => {
                tracing::error!(policy = %controller.name(), "Eviction sweep panicked");
                continue;
            }
        };
        let tracked = controller.tracked_keys();

        EVICTED_ENTRIES
            .with_label_values(&[controller.name()])
            .inc_by(removed as u64);
        TRACKED_KEYS
            .with_label_values(&[controller.name()])
            .set(tracked as i64);

        if removed > 0 {
            tracing::debug!(policy = %controller.name(), removed, tracked, "Evicted expired entries");
        }
    }
}
