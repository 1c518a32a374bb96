//! Background worker for periodic tasks.
//!
//! Provides `ScheduledWorker`, which drives a `PeriodicTask` on a fixed
//! period after an initial delay until it is stopped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

// ---------------------------------------------------------------------------
// PeriodicTask trait
// ---------------------------------------------------------------------------

/// Work executed by a `ScheduledWorker` on every tick.
#[async_trait]
pub trait PeriodicTask: Send + Sync + 'static {
    /// Name used in logs.
    fn task_name(&self) -> &str;

    /// Called once per period.
    async fn on_tick(&self);

    /// Called once after the last tick when the worker stops. Default is a no-op.
    async fn shutdown(&self) {}
}

// ---------------------------------------------------------------------------
// ScheduledWorker
// ---------------------------------------------------------------------------

/// Handle to a spawned periodic loop.
///
/// The loop waits `initial_delay`, then calls `PeriodicTask::on_tick()` every
/// `period`. A tick that overruns the period delays the next one instead of
/// bursting to catch up.
pub struct ScheduledWorker {
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ScheduledWorker {
    /// Spawns the loop on the current tokio runtime.
    #[must_use]
    pub fn start<T: PeriodicTask>(task: Arc<T>, initial_delay: Duration, period: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + initial_delay, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(task = task.task_name(), ?initial_delay, ?period, "scheduler started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        task.on_tick().await;
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }

            task.shutdown().await;
            debug!(task = task.task_name(), "scheduler stopped");
        });

        Self {
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop the loop, waiting for an in-flight tick and `shutdown()` to finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
