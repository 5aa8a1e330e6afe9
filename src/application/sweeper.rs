//! Background pruning of dead per-key state.
//!
//! Expired cache entries and empty rate-limit windows are already ignored by
//! every read; the sweeper only reclaims their memory. Nothing depends on it
//! running for correctness.

use crate::application::ports::Sweep;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

#[cfg(feature = "async")]
use tokio::sync::oneshot;
#[cfg(feature = "async")]
use tokio::task::JoinHandle;
#[cfg(feature = "async")]
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Error returned when sweeper configuration validation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SweepConfigError {
    /// Sweep interval duration must be greater than zero
    #[error("sweep interval must be greater than 0")]
    ZeroInterval,
}

/// Error returned when stopping the background task fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ShutdownError {
    /// The task panicked while sweeping
    #[error("sweeper task panicked")]
    TaskPanicked,
    /// The task was cancelled before it could stop on its own
    #[error("sweeper task was cancelled")]
    TaskCancelled,
}

/// Periodically sweeps a set of targets.
#[derive(Debug, Clone)]
pub struct Sweeper {
    targets: Vec<Arc<dyn Sweep>>,
    interval: Duration,
}

impl Sweeper {
    /// Create a sweeper running every `interval`.
    ///
    /// # Errors
    /// Returns `SweepConfigError::ZeroInterval` if `interval` is zero.
    pub fn new(interval: Duration) -> Result<Self, SweepConfigError> {
        if interval.is_zero() {
            return Err(SweepConfigError::ZeroInterval);
        }
        Ok(Self {
            targets: Vec::new(),
            interval,
        })
    }

    /// Add a target to sweep.
    pub fn with_target(mut self, target: Arc<dyn Sweep>) -> Self {
        self.targets.push(target);
        self
    }

    /// Add a target to an existing sweeper.
    pub fn add_target(&mut self, target: Arc<dyn Sweep>) {
        self.targets.push(target);
    }

    /// Get the sweep interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Sweep every target once. Returns the total number of removed entries.
    pub fn sweep_once(&self) -> usize {
        let mut total = 0;
        for target in &self.targets {
            let removed = target.sweep();
            trace!(component = target.name(), removed, "swept");
            total += removed;
        }

        if total > 0 {
            debug!(removed = total, targets = self.targets.len(), "sweep pass complete");
        }
        total
    }

    /// Start sweeping in a background task.
    ///
    /// The first pass runs one interval after the start. Stop the task with
    /// [`SweeperHandle::shutdown`]; dropping the handle leaves it running
    /// until the runtime shuts down.
    #[cfg(feature = "async")]
    pub fn start(self) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let join_handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep_once();
                    }
                    _ = &mut shutdown_rx => {
                        debug!("sweeper stopped");
                        break;
                    }
                }
            }
        });

        SweeperHandle {
            shutdown_tx: Some(shutdown_tx),
            join_handle: Some(join_handle),
        }
    }
}

/// Handle to a running [`Sweeper`] task.
#[cfg(feature = "async")]
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

#[cfg(feature = "async")]
impl SweeperHandle {
    /// Signal the task to stop and wait for it.
    ///
    /// A pass already in progress finishes first.
    ///
    /// # Errors
    /// Returns `ShutdownError` if the task panicked or was cancelled.
    pub async fn shutdown(mut self) -> Result<(), ShutdownError> {
        if let Some(tx) = self.shutdown_tx.take() {
            // The receiver is gone if the task already ended; joining reports why
            let _ = tx.send(());
        }

        match self.join_handle.take() {
            Some(handle) => handle.await.map_err(|err| {
                if err.is_panic() {
                    ShutdownError::TaskPanicked
                } else {
                    ShutdownError::TaskCancelled
                }
            }),
            None => Ok(()),
        }
    }

    /// Check whether the task has ended.
    pub fn is_finished(&self) -> bool {
        self.join_handle
            .as_ref()
            .map_or(true, |handle| handle.is_finished())
    }
}
