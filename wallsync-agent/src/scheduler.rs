use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use thiserror::Error;
use tokio::sync::{Mutex, Notify, watch};
use tracing::{error, info, warn};
use wallsync_core::{DEFAULT_REFRESH_INTERVAL_MINUTES, lock::FileLock};

use crate::{
    acquire::Acquire,
    desktop::DesktopApplier,
    orchestrator::{SyncOrchestrator, TickError, TickOutcome},
};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler is already running")]
    AlreadyRunning,
}

/// Drives the orchestrator: one tick immediately, then one per refresh interval.
///
/// Scheduled ticks and manual ticks share one in-flight gate, so two ticks never
/// overlap. With a tick lock file the gate also spans processes. Cancellation
/// is observed between ticks.
pub struct SyncScheduler<A, D> {
    orchestrator: Arc<SyncOrchestrator<A, D>>,
    tick_lock: Option<PathBuf>,
    running: AtomicBool,
    in_flight: Mutex<()>,
    requested: Notify,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<A, D> SyncScheduler<A, D>
where
    A: Acquire + 'static,
    D: DesktopApplier + 'static,
{
    pub fn new(orchestrator: Arc<SyncOrchestrator<A, D>>) -> Self {
        Self {
            orchestrator,
            tick_lock: None,
            running: AtomicBool::new(false),
            in_flight: Mutex::new(()),
            requested: Notify::new(),
        }
    }

    /// Also gates ticks on an exclusive lock of `path`, shared with every
    /// other process that syncs the same data directory.
    #[must_use]
    pub fn with_tick_lock(mut self, path: impl Into<PathBuf>) -> Self {
        self.tick_lock = Some(path.into());
        self
    }

    /// Asks a running [`start`](Self::start) loop for a manual tick. Requests
    /// made while one is pending collapse into it.
    pub fn request_tick(&self) {
        self.requested.notify_one();
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Runs until `shutdown` flips to `true` or its sender is dropped.
    pub async fn start(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), SchedulerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }
        let _running = RunningGuard(&self.running);

        let mut interval = self.refresh_interval(None).await;
        info!(minutes = interval.as_secs() / 60, "scheduler started");

        let mut due = true;
        while !*shutdown.borrow() {
            if due {
                let outcome = self.scheduled_tick().await;
                log_outcome(&outcome);

                interval = self.refresh_interval(Some(interval)).await;
                info!(minutes = interval.as_secs() / 60, "next sync scheduled");
            }

            due = tokio::select! {
                () = tokio::time::sleep(interval) => true,
                () = self.requested.notified() => {
                    info!("sync requested");
                    self.tick_now().await;
                    false
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    false
                }
            };
        }

        info!("scheduler stopped");
        Ok(())
    }

    /// Manual "refresh now": runs even while sync is disabled.
    pub async fn tick_now(&self) -> TickOutcome {
        let outcome = self.gated_tick().await;
        log_outcome(&outcome);
        outcome
    }

    async fn scheduled_tick(&self) -> TickOutcome {
        match self
            .orchestrator
            .blocking(|orchestrator| orchestrator.state().load().is_enabled)
            .await
        {
            Ok(true) => self.gated_tick().await,
            Ok(false) => TickOutcome::Paused,
            Err(err) => TickOutcome::Failed(err),
        }
    }

    async fn gated_tick(&self) -> TickOutcome {
        let Ok(_gate) = self.in_flight.try_lock() else {
            return TickOutcome::Skipped;
        };
        let _process_gate = match self.lock_other_processes_out() {
            Ok(lock) => lock,
            Err(()) => return TickOutcome::Skipped,
        };

        let orchestrator = self.orchestrator.clone();
        match tokio::spawn(async move { orchestrator.run_tick().await }).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!("sync tick aborted: {err}");
                let _ = self
                    .orchestrator
                    .blocking(|orchestrator| {
                        orchestrator.state().increment_failure();
                    })
                    .await;
                TickOutcome::Failed(TickError::Panicked)
            }
        }
    }

    /// `Err(())` when another process holds the tick lock. An unusable lock
    /// file degrades to the in-process gate.
    fn lock_other_processes_out(&self) -> Result<Option<FileLock>, ()> {
        let Some(path) = &self.tick_lock else {
            return Ok(None);
        };
        match FileLock::try_acquire(path) {
            Ok(Some(lock)) => Ok(Some(lock)),
            Ok(None) => {
                info!(path = %path.display(), "another process is syncing");
                Err(())
            }
            Err(err) => {
                warn!(path = %path.display(), "tick lock unavailable: {err}");
                Ok(None)
            }
        }
    }

    async fn refresh_interval(&self, previous: Option<Duration>) -> Duration {
        let fallback = previous.unwrap_or_else(|| minutes(DEFAULT_REFRESH_INTERVAL_MINUTES));
        match self
            .orchestrator
            .blocking(|orchestrator| orchestrator.load_settings())
            .await
        {
            Ok(Ok(settings)) => minutes(settings.refresh_interval_minutes),
            Ok(Err(err)) => {
                warn!("keeping refresh interval, settings unavailable: {err}");
                fallback
            }
            Err(err) => {
                warn!("keeping refresh interval: {err}");
                fallback
            }
        }
    }
}

fn minutes(value: u32) -> Duration {
    Duration::from_secs(u64::from(value.max(1)) * 60)
}

fn log_outcome(outcome: &TickOutcome) {
    match outcome {
        TickOutcome::Success { artifact } => {
            info!(path = %artifact.display(), "tick succeeded");
        }
        TickOutcome::FallbackApplied { artifact, cause } => {
            warn!(path = %artifact.display(), "tick fell back to last-known-good: {cause}");
        }
        TickOutcome::Failed(err) => warn!("tick failed: {err}"),
        TickOutcome::ConfigurationError(err) => warn!("tick skipped, configuration error: {err}"),
        TickOutcome::Paused => info!("sync disabled, tick skipped"),
        TickOutcome::Skipped => info!("tick already in flight, skipped"),
    }
}
