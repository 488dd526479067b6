use std::{path::PathBuf, sync::Arc};

use thiserror::Error;
use tracing::{error, info, warn};
use wallsync_core::{ConfigError, NotificationChannel, Settings, SettingsStore, SyncStateStore};

use crate::{
    acquire::{Acquire, AcquireError, Artifact},
    desktop::{ApplyError, DesktopApplier},
    retention::RetentionManager,
};

/// Where the orchestrator reads validated settings from on every tick.
pub trait SettingsSource: Send + Sync {
    fn load_settings(&self) -> Result<Settings, ConfigError>;
}

impl SettingsSource for SettingsStore {
    fn load_settings(&self) -> Result<Settings, ConfigError> {
        self.load()
    }
}

/// Wakes widget processes after a successful sync.
pub trait RefreshNotifier: Send + Sync {
    fn notify_refresh(&self);
}

impl RefreshNotifier for NotificationChannel {
    fn notify_refresh(&self) {
        match self.signal() {
            Ok(true) => info!(channel = %self.name(), "widget refresh signalled"),
            Ok(false) => info!(channel = %self.name(), "no widget listener, relying on polling"),
            Err(err) => warn!(channel = %self.name(), "widget refresh signal failed: {err}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum TickError {
    #[error("no usable last-known-good wallpaper after acquisition failed: {0}")]
    Acquire(#[source] AcquireError),
    #[error("applying the new wallpaper failed: {0}")]
    Apply(#[source] ApplyError),
    #[error("acquisition failed ({acquire}) and re-applying the last-known-good failed: {apply}")]
    Fallback {
        acquire: AcquireError,
        apply: ApplyError,
    },
    #[error("tick panicked")]
    Panicked,
    #[error("tick interrupted by runtime shutdown")]
    Interrupted,
}

#[derive(Debug)]
pub enum TickOutcome {
    /// A new artifact was applied and recorded as last-known-good.
    Success { artifact: PathBuf },
    /// Acquisition failed; the previous artifact was re-applied.
    FallbackApplied {
        artifact: PathBuf,
        cause: AcquireError,
    },
    Failed(TickError),
    /// Settings could not be loaded; state was left untouched.
    ConfigurationError(ConfigError),
    /// Sync is disabled.
    Paused,
    /// Another tick was already in flight.
    Skipped,
}

impl TickOutcome {
    /// Whether the desktop ended the tick showing a good wallpaper.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            TickOutcome::Success { .. } | TickOutcome::FallbackApplied { .. }
        )
    }
}

/// One acquire, apply, record, clean up and notify pass.
///
/// Only acquisition runs on the async runtime. Settings reads, desktop calls,
/// state writes and retention run on the blocking pool.
pub struct SyncOrchestrator<A, D> {
    settings: Arc<dyn SettingsSource>,
    acquirer: A,
    desktop: D,
    state: Arc<SyncStateStore>,
    retention: RetentionManager,
    notifier: Arc<dyn RefreshNotifier>,
}

impl<A, D> SyncOrchestrator<A, D>
where
    A: Acquire + 'static,
    D: DesktopApplier + 'static,
{
    pub fn new(
        settings: Arc<dyn SettingsSource>,
        acquirer: A,
        desktop: D,
        state: Arc<SyncStateStore>,
        retention: RetentionManager,
        notifier: Arc<dyn RefreshNotifier>,
    ) -> Self {
        Self {
            settings,
            acquirer,
            desktop,
            state,
            retention,
            notifier,
        }
    }

    #[must_use]
    pub fn state(&self) -> &Arc<SyncStateStore> {
        &self.state
    }

    pub fn load_settings(&self) -> Result<Settings, ConfigError> {
        self.settings.load_settings()
    }

    pub async fn run_tick(self: &Arc<Self>) -> TickOutcome {
        let loaded = match self.blocking(|this| this.load_settings()).await {
            Ok(loaded) => loaded,
            Err(err) => return TickOutcome::Failed(err),
        };
        let settings = match loaded {
            Ok(settings) => settings,
            Err(err) => {
                error!("configuration error, skipping sync: {err}");
                return TickOutcome::ConfigurationError(err);
            }
        };

        let acquired = self.acquirer.acquire(&settings).await;
        self.blocking(move |this| this.settle(&settings, acquired))
            .await
            .unwrap_or_else(TickOutcome::Failed)
    }

    /// Runs `work` on the blocking pool. A panic inside `work` resumes on the
    /// caller so the scheduler's containment sees it.
    pub(crate) async fn blocking<T, F>(self: &Arc<Self>, work: F) -> Result<T, TickError>
    where
        T: Send + 'static,
        F: FnOnce(&Self) -> T + Send + 'static,
    {
        let this = Arc::clone(self);
        match tokio::task::spawn_blocking(move || work(&this)).await {
            Ok(value) => Ok(value),
            Err(err) => match err.try_into_panic() {
                Ok(payload) => std::panic::resume_unwind(payload),
                Err(_) => Err(TickError::Interrupted),
            },
        }
    }

    fn settle(&self, settings: &Settings, acquired: Result<Artifact, AcquireError>) -> TickOutcome {
        let artifact = match acquired {
            Ok(artifact) => artifact,
            Err(err) => return self.fall_back(settings, err),
        };

        if let Err(err) = self.desktop.apply(&artifact.path, settings.fit_mode) {
            // The new artifact stays on disk; last-known-good keeps pointing at
            // the previous one.
            error!(path = %artifact.path.display(), "failed to apply wallpaper: {err}");
            self.state.increment_failure();
            return TickOutcome::Failed(TickError::Apply(err));
        }

        self.state.update_last_known_good(&artifact.path);
        let state = self.state.increment_success();
        info!(
            path = %artifact.path.display(),
            successes = state.success_count,
            "wallpaper synced"
        );

        self.retention.cleanup();
        self.notifier.notify_refresh();

        TickOutcome::Success {
            artifact: artifact.path,
        }
    }

    fn fall_back(&self, settings: &Settings, cause: AcquireError) -> TickOutcome {
        warn!("acquisition failed: {cause}");
        let state = self.state.load();
        let Some(previous) = state.usable_last_known_good().map(PathBuf::from) else {
            warn!("no last-known-good wallpaper available, desktop left unchanged");
            self.state.increment_failure();
            return TickOutcome::Failed(TickError::Acquire(cause));
        };

        match self.desktop.apply(&previous, settings.fit_mode) {
            Ok(()) => {
                self.state.record_fallback_applied();
                info!(path = %previous.display(), "re-applied last-known-good wallpaper");
                TickOutcome::FallbackApplied {
                    artifact: previous,
                    cause,
                }
            }
            Err(apply) => {
                error!(path = %previous.display(), "fallback apply failed: {apply}");
                self.state.increment_failure();
                TickOutcome::Failed(TickError::Fallback {
                    acquire: cause,
                    apply,
                })
            }
        }
    }
}
