pub mod acquire;
pub mod autostart;
pub mod desktop;
pub mod orchestrator;
pub mod retention;
pub mod scheduler;

#[cfg(target_os = "windows")]
mod registry;

pub use acquire::{Acquire, AcquireError, Artifact, ImageAcquirer};
pub use desktop::{ApplyError, DesktopApplier, SystemDesktop};
pub use orchestrator::{RefreshNotifier, SettingsSource, SyncOrchestrator, TickError, TickOutcome};
pub use retention::{CleanupReport, RetentionManager};
pub use scheduler::{SchedulerError, SyncScheduler};
