use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};
use wallsync_core::{
    ChannelListener, ConfigError, NotificationChannel, Settings, SettingsStore, SyncStateStore,
    WidgetSize,
};

use crate::{
    cards::{CardError, CardTemplates, WidgetData},
    registry::WidgetInstanceRegistry,
};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const REFRESH_VERB: &str = "refresh";

/// A hydrated card addressed to one widget instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedCard {
    pub widget_id: String,
    pub size: WidgetSize,
    pub template: String,
    pub custom_state: String,
    pub has_image: bool,
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("no surface is connected for widget {0}")]
    Disconnected(String),
    #[error("failed to encode card: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Where rendered cards go: the widget host connection in production.
pub trait CardSink: Send + Sync {
    fn push(&self, card: RenderedCard) -> Result<(), SinkError>;
}

/// Asks the sync agent for an immediate sync.
pub trait SyncRequester: Send + Sync {
    fn request_sync(&self);
}

impl SyncRequester for NotificationChannel {
    fn request_sync(&self) {
        match self.signal() {
            Ok(true) => info!(channel = %self.name(), "sync requested"),
            Ok(false) => info!(channel = %self.name(), "no agent listening for sync requests"),
            Err(err) => warn!(channel = %self.name(), "sync request failed: {err}"),
        }
    }
}

/// Supplies the display record for a fan-out pass.
pub trait StatusSource: Send + Sync {
    fn widget_data(&self) -> WidgetData;
}

/// Reads the producer's settings and state files on every pass.
#[derive(Debug)]
pub struct StoreStatus {
    settings: SettingsStore,
    state: SyncStateStore,
}

impl StoreStatus {
    #[must_use]
    pub fn new(settings: SettingsStore, state: SyncStateStore) -> Self {
        Self { settings, state }
    }
}

impl StatusSource for StoreStatus {
    fn widget_data(&self) -> WidgetData {
        // Invalid settings still render; the card is a status display, not a sync.
        let settings = match self.settings.read() {
            Ok(settings) => settings,
            Err(ConfigError::Missing(path)) => {
                debug!(path = %path.display(), "no settings yet, showing defaults");
                Settings::default()
            }
            Err(err) => {
                warn!("settings unreadable, showing defaults: {err}");
                Settings::default()
            }
        };
        WidgetData::new(&settings, &self.state.load())
    }
}

#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("render failed: {0}")]
    Render(#[from] CardError),
    #[error("push failed: {0}")]
    Sink(#[from] SinkError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub rendered: usize,
    pub failed: usize,
}

/// Opaque host identity plus the size the host asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WidgetContext {
    pub id: String,
    pub size: WidgetSize,
}

impl WidgetContext {
    #[must_use]
    pub fn new(id: impl Into<String>, size: WidgetSize) -> Self {
        Self {
            id: id.into(),
            size,
        }
    }
}

/// Lifecycle callbacks a widget host drives.
pub trait WidgetSurfaceHandler: Send + Sync {
    fn create_widget(&self, ctx: &WidgetContext);
    fn activate(&self, ctx: &WidgetContext);
    fn deactivate(&self, id: &str);
    fn delete_widget(&self, id: &str);
    fn context_changed(&self, ctx: &WidgetContext);
    fn action_invoked(&self, id: &str, verb: &str);
}

/// Pushes a fresh card to every registered widget when woken by the
/// refresh channel, by its poll timer, or by a lifecycle event.
pub struct NotificationFanout {
    registry: Arc<WidgetInstanceRegistry>,
    status: Arc<dyn StatusSource>,
    sink: Arc<dyn CardSink>,
    sync_requester: Option<Arc<dyn SyncRequester>>,
    templates: CardTemplates,
    poll_interval: Duration,
    wake: Notify,
}

impl NotificationFanout {
    #[must_use]
    pub fn new(
        registry: Arc<WidgetInstanceRegistry>,
        status: Arc<dyn StatusSource>,
        sink: Arc<dyn CardSink>,
    ) -> Self {
        Self {
            registry,
            status,
            sink,
            sync_requester: None,
            templates: CardTemplates::embedded(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            wake: Notify::new(),
        }
    }

    #[must_use]
    pub fn with_templates(mut self, templates: CardTemplates) -> Self {
        self.templates = templates;
        self
    }

    /// Where the refresh action forwards its sync request.
    #[must_use]
    pub fn with_sync_requester(mut self, requester: Arc<dyn SyncRequester>) -> Self {
        self.sync_requester = Some(requester);
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    #[must_use]
    pub fn registry(&self) -> &WidgetInstanceRegistry {
        &self.registry
    }

    /// One pass over a snapshot of the registry. A failing instance is logged
    /// and skipped.
    pub fn push_all(&self) -> FanoutReport {
        let instances = self.registry.snapshot();
        if instances.is_empty() {
            return FanoutReport::default();
        }

        let data = self.status.widget_data();
        let mut report = FanoutReport::default();
        for (id, size) in instances {
            match self.push_card(&id, size, &data) {
                Ok(()) => report.rendered += 1,
                Err(err) => {
                    warn!(widget_id = %id, %size, "card update failed: {err}");
                    report.failed += 1;
                }
            }
        }
        debug!(rendered = report.rendered, failed = report.failed, "fan-out pass complete");
        report
    }

    /// Pushes the card of a single registered instance.
    pub fn push_one(&self, id: &str) -> Result<(), FanoutError> {
        let Some(size) = self.registry.size_of(id) else {
            debug!(widget_id = %id, "not registered, nothing to push");
            return Ok(());
        };
        let data = self.status.widget_data();
        self.push_card(id, size, &data)
    }

    fn push_card(&self, id: &str, size: WidgetSize, data: &WidgetData) -> Result<(), FanoutError> {
        let template = self.templates.render(size, data)?;
        self.sink.push(RenderedCard {
            widget_id: id.to_owned(),
            size,
            template,
            custom_state: data.fingerprint(),
            has_image: data.has_image,
        })?;
        Ok(())
    }

    fn register_and_push(&self, ctx: &WidgetContext) {
        self.registry.add_or_update(ctx.id.clone(), ctx.size);
        if let Err(err) = self.push_one(&ctx.id) {
            warn!(widget_id = %ctx.id, size = %ctx.size, "card update failed: {err}");
        }
    }

    /// Requests a pass from [`run`](Self::run). A wake that arrives mid-pass
    /// is kept and triggers one more pass.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Forwards refresh-channel signals into [`wake`](Self::wake).
    pub fn listen(self: &Arc<Self>, channel: &NotificationChannel) -> ChannelListener {
        let fanout = Arc::clone(self);
        channel.listen(move || fanout.wake())
    }

    /// Runs fan-out passes until `shutdown` flips to `true` or its sender is
    /// dropped. Passes read files, so they run on the blocking pool.
    pub async fn run(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(poll_seconds = self.poll_interval.as_secs(), "notification fan-out started");
        loop {
            tokio::select! {
                () = tokio::time::sleep(self.poll_interval) => {}
                () = self.wake.notified() => debug!("refresh signal received"),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            let fanout = Arc::clone(self);
            if let Err(err) = tokio::task::spawn_blocking(move || fanout.push_all()).await {
                warn!("fan-out pass aborted: {err}");
            }
        }
        info!("notification fan-out stopped");
    }
}

impl WidgetSurfaceHandler for NotificationFanout {
    fn create_widget(&self, ctx: &WidgetContext) {
        info!(widget_id = %ctx.id, size = %ctx.size, "widget created");
        self.register_and_push(ctx);
    }

    fn activate(&self, ctx: &WidgetContext) {
        debug!(widget_id = %ctx.id, "widget activated");
        self.register_and_push(ctx);
    }

    fn deactivate(&self, id: &str) {
        // Stays registered so the next pass still reaches it.
        debug!(widget_id = %id, "widget deactivated");
    }

    fn delete_widget(&self, id: &str) {
        if self.registry.remove(id).is_some() {
            info!(widget_id = %id, "widget deleted");
        }
    }

    fn context_changed(&self, ctx: &WidgetContext) {
        debug!(widget_id = %ctx.id, size = %ctx.size, "widget resized");
        self.register_and_push(ctx);
    }

    fn action_invoked(&self, id: &str, verb: &str) {
        match verb {
            REFRESH_VERB => {
                info!(widget_id = %id, "refresh requested from widget");
                if let Some(requester) = &self.sync_requester {
                    requester.request_sync();
                }
                // Cards show the current state now; the agent's refresh signal
                // brings the synced one.
                self.push_all();
            }
            other => warn!(widget_id = %id, verb = %other, "ignoring unknown widget action"),
        }
    }
}
