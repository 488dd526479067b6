use std::{
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread::{self, ThreadId},
    time::Duration,
};

use tokio::{sync::watch, time::timeout};
use wallsync_core::{Settings, SettingsStore, SourceKind, SyncState, SyncStateStore, WidgetSize};
use wallsync_widgets::{
    CardSink, CardTemplates, LOCAL_FILE_PLACEHOLDER_URL, NotificationFanout, RenderedCard,
    SinkError, StatusSource, StoreStatus, SyncRequester, WidgetContext, WidgetData,
    WidgetInstanceRegistry, WidgetSurfaceHandler,
};

#[derive(Default)]
struct RecordingSink {
    cards: Mutex<Vec<RenderedCard>>,
    threads: Mutex<Vec<ThreadId>>,
    refuse: Option<String>,
}

impl RecordingSink {
    fn refusing(widget_id: &str) -> Self {
        Self {
            refuse: Some(widget_id.to_owned()),
            ..Self::default()
        }
    }

    fn take(&self) -> Vec<RenderedCard> {
        std::mem::take(&mut *self.cards.lock().unwrap())
    }
}

impl CardSink for RecordingSink {
    fn push(&self, card: RenderedCard) -> Result<(), SinkError> {
        if self.refuse.as_deref() == Some(card.widget_id.as_str()) {
            return Err(SinkError::Disconnected(card.widget_id));
        }
        self.threads.lock().unwrap().push(thread::current().id());
        self.cards.lock().unwrap().push(card);
        Ok(())
    }
}

struct FixedStatus(WidgetData);

impl StatusSource for FixedStatus {
    fn widget_data(&self) -> WidgetData {
        self.0.clone()
    }
}

fn status() -> Arc<FixedStatus> {
    Arc::new(FixedStatus(WidgetData {
        display_url: "https://example.com/latest.png".to_owned(),
        last_updated_text: "Tue 08:15".to_owned(),
        status_text: "Active".to_owned(),
        has_image: true,
    }))
}

#[derive(Default)]
struct CountingRequester(AtomicUsize);

impl SyncRequester for CountingRequester {
    fn request_sync(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn fanout_with(sink: Arc<RecordingSink>) -> NotificationFanout {
    NotificationFanout::new(Arc::new(WidgetInstanceRegistry::new()), status(), sink)
}

fn sizes_by_id(cards: &[RenderedCard]) -> Vec<(String, WidgetSize)> {
    let mut sizes: Vec<_> = cards
        .iter()
        .map(|card| (card.widget_id.clone(), card.size))
        .collect();
    sizes.sort();
    sizes
}

#[test]
fn every_registered_instance_gets_one_card_in_its_size() {
    let sink = Arc::new(RecordingSink::default());
    let fanout = fanout_with(sink.clone());
    fanout.registry().add_or_update("a", WidgetSize::Small);
    fanout.registry().add_or_update("b", WidgetSize::Medium);
    fanout.registry().add_or_update("c", WidgetSize::Large);

    let report = fanout.push_all();
    assert_eq!((report.rendered, report.failed), (3, 0));
    let cards = sink.take();
    assert_eq!(
        sizes_by_id(&cards),
        vec![
            ("a".to_owned(), WidgetSize::Small),
            ("b".to_owned(), WidgetSize::Medium),
            ("c".to_owned(), WidgetSize::Large),
        ]
    );
    let templates = CardTemplates::embedded();
    for card in &cards {
        let expected = templates
            .render(card.size, &status().0)
            .expect("embedded template renders");
        assert_eq!(card.template, expected);
        assert_eq!(card.custom_state, status().0.fingerprint());
    }

    fanout.registry().remove("b");
    let report = fanout.push_all();
    assert_eq!(report.rendered, 2);
    assert_eq!(
        sizes_by_id(&sink.take()),
        vec![
            ("a".to_owned(), WidgetSize::Small),
            ("c".to_owned(), WidgetSize::Large),
        ]
    );
}

#[test]
fn failing_instance_does_not_stop_the_pass() {
    let broken_large = CardTemplates::new(
        r#"{"url":"${imageUrl}"}"#,
        r#"{"status":"${status}"}"#,
        r#"{"battery":"${battery}"}"#,
    );
    let sink = Arc::new(RecordingSink::refusing("b"));
    let fanout = fanout_with(sink.clone()).with_templates(broken_large);
    fanout.registry().add_or_update("a", WidgetSize::Small);
    fanout.registry().add_or_update("b", WidgetSize::Small);
    fanout.registry().add_or_update("c", WidgetSize::Large);
    fanout.registry().add_or_update("d", WidgetSize::Medium);

    let report = fanout.push_all();
    assert_eq!((report.rendered, report.failed), (2, 2));
    assert_eq!(
        sizes_by_id(&sink.take()),
        vec![
            ("a".to_owned(), WidgetSize::Small),
            ("d".to_owned(), WidgetSize::Medium),
        ]
    );
}

#[test]
fn lifecycle_events_update_registry_and_push() {
    let sink = Arc::new(RecordingSink::default());
    let fanout = fanout_with(sink.clone());

    fanout.create_widget(&WidgetContext::new("w1", WidgetSize::Small));
    assert_eq!(sizes_by_id(&sink.take()), vec![("w1".to_owned(), WidgetSize::Small)]);

    fanout.context_changed(&WidgetContext::new("w1", WidgetSize::Large));
    assert_eq!(sizes_by_id(&sink.take()), vec![("w1".to_owned(), WidgetSize::Large)]);

    fanout.deactivate("w1");
    assert!(fanout.registry().contains("w1"));
    assert!(sink.take().is_empty());

    fanout.activate(&WidgetContext::new("w1", WidgetSize::Large));
    assert_eq!(sink.take().len(), 1);

    fanout.create_widget(&WidgetContext::new("w2", WidgetSize::Medium));
    sink.take();
    fanout.action_invoked("w1", "refresh");
    assert_eq!(sink.take().len(), 2);

    fanout.action_invoked("w1", "dance");
    assert!(sink.take().is_empty());

    fanout.delete_widget("w1");
    assert!(!fanout.registry().contains("w1"));
    fanout.push_all();
    assert_eq!(sizes_by_id(&sink.take()), vec![("w2".to_owned(), WidgetSize::Medium)]);
}

#[test]
fn refresh_action_asks_the_agent_for_a_sync() {
    let sink = Arc::new(RecordingSink::default());
    let requester = Arc::new(CountingRequester::default());
    let fanout = fanout_with(sink.clone()).with_sync_requester(requester.clone());
    fanout.create_widget(&WidgetContext::new("w1", WidgetSize::Medium));
    sink.take();

    fanout.action_invoked("w1", "refresh");
    assert_eq!(requester.0.load(Ordering::SeqCst), 1);
    assert_eq!(sizes_by_id(&sink.take()), vec![("w1".to_owned(), WidgetSize::Medium)]);

    fanout.action_invoked("w1", "dance");
    fanout.push_all();
    assert_eq!(requester.0.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn wake_triggers_a_pass_and_shutdown_stops_the_loop() {
    let sink = Arc::new(RecordingSink::default());
    let fanout = Arc::new(fanout_with(sink.clone()).with_poll_interval(Duration::from_secs(3600)));
    fanout.registry().add_or_update("a", WidgetSize::Medium);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn({
        let fanout = fanout.clone();
        async move { fanout.run(shutdown_rx).await }
    });

    fanout.wake();
    timeout(Duration::from_secs(2), async {
        while sink.cards.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("wake produces a card");
    let runtime_thread = thread::current().id();
    assert!(sink.threads.lock().unwrap().iter().all(|id| *id != runtime_thread));

    shutdown_tx.send(true).unwrap();
    timeout(Duration::from_secs(2), task)
        .await
        .expect("loop stops on shutdown")
        .unwrap();
}

#[tokio::test]
async fn poll_interval_refreshes_without_a_signal() {
    let sink = Arc::new(RecordingSink::default());
    let fanout =
        Arc::new(fanout_with(sink.clone()).with_poll_interval(Duration::from_millis(50)));
    fanout.registry().add_or_update("a", WidgetSize::Small);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn({
        let fanout = fanout.clone();
        async move { fanout.run(shutdown_rx).await }
    });

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(sink.take().len() >= 2);

    drop(shutdown_tx);
    timeout(Duration::from_secs(2), task)
        .await
        .expect("loop stops when the sender is gone")
        .unwrap();
}

#[test]
fn store_status_reads_producer_files() {
    let dir = tempfile::tempdir().unwrap();
    let settings = SettingsStore::new(dir.path().join("WallpaperApp.json"));
    let state = SyncStateStore::new(dir.path().join("state.json"));

    let missing = StoreStatus::new(settings.clone(), SyncStateStore::new(state.path()));
    let data = missing.widget_data();
    assert_eq!(data.status_text, "Active");
    assert_eq!(data.last_updated_text, "Never");
    assert!(!data.has_image);

    settings
        .save(&Settings {
            source_kind: SourceKind::LocalFile,
            local_image_path: Some(PathBuf::from("/pictures/beach.jpg")),
            ..Settings::default()
        })
        .unwrap();
    state.save(&SyncState {
        is_enabled: false,
        ..SyncState::default()
    });

    let data = StoreStatus::new(settings, state).widget_data();
    assert_eq!(data.display_url, LOCAL_FILE_PLACEHOLDER_URL);
    assert_eq!(data.status_text, "Paused");
    assert!(data.has_image);
}
