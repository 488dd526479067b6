//! WebSocket adapter for widget hosts.
//!
//! A surface connects to `/widgets` and drives the lifecycle with JSON text
//! messages:
//!
//! ```text
//! {"type":"create","widget_id":"w1","size":"medium"}
//! {"type":"activate","widget_id":"w1","size":"medium"}
//! {"type":"deactivate","widget_id":"w1"}
//! {"type":"resize","widget_id":"w1","size":"large"}
//! {"type":"action","widget_id":"w1","verb":"refresh"}
//! {"type":"delete","widget_id":"w1"}
//! ```
//!
//! Cards come back as `{"type":"card","widget_id":..,"size":..,"template":..,"custom_state":..,"has_image":..}`.
//! Every widget a socket created is deleted when the socket closes, unless a
//! later socket created the same id and took the route over. Messages that do
//! not parse, or that name a widget the socket does not own, are logged and
//! dropped.

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use axum::{
    Json, Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::mpsc};
use tracing::{debug, info, warn};
use wallsync_core::WidgetSize;

use crate::fanout::{
    CardSink, NotificationFanout, RenderedCard, SinkError, WidgetContext, WidgetSurfaceHandler,
};

pub const MAX_SURFACE_MESSAGE_BYTES: usize = 16 * 1024;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SurfaceMessage {
    Create {
        widget_id: String,
        #[serde(default)]
        size: WidgetSize,
    },
    Activate {
        widget_id: String,
        #[serde(default)]
        size: WidgetSize,
    },
    Deactivate {
        widget_id: String,
    },
    Resize {
        widget_id: String,
        size: WidgetSize,
    },
    Action {
        widget_id: String,
        verb: String,
    },
    Delete {
        widget_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    Card {
        widget_id: String,
        size: WidgetSize,
        template: String,
        custom_state: String,
        has_image: bool,
    },
}

impl From<RenderedCard> for HostMessage {
    fn from(card: RenderedCard) -> Self {
        HostMessage::Card {
            widget_id: card.widget_id,
            size: card.size,
            template: card.template,
            custom_state: card.custom_state,
            has_image: card.has_image,
        }
    }
}

/// Routes cards to the socket that owns each widget id.
#[derive(Debug, Default)]
pub struct HostSink {
    routes: Mutex<HashMap<String, mpsc::UnboundedSender<Message>>>,
}

impl HostSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, mpsc::UnboundedSender<Message>>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Routes `widget_id` to `tx`. A route held by another live socket is
    /// taken over.
    fn attach(&self, widget_id: &str, tx: &mpsc::UnboundedSender<Message>) {
        let previous = self.lock().insert(widget_id.to_owned(), tx.clone());
        if previous.is_some_and(|previous| !previous.same_channel(tx)) {
            info!(widget_id = %widget_id, "widget moved to another surface");
        }
    }

    /// Drops the route only while it still points at `tx`. Returns whether it did.
    fn detach(&self, widget_id: &str, tx: &mpsc::UnboundedSender<Message>) -> bool {
        let mut routes = self.lock();
        if routes.get(widget_id).is_some_and(|route| route.same_channel(tx)) {
            routes.remove(widget_id);
            true
        } else {
            false
        }
    }
}

impl CardSink for HostSink {
    fn push(&self, card: RenderedCard) -> Result<(), SinkError> {
        let Some(tx) = self.lock().get(&card.widget_id).cloned() else {
            return Err(SinkError::Disconnected(card.widget_id));
        };
        let widget_id = card.widget_id.clone();
        let frame = serde_json::to_string(&HostMessage::from(card))?;
        tx.send(Message::Text(frame.into()))
            .map_err(|_| SinkError::Disconnected(widget_id))
    }
}

#[derive(Clone)]
pub struct HostState {
    fanout: Arc<NotificationFanout>,
    sink: Arc<HostSink>,
}

impl HostState {
    /// `sink` must be the sink `fanout` pushes into.
    #[must_use]
    pub fn new(fanout: Arc<NotificationFanout>, sink: Arc<HostSink>) -> Self {
        Self { fanout, sink }
    }
}

pub fn build_router(state: HostState) -> Router {
    Router::new()
        .route("/widgets", get(ws_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state)
}

pub async fn serve(
    listener: TcpListener,
    state: HostState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), String> {
    info!(
        "widget host listening on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned())
    );
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|err| err.to_string())
}

async fn healthz_handler() -> impl IntoResponse {
    Json(serde_json::json!({"ok": true}))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<HostState>) -> impl IntoResponse {
    ws.max_message_size(MAX_SURFACE_MESSAGE_BYTES)
        .on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: HostState, socket: WebSocket) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    // Pongs queued by the read half only flush when the write half sends.
    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(KEEPALIVE_INTERVAL);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = outbound_rx.recv() => {
                    match msg {
                        Some(message) => {
                            if ws_sender.send(message).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut owned: HashSet<String> = HashSet::new();
    while let Some(next_message) = ws_receiver.next().await {
        let message = match next_message {
            Ok(message) => message,
            Err(err) => {
                warn!("widget socket receive error: {err}");
                break;
            }
        };

        match message {
            Message::Text(text) => match serde_json::from_str::<SurfaceMessage>(text.as_str()) {
                Ok(surface) => dispatch(&state, &outbound_tx, &mut owned, surface).await,
                Err(err) => warn!("malformed surface message: {err}"),
            },
            Message::Close(_) => break,
            Message::Binary(_) | Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    let mut deleted = 0_usize;
    for widget_id in owned {
        if state.sink.detach(&widget_id, &outbound_tx) {
            on_fanout(&state, move |fanout| fanout.delete_widget(&widget_id)).await;
            deleted += 1;
        }
    }
    send_task.abort();
    debug!(widgets = deleted, "widget surface disconnected");
}

async fn dispatch(
    state: &HostState,
    tx: &mpsc::UnboundedSender<Message>,
    owned: &mut HashSet<String>,
    message: SurfaceMessage,
) {
    match message {
        SurfaceMessage::Create { widget_id, size } => {
            if widget_id.trim().is_empty() {
                warn!("ignoring create with an empty widget_id");
                return;
            }
            state.sink.attach(&widget_id, tx);
            owned.insert(widget_id.clone());
            let ctx = WidgetContext::new(widget_id, size);
            on_fanout(state, move |fanout| fanout.create_widget(&ctx)).await;
        }
        SurfaceMessage::Activate { widget_id, size } => {
            if owns(owned, &widget_id) {
                let ctx = WidgetContext::new(widget_id, size);
                on_fanout(state, move |fanout| fanout.activate(&ctx)).await;
            }
        }
        SurfaceMessage::Deactivate { widget_id } => {
            if owns(owned, &widget_id) {
                state.fanout.deactivate(&widget_id);
            }
        }
        SurfaceMessage::Resize { widget_id, size } => {
            if owns(owned, &widget_id) {
                let ctx = WidgetContext::new(widget_id, size);
                on_fanout(state, move |fanout| fanout.context_changed(&ctx)).await;
            }
        }
        SurfaceMessage::Action { widget_id, verb } => {
            if owns(owned, &widget_id) {
                on_fanout(state, move |fanout| fanout.action_invoked(&widget_id, &verb)).await;
            }
        }
        SurfaceMessage::Delete { widget_id } => {
            if owned.remove(&widget_id) && state.sink.detach(&widget_id, tx) {
                on_fanout(state, move |fanout| fanout.delete_widget(&widget_id)).await;
            }
        }
    }
}

/// Lifecycle handlers read settings and state files, so they run on the
/// blocking pool. Awaiting keeps one socket's events in order.
async fn on_fanout<F>(state: &HostState, handler: F)
where
    F: FnOnce(&NotificationFanout) + Send + 'static,
{
    let fanout = state.fanout.clone();
    if let Err(err) = tokio::task::spawn_blocking(move || handler(&fanout)).await {
        warn!("widget event handler failed: {err}");
    }
}

fn owns(owned: &HashSet<String>, widget_id: &str) -> bool {
    let found = owned.contains(widget_id);
    if !found {
        warn!(widget_id = %widget_id, "ignoring message for a widget this surface does not own");
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn surface_messages_parse_from_host_json() {
        let create: SurfaceMessage =
            serde_json::from_str(r#"{"type":"create","widget_id":"w1","size":"small"}"#).unwrap();
        assert_eq!(
            create,
            SurfaceMessage::Create {
                widget_id: "w1".to_owned(),
                size: WidgetSize::Small
            }
        );

        let defaulted: SurfaceMessage =
            serde_json::from_str(r#"{"type":"create","widget_id":"w2"}"#).unwrap();
        assert_eq!(
            defaulted,
            SurfaceMessage::Create {
                widget_id: "w2".to_owned(),
                size: WidgetSize::Medium
            }
        );

        assert!(serde_json::from_str::<SurfaceMessage>(r#"{"type":"resize","widget_id":"w1"}"#)
            .is_err());
        assert!(
            serde_json::from_str::<SurfaceMessage>(r#"{"type":"create","widget_id":"w1","size":"huge"}"#)
                .is_err()
        );
    }

    #[test]
    fn sink_without_route_reports_disconnected() {
        let sink = HostSink::new();
        let err = sink
            .push(RenderedCard {
                widget_id: "ghost".to_owned(),
                size: WidgetSize::Small,
                template: "{}".to_owned(),
                custom_state: String::new(),
                has_image: false,
            })
            .unwrap_err();
        assert!(matches!(err, SinkError::Disconnected(id) if id == "ghost"));
    }

    fn card(widget_id: &str) -> RenderedCard {
        RenderedCard {
            widget_id: widget_id.to_owned(),
            size: WidgetSize::Medium,
            template: "{}".to_owned(),
            custom_state: String::new(),
            has_image: true,
        }
    }

    #[test]
    fn route_survives_close_of_the_socket_it_was_taken_from() {
        let sink = HostSink::new();
        let (first_tx, mut first_rx) = mpsc::unbounded_channel();
        let (second_tx, mut second_rx) = mpsc::unbounded_channel();

        sink.attach("shared", &first_tx);
        sink.attach("shared", &second_tx);
        assert!(!sink.detach("shared", &first_tx));

        sink.push(card("shared")).unwrap();
        assert!(second_rx.try_recv().is_ok());
        assert!(first_rx.try_recv().is_err());

        assert!(sink.detach("shared", &second_tx));
        assert!(matches!(
            sink.push(card("shared")),
            Err(SinkError::Disconnected(_))
        ));
    }

    #[test]
    fn card_frame_has_host_fields() {
        let frame = serde_json::to_value(HostMessage::Card {
            widget_id: "w1".to_owned(),
            size: WidgetSize::Large,
            template: "{}".to_owned(),
            custom_state: "ab".to_owned(),
            has_image: true,
        })
        .unwrap();
        assert_eq!(frame["type"], "card");
        assert_eq!(frame["widget_id"], "w1");
        assert_eq!(frame["size"], "large");
        assert_eq!(frame["custom_state"], "ab");
        assert_eq!(frame["has_image"], true);
    }
}
