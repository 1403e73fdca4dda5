//! WebSocket namespace multiplexer (spec §4.6): session namespaces
//! (`/ws/<browserId>`, duplex input/screencast) and the user notification
//! namespace (`/ws/queued-run`, run lifecycle events per `user-<userId>`
//! room). Generalizes the teacher's `RuntimeManager` — a registry behind a
//! `RwLock<HashMap<id, _>>` handing out a `broadcast::Sender` per key — into
//! two purpose-built registries instead of one.

use crate::api::AppState;
use crate::auth::AuthenticatedUser;
use crate::browser_driver::InputEvent;
use crate::db::Database;
use crate::worker::RunNotifier;
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};

use super::handlers::AppError;

/// Outbound events the session namespace streams back to the authoring UI,
/// beyond the raw screencast frame stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionOutboundEvent {
    UrlChanged { url: String },
    ViewportInfo { width: u32, height: u32 },
    ListDataExtracted { data: serde_json::Value },
    Error { message: String },
}

struct SessionNamespaceEntry {
    clients: usize,
    tx: broadcast::Sender<SessionOutboundEvent>,
}

/// One entry per `browserId` session namespace, tracking attached client
/// count so the namespace is only torn down once nobody is listening.
pub struct SessionRegistry {
    namespaces: RwLock<HashMap<String, SessionNamespaceEntry>>,
    settle_delay: Duration,
}

impl SessionRegistry {
    pub fn new(settle_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            namespaces: RwLock::new(HashMap::new()),
            settle_delay,
        })
    }

    pub async fn join(&self, browser_id: &str) -> broadcast::Receiver<SessionOutboundEvent> {
        let mut namespaces = self.namespaces.write().await;
        let entry = namespaces
            .entry(browser_id.to_string())
            .or_insert_with(|| SessionNamespaceEntry {
                clients: 0,
                tx: broadcast::channel(64).0,
            });
        entry.clients += 1;
        entry.tx.subscribe()
    }

    pub async fn publish(&self, browser_id: &str, event: SessionOutboundEvent) {
        if let Some(entry) = self.namespaces.read().await.get(browser_id) {
            let _ = entry.tx.send(event);
        }
    }

    /// A namespace is not deleted while it still has clients attached; the
    /// 100ms settle delay matches spec §4.6's teardown rule and gives a
    /// reconnecting client a window to reattach without losing the channel.
    pub async fn leave(self: &Arc<Self>, browser_id: &str) {
        {
            let mut namespaces = self.namespaces.write().await;
            if let Some(entry) = namespaces.get_mut(browser_id) {
                entry.clients = entry.clients.saturating_sub(1);
            }
        }
        let registry = self.clone();
        let browser_id = browser_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(registry.settle_delay).await;
            let mut namespaces = registry.namespaces.write().await;
            if let Some(entry) = namespaces.get(&browser_id) {
                if entry.clients == 0 {
                    namespaces.remove(&browser_id);
                }
            }
        });
    }
}

/// One lifecycle event pushed through a `user-<userId>` room.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum QueuedRunEvent {
    RunScheduled { run_id: String },
    RunStarted { run_id: String },
    RunCompleted { run_id: String },
    RunAborted { run_id: String },
    RunRecovered { run_id: String },
}

impl QueuedRunEvent {
    fn is_recovery(&self) -> bool {
        matches!(self, QueuedRunEvent::RunRecovered { .. })
    }
}

/// Rooms keyed `user-<userId>` (tracked here simply by `userId`, the room
/// name is a WS-wire concern not a storage key). A run-recovered event
/// emitted while nobody is subscribed is buffered and replayed on the next
/// connect, then cleared — spec §4.6's offline-recovery rule.
pub struct NotificationRegistry {
    rooms: RwLock<HashMap<String, broadcast::Sender<QueuedRunEvent>>>,
    recovery_buffer: StdMutex<HashMap<String, Vec<QueuedRunEvent>>>,
}

impl NotificationRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rooms: RwLock::new(HashMap::new()),
            recovery_buffer: StdMutex::new(HashMap::new()),
        })
    }

    async fn room(&self, user_id: &str) -> broadcast::Sender<QueuedRunEvent> {
        if let Some(tx) = self.rooms.read().await.get(user_id) {
            return tx.clone();
        }
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(user_id.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }

    pub async fn subscribe(
        &self,
        user_id: &str,
    ) -> (broadcast::Receiver<QueuedRunEvent>, Vec<QueuedRunEvent>) {
        let tx = self.room(user_id).await;
        let rx = tx.subscribe();
        let buffered = self
            .recovery_buffer
            .lock()
            .unwrap()
            .remove(user_id)
            .unwrap_or_default();
        (rx, buffered)
    }

    pub async fn publish(&self, user_id: &str, event: QueuedRunEvent) {
        let tx = self.room(user_id).await;
        if tx.receiver_count() == 0 {
            if event.is_recovery() {
                self.recovery_buffer
                    .lock()
                    .unwrap()
                    .entry(user_id.to_string())
                    .or_default()
                    .push(event);
            }
            return;
        }
        let _ = tx.send(event);
    }
}

/// `RunNotifier` adapter over `NotificationRegistry`. The trait only carries
/// `run_id`, so each call looks up the owning user before publishing.
pub struct WsNotifier {
    db: Database,
    registry: Arc<NotificationRegistry>,
}

impl WsNotifier {
    pub fn new(db: Database, registry: Arc<NotificationRegistry>) -> Arc<Self> {
        Arc::new(Self { db, registry })
    }

    async fn emit(&self, run_id: &str, event: QueuedRunEvent) {
        match self.db.get_run(run_id) {
            Ok(run) => self.registry.publish(&run.user_id, event).await,
            Err(e) => {
                tracing::warn!(run_id, error = %e, "notifier: run missing, dropping event");
            }
        }
    }
}

#[async_trait]
impl RunNotifier for WsNotifier {
    async fn run_scheduled(&self, run_id: &str) {
        self.emit(run_id, QueuedRunEvent::RunScheduled { run_id: run_id.to_string() }).await;
    }

    async fn run_started(&self, run_id: &str) {
        self.emit(run_id, QueuedRunEvent::RunStarted { run_id: run_id.to_string() }).await;
    }

    async fn run_completed(&self, run_id: &str) {
        self.emit(run_id, QueuedRunEvent::RunCompleted { run_id: run_id.to_string() }).await;
    }

    async fn run_aborted(&self, run_id: &str) {
        self.emit(run_id, QueuedRunEvent::RunAborted { run_id: run_id.to_string() }).await;
    }

    async fn run_recovered(&self, run_id: &str) {
        self.emit(run_id, QueuedRunEvent::RunRecovered { run_id: run_id.to_string() }).await;
    }
}

/// Pulls the bearer token out of a `Cookie` header — spec §4.6's
/// "middleware reads a bearer token from a cookie" for the session
/// namespace, reused here for the notification namespace too.
fn token_from_cookie(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == "token").then(|| value.to_string())
    })
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<AuthenticatedUser, AppError> {
    let token = token_from_cookie(headers).ok_or(AppError::Unauthorized)?;
    state
        .auth
        .verify(&format!("Bearer {token}"))
        .await
        .map_err(AppError::from)
}

pub async fn session_ws(
    State(state): State<AppState>,
    Path(browser_id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let user = authenticate(&state, &headers).await?;
    if let Some(slot) = state.pool.get_slot(&browser_id).await {
        if slot.user_id != user.user_id {
            return Err(AppError::Forbidden);
        }
    }
    Ok(ws.on_upgrade(move |socket| handle_session_socket(socket, state, browser_id)))
}

async fn handle_session_socket(mut socket: WebSocket, state: AppState, browser_id: String) {
    let mut outbound_rx = state.sessions.join(&browser_id).await;
    let mut screencast = state.driver.subscribe_screencast(&browser_id).await.ok();

    loop {
        let next_frame = async {
            match screencast.as_mut() {
                Some(stream) => stream.next().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            frame = next_frame => {
                match frame {
                    Some(frame) => {
                        let message = serde_json::json!({
                            "type": "screencast",
                            "sessionId": frame.session_id,
                            "data": BASE64.encode(&frame.png_bytes),
                        });
                        if socket.send(Message::Text(message.to_string())).await.is_err() {
                            break;
                        }
                    }
                    None => screencast = None,
                }
            }
            event = outbound_rx.recv() => {
                match event {
                    Ok(event) => {
                        let Ok(text) = serde_json::to_string(&event) else { continue };
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_inbound_input(&state, &browser_id, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    state.sessions.leave(&browser_id).await;
}

async fn handle_inbound_input(state: &AppState, browser_id: &str, text: &str) {
    let Ok(input) = serde_json::from_str::<InputEvent>(text) else {
        return;
    };
    let set_viewport = matches!(input, InputEvent::SetViewportSize { .. });
    match state.driver.inject_input(browser_id, input.clone()).await {
        Ok(()) => {
            if let (true, InputEvent::SetViewportSize { width, height }) = (set_viewport, input) {
                state
                    .sessions
                    .publish(browser_id, SessionOutboundEvent::ViewportInfo { width, height })
                    .await;
            }
        }
        Err(e) => {
            state
                .sessions
                .publish(browser_id, SessionOutboundEvent::Error { message: e.to_string() })
                .await;
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct QueuedRunQuery {
    #[serde(rename = "userId")]
    pub user_id: String,
}

pub async fn queued_run_ws(
    State(state): State<AppState>,
    Query(params): Query<QueuedRunQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let user = authenticate(&state, &headers).await?;
    if user.user_id != params.user_id {
        return Err(AppError::Forbidden);
    }
    Ok(ws.on_upgrade(move |socket| handle_notification_socket(socket, state, params.user_id)))
}

async fn handle_notification_socket(mut socket: WebSocket, state: AppState, user_id: String) {
    let (mut rx, replay) = state.notifications.subscribe(&user_id).await;

    for event in replay {
        let Ok(text) = serde_json::to_string(&event) else { continue };
        if socket.send(Message::Text(text)).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(event) => {
                        let Ok(text) = serde_json::to_string(&event) else { continue };
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        super::handlers::app_error_response(self)
    }
}
