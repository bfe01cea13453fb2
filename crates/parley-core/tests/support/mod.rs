#![allow(dead_code)]

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use parley_core::protocol::{ClientMessage, ServerMessage};
use parley_core::relay::Cipher;
use parley_core::error::{CipherError, DecryptionError};
use parley_core::{SessionConfig, SessionEvent};

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

enum Outbound {
    Frame(String),
    Close(u16),
}

struct Participant {
    id: String,
    tx: mpsc::UnboundedSender<Outbound>,
}

#[derive(Default)]
struct RelayState {
    sessions: Mutex<HashMap<String, Vec<Participant>>>,
    received: Mutex<Vec<(String, ClientMessage)>>,
    connections: Mutex<Vec<String>>,
    relaying: Mutex<bool>,
    refusing: Mutex<bool>,
}

impl RelayState {
    fn join(&self, token: &str, id: &str, tx: mpsc::UnboundedSender<Outbound>) {
        let mut sessions = self.sessions.lock();
        let participants = sessions.entry(token.to_string()).or_default();
        participants.retain(|participant| participant.id != id);
        participants.push(Participant {
            id: id.to_string(),
            tx,
        });
        self.connections.lock().push(id.to_string());
        broadcast_status(participants);
    }

    fn leave(&self, token: &str, id: &str, tx: &mpsc::UnboundedSender<Outbound>) {
        let mut sessions = self.sessions.lock();
        let Some(participants) = sessions.get_mut(token) else {
            return;
        };
        participants.retain(|participant| !(participant.id == id && participant.tx.same_channel(tx)));
        broadcast_status(participants);
    }

    fn relay(&self, token: &str, message: ClientMessage) {
        self.received
            .lock()
            .push((token.to_string(), message.clone()));
        if !*self.relaying.lock() {
            return;
        }
        let ClientMessage::Signal {
            signal_type,
            payload,
            participant_id,
        } = message;
        let forwarded = ServerMessage::Signal {
            signal_type,
            payload,
            sender: participant_id.clone(),
        };
        let Ok(text) = serde_json::to_string(&forwarded) else {
            return;
        };
        let sessions = self.sessions.lock();
        if let Some(participants) = sessions.get(token) {
            for participant in participants.iter().filter(|p| p.id != participant_id) {
                let _ = participant.tx.send(Outbound::Frame(text.clone()));
            }
        }
    }
}

fn broadcast_status(participants: &[Participant]) {
    let status = ServerMessage::Status {
        connected_participants: participants.iter().map(|p| p.id.clone()).collect(),
        status: Some("active".into()),
    };
    if let Ok(text) = serde_json::to_string(&status) {
        for participant in participants {
            let _ = participant.tx.send(Outbound::Frame(text.clone()));
        }
    }
}

/// Minimal signaling server: relays signals between the participants of a
/// session token and broadcasts presence.
pub struct RelayServer {
    pub base_url: String,
    state: Arc<RelayState>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl RelayServer {
    pub async fn start() -> Self {
        let state = Arc::new(RelayState::default());
        *state.relaying.lock() = true;
        let router = Router::new()
            .route("/ws/sessions/:token", get(ws_handler))
            .with_state(Arc::clone(&state));
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener bind");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });
        Self {
            base_url: format!("http://{addr}"),
            state,
            shutdown: Some(shutdown_tx),
        }
    }

    pub fn config(&self) -> SessionConfig {
        SessionConfig {
            ice_servers: Vec::new(),
            reconnect_base_delay: Duration::from_millis(20),
            ..SessionConfig::default()
        }
        .with_signaling_url(self.base_url.clone())
    }

    /// Everything clients sent, in arrival order.
    pub fn received(&self) -> Vec<(String, ClientMessage)> {
        self.state.received.lock().clone()
    }

    pub fn connection_count(&self, participant: &str) -> usize {
        self.state
            .connections
            .lock()
            .iter()
            .filter(|id| *id == participant)
            .count()
    }

    pub fn set_relaying(&self, enabled: bool) {
        *self.state.relaying.lock() = enabled;
    }

    /// Rejects new websocket upgrades while set.
    pub fn set_refusing(&self, refusing: bool) {
        *self.state.refusing.lock() = refusing;
    }

    /// Pushes a control message to every participant of a session.
    pub fn push(&self, token: &str, message: &ServerMessage) {
        let text = serde_json::to_string(message).expect("encode server message");
        let sessions = self.state.sessions.lock();
        if let Some(participants) = sessions.get(token) {
            for participant in participants {
                let _ = participant.tx.send(Outbound::Frame(text.clone()));
            }
        }
    }

    /// Closes one participant's socket with the given close code.
    pub fn kick(&self, token: &str, participant: &str, code: u16) {
        let sessions = self.state.sessions.lock();
        if let Some(participants) = sessions.get(token) {
            for entry in participants.iter().filter(|p| p.id == participant) {
                let _ = entry.tx.send(Outbound::Close(code));
            }
        }
    }

    pub fn participants(&self, token: &str) -> Vec<String> {
        self.state
            .sessions
            .lock()
            .get(token)
            .map(|participants| participants.iter().map(|p| p.id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn shutdown(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
    Path(token): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if *state.refusing.lock() {
        return (StatusCode::SERVICE_UNAVAILABLE, "refusing connections").into_response();
    }
    let participant = query.get("participantId").cloned().unwrap_or_default();
    ws.on_upgrade(move |socket| handle_socket(socket, state, token, participant))
        .into_response()
}

async fn handle_socket(socket: WebSocket, state: Arc<RelayState>, token: String, participant: String) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    let send_task = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Frame(text) => {
                    if sender.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close(code) => {
                    let _ = sender
                        .send(WsMessage::Close(Some(CloseFrame {
                            code,
                            reason: Cow::Borrowed("closed by test"),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    state.join(&token, &participant, tx.clone());

    while let Some(Ok(message)) = receiver.next().await {
        match message {
            WsMessage::Text(text) => {
                if let Ok(message) = serde_json::from_str::<ClientMessage>(&text) {
                    state.relay(&token, message);
                }
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
        if send_task.is_finished() {
            break;
        }
    }

    state.leave(&token, &participant, &tx);
    send_task.abort();
}

/// Reversible stand-in for the application's cipher. Ciphertext is the
/// plaintext reversed behind a key-dependent prefix.
pub struct TestCipher;

impl TestCipher {
    fn prefix(token: &str) -> Vec<u8> {
        format!("sealed:{token}:").into_bytes()
    }
}

impl Cipher for TestCipher {
    fn encrypt(&self, token: &str, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut sealed = Self::prefix(token);
        sealed.extend(plaintext.iter().rev());
        Ok(sealed)
    }

    fn decrypt(&self, token: &str, ciphertext: &[u8]) -> Result<Vec<u8>, DecryptionError> {
        let prefix = Self::prefix(token);
        let body = ciphertext
            .strip_prefix(prefix.as_slice())
            .ok_or_else(|| DecryptionError("wrong key".into()))?;
        Ok(body.iter().rev().copied().collect())
    }
}

/// Waits for the first event matching `predicate`, skipping others.
pub async fn expect_event<F>(
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    mut predicate: F,
) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    timeout(EVENT_TIMEOUT, async {
        loop {
            match events.recv().await {
                Some(event) if predicate(&event) => return event,
                Some(_) => continue,
                None => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}

/// Drains whatever is already queued.
pub fn drain(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

/// Polls `condition` until it holds.
pub async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    timeout(EVENT_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}
