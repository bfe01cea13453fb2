//! Control-plane WebSocket to the signaling server.
//!
//! One [`SignalingTransport`] serves one session. Outbound frames go through
//! an unbounded channel to a writer task; a reader task parses inbound
//! [`ServerMessage`]s and fans them out, in arrival order, to every
//! registered handler. When the socket drops without the caller asking for
//! it, a reconnect loop retries with exponential backoff until the attempt
//! budget runs out.

use std::borrow::Cow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use crate::config::SessionConfig;
use crate::error::{ConnectError, TransportError};
use crate::protocol::{ClientMessage, PeerMessage, ServerMessage};

type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;
type MessageHandler = Arc<dyn Fn(&ServerMessage) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Error(String),
}

/// Builds `{ws|wss}://host/ws/sessions/{token}?participantId=...` from the
/// configured HTTP(S) or WS(S) base.
pub fn websocket_url(base: &str, token: &str, participant_id: &str) -> Result<Url, ConnectError> {
    let mut url = Url::parse(base)
        .map_err(|err| ConnectError::InvalidUrl(format!("{base}: {err}")))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ConnectError::InvalidUrl(format!(
                "unsupported scheme {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| ConnectError::InvalidUrl(format!("cannot use scheme {scheme}")))?;
    url.path_segments_mut()
        .map_err(|_| ConnectError::InvalidUrl(format!("{base} cannot be a base url")))?
        .pop_if_empty()
        .extend(["ws", "sessions", token]);
    url.set_query(None);
    url.query_pairs_mut()
        .append_pair("participantId", participant_id);
    Ok(url)
}

/// `base * 2^attempt`, saturating.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.min(20))
}

struct Endpoint {
    url: Url,
    participant_id: String,
}

struct Inner {
    base_url: String,
    reconnect_base: Duration,
    max_attempts: u32,
    endpoint: Mutex<Option<Endpoint>>,
    handlers: RwLock<Vec<MessageHandler>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    state: watch::Sender<SignalingConnectionState>,
    closed: AtomicBool,
    attempts: AtomicU32,
    reader: Mutex<Option<JoinHandle<()>>>,
    reconnect: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct SignalingTransport {
    inner: Arc<Inner>,
}

impl SignalingTransport {
    pub fn new(config: &SessionConfig) -> Self {
        let (state, _) = watch::channel(SignalingConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                base_url: config.signaling_url.clone(),
                reconnect_base: config.reconnect_base_delay,
                max_attempts: config.max_reconnect_attempts,
                endpoint: Mutex::new(None),
                handlers: RwLock::new(Vec::new()),
                outbound: Mutex::new(None),
                state,
                closed: AtomicBool::new(false),
                attempts: AtomicU32::new(0),
                reader: Mutex::new(None),
                reconnect: Mutex::new(None),
            }),
        }
    }

    /// Opens the control channel and resolves once it is open.
    pub async fn connect(&self, token: &str, participant_id: &str) -> Result<(), ConnectError> {
        let url = websocket_url(&self.inner.base_url, token, participant_id)?;
        self.inner.closed.store(false, Ordering::SeqCst);
        self.inner.attempts.store(0, Ordering::SeqCst);
        *self.inner.endpoint.lock() = Some(Endpoint {
            url,
            participant_id: participant_id.to_string(),
        });
        self.inner.set_state(SignalingConnectionState::Connecting);
        match Inner::open(&self.inner).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.inner
                    .set_state(SignalingConnectionState::Error(err.to_string()));
                Err(err)
            }
        }
    }

    /// Sends a control message, tagging signals with our participant id.
    pub fn send(&self, message: ClientMessage) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let participant_id = self.participant_id().ok_or(TransportError::NotConnected)?;
        let message = match message {
            ClientMessage::Signal {
                signal_type,
                payload,
                ..
            } => ClientMessage::Signal {
                signal_type,
                payload,
                participant_id,
            },
        };
        let text =
            serde_json::to_string(&message).map_err(|err| TransportError::Encode(err.to_string()))?;
        let outbound = self.inner.outbound.lock().clone();
        let Some(outbound) = outbound else {
            return Err(TransportError::NotConnected);
        };
        outbound
            .send(Message::Text(text))
            .map_err(|_| TransportError::Closed)
    }

    pub fn send_signal(&self, message: PeerMessage) -> Result<(), TransportError> {
        let (signal_type, payload) = message
            .into_signal()
            .map_err(|err| TransportError::Encode(err.to_string()))?;
        self.send(ClientMessage::Signal {
            signal_type,
            payload,
            participant_id: String::new(),
        })
    }

    /// Registers a handler that sees every inbound message in arrival order.
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(&ServerMessage) + Send + Sync + 'static,
    {
        self.inner.handlers.write().push(Arc::new(handler));
    }

    pub fn state(&self) -> SignalingConnectionState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SignalingConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        matches!(*self.inner.state.borrow(), SignalingConnectionState::Connected)
    }

    pub fn participant_id(&self) -> Option<String> {
        self.inner
            .endpoint
            .lock()
            .as_ref()
            .map(|endpoint| endpoint.participant_id.clone())
    }

    /// Closes with a normal-closure frame, cancels any pending reconnect and
    /// drops every handler. Safe to call more than once.
    pub async fn disconnect(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(reconnect) = self.inner.reconnect.lock().take() {
            reconnect.abort();
        }
        if let Some(reader) = self.inner.reader.lock().take() {
            reader.abort();
        }
        if let Some(outbound) = self.inner.outbound.lock().take() {
            let _ = outbound.send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: Cow::Borrowed("session ended"),
            })));
        }
        self.inner.handlers.write().clear();
        self.inner.set_state(SignalingConnectionState::Disconnected);
        tracing::info!(target: "parley::signaling", "signaling disconnected");
    }
}

impl Inner {
    fn set_state(&self, state: SignalingConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    async fn open(inner: &Arc<Inner>) -> Result<(), ConnectError> {
        let url = inner
            .endpoint
            .lock()
            .as_ref()
            .map(|endpoint| endpoint.url.clone())
            .ok_or_else(|| ConnectError::InvalidUrl("no endpoint configured".into()))?;

        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| ConnectError::Unreachable(err.to_string()))?;
        tracing::debug!(target: "parley::signaling", url = %url, "signaling websocket connected");

        let (mut write, read) = stream.split();
        if inner.closed.load(Ordering::SeqCst) {
            let _ = write.send(Message::Close(None)).await;
            return Ok(());
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(err) = write.send(message).await {
                    tracing::debug!(target: "parley::signaling", error = %err, "signaling write failed");
                    break;
                }
                if closing {
                    break;
                }
            }
        });
        *inner.outbound.lock() = Some(tx);
        inner.attempts.store(0, Ordering::SeqCst);
        inner.set_state(SignalingConnectionState::Connected);

        let reader = tokio::spawn(read_loop(Arc::clone(inner), read));
        if let Some(previous) = inner.reader.lock().replace(reader) {
            previous.abort();
        }
        Ok(())
    }

    fn dispatch(&self, text: &str) {
        let message = match serde_json::from_str::<ServerMessage>(text) {
            Ok(message) => message,
            Err(err) => {
                tracing::debug!(
                    target: "parley::signaling",
                    error = %err,
                    "ignoring unrecognised control message"
                );
                return;
            }
        };
        let handlers: Vec<MessageHandler> = self.handlers.read().clone();
        for handler in handlers {
            handler(&message);
        }
    }
}

async fn read_loop(inner: Arc<Inner>, mut read: WsReader) {
    let mut reconnect = true;
    while let Some(frame) = read.next().await {
        match frame {
            Ok(Message::Text(text)) => inner.dispatch(&text),
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => inner.dispatch(text),
                Err(_) => {
                    tracing::debug!(target: "parley::signaling", "ignoring non-utf8 binary frame")
                }
            },
            Ok(Message::Close(frame)) => {
                let code = frame.as_ref().map(|frame| frame.code);
                tracing::info!(target: "parley::signaling", ?code, "signaling websocket closed by server");
                reconnect = code != Some(CloseCode::Normal);
                break;
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(target: "parley::signaling", error = %err, "signaling websocket error");
                break;
            }
        }
    }

    inner.outbound.lock().take();
    if inner.closed.load(Ordering::SeqCst) {
        return;
    }
    inner.set_state(SignalingConnectionState::Disconnected);
    if reconnect {
        schedule_reconnect(&inner);
    }
}

fn schedule_reconnect(inner: &Arc<Inner>) {
    let task = tokio::spawn(reconnect_loop(Arc::clone(inner)));
    if let Some(previous) = inner.reconnect.lock().replace(task) {
        previous.abort();
    }
}

async fn reconnect_loop(inner: Arc<Inner>) {
    loop {
        let attempt = inner.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt >= inner.max_attempts {
            tracing::warn!(
                target: "parley::signaling",
                attempts = attempt,
                "signaling reconnect attempts exhausted"
            );
            inner.set_state(SignalingConnectionState::Error(
                "reconnect attempts exhausted".into(),
            ));
            return;
        }
        let delay = backoff_delay(inner.reconnect_base, attempt);
        tracing::info!(
            target: "parley::signaling",
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "scheduling signaling reconnect"
        );
        tokio::time::sleep(delay).await;
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }
        inner.set_state(SignalingConnectionState::Connecting);
        match Inner::open(&inner).await {
            Ok(()) => {
                tracing::info!(target: "parley::signaling", "signaling reconnected");
                return;
            }
            Err(err) => {
                tracing::warn!(target: "parley::signaling", error = %err, "signaling reconnect failed");
                inner.set_state(SignalingConnectionState::Disconnected);
            }
        }
    }
}
