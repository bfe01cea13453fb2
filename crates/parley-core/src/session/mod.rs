//! Public entry point: one actor task per session.
//!
//! [`Session::spawn`] starts the actor and returns a cloneable
//! [`SessionHandle`] for commands plus the receiver of [`SessionEvent`]s.
//! Commands, control messages, signaling state changes, engine callbacks
//! and recovery timers all land on the same queue and are handled one at a
//! time.

mod actor;

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::config::SessionConfig;
use crate::context::SessionContext;
use crate::engine::{EngineEvent, IceConnectionState, PeerEngine, RemoteMedia};
use crate::error::SessionError;
use crate::protocol::{MessageId, ServerMessage};
use crate::recovery::RecoveryTimer;
use crate::relay::{Cipher, ReceivedMessage};
use crate::signaling::SignalingConnectionState;

use actor::SessionActor;

/// Coarse peer connectivity for the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl From<IceConnectionState> for ConnectionStatus {
    fn from(state: IceConnectionState) -> Self {
        match state {
            IceConnectionState::New | IceConnectionState::Checking => ConnectionStatus::Connecting,
            IceConnectionState::Connected | IceConnectionState::Completed => {
                ConnectionStatus::Connected
            }
            IceConnectionState::Disconnected | IceConnectionState::Failed => {
                ConnectionStatus::Reconnecting
            }
            IceConnectionState::Closed => ConnectionStatus::Closed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    Local,
    RemoteClosed,
    Expired,
    Deleted,
    SignalingLost,
    Unrecoverable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    SignalingStateChanged(SignalingConnectionState),
    ParticipantsChanged(Vec<String>),
    ConnectionStateChanged(ConnectionStatus),
    DataChannelOpened,
    DataChannelClosed,
    VideoInviteReceived,
    VideoAccepted,
    VideoDeclined,
    VideoEnded,
    RemoteMediaChanged(Option<RemoteMedia>),
    ChatMessageReceived(ReceivedMessage),
    MessageAcknowledged(MessageId),
    NegotiationFailed(String),
    DecryptionFailed { message_id: MessageId, reason: String },
    ServerError(String),
    SessionEnded(EndReason),
}

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

pub(crate) enum Command {
    Start(Reply<()>),
    StartVideo(Reply<()>),
    StopVideo(Reply<()>),
    SendInvite(Reply<()>),
    AcceptInvite(Reply<()>),
    DeclineInvite(Reply<()>),
    EndCall(Reply<()>),
    SendChat(String, Reply<MessageId>),
    RequestRecovery,
    EndSession(oneshot::Sender<()>),
}

pub(crate) enum SessionInput {
    Command(Command),
    Control(ServerMessage),
    SignalingState(SignalingConnectionState),
    Engine { generation: u64, event: EngineEvent },
    Recovery(RecoveryTimer),
}

#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionInput>,
    context: SessionContext,
}

impl SessionHandle {
    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionInput::Command(build(reply)))
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Connects signaling for this session.
    pub async fn start(&self) -> Result<(), SessionError> {
        self.request(Command::Start).await
    }

    pub async fn start_video(&self) -> Result<(), SessionError> {
        self.request(Command::StartVideo).await
    }

    pub async fn stop_video(&self) -> Result<(), SessionError> {
        self.request(Command::StopVideo).await
    }

    pub async fn send_invite(&self) -> Result<(), SessionError> {
        self.request(Command::SendInvite).await
    }

    pub async fn accept_invite(&self) -> Result<(), SessionError> {
        self.request(Command::AcceptInvite).await
    }

    pub async fn decline_invite(&self) -> Result<(), SessionError> {
        self.request(Command::DeclineInvite).await
    }

    pub async fn end_call(&self) -> Result<(), SessionError> {
        self.request(Command::EndCall).await
    }

    pub async fn send_chat(&self, text: impl Into<String>) -> Result<MessageId, SessionError> {
        let text = text.into();
        self.request(|reply| Command::SendChat(text, reply)).await
    }

    /// Host application returned to the foreground.
    pub fn request_recovery(&self) -> Result<(), SessionError> {
        self.tx
            .send(SessionInput::Command(Command::RequestRecovery))
            .map_err(|_| SessionError::Closed)
    }

    /// Ends the session and waits for the actor to release everything.
    pub async fn end_session(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionInput::Command(Command::EndSession(reply)))
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }
}

pub struct Session;

impl Session {
    /// Spawns the session actor on the current tokio runtime.
    pub fn spawn(
        config: SessionConfig,
        context: SessionContext,
        engine: Arc<dyn PeerEngine>,
        cipher: Arc<dyn Cipher>,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let actor = SessionActor::new(
            config,
            context.clone(),
            engine,
            cipher,
            tx.downgrade(),
            rx,
            events_tx,
        );
        tokio::spawn(actor.run());
        (SessionHandle { tx, context }, events_rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ice_states_map_to_ui_status() {
        assert_eq!(
            ConnectionStatus::from(IceConnectionState::Checking),
            ConnectionStatus::Connecting
        );
        assert_eq!(
            ConnectionStatus::from(IceConnectionState::Completed),
            ConnectionStatus::Connected
        );
        assert_eq!(
            ConnectionStatus::from(IceConnectionState::Failed),
            ConnectionStatus::Reconnecting
        );
        assert_eq!(
            ConnectionStatus::from(IceConnectionState::Closed),
            ConnectionStatus::Closed
        );
    }
}
