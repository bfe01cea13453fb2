use thiserror::Error;
use uuid::Uuid;

use crate::call::CallState;
use crate::protocol::SdpKind;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("signaling server unreachable: {0}")]
    Unreachable(String),
    #[error("invalid signaling url: {0}")]
    InvalidUrl(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("signaling channel is not connected")]
    NotConnected,
    #[error("signaling server unreachable: {0}")]
    Unreachable(String),
    #[error("signaling channel closed")]
    Closed,
    #[error("signaling protocol error: {0}")]
    Protocol(String),
    #[error("failed to encode control message: {0}")]
    Encode(String),
}

impl From<ConnectError> for TransportError {
    fn from(err: ConnectError) -> Self {
        match err {
            ConnectError::Unreachable(reason) => TransportError::Unreachable(reason),
            ConnectError::InvalidUrl(reason) => TransportError::Protocol(reason),
        }
    }
}

/// Failures reported by the native peer-connection engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("peer connection setup failed: {0}")]
    Setup(String),
    #[error("session description rejected: {0}")]
    Description(String),
    #[error("ice candidate rejected: {0}")]
    Candidate(String),
    #[error("data channel failure: {0}")]
    DataChannel(String),
    #[error("media track failure: {0}")]
    Media(String),
    #[error("operation not supported by engine: {0}")]
    Unsupported(String),
    #[error("peer connection closed")]
    Closed,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("no active peer connection")]
    NoPeerConnection,
    #[error("failed to create peer connection: {0}")]
    Setup(#[source] EngineError),
    #[error("failed to create {kind}: {source}")]
    Create {
        kind: SdpKind,
        #[source]
        source: EngineError,
    },
    #[error("failed to apply {kind}: {source}")]
    Apply {
        kind: SdpKind,
        #[source]
        source: EngineError,
    },
    #[error("ice restart failed: {0}")]
    IceRestart(#[source] EngineError),
    #[error("local media update failed: {0}")]
    Media(#[source] EngineError),
}

/// A single remote candidate the engine refused. Logged, never fatal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("failed to apply ice candidate {candidate:?}: {source}")]
pub struct IceApplyError {
    pub candidate: String,
    #[source]
    pub source: EngineError,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("encryption failed: {0}")]
pub struct CipherError(pub String);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("decryption failed: {0}")]
pub struct DecryptionError(pub String);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    #[error("cannot {action} while call is {from}")]
    InvalidTransition { from: CallState, action: &'static str },
    #[error("call control requires an active peer connection")]
    NoPeerConnection,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("no open data channel")]
    ChannelNotOpen,
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error("failed to encode envelope {message_id}: {reason}")]
    Encode { message_id: Uuid, reason: String },
    #[error("data channel send failed: {0}")]
    Send(#[source] EngineError),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("session closed")]
    Closed,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Call(#[from] CallError),
    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl From<ConnectError> for SessionError {
    fn from(err: ConnectError) -> Self {
        SessionError::Transport(err.into())
    }
}
