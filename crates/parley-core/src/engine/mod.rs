//! Capability interface over the native peer-connection engine.
//!
//! The core never talks to a WebRTC stack directly. It drives a
//! [`PeerConnection`] through this trait surface, and every callback the
//! engine raises (candidate gathered, ICE state change, data channel
//! traffic, remote track) is turned into an [`EngineEvent`] and pushed onto
//! the owning session's inbound queue through an [`EngineEventSink`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::EngineError;
use crate::protocol::{IceCandidate, SessionDescription};

pub mod mock;
pub mod rtc;

pub use mock::{MockEngine, MockNetwork, MockPeerConnection};
pub use rtc::RtcEngine;

/// Offer/answer state of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SignalingState::Stable => "stable",
            SignalingState::HaveLocalOffer => "have-local-offer",
            SignalingState::HaveRemoteOffer => "have-remote-offer",
            SignalingState::Closed => "closed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            IceConnectionState::Connected | IceConnectionState::Completed
        )
    }
}

impl fmt::Display for IceConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            IceConnectionState::New => "new",
            IceConnectionState::Checking => "checking",
            IceConnectionState::Connected => "connected",
            IceConnectionState::Completed => "completed",
            IceConnectionState::Disconnected => "disconnected",
            IceConnectionState::Failed => "failed",
            IceConnectionState::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// A remote media stream announced by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMedia {
    pub stream_id: String,
    pub track_id: String,
}

/// Everything the engine reports back to the session.
pub enum EngineEvent {
    LocalCandidate(IceCandidate),
    IceConnectionStateChanged(IceConnectionState),
    NegotiationNeeded,
    DataChannelOpen(Arc<dyn DataChannel>),
    DataChannelClosed,
    DataChannelMessage(String),
    RemoteTrack(RemoteMedia),
    RemoteTrackRemoved,
}

impl fmt::Debug for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineEvent::LocalCandidate(candidate) => {
                f.debug_tuple("LocalCandidate").field(candidate).finish()
            }
            EngineEvent::IceConnectionStateChanged(state) => f
                .debug_tuple("IceConnectionStateChanged")
                .field(state)
                .finish(),
            EngineEvent::NegotiationNeeded => f.write_str("NegotiationNeeded"),
            EngineEvent::DataChannelOpen(channel) => f
                .debug_tuple("DataChannelOpen")
                .field(&channel.label())
                .finish(),
            EngineEvent::DataChannelClosed => f.write_str("DataChannelClosed"),
            EngineEvent::DataChannelMessage(text) => f
                .debug_struct("DataChannelMessage")
                .field("len", &text.len())
                .finish(),
            EngineEvent::RemoteTrack(media) => f.debug_tuple("RemoteTrack").field(media).finish(),
            EngineEvent::RemoteTrackRemoved => f.write_str("RemoteTrackRemoved"),
        }
    }
}

/// Routes engine events, tagged with a peer-connection generation.
pub type EventRouter = Arc<dyn Fn(u64, EngineEvent) + Send + Sync>;

/// Handed to the engine when a peer connection is created. Cloned into
/// every native callback; events from a discarded generation are dropped by
/// the session.
#[derive(Clone)]
pub struct EngineEventSink {
    generation: u64,
    router: EventRouter,
}

impl EngineEventSink {
    pub fn new(generation: u64, router: EventRouter) -> Self {
        Self { generation, router }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, event: EngineEvent) {
        (self.router)(self.generation, event);
    }
}

impl fmt::Debug for EngineEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineEventSink")
            .field("generation", &self.generation)
            .finish()
    }
}

#[async_trait]
pub trait PeerEngine: Send + Sync {
    async fn create_peer_connection(
        &self,
        events: EngineEventSink,
    ) -> Result<Arc<dyn PeerConnection>, EngineError>;
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, EngineError>;

    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;

    async fn set_local_description(&self, description: SessionDescription)
    -> Result<(), EngineError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError>;

    /// Creates a data channel. It is reported through
    /// [`EngineEvent::DataChannelOpen`] once usable.
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, EngineError>;

    async fn attach_local_video(&self) -> Result<(), EngineError>;

    async fn detach_local_video(&self) -> Result<(), EngineError>;

    /// Asks the engine to gather fresh ICE credentials. Engines that restart
    /// ICE purely through the offer flag treat this as a no-op.
    async fn restart_ice(&self) -> Result<(), EngineError>;

    fn signaling_state(&self) -> SignalingState;

    fn ice_connection_state(&self) -> IceConnectionState;

    async fn close(&self) -> Result<(), EngineError>;
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    async fn send_text(&self, text: String) -> Result<(), EngineError>;

    async fn close(&self);
}
