//! In-memory engine pair.
//!
//! Peer connections created from engines that share a [`MockNetwork`] find
//! each other through the origin id embedded in their fake SDP. Once both
//! sides of an offer/answer exchange reach `stable` the pair is linked: data
//! channels announced in the offer open on both ends, ICE walks through
//! `checking` to `connected`, and each side reports remote media according
//! to what the other side announced.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{
    DataChannel, EngineEvent, EngineEventSink, IceConnectionState, PeerConnection, PeerEngine,
    RemoteMedia, SignalingState,
};
use crate::error::EngineError;
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MockSdp {
    origin: u64,
    version: u32,
    #[serde(default)]
    data_channel: Option<String>,
    #[serde(default)]
    video: bool,
    #[serde(default)]
    ice_restart: bool,
}

impl MockSdp {
    fn encode(&self) -> String {
        format!(
            "v=0\r\na=x-parley-mock:{}\r\n",
            serde_json::to_string(self).unwrap_or_default()
        )
    }

    fn decode(sdp: &str) -> Result<Self, EngineError> {
        let payload = sdp
            .lines()
            .find_map(|line| line.strip_prefix("a=x-parley-mock:"))
            .ok_or_else(|| EngineError::Description("not a mock session description".into()))?;
        serde_json::from_str(payload.trim())
            .map_err(|err| EngineError::Description(format!("malformed mock sdp: {err}")))
    }
}

#[derive(Clone, Default)]
pub struct MockNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

#[derive(Default)]
struct NetworkState {
    next_id: u64,
    peers: HashMap<u64, Weak<MockPeerConnection>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&self) -> u64 {
        let mut state = self.inner.lock();
        state.next_id += 1;
        state.next_id
    }

    fn register(&self, peer: &Arc<MockPeerConnection>) {
        self.inner
            .lock()
            .peers
            .insert(peer.id, Arc::downgrade(peer));
    }

    fn lookup(&self, id: u64) -> Option<Arc<MockPeerConnection>> {
        self.inner.lock().peers.get(&id).and_then(Weak::upgrade)
    }
}

pub struct MockEngine {
    network: MockNetwork,
    connections: Mutex<Vec<Arc<MockPeerConnection>>>,
    fail_next_create: AtomicBool,
}

impl MockEngine {
    pub fn new(network: &MockNetwork) -> Self {
        Self {
            network: network.clone(),
            connections: Mutex::new(Vec::new()),
            fail_next_create: AtomicBool::new(false),
        }
    }

    /// Every peer connection this engine created, oldest first.
    pub fn connections(&self) -> Vec<Arc<MockPeerConnection>> {
        self.connections.lock().clone()
    }

    pub fn latest(&self) -> Option<Arc<MockPeerConnection>> {
        self.connections.lock().last().cloned()
    }

    pub fn fail_next_create(&self) {
        self.fail_next_create.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerEngine for MockEngine {
    async fn create_peer_connection(
        &self,
        events: EngineEventSink,
    ) -> Result<Arc<dyn PeerConnection>, EngineError> {
        if self.fail_next_create.swap(false, Ordering::SeqCst) {
            return Err(EngineError::Setup("injected create failure".into()));
        }
        let peer = Arc::new(MockPeerConnection {
            id: self.network.allocate(),
            network: self.network.clone(),
            events,
            state: Mutex::new(PeerState::default()),
        });
        self.network.register(&peer);
        self.connections.lock().push(Arc::clone(&peer));
        Ok(peer)
    }
}

struct PeerState {
    signaling: SignalingState,
    ice: IceConnectionState,
    local_video: bool,
    local_offer: Option<MockSdp>,
    remote_offer: Option<MockSdp>,
    remote_origin: Option<u64>,
    remote_description: bool,
    remote_video: bool,
    reported_remote_track: bool,
    created_channel: Option<Arc<MockDataChannel>>,
    channel: Option<Arc<MockDataChannel>>,
    linked_peer: Option<u64>,
    applied_candidates: Vec<IceCandidate>,
    offers_created: u32,
    ice_restart_offers: u32,
    rollbacks: u32,
    gathered: u32,
    version: u32,
    fail_next_offer: bool,
    fail_ice_restart: bool,
    rollback_supported: bool,
}

impl Default for PeerState {
    fn default() -> Self {
        Self {
            signaling: SignalingState::Stable,
            ice: IceConnectionState::New,
            local_video: false,
            local_offer: None,
            remote_offer: None,
            remote_origin: None,
            remote_description: false,
            remote_video: false,
            reported_remote_track: false,
            created_channel: None,
            channel: None,
            linked_peer: None,
            applied_candidates: Vec::new(),
            offers_created: 0,
            ice_restart_offers: 0,
            rollbacks: 0,
            gathered: 0,
            version: 0,
            fail_next_offer: false,
            fail_ice_restart: false,
            rollback_supported: true,
        }
    }
}

pub struct MockPeerConnection {
    id: u64,
    network: MockNetwork,
    events: EngineEventSink,
    state: Mutex<PeerState>,
}

impl MockPeerConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied_candidates.clone()
    }

    pub fn offers_created(&self) -> u32 {
        self.state.lock().offers_created
    }

    pub fn ice_restart_offers(&self) -> u32 {
        self.state.lock().ice_restart_offers
    }

    pub fn rollbacks(&self) -> u32 {
        self.state.lock().rollbacks
    }

    pub fn local_video(&self) -> bool {
        self.state.lock().local_video
    }

    pub fn has_remote_description(&self) -> bool {
        self.state.lock().remote_description
    }

    pub fn set_rollback_supported(&self, supported: bool) {
        self.state.lock().rollback_supported = supported;
    }

    pub fn fail_next_offer(&self) {
        self.state.lock().fail_next_offer = true;
    }

    pub fn fail_ice_restart(&self, fail: bool) {
        self.state.lock().fail_ice_restart = fail;
    }

    /// Forces an ICE state and reports it as the engine would.
    pub fn simulate_ice_state(&self, ice: IceConnectionState) {
        self.state.lock().ice = ice;
        self.events.emit(EngineEvent::IceConnectionStateChanged(ice));
    }

    pub fn simulate_negotiation_needed(&self) {
        self.events.emit(EngineEvent::NegotiationNeeded);
    }

    /// Delivers `text` as if the remote end had sent it on the data channel.
    pub fn inject_channel_message(&self, text: impl Into<String>) {
        self.events.emit(EngineEvent::DataChannelMessage(text.into()));
    }

    fn is_settled_with(&self, remote_id: u64) -> bool {
        let state = self.state.lock();
        state.signaling == SignalingState::Stable && state.remote_origin == Some(remote_id)
    }

    fn gather_candidate(&self) {
        let index = {
            let mut state = self.state.lock();
            state.gathered += 1;
            state.gathered
        };
        self.events.emit(EngineEvent::LocalCandidate(IceCandidate {
            candidate: format!(
                "candidate:mock{}{} 1 udp 2130706431 10.0.0.{} {} typ host",
                self.id,
                index,
                self.id % 250 + 1,
                5000 + index
            ),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }));
    }

    /// Runs after this side reached `stable` through an offer/answer round.
    fn settle(&self, ice_restart: bool) {
        let (media_event, remote_origin) = {
            let mut state = self.state.lock();
            let media_event = if state.remote_video && !state.reported_remote_track {
                state.reported_remote_track = true;
                Some(EngineEvent::RemoteTrack(RemoteMedia {
                    stream_id: format!("mock-stream-{}", state.remote_origin.unwrap_or_default()),
                    track_id: format!("mock-video-{}", state.remote_origin.unwrap_or_default()),
                }))
            } else if !state.remote_video && state.reported_remote_track {
                state.reported_remote_track = false;
                Some(EngineEvent::RemoteTrackRemoved)
            } else {
                None
            };
            (media_event, state.remote_origin)
        };
        if let Some(event) = media_event {
            self.events.emit(event);
        }

        let Some(remote) = remote_origin.and_then(|id| self.network.lookup(id)) else {
            return;
        };
        if remote.is_settled_with(self.id) {
            link(self, &remote, ice_restart);
        }
    }
}

fn link(a: &MockPeerConnection, b: &MockPeerConnection, ice_restart: bool) {
    let newly_linked = {
        let mut a_state = a.state.lock();
        let was = a_state.linked_peer;
        a_state.linked_peer = Some(b.id);
        was != Some(b.id)
    };
    b.state.lock().linked_peer = Some(a.id);

    open_announced_channel(a, b);
    open_announced_channel(b, a);

    let needs_ice = newly_linked
        || ice_restart
        || !a.state.lock().ice.is_connected()
        || !b.state.lock().ice.is_connected();
    if needs_ice {
        for peer in [a, b] {
            peer.simulate_ice_state(IceConnectionState::Checking);
            peer.simulate_ice_state(IceConnectionState::Connected);
        }
    }
}

fn open_announced_channel(owner: &MockPeerConnection, remote: &MockPeerConnection) {
    let pending = {
        let state = owner.state.lock();
        state
            .created_channel
            .as_ref()
            .filter(|channel| !channel.is_open())
            .cloned()
    };
    let Some(local) = pending else {
        return;
    };
    let far = Arc::new(MockDataChannel::new(local.label()));
    local.connect(remote.events.clone());
    far.connect(owner.events.clone());
    owner.state.lock().channel = Some(Arc::clone(&local));
    remote.state.lock().channel = Some(Arc::clone(&far));
    owner.events.emit(EngineEvent::DataChannelOpen(local));
    remote.events.emit(EngineEvent::DataChannelOpen(far));
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, EngineError> {
        let mut state = self.state.lock();
        if state.signaling == SignalingState::Closed {
            return Err(EngineError::Closed);
        }
        if state.fail_next_offer {
            state.fail_next_offer = false;
            return Err(EngineError::Description("injected offer failure".into()));
        }
        state.version += 1;
        state.offers_created += 1;
        if ice_restart {
            state.ice_restart_offers += 1;
        }
        let data_channel = state
            .created_channel
            .as_ref()
            .or(state.channel.as_ref())
            .map(|channel| channel.label().to_string());
        let sdp = MockSdp {
            origin: self.id,
            version: state.version,
            data_channel,
            video: state.local_video,
            ice_restart,
        };
        Ok(SessionDescription::offer(sdp.encode()))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        let mut state = self.state.lock();
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(EngineError::Description(format!(
                "cannot answer in {}",
                state.signaling
            )));
        }
        state.version += 1;
        let data_channel = state
            .remote_offer
            .as_ref()
            .and_then(|offer| offer.data_channel.clone());
        let sdp = MockSdp {
            origin: self.id,
            version: state.version,
            data_channel,
            video: state.local_video,
            ice_restart: false,
        };
        Ok(SessionDescription::answer(sdp.encode()))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        match description.kind {
            SdpKind::Offer => {
                let offer = MockSdp::decode(&description.sdp)?;
                {
                    let mut state = self.state.lock();
                    if !matches!(
                        state.signaling,
                        SignalingState::Stable | SignalingState::HaveLocalOffer
                    ) {
                        return Err(EngineError::Description(format!(
                            "cannot set local offer in {}",
                            state.signaling
                        )));
                    }
                    state.signaling = SignalingState::HaveLocalOffer;
                    state.local_offer = Some(offer);
                }
                self.gather_candidate();
                Ok(())
            }
            SdpKind::Answer => {
                let ice_restart = {
                    let mut state = self.state.lock();
                    if state.signaling != SignalingState::HaveRemoteOffer {
                        return Err(EngineError::Description(format!(
                            "cannot set local answer in {}",
                            state.signaling
                        )));
                    }
                    state.signaling = SignalingState::Stable;
                    let offer = state.remote_offer.take();
                    state.remote_video = offer.as_ref().is_some_and(|offer| offer.video);
                    offer.is_some_and(|offer| offer.ice_restart)
                };
                self.gather_candidate();
                self.settle(ice_restart);
                Ok(())
            }
            SdpKind::Rollback => {
                let mut state = self.state.lock();
                if !state.rollback_supported {
                    return Err(EngineError::Unsupported("rollback".into()));
                }
                if state.signaling != SignalingState::HaveLocalOffer {
                    return Err(EngineError::Description(format!(
                        "nothing to roll back in {}",
                        state.signaling
                    )));
                }
                state.signaling = SignalingState::Stable;
                state.local_offer = None;
                state.rollbacks += 1;
                Ok(())
            }
        }
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        match description.kind {
            SdpKind::Offer => {
                let offer = MockSdp::decode(&description.sdp)?;
                let mut state = self.state.lock();
                match state.signaling {
                    SignalingState::Closed => return Err(EngineError::Closed),
                    SignalingState::HaveLocalOffer => {
                        return Err(EngineError::Description(
                            "remote offer collides with local offer".into(),
                        ));
                    }
                    _ => {}
                }
                state.signaling = SignalingState::HaveRemoteOffer;
                state.remote_origin = Some(offer.origin);
                state.remote_description = true;
                state.remote_offer = Some(offer);
                Ok(())
            }
            SdpKind::Answer => {
                let answer = MockSdp::decode(&description.sdp)?;
                let ice_restart = {
                    let mut state = self.state.lock();
                    if state.signaling != SignalingState::HaveLocalOffer {
                        return Err(EngineError::Description(format!(
                            "cannot apply answer in {}",
                            state.signaling
                        )));
                    }
                    state.signaling = SignalingState::Stable;
                    state.remote_origin = Some(answer.origin);
                    state.remote_description = true;
                    state.remote_video = answer.video;
                    state
                        .local_offer
                        .take()
                        .is_some_and(|offer| offer.ice_restart)
                };
                self.settle(ice_restart);
                Ok(())
            }
            SdpKind::Rollback => Err(EngineError::Description(
                "rollback is only valid as a local description".into(),
            )),
        }
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if state.signaling == SignalingState::Closed {
            return Err(EngineError::Closed);
        }
        if !state.remote_description {
            return Err(EngineError::Candidate("remote description not set".into()));
        }
        if candidate.candidate.is_empty() {
            return Err(EngineError::Candidate("empty candidate".into()));
        }
        state.applied_candidates.push(candidate);
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, EngineError> {
        let mut state = self.state.lock();
        if state.signaling == SignalingState::Closed {
            return Err(EngineError::Closed);
        }
        let channel = Arc::new(MockDataChannel::new(label));
        state.created_channel = Some(Arc::clone(&channel));
        Ok(channel)
    }

    async fn attach_local_video(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if state.signaling == SignalingState::Closed {
            return Err(EngineError::Closed);
        }
        state.local_video = true;
        Ok(())
    }

    async fn detach_local_video(&self) -> Result<(), EngineError> {
        self.state.lock().local_video = false;
        Ok(())
    }

    async fn restart_ice(&self) -> Result<(), EngineError> {
        let state = self.state.lock();
        if state.signaling == SignalingState::Closed {
            return Err(EngineError::Closed);
        }
        if state.fail_ice_restart {
            return Err(EngineError::Unsupported("ice restart".into()));
        }
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        self.state.lock().ice
    }

    async fn close(&self) -> Result<(), EngineError> {
        let (channel, linked_peer) = {
            let mut state = self.state.lock();
            if state.signaling == SignalingState::Closed {
                return Ok(());
            }
            state.signaling = SignalingState::Closed;
            state.ice = IceConnectionState::Closed;
            state.created_channel = None;
            (state.channel.take(), state.linked_peer.take())
        };
        if let Some(channel) = channel {
            channel.close().await;
        }
        if let Some(peer) = linked_peer.and_then(|id| self.network.lookup(id)) {
            peer.simulate_ice_state(IceConnectionState::Disconnected);
        }
        Ok(())
    }
}

pub struct MockDataChannel {
    label: String,
    open: AtomicBool,
    peer: Mutex<Option<EngineEventSink>>,
}

impl MockDataChannel {
    fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            open: AtomicBool::new(false),
            peer: Mutex::new(None),
        }
    }

    fn connect(&self, peer: EngineEventSink) {
        *self.peer.lock() = Some(peer);
        self.open.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: String) -> Result<(), EngineError> {
        if !self.is_open() {
            return Err(EngineError::DataChannel("channel not open".into()));
        }
        let peer = self.peer.lock().clone();
        match peer {
            Some(peer) => {
                peer.emit(EngineEvent::DataChannelMessage(text));
                Ok(())
            }
            None => Err(EngineError::DataChannel("channel has no remote end".into())),
        }
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        if let Some(peer) = self.peer.lock().take() {
            peer.emit(EngineEvent::DataChannelClosed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EventRouter;
    use tokio::sync::mpsc;

    fn sink(generation: u64) -> (EngineEventSink, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let router: EventRouter = Arc::new(move |_generation, event| {
            let _ = tx.send(event);
        });
        (EngineEventSink::new(generation, router), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn offer_answer_round_links_the_pair() {
        let network = MockNetwork::new();
        let engine = MockEngine::new(&network);
        let (a_sink, mut a_rx) = sink(1);
        let (b_sink, mut b_rx) = sink(1);
        let a = engine.create_peer_connection(a_sink).await.unwrap();
        let b = engine.create_peer_connection(b_sink).await.unwrap();

        a.create_data_channel("chat").await.unwrap();
        let offer = a.create_offer(false).await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        assert_eq!(a.signaling_state(), SignalingState::HaveLocalOffer);

        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        assert_eq!(a.signaling_state(), SignalingState::Stable);
        assert_eq!(b.signaling_state(), SignalingState::Stable);
        assert_eq!(a.ice_connection_state(), IceConnectionState::Connected);
        assert_eq!(b.ice_connection_state(), IceConnectionState::Connected);

        let a_events = drain(&mut a_rx);
        let b_events = drain(&mut b_rx);
        assert!(a_events.iter().any(|e| matches!(e, EngineEvent::DataChannelOpen(_))));
        let far = b_events
            .iter()
            .find_map(|e| match e {
                EngineEvent::DataChannelOpen(channel) => Some(Arc::clone(channel)),
                _ => None,
            })
            .expect("remote channel opened");
        assert_eq!(far.label(), "chat");

        far.send_text("ping".into()).await.unwrap();
        match a_rx.try_recv() {
            Ok(EngineEvent::DataChannelMessage(text)) => assert_eq!(text, "ping"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn candidates_require_remote_description() {
        let network = MockNetwork::new();
        let engine = MockEngine::new(&network);
        let (a_sink, _a_rx) = sink(1);
        let a = engine.create_peer_connection(a_sink).await.unwrap();

        let err = a
            .add_ice_candidate(IceCandidate::new("candidate:1"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Candidate(_)));
    }

    #[tokio::test]
    async fn rollback_can_be_disabled() {
        let network = MockNetwork::new();
        let engine = MockEngine::new(&network);
        let (a_sink, _a_rx) = sink(1);
        let a = engine.create_peer_connection(a_sink).await.unwrap();
        let offer = a.create_offer(false).await.unwrap();
        a.set_local_description(offer).await.unwrap();

        let mock = engine.latest().unwrap();
        mock.set_rollback_supported(false);
        assert!(matches!(
            a.set_local_description(SessionDescription::rollback()).await,
            Err(EngineError::Unsupported(_))
        ));
        mock.set_rollback_supported(true);
        a.set_local_description(SessionDescription::rollback())
            .await
            .unwrap();
        assert_eq!(a.signaling_state(), SignalingState::Stable);
        assert_eq!(mock.rollbacks(), 1);
    }

    #[tokio::test]
    async fn video_flag_surfaces_remote_track() {
        let network = MockNetwork::new();
        let engine = MockEngine::new(&network);
        let (a_sink, _a_rx) = sink(1);
        let (b_sink, mut b_rx) = sink(1);
        let a = engine.create_peer_connection(a_sink).await.unwrap();
        let b = engine.create_peer_connection(b_sink).await.unwrap();

        a.attach_local_video().await.unwrap();
        let offer = a.create_offer(false).await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer).await.unwrap();

        assert!(
            drain(&mut b_rx)
                .iter()
                .any(|e| matches!(e, EngineEvent::RemoteTrack(_)))
        );
    }
}
