//! Engine backed by the `webrtc` crate.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_VP8, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use super::{
    DataChannel, EngineEvent, EngineEventSink, IceConnectionState, PeerConnection, PeerEngine,
    RemoteMedia, SignalingState,
};
use crate::config::SessionConfig;
use crate::error::EngineError;
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};

const VIDEO_TRACK_ID: &str = "parley-video";
const VIDEO_STREAM_ID: &str = "parley-camera";
const REMOTE_RTP_BUFFER: usize = 512;

/// Creates real peer connections. The embedding application feeds camera
/// frames into [`RtcEngine::local_video_track`]; attaching video adds that
/// track to the connection. Remote video arrives as RTP packets on
/// [`RtcEngine::subscribe_remote_video`]; packets nobody subscribed to are
/// dropped.
pub struct RtcEngine {
    api: API,
    ice_servers: Vec<String>,
    video_track: Arc<TrackLocalStaticSample>,
    remote_rtp: broadcast::Sender<Packet>,
}

impl RtcEngine {
    pub fn new(config: &SessionConfig) -> Result<Self, EngineError> {
        let mut media = MediaEngine::default();
        media
            .register_default_codecs()
            .map_err(|err| EngineError::Setup(err.to_string()))?;
        let registry = register_default_interceptors(Registry::new(), &mut media)
            .map_err(|err| EngineError::Setup(err.to_string()))?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let video_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            VIDEO_TRACK_ID.to_owned(),
            VIDEO_STREAM_ID.to_owned(),
        ));

        let (remote_rtp, _) = broadcast::channel(REMOTE_RTP_BUFFER);

        Ok(Self {
            api,
            ice_servers: config.ice_servers.clone(),
            video_track,
            remote_rtp,
        })
    }

    pub fn local_video_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.video_track)
    }

    /// RTP packets of the remote video track, for a decoder or renderer.
    /// Slow subscribers lose the oldest packets.
    pub fn subscribe_remote_video(&self) -> broadcast::Receiver<Packet> {
        self.remote_rtp.subscribe()
    }

    fn configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerEngine for RtcEngine {
    async fn create_peer_connection(
        &self,
        events: EngineEventSink,
    ) -> Result<Arc<dyn PeerConnection>, EngineError> {
        let pc = self
            .api
            .new_peer_connection(self.configuration())
            .await
            .map_err(|err| EngineError::Setup(err.to_string()))?;
        let pc = Arc::new(pc);
        install_callbacks(&pc, &events, &self.remote_rtp);
        tracing::debug!(
            target: "parley::engine",
            generation = events.generation(),
            "created webrtc peer connection"
        );
        Ok(Arc::new(RtcPeerConnection {
            pc,
            events,
            video_track: Arc::clone(&self.video_track),
            video_sender: Mutex::new(None),
        }))
    }
}

fn install_callbacks(
    pc: &Arc<RTCPeerConnection>,
    events: &EngineEventSink,
    remote_rtp: &broadcast::Sender<Packet>,
) {
    let sink = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let sink = sink.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => sink.emit(EngineEvent::LocalCandidate(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                })),
                Err(err) => tracing::warn!(
                    target: "parley::engine",
                    error = %err,
                    "failed to serialize local candidate"
                ),
            }
        })
    }));

    let sink = events.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let sink = sink.clone();
        Box::pin(async move {
            if let Some(state) = map_ice_state(state) {
                sink.emit(EngineEvent::IceConnectionStateChanged(state));
            }
        })
    }));

    let sink = events.clone();
    pc.on_negotiation_needed(Box::new(move || {
        let sink = sink.clone();
        Box::pin(async move {
            sink.emit(EngineEvent::NegotiationNeeded);
        })
    }));

    let sink = events.clone();
    pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
        let sink = sink.clone();
        Box::pin(async move {
            tracing::debug!(target: "parley::engine", label = channel.label(), "remote data channel");
            wire_data_channel(channel, &sink);
        })
    }));

    let sink = events.clone();
    let remote_rtp = remote_rtp.clone();
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let sink = sink.clone();
            let remote_rtp = remote_rtp.clone();
            Box::pin(async move {
                sink.emit(EngineEvent::RemoteTrack(RemoteMedia {
                    stream_id: track.stream_id(),
                    track_id: track.id(),
                }));
                // The track ends when its RTP stream does.
                tokio::spawn(async move {
                    while let Ok((packet, _)) = track.read_rtp().await {
                        // No subscriber is not an error.
                        let _ = remote_rtp.send(packet);
                    }
                    sink.emit(EngineEvent::RemoteTrackRemoved);
                });
            })
        },
    ));
}

fn wire_data_channel(channel: Arc<RTCDataChannel>, events: &EngineEventSink) -> Arc<dyn DataChannel> {
    let wrapper: Arc<dyn DataChannel> = Arc::new(RtcDataChannel {
        inner: Arc::clone(&channel),
    });

    let sink = events.clone();
    channel.on_message(Box::new(move |message: DataChannelMessage| {
        let sink = sink.clone();
        Box::pin(async move {
            if message.is_string {
                let text = String::from_utf8_lossy(&message.data).into_owned();
                sink.emit(EngineEvent::DataChannelMessage(text));
            }
        })
    }));

    let sink = events.clone();
    channel.on_close(Box::new(move || {
        let sink = sink.clone();
        Box::pin(async move {
            sink.emit(EngineEvent::DataChannelClosed);
        })
    }));

    if channel.ready_state() == RTCDataChannelState::Open {
        events.emit(EngineEvent::DataChannelOpen(Arc::clone(&wrapper)));
    } else {
        let sink = events.clone();
        let opened = Arc::clone(&wrapper);
        channel.on_open(Box::new(move || {
            let sink = sink.clone();
            let opened = Arc::clone(&opened);
            Box::pin(async move {
                sink.emit(EngineEvent::DataChannelOpen(opened));
            })
        }));
    }
    wrapper
}

fn map_ice_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    Some(match state {
        RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        RTCIceConnectionState::Unspecified => return None,
    })
}

fn to_native(description: SessionDescription) -> Result<RTCSessionDescription, EngineError> {
    let native = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        SdpKind::Rollback => {
            return serde_json::from_value(serde_json::json!({ "type": "rollback", "sdp": "" }))
                .map_err(|err| EngineError::Description(err.to_string()));
        }
    };
    native.map_err(|err| EngineError::Description(err.to_string()))
}

fn from_native(description: RTCSessionDescription) -> Result<SessionDescription, EngineError> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        other => {
            return Err(EngineError::Unsupported(format!(
                "session description type {other}"
            )));
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: description.sdp,
    })
}

struct RtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    events: EngineEventSink,
    video_track: Arc<TrackLocalStaticSample>,
    video_sender: Mutex<Option<Arc<RTCRtpSender>>>,
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, EngineError> {
        let options = RTCOfferOptions {
            ice_restart,
            voice_activity_detection: false,
        };
        let offer = self
            .pc
            .create_offer(Some(options))
            .await
            .map_err(|err| EngineError::Description(err.to_string()))?;
        from_native(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|err| EngineError::Description(err.to_string()))?;
        from_native(answer)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        self.pc
            .set_local_description(to_native(description)?)
            .await
            .map_err(|err| EngineError::Description(err.to_string()))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        self.pc
            .set_remote_description(to_native(description)?)
            .await
            .map_err(|err| EngineError::Description(err.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| EngineError::Candidate(err.to_string()))
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, EngineError> {
        let channel = self
            .pc
            .create_data_channel(label, None)
            .await
            .map_err(|err| EngineError::DataChannel(err.to_string()))?;
        Ok(wire_data_channel(channel, &self.events))
    }

    async fn attach_local_video(&self) -> Result<(), EngineError> {
        if self.video_sender.lock().is_some() {
            return Ok(());
        }
        let track: Arc<dyn TrackLocal + Send + Sync> = Arc::clone(&self.video_track) as _;
        let sender = self
            .pc
            .add_track(track)
            .await
            .map_err(|err| EngineError::Media(err.to_string()))?;
        *self.video_sender.lock() = Some(sender);
        Ok(())
    }

    async fn detach_local_video(&self) -> Result<(), EngineError> {
        let sender = self.video_sender.lock().take();
        if let Some(sender) = sender {
            self.pc
                .remove_track(&sender)
                .await
                .map_err(|err| EngineError::Media(err.to_string()))?;
        }
        Ok(())
    }

    async fn restart_ice(&self) -> Result<(), EngineError> {
        // Fresh credentials come from the ice_restart offer option.
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingState::HaveRemoteOffer
            }
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        map_ice_state(self.pc.ice_connection_state()).unwrap_or(IceConnectionState::New)
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.pc
            .close()
            .await
            .map_err(|err| EngineError::Setup(err.to_string()))
    }
}

struct RtcDataChannel {
    inner: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> &str {
        self.inner.label()
    }

    fn is_open(&self) -> bool {
        self.inner.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: String) -> Result<(), EngineError> {
        self.inner
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|err| EngineError::DataChannel(err.to_string()))
    }

    async fn close(&self) {
        if let Err(err) = self.inner.close().await {
            tracing::debug!(target: "parley::engine", error = %err, "data channel close failed");
        }
    }
}
