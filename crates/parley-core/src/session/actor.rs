use std::sync::Arc;

use tokio::sync::mpsc::{self, WeakUnboundedSender};
use tokio::task::JoinHandle;

use super::{Command, ConnectionStatus, EndReason, SessionEvent, SessionInput};
use crate::call::{CallEffect, CallNotice, CallStateMachine};
use crate::config::SessionConfig;
use crate::context::{Role, SessionContext};
use crate::engine::{EngineEvent, EventRouter, PeerEngine, RemoteMedia};
use crate::error::{NegotiationError, SessionError};
use crate::negotiation::{
    NegotiationCoordinator, RemoteOffer, RemoteOfferOutcome, negotiation_owner,
};
use crate::protocol::{CallAction, MessageId, PeerMessage, ServerMessage};
use crate::recovery::{RecoveryAction, RecoveryMonitor, RecoveryTimer, TimerSink};
use crate::relay::{Cipher, MessageRelay};
use crate::signaling::{SignalingConnectionState, SignalingTransport};

pub(super) struct SessionActor {
    context: SessionContext,
    signaling: SignalingTransport,
    coordinator: NegotiationCoordinator,
    call: CallStateMachine,
    relay: MessageRelay,
    recovery: RecoveryMonitor,
    inbox: mpsc::UnboundedReceiver<SessionInput>,
    inbox_tx: WeakUnboundedSender<SessionInput>,
    outbox: mpsc::UnboundedReceiver<PeerMessage>,
    events: mpsc::UnboundedSender<SessionEvent>,
    participants: Vec<String>,
    connection_status: Option<ConnectionStatus>,
    remote_media: Option<RemoteMedia>,
    channel_open: bool,
    state_forwarder: Option<JoinHandle<()>>,
    started: bool,
    ended: bool,
}

impl SessionActor {
    pub(super) fn new(
        config: SessionConfig,
        context: SessionContext,
        engine: Arc<dyn PeerEngine>,
        cipher: Arc<dyn Cipher>,
        inbox_tx: WeakUnboundedSender<SessionInput>,
        inbox: mpsc::UnboundedReceiver<SessionInput>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let engine_tx = inbox_tx.clone();
        let router: EventRouter = Arc::new(move |generation, event| {
            if let Some(tx) = engine_tx.upgrade() {
                let _ = tx.send(SessionInput::Engine { generation, event });
            }
        });
        let timer_tx = inbox_tx.clone();
        let timers: TimerSink = Arc::new(move |timer: RecoveryTimer| {
            if let Some(tx) = timer_tx.upgrade() {
                let _ = tx.send(SessionInput::Recovery(timer));
            }
        });

        let signaling = SignalingTransport::new(&config);
        let control_tx = inbox_tx.clone();
        signaling.on_message(move |message| {
            if let Some(tx) = control_tx.upgrade() {
                let _ = tx.send(SessionInput::Control(message.clone()));
            }
        });

        let (outbox_tx, outbox) = mpsc::unbounded_channel();
        let coordinator = NegotiationCoordinator::new(
            engine,
            context.clone(),
            config.data_channel_label.clone(),
            router,
            outbox_tx,
        );

        Self {
            call: CallStateMachine::new(context.role),
            relay: MessageRelay::new(&context, cipher),
            recovery: RecoveryMonitor::new(&config, timers),
            context,
            signaling,
            coordinator,
            inbox,
            inbox_tx,
            outbox,
            events,
            participants: Vec::new(),
            connection_status: None,
            remote_media: None,
            channel_open: false,
            state_forwarder: None,
            started: false,
            ended: false,
        }
    }

    pub(super) async fn run(mut self) {
        tracing::info!(
            target: "parley::session",
            participant = %self.context.participant_id,
            role = %self.context.role,
            "session actor started"
        );
        self.state_forwarder = Some(self.spawn_state_forwarder());

        while let Some(input) = self.inbox.recv().await {
            self.handle_input(input).await;
            self.flush_outbox().await;
            if self.ended {
                break;
            }
        }
        if !self.ended {
            self.shutdown(EndReason::Local).await;
        }
        tracing::debug!(
            target: "parley::session",
            participant = %self.context.participant_id,
            "session actor stopped"
        );
    }

    fn spawn_state_forwarder(&self) -> JoinHandle<()> {
        let mut states = self.signaling.subscribe_state();
        let inbox = self.inbox_tx.clone();
        tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let state = states.borrow_and_update().clone();
                let Some(tx) = inbox.upgrade() else {
                    break;
                };
                if tx.send(SessionInput::SignalingState(state)).is_err() {
                    break;
                }
            }
        })
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn owner(&self) -> Role {
        negotiation_owner(self.call.video_initiator())
    }

    fn is_owner(&self) -> bool {
        self.context.role == self.owner()
    }

    fn peer_present(&self) -> bool {
        self.participants
            .iter()
            .any(|participant| *participant != self.context.participant_id)
    }

    fn require_peer_connection(&self) -> Result<(), SessionError> {
        if self.coordinator.has_peer_connection() {
            Ok(())
        } else {
            Err(SessionError::InvalidState(
                "no active peer connection".into(),
            ))
        }
    }

    async fn handle_input(&mut self, input: SessionInput) {
        match input {
            SessionInput::Command(command) => self.handle_command(command).await,
            SessionInput::Control(message) => self.handle_control(message).await,
            SessionInput::SignalingState(state) => self.handle_signaling_state(state).await,
            SessionInput::Engine { generation, event } => {
                if self.coordinator.accepts_generation(generation) {
                    self.handle_engine_event(event).await;
                } else {
                    tracing::trace!(
                        target: "parley::session",
                        generation,
                        ?event,
                        "dropping event from discarded peer connection"
                    );
                }
            }
            SessionInput::Recovery(timer) => {
                let state = self.coordinator.ice_connection_state();
                let is_owner = self.is_owner();
                let action = self.recovery.on_timer(timer, state, is_owner);
                self.apply_recovery(action).await;
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start(reply) => {
                let result = self.start().await;
                let _ = reply.send(result);
            }
            Command::StartVideo(reply) => {
                let result = self.set_local_video(true).await;
                let _ = reply.send(result);
            }
            Command::StopVideo(reply) => {
                let result = self.set_local_video(false).await;
                let _ = reply.send(result);
            }
            Command::SendInvite(reply) => {
                let result = match self.require_peer_connection() {
                    Ok(()) => self.call.send_invite().map_err(SessionError::from),
                    Err(err) => Err(err),
                };
                let result = match result {
                    Ok(effects) => {
                        self.apply_call_effects(effects).await;
                        Ok(())
                    }
                    Err(err) => Err(err),
                };
                let _ = reply.send(result);
            }
            Command::AcceptInvite(reply) => {
                let has_peer = self.coordinator.has_peer_connection();
                let result = match self.call.accept_invite(has_peer) {
                    Ok(effects) => {
                        self.apply_call_effects(effects).await;
                        Ok(())
                    }
                    Err(err) => Err(err.into()),
                };
                let _ = reply.send(result);
            }
            Command::DeclineInvite(reply) => {
                let result = match self.call.decline_invite() {
                    Ok(effects) => {
                        self.apply_call_effects(effects).await;
                        Ok(())
                    }
                    Err(err) => Err(err.into()),
                };
                let _ = reply.send(result);
            }
            Command::EndCall(reply) => {
                let was_owner = self.is_owner();
                let has_peer = self.coordinator.has_peer_connection();
                let result = match self.call.end_call(has_peer) {
                    Ok(effects) => {
                        self.apply_call_effects(effects).await;
                        self.call.finish_ending();
                        Ok(())
                    }
                    Err(err) => Err(err.into()),
                };
                let _ = reply.send(result);
                self.reevaluate_ownership(was_owner).await;
            }
            Command::SendChat(text, reply) => {
                let result = self.send_chat(&text).await;
                let _ = reply.send(result);
            }
            Command::RequestRecovery => self.resume().await,
            Command::EndSession(reply) => {
                self.shutdown(EndReason::Local).await;
                let _ = reply.send(());
            }
        }
    }

    async fn start(&mut self) -> Result<(), SessionError> {
        if self.started {
            return Ok(());
        }
        self.signaling
            .connect(&self.context.token, &self.context.participant_id)
            .await?;
        self.started = true;
        Ok(())
    }

    async fn set_local_video(&mut self, enabled: bool) -> Result<(), SessionError> {
        self.require_peer_connection()?;
        if enabled {
            self.coordinator.attach_local_video().await?;
        } else {
            self.coordinator.detach_local_video().await?;
        }
        self.renegotiate().await;
        Ok(())
    }

    async fn send_chat(&mut self, text: &str) -> Result<MessageId, SessionError> {
        let Some(channel) = self.coordinator.data_channel() else {
            return Err(SessionError::InvalidState("data channel is not open".into()));
        };
        Ok(self.relay.send(channel.as_ref(), text).await?)
    }

    async fn resume(&mut self) {
        match self.coordinator.ice_connection_state() {
            None => {
                if self.context.role == Role::Host && self.peer_present() {
                    self.bootstrap().await;
                }
            }
            Some(state) => {
                let is_owner = self.is_owner();
                let action = self.recovery.on_resume(state, is_owner);
                self.apply_recovery(action).await;
            }
        }
    }

    async fn handle_control(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Status {
                connected_participants,
                ..
            } => {
                if connected_participants != self.participants {
                    self.participants = connected_participants.clone();
                    self.emit(SessionEvent::ParticipantsChanged(connected_participants));
                }
                if self.context.role == Role::Host
                    && self.peer_present()
                    && !self.coordinator.has_peer_connection()
                {
                    self.bootstrap().await;
                }
            }
            ServerMessage::Signal {
                signal_type,
                payload,
                sender,
            } => {
                if sender == self.context.participant_id {
                    return;
                }
                match PeerMessage::from_signal(&signal_type, payload) {
                    Ok(message) => self.handle_peer_message(message).await,
                    Err(err) => tracing::debug!(
                        target: "parley::session",
                        signal_type = %signal_type,
                        error = %err,
                        "ignoring malformed signal"
                    ),
                }
            }
            ServerMessage::Error { message } => {
                tracing::warn!(target: "parley::session", error = %message, "signaling server error");
                self.emit(SessionEvent::ServerError(message));
            }
            ServerMessage::SessionClosed => self.shutdown(EndReason::RemoteClosed).await,
            ServerMessage::SessionExpired => self.shutdown(EndReason::Expired).await,
            ServerMessage::SessionDeleted => self.shutdown(EndReason::Deleted).await,
            ServerMessage::AbuseReported => {
                tracing::info!(target: "parley::session", "session reported for abuse");
            }
            ServerMessage::Pong => {}
        }
    }

    async fn handle_signaling_state(&mut self, state: SignalingConnectionState) {
        self.emit(SessionEvent::SignalingStateChanged(state.clone()));
        if let SignalingConnectionState::Error(reason) = state {
            if self.started {
                tracing::warn!(target: "parley::session", %reason, "signaling lost");
                self.shutdown(EndReason::SignalingLost).await;
            }
        }
    }

    async fn handle_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::LocalCandidate(candidate) => {
                self.route(PeerMessage::IceCandidate(candidate)).await;
            }
            EngineEvent::IceConnectionStateChanged(state) => {
                if self.coordinator.on_ice_state(state) {
                    self.publish_status(state.into());
                    let is_owner = self.is_owner();
                    let action = self.recovery.observe(state, is_owner);
                    self.apply_recovery(action).await;
                }
            }
            EngineEvent::NegotiationNeeded => {
                let owner = self.owner();
                if let Err(err) = self.coordinator.on_negotiation_needed(owner).await {
                    self.negotiation_failed(err);
                }
            }
            EngineEvent::DataChannelOpen(channel) => {
                self.coordinator.on_data_channel_open(channel);
                if !self.channel_open {
                    self.channel_open = true;
                    self.emit(SessionEvent::DataChannelOpened);
                }
            }
            EngineEvent::DataChannelClosed => {
                self.coordinator.on_data_channel_closed();
                self.mark_channel_closed();
            }
            EngineEvent::DataChannelMessage(text) => match PeerMessage::from_text(&text) {
                Ok(message) => self.handle_peer_message(message).await,
                Err(err) => tracing::debug!(
                    target: "parley::session",
                    error = %err,
                    "ignoring malformed data channel message"
                ),
            },
            EngineEvent::RemoteTrack(media) => self.set_remote_media(Some(media)),
            EngineEvent::RemoteTrackRemoved => self.set_remote_media(None),
        }
    }

    async fn handle_peer_message(&mut self, message: PeerMessage) {
        tracing::trace!(target: "parley::session", kind = message.kind(), "peer message");
        match message {
            PeerMessage::Offer {
                sdp,
                ice_restart,
                connection_id,
            } => {
                let offer = RemoteOffer {
                    sdp,
                    ice_restart,
                    connection_id,
                };
                let owner = self.owner();
                match self.coordinator.handle_remote_offer(offer, owner).await {
                    Ok(RemoteOfferOutcome::Answered { rebuilt: true }) => self.after_rebuild(),
                    Ok(_) => {}
                    Err(err) => self.negotiation_failed(err),
                }
            }
            PeerMessage::Answer { sdp } => {
                let owner = self.owner();
                if let Err(err) = self.coordinator.handle_remote_answer(sdp, owner).await {
                    self.negotiation_failed(err);
                }
            }
            PeerMessage::IceCandidate(candidate) => {
                if let Err(err) = self.coordinator.handle_remote_ice_candidate(candidate).await {
                    self.negotiation_failed(err);
                }
            }
            PeerMessage::Message(envelope) => match self.relay.on_receive(&envelope) {
                Ok(received) => {
                    let ack = MessageRelay::ack_for(&received);
                    self.emit(SessionEvent::ChatMessageReceived(received));
                    self.route(ack).await;
                }
                Err(err) => {
                    tracing::warn!(
                        target: "parley::relay",
                        message_id = %envelope.message_id,
                        error = %err,
                        "dropping undecryptable message"
                    );
                    self.emit(SessionEvent::DecryptionFailed {
                        message_id: envelope.message_id,
                        reason: err.to_string(),
                    });
                }
            },
            PeerMessage::Ack { message_id } => {
                if self.relay.on_ack(message_id) {
                    self.emit(SessionEvent::MessageAcknowledged(message_id));
                }
            }
            PeerMessage::Call { action, invite_id } => {
                self.handle_call_message(action, invite_id).await;
            }
        }
    }

    async fn handle_call_message(&mut self, action: CallAction, invite_id: uuid::Uuid) {
        let was_owner = self.is_owner();
        let has_peer = self.coordinator.has_peer_connection();
        let effects = match action {
            CallAction::Invite => Ok(self.call.on_remote_invite(invite_id)),
            CallAction::Accept => Ok(self.call.on_remote_accept(invite_id)),
            CallAction::Decline => Ok(self.call.on_remote_decline(invite_id)),
            CallAction::End => self.call.on_remote_end(invite_id, has_peer),
        };
        match effects {
            Ok(effects) => {
                self.apply_call_effects(effects).await;
                self.call.finish_ending();
            }
            Err(err) => {
                tracing::warn!(
                    target: "parley::call",
                    %action,
                    error = %err,
                    "ignoring call message"
                );
            }
        }
        self.reevaluate_ownership(was_owner).await;
    }

    async fn apply_call_effects(&mut self, effects: Vec<CallEffect>) {
        for effect in effects {
            match effect {
                CallEffect::Send(message) => self.route(message).await,
                CallEffect::AttachLocalVideo => {
                    if let Err(err) = self.coordinator.attach_local_video().await {
                        self.negotiation_failed(err);
                    }
                }
                CallEffect::DetachLocalVideo => {
                    if let Err(err) = self.coordinator.detach_local_video().await {
                        self.negotiation_failed(err);
                    }
                }
                CallEffect::Renegotiate => self.renegotiate().await,
                CallEffect::ClearRemoteMedia => self.set_remote_media(None),
                CallEffect::Notify(notice) => self.emit(match notice {
                    CallNotice::InviteReceived => SessionEvent::VideoInviteReceived,
                    CallNotice::Accepted => SessionEvent::VideoAccepted,
                    CallNotice::Declined => SessionEvent::VideoDeclined,
                    CallNotice::Ended => SessionEvent::VideoEnded,
                }),
            }
        }
    }

    /// Gaining ownership while the connection is degraded means recovery is
    /// now ours to run.
    async fn reevaluate_ownership(&mut self, was_owner: bool) {
        if was_owner || !self.is_owner() {
            return;
        }
        if let Some(state) = self.coordinator.ice_connection_state() {
            if !state.is_connected() {
                let action = self.recovery.observe(state, true);
                self.apply_recovery(action).await;
            }
        }
    }

    async fn renegotiate(&mut self) {
        let owner = self.owner();
        match self.coordinator.request_renegotiation(owner).await {
            Ok(outcome) => {
                tracing::debug!(target: "parley::session", ?outcome, "renegotiation requested");
            }
            Err(NegotiationError::NoPeerConnection) => {}
            Err(err) => self.negotiation_failed(err),
        }
    }

    async fn bootstrap(&mut self) {
        let is_initiator = self.context.role == Role::Host;
        match self.coordinator.ensure_peer_connection(is_initiator).await {
            Ok(true) => {
                self.publish_status(ConnectionStatus::Connecting);
                self.recovery.await_connection();
            }
            Ok(false) => {}
            Err(err) => {
                self.negotiation_failed(err);
                self.coordinator.reset().await;
            }
        }
    }

    async fn apply_recovery(&mut self, action: RecoveryAction) {
        match action {
            RecoveryAction::None => {}
            RecoveryAction::RestartIce => {
                self.publish_status(ConnectionStatus::Reconnecting);
                let owner = self.owner();
                match self.coordinator.restart_ice(owner).await {
                    Ok(outcome) => {
                        tracing::debug!(target: "parley::recovery", ?outcome, "ice restart requested");
                    }
                    Err(err) => {
                        tracing::warn!(
                            target: "parley::recovery",
                            error = %err,
                            "ice restart failed; rebuilding peer connection"
                        );
                        self.full_reset().await;
                    }
                }
            }
            RecoveryAction::FullReset => self.full_reset().await,
        }
    }

    async fn full_reset(&mut self) {
        tracing::warn!(
            target: "parley::session",
            participant = %self.context.participant_id,
            "full peer connection reset"
        );
        let call_in_progress = self.call.reset();
        self.set_remote_media(None);
        self.mark_channel_closed();
        self.coordinator.reset().await;
        self.recovery.reset();
        self.relay.clear();
        self.publish_status(ConnectionStatus::Reconnecting);

        if let Some(invite_id) = call_in_progress {
            self.emit(SessionEvent::VideoEnded);
            self.route(PeerMessage::Call {
                action: CallAction::End,
                invite_id,
            })
            .await;
        }

        if self.context.role == Role::Host {
            match self.coordinator.ensure_peer_connection(true).await {
                Ok(_) if self.peer_present() => self.recovery.await_connection(),
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(
                        target: "parley::session",
                        error = %err,
                        "could not rebuild peer connection"
                    );
                    self.shutdown(EndReason::Unrecoverable(err.to_string()))
                        .await;
                }
            }
        }
    }

    /// The remote side replaced its peer connection and ours was rebuilt
    /// to match.
    fn after_rebuild(&mut self) {
        if self.call.reset().is_some() {
            self.emit(SessionEvent::VideoEnded);
        }
        self.remote_media = None;
        if self.channel_open {
            self.channel_open = false;
            self.emit(SessionEvent::DataChannelClosed);
        }
        self.recovery.reset();
        self.relay.clear();
    }

    fn set_remote_media(&mut self, media: Option<RemoteMedia>) {
        self.coordinator.set_remote_media(media.clone());
        if self.remote_media != media {
            self.remote_media = media.clone();
            self.emit(SessionEvent::RemoteMediaChanged(media));
        }
    }

    fn mark_channel_closed(&mut self) {
        if self.channel_open {
            self.channel_open = false;
            self.emit(SessionEvent::DataChannelClosed);
        }
    }

    fn publish_status(&mut self, status: ConnectionStatus) {
        if self.connection_status != Some(status) {
            self.connection_status = Some(status);
            self.emit(SessionEvent::ConnectionStateChanged(status));
        }
    }

    fn negotiation_failed(&self, err: NegotiationError) {
        tracing::warn!(
            target: "parley::negotiation",
            participant = %self.context.participant_id,
            error = %err,
            "negotiation failed"
        );
        self.emit(SessionEvent::NegotiationFailed(err.to_string()));
    }

    async fn flush_outbox(&mut self) {
        while let Ok(message) = self.outbox.try_recv() {
            self.route(message).await;
        }
    }

    /// Sends over the data channel when it can, otherwise through signaling.
    async fn route(&mut self, message: PeerMessage) {
        let connected = self
            .coordinator
            .ice_connection_state()
            .is_some_and(|state| state.is_connected());
        let kind = message.kind();
        if connected || !message.allows_signaling_fallback() {
            if let Some(channel) = self.coordinator.data_channel() {
                match message.to_text() {
                    Ok(text) => match channel.send_text(text).await {
                        Ok(()) => return,
                        Err(err) => tracing::warn!(
                            target: "parley::session",
                            kind,
                            error = %err,
                            "data channel send failed"
                        ),
                    },
                    Err(err) => {
                        tracing::warn!(target: "parley::session", kind, error = %err, "failed to encode peer message");
                        return;
                    }
                }
            }
        }
        if !message.allows_signaling_fallback() {
            tracing::warn!(target: "parley::session", kind, "no data channel; dropping message");
            return;
        }
        if let Err(err) = self.signaling.send_signal(message) {
            tracing::warn!(
                target: "parley::session",
                kind,
                error = %err,
                "failed to send via signaling"
            );
        }
    }

    async fn shutdown(&mut self, reason: EndReason) {
        if self.ended {
            return;
        }
        self.ended = true;
        tracing::info!(
            target: "parley::session",
            participant = %self.context.participant_id,
            ?reason,
            "ending session"
        );
        self.recovery.reset();
        self.coordinator.reset().await;
        self.signaling.disconnect().await;
        if let Some(forwarder) = self.state_forwarder.take() {
            forwarder.abort();
        }
        self.emit(SessionEvent::SessionEnded(reason));
    }
}
