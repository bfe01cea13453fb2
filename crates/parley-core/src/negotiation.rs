//! Offer/answer/ICE exchange for the session's single peer connection.
//!
//! The coordinator owns the one [`PeerConnectionHandle`] a session may
//! have. Every operation runs on the session actor, so the checks on
//! [`NegotiationPhase`] and the signaling state cannot interleave with each
//! other. Outbound negotiation messages are pushed onto an outbox that the
//! actor drains and routes once the current event has been handled.
//!
//! Offer collisions are settled with fixed politeness: the Guest yields
//! (rolls back its own offer and answers), the Host keeps its offer and
//! ignores the colliding one.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::context::{Role, SessionContext};
use crate::engine::{
    DataChannel, EngineEventSink, EventRouter, IceConnectionState, PeerConnection, PeerEngine,
    RemoteMedia, SignalingState,
};
use crate::error::{EngineError, IceApplyError, NegotiationError};
use crate::protocol::{IceCandidate, PeerMessage, SdpKind, SessionDescription};

/// Who may originate the next offer. The Host owns the text channel; while
/// a video call is active its inviter owns renegotiation.
pub fn negotiation_owner(video_initiator: Option<Role>) -> Role {
    video_initiator.unwrap_or(Role::Host)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    Idle,
    CreatingOffer,
    ProcessingRemoteOffer,
    AwaitingAnswer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingAction {
    Renegotiate,
    IceRestart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOfferOutcome {
    Answered { rebuilt: bool },
    DuplicateDropped,
    /// Colliding offer ignored because the local offer wins.
    Ignored,
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferRequestOutcome {
    OfferSent,
    Deferred,
    NotOwner,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOffer {
    pub sdp: String,
    pub ice_restart: bool,
    pub connection_id: Option<Uuid>,
}

pub struct PeerConnectionHandle {
    connection: Arc<dyn PeerConnection>,
    connection_id: Uuid,
    generation: u64,
    signaling_state: SignalingState,
    ice_connection_state: IceConnectionState,
    pending_ice_candidates: VecDeque<IceCandidate>,
    phase: NegotiationPhase,
    pending_action: Option<PendingAction>,
    has_remote_description: bool,
    remote_connection_id: Option<Uuid>,
    last_remote_offer: Option<String>,
    data_channel: Option<Arc<dyn DataChannel>>,
    local_video: bool,
    tracks_dirty: bool,
    remote_media: Option<RemoteMedia>,
}

impl PeerConnectionHandle {
    fn new(connection: Arc<dyn PeerConnection>, generation: u64) -> Self {
        Self {
            connection,
            connection_id: Uuid::new_v4(),
            generation,
            signaling_state: SignalingState::Stable,
            ice_connection_state: IceConnectionState::New,
            pending_ice_candidates: VecDeque::new(),
            phase: NegotiationPhase::Idle,
            pending_action: None,
            has_remote_description: false,
            remote_connection_id: None,
            last_remote_offer: None,
            data_channel: None,
            local_video: false,
            tracks_dirty: false,
            remote_media: None,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.signaling_state
    }

    pub fn ice_connection_state(&self) -> IceConnectionState {
        self.ice_connection_state
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    pub fn pending_action(&self) -> Option<PendingAction> {
        self.pending_action
    }

    pub fn pending_candidate_count(&self) -> usize {
        self.pending_ice_candidates.len()
    }

    pub fn has_remote_description(&self) -> bool {
        self.has_remote_description
    }

    pub fn local_video(&self) -> bool {
        self.local_video
    }

    fn is_idle_and_stable(&self) -> bool {
        self.phase == NegotiationPhase::Idle && self.signaling_state == SignalingState::Stable
    }

    /// Re-reads the engine's state after a failed operation left ours
    /// uncertain.
    fn resync_signaling_state(&mut self) {
        let engine_state = self.connection.signaling_state();
        if engine_state != self.signaling_state {
            tracing::debug!(
                target: "parley::negotiation",
                generation = self.generation,
                tracked = %self.signaling_state,
                engine = %engine_state,
                "resynchronising signaling state"
            );
            self.signaling_state = engine_state;
        }
    }

    async fn start_offer(
        &mut self,
        ice_restart: bool,
        outbox: &mpsc::UnboundedSender<PeerMessage>,
    ) -> Result<(), NegotiationError> {
        self.phase = NegotiationPhase::CreatingOffer;
        let offer = match self.connection.create_offer(ice_restart).await {
            Ok(offer) => offer,
            Err(source) => {
                self.phase = NegotiationPhase::Idle;
                return Err(NegotiationError::Create {
                    kind: SdpKind::Offer,
                    source,
                });
            }
        };
        if let Err(source) = self.connection.set_local_description(offer.clone()).await {
            self.phase = NegotiationPhase::Idle;
            self.resync_signaling_state();
            return Err(NegotiationError::Apply {
                kind: SdpKind::Offer,
                source,
            });
        }
        self.signaling_state = SignalingState::HaveLocalOffer;
        self.phase = NegotiationPhase::AwaitingAnswer;
        self.tracks_dirty = false;
        tracing::info!(
            target: "parley::negotiation",
            generation = self.generation,
            ice_restart,
            "sending offer"
        );
        if outbox
            .send(PeerMessage::Offer {
                sdp: offer.sdp,
                ice_restart,
                connection_id: Some(self.connection_id),
            })
            .is_err()
        {
            tracing::debug!(target: "parley::negotiation", "outbox closed; offer dropped");
        }
        Ok(())
    }

    async fn answer_remote_offer(
        &mut self,
        offer: RemoteOffer,
        outbox: &mpsc::UnboundedSender<PeerMessage>,
    ) -> Result<(), NegotiationError> {
        self.connection
            .set_remote_description(SessionDescription::offer(offer.sdp.clone()))
            .await
            .map_err(|source| NegotiationError::Apply {
                kind: SdpKind::Offer,
                source,
            })?;
        self.signaling_state = SignalingState::HaveRemoteOffer;
        self.has_remote_description = true;
        self.last_remote_offer = Some(offer.sdp.clone());
        if offer.connection_id.is_some() {
            self.remote_connection_id = offer.connection_id;
        }

        let answer =
            self.connection
                .create_answer()
                .await
                .map_err(|source| NegotiationError::Create {
                    kind: SdpKind::Answer,
                    source,
                })?;
        self.connection
            .set_local_description(answer.clone())
            .await
            .map_err(|source| NegotiationError::Apply {
                kind: SdpKind::Answer,
                source,
            })?;
        self.signaling_state = SignalingState::Stable;
        self.tracks_dirty = false;
        tracing::info!(
            target: "parley::negotiation",
            generation = self.generation,
            ice_restart = offer.ice_restart,
            "sending answer"
        );
        if outbox.send(PeerMessage::Answer { sdp: answer.sdp }).is_err() {
            tracing::debug!(target: "parley::negotiation", "outbox closed; answer dropped");
        }
        Ok(())
    }

    async fn apply_candidate(&self, candidate: IceCandidate) {
        let text = candidate.candidate.clone();
        if let Err(source) = self.connection.add_ice_candidate(candidate).await {
            let err = IceApplyError {
                candidate: text,
                source,
            };
            tracing::warn!(
                target: "parley::negotiation",
                generation = self.generation,
                error = %err,
                "ignoring ice candidate"
            );
        }
    }

    async fn flush_pending_candidates(&mut self) {
        if self.pending_ice_candidates.is_empty() {
            return;
        }
        tracing::debug!(
            target: "parley::negotiation",
            generation = self.generation,
            count = self.pending_ice_candidates.len(),
            "flushing queued ice candidates"
        );
        while let Some(candidate) = self.pending_ice_candidates.pop_front() {
            self.apply_candidate(candidate).await;
        }
    }

    /// Runs a deferred offer once the handle is idle and stable again.
    async fn run_pending(
        &mut self,
        is_owner: bool,
        outbox: &mpsc::UnboundedSender<PeerMessage>,
    ) -> Result<(), NegotiationError> {
        if !self.is_idle_and_stable() {
            return Ok(());
        }
        let Some(action) = self.pending_action.take() else {
            return Ok(());
        };
        if !is_owner {
            tracing::debug!(
                target: "parley::negotiation",
                generation = self.generation,
                ?action,
                "dropping deferred offer; no longer negotiation owner"
            );
            return Ok(());
        }
        tracing::debug!(
            target: "parley::negotiation",
            generation = self.generation,
            ?action,
            "running deferred offer"
        );
        self.start_offer(action == PendingAction::IceRestart, outbox)
            .await
    }
}

pub struct NegotiationCoordinator {
    engine: Arc<dyn PeerEngine>,
    context: SessionContext,
    data_channel_label: String,
    router: EventRouter,
    outbox: mpsc::UnboundedSender<PeerMessage>,
    handle: Option<PeerConnectionHandle>,
    next_generation: u64,
}

impl NegotiationCoordinator {
    pub fn new(
        engine: Arc<dyn PeerEngine>,
        context: SessionContext,
        data_channel_label: impl Into<String>,
        router: EventRouter,
        outbox: mpsc::UnboundedSender<PeerMessage>,
    ) -> Self {
        Self {
            engine,
            context,
            data_channel_label: data_channel_label.into(),
            router,
            outbox,
            handle: None,
            next_generation: 0,
        }
    }

    pub fn handle(&self) -> Option<&PeerConnectionHandle> {
        self.handle.as_ref()
    }

    pub fn has_peer_connection(&self) -> bool {
        self.handle.is_some()
    }

    /// True if `generation` belongs to the live peer connection.
    pub fn accepts_generation(&self, generation: u64) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| handle.generation == generation)
    }

    pub fn ice_connection_state(&self) -> Option<IceConnectionState> {
        self.handle.as_ref().map(|handle| handle.ice_connection_state)
    }

    /// The data channel, if it is open.
    pub fn data_channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.handle
            .as_ref()
            .and_then(|handle| handle.data_channel.as_ref())
            .filter(|channel| channel.is_open())
            .cloned()
    }

    pub fn remote_media(&self) -> Option<&RemoteMedia> {
        self.handle
            .as_ref()
            .and_then(|handle| handle.remote_media.as_ref())
    }

    fn is_polite(&self) -> bool {
        self.context.role == Role::Guest
    }

    fn is_owner(&self, owner: Role) -> bool {
        self.context.role == owner
    }

    async fn create_handle(&mut self) -> Result<(), NegotiationError> {
        self.next_generation += 1;
        let generation = self.next_generation;
        let sink = EngineEventSink::new(generation, Arc::clone(&self.router));
        let connection = self
            .engine
            .create_peer_connection(sink)
            .await
            .map_err(NegotiationError::Setup)?;
        tracing::info!(
            target: "parley::negotiation",
            participant = %self.context.participant_id,
            role = %self.context.role,
            generation,
            "peer connection created"
        );
        self.handle = Some(PeerConnectionHandle::new(connection, generation));
        Ok(())
    }

    /// Creates the peer connection if there is none. The initiator also opens
    /// the data channel and sends the first offer. Returns whether a new
    /// connection was created.
    pub async fn ensure_peer_connection(
        &mut self,
        is_initiator: bool,
    ) -> Result<bool, NegotiationError> {
        if self.handle.is_some() {
            return Ok(false);
        }
        self.create_handle().await?;
        if !is_initiator {
            return Ok(true);
        }

        let label = self.data_channel_label.clone();
        let Some(handle) = self.handle.as_mut() else {
            return Err(NegotiationError::NoPeerConnection);
        };
        let channel = handle
            .connection
            .create_data_channel(&label)
            .await
            .map_err(NegotiationError::Setup)?;
        handle.data_channel = Some(channel);
        handle.start_offer(false, &self.outbox).await?;
        Ok(true)
    }

    pub async fn handle_remote_offer(
        &mut self,
        offer: RemoteOffer,
        owner: Role,
    ) -> Result<RemoteOfferOutcome, NegotiationError> {
        let mut rebuilt = false;
        let replaced = match (&self.handle, offer.connection_id) {
            (Some(handle), Some(incoming)) => handle
                .remote_connection_id
                .is_some_and(|known| known != incoming),
            _ => false,
        };
        if replaced {
            tracing::info!(
                target: "parley::negotiation",
                participant = %self.context.participant_id,
                "remote peer connection replaced; rebuilding"
            );
            self.reset().await;
            rebuilt = true;
        }
        if self.handle.is_none() {
            self.create_handle().await?;
        }

        let polite = self.is_polite();
        let is_owner = self.is_owner(owner);
        let Some(handle) = self.handle.as_mut() else {
            return Err(NegotiationError::NoPeerConnection);
        };

        // The same offer can arrive over both the data channel and signaling.
        if handle.phase == NegotiationPhase::ProcessingRemoteOffer
            || handle.last_remote_offer.as_deref() == Some(offer.sdp.as_str())
        {
            tracing::debug!(
                target: "parley::negotiation",
                generation = handle.generation,
                "offer already applied; dropping duplicate"
            );
            return Ok(RemoteOfferOutcome::DuplicateDropped);
        }

        let mut rollback_failed = false;

        if handle.signaling_state == SignalingState::HaveLocalOffer {
            if !polite {
                tracing::info!(
                    target: "parley::negotiation",
                    generation = handle.generation,
                    "offer collision; keeping local offer"
                );
                return Ok(RemoteOfferOutcome::Ignored);
            }
            tracing::info!(
                target: "parley::negotiation",
                generation = handle.generation,
                "offer collision; rolling back local offer"
            );
            match handle
                .connection
                .set_local_description(SessionDescription::rollback())
                .await
            {
                Ok(()) => {
                    handle.signaling_state = SignalingState::Stable;
                    handle.phase = NegotiationPhase::Idle;
                    if handle.pending_action.is_none() {
                        handle.pending_action = Some(PendingAction::Renegotiate);
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        target: "parley::negotiation",
                        generation = handle.generation,
                        error = %err,
                        "rollback failed; continuing with remote offer"
                    );
                    handle.phase = NegotiationPhase::Idle;
                    rollback_failed = true;
                }
            }
        }

        if !matches!(
            handle.signaling_state,
            SignalingState::Stable | SignalingState::HaveLocalOffer
        ) {
            tracing::debug!(
                target: "parley::negotiation",
                generation = handle.generation,
                signaling_state = %handle.signaling_state,
                "deferring remote offer"
            );
            return Ok(RemoteOfferOutcome::Deferred);
        }

        let retry = rollback_failed.then(|| offer.clone());
        handle.phase = NegotiationPhase::ProcessingRemoteOffer;
        let result = handle.answer_remote_offer(offer, &self.outbox).await;
        handle.phase = NegotiationPhase::Idle;
        if let Err(err) = result {
            handle.resync_signaling_state();
            let Some(offer) = retry else {
                return Err(err);
            };
            // Our own offer is stuck in place and the remote side ignored it,
            // so neither end would ever return to stable.
            tracing::warn!(
                target: "parley::negotiation",
                generation = handle.generation,
                error = %err,
                "collision unresolved; answering on a fresh peer connection"
            );
            return self.answer_on_fresh_connection(offer).await;
        }
        handle.flush_pending_candidates().await;
        handle.run_pending(is_owner, &self.outbox).await?;
        Ok(RemoteOfferOutcome::Answered { rebuilt })
    }

    async fn answer_on_fresh_connection(
        &mut self,
        offer: RemoteOffer,
    ) -> Result<RemoteOfferOutcome, NegotiationError> {
        self.reset().await;
        self.create_handle().await?;
        let Some(handle) = self.handle.as_mut() else {
            return Err(NegotiationError::NoPeerConnection);
        };
        handle.phase = NegotiationPhase::ProcessingRemoteOffer;
        let result = handle.answer_remote_offer(offer, &self.outbox).await;
        handle.phase = NegotiationPhase::Idle;
        if let Err(err) = result {
            handle.resync_signaling_state();
            return Err(err);
        }
        Ok(RemoteOfferOutcome::Answered { rebuilt: true })
    }

    /// Applies an answer to our outstanding offer. Returns `false` when the
    /// answer was stray or duplicate.
    pub async fn handle_remote_answer(
        &mut self,
        sdp: String,
        owner: Role,
    ) -> Result<bool, NegotiationError> {
        let is_owner = self.is_owner(owner);
        let Some(handle) = self.handle.as_mut() else {
            tracing::debug!(target: "parley::negotiation", "answer without peer connection ignored");
            return Ok(false);
        };
        if handle.signaling_state != SignalingState::HaveLocalOffer {
            tracing::debug!(
                target: "parley::negotiation",
                generation = handle.generation,
                signaling_state = %handle.signaling_state,
                "ignoring stray answer"
            );
            return Ok(false);
        }

        if let Err(source) = handle
            .connection
            .set_remote_description(SessionDescription::answer(sdp))
            .await
        {
            handle.phase = NegotiationPhase::Idle;
            handle.resync_signaling_state();
            return Err(NegotiationError::Apply {
                kind: SdpKind::Answer,
                source,
            });
        }
        handle.signaling_state = SignalingState::Stable;
        handle.phase = NegotiationPhase::Idle;
        handle.has_remote_description = true;
        tracing::debug!(
            target: "parley::negotiation",
            generation = handle.generation,
            "answer applied"
        );
        handle.flush_pending_candidates().await;
        handle.run_pending(is_owner, &self.outbox).await?;
        Ok(true)
    }

    pub async fn handle_remote_ice_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<(), NegotiationError> {
        if self.handle.is_none() {
            self.create_handle().await?;
        }
        let Some(handle) = self.handle.as_mut() else {
            return Err(NegotiationError::NoPeerConnection);
        };
        if !handle.has_remote_description {
            handle.pending_ice_candidates.push_back(candidate);
            tracing::trace!(
                target: "parley::negotiation",
                generation = handle.generation,
                queued = handle.pending_ice_candidates.len(),
                "queued ice candidate until remote description"
            );
            return Ok(());
        }
        handle.apply_candidate(candidate).await;
        Ok(())
    }

    pub async fn request_renegotiation(
        &mut self,
        owner: Role,
    ) -> Result<OfferRequestOutcome, NegotiationError> {
        let is_owner = self.is_owner(owner);
        let Some(handle) = self.handle.as_mut() else {
            return Err(NegotiationError::NoPeerConnection);
        };
        if !is_owner {
            tracing::debug!(
                target: "parley::negotiation",
                generation = handle.generation,
                %owner,
                "not negotiation owner; waiting for remote offer"
            );
            return Ok(OfferRequestOutcome::NotOwner);
        }
        if !handle.is_idle_and_stable() {
            tracing::debug!(
                target: "parley::negotiation",
                generation = handle.generation,
                phase = ?handle.phase,
                signaling_state = %handle.signaling_state,
                "negotiation busy; deferring offer"
            );
            if handle.pending_action != Some(PendingAction::IceRestart) {
                handle.pending_action = Some(PendingAction::Renegotiate);
            }
            return Ok(OfferRequestOutcome::Deferred);
        }
        handle.start_offer(false, &self.outbox).await?;
        Ok(OfferRequestOutcome::OfferSent)
    }

    /// Reacts to the engine's negotiation-needed signal. Only local track
    /// changes that no offer has carried yet are worth an offer.
    pub async fn on_negotiation_needed(
        &mut self,
        owner: Role,
    ) -> Result<OfferRequestOutcome, NegotiationError> {
        let dirty = self
            .handle
            .as_ref()
            .is_some_and(|handle| handle.tracks_dirty);
        if !self.is_owner(owner) || !dirty {
            tracing::trace!(
                target: "parley::negotiation",
                dirty,
                "negotiation-needed ignored"
            );
            return Ok(OfferRequestOutcome::NotOwner);
        }
        self.request_renegotiation(owner).await
    }

    /// Sends an offer flagged as an ICE restart. An unanswered offer is
    /// superseded, since its answer was likely lost with the connection.
    pub async fn restart_ice(&mut self, owner: Role) -> Result<OfferRequestOutcome, NegotiationError> {
        let is_owner = self.is_owner(owner);
        let Some(handle) = self.handle.as_mut() else {
            return Err(NegotiationError::NoPeerConnection);
        };
        if !is_owner {
            return Ok(OfferRequestOutcome::NotOwner);
        }
        if matches!(
            handle.phase,
            NegotiationPhase::CreatingOffer | NegotiationPhase::ProcessingRemoteOffer
        ) || handle.signaling_state == SignalingState::HaveRemoteOffer
        {
            handle.pending_action = Some(PendingAction::IceRestart);
            return Ok(OfferRequestOutcome::Deferred);
        }
        handle
            .connection
            .restart_ice()
            .await
            .map_err(NegotiationError::IceRestart)?;
        tracing::info!(
            target: "parley::negotiation",
            generation = handle.generation,
            "restarting ice"
        );
        handle.pending_action = None;
        handle.start_offer(true, &self.outbox).await?;
        Ok(OfferRequestOutcome::OfferSent)
    }

    pub async fn attach_local_video(&mut self) -> Result<(), NegotiationError> {
        let Some(handle) = self.handle.as_mut() else {
            return Err(NegotiationError::NoPeerConnection);
        };
        if handle.local_video {
            return Ok(());
        }
        handle
            .connection
            .attach_local_video()
            .await
            .map_err(NegotiationError::Media)?;
        handle.local_video = true;
        handle.tracks_dirty = true;
        Ok(())
    }

    pub async fn detach_local_video(&mut self) -> Result<(), NegotiationError> {
        let Some(handle) = self.handle.as_mut() else {
            return Err(NegotiationError::NoPeerConnection);
        };
        if !handle.local_video {
            return Ok(());
        }
        handle
            .connection
            .detach_local_video()
            .await
            .map_err(NegotiationError::Media)?;
        handle.local_video = false;
        handle.tracks_dirty = true;
        Ok(())
    }

    /// Records a new ICE state. Returns `true` if it differs from the last one.
    pub fn on_ice_state(&mut self, state: IceConnectionState) -> bool {
        let Some(handle) = self.handle.as_mut() else {
            return false;
        };
        if handle.ice_connection_state == state {
            return false;
        }
        tracing::info!(
            target: "parley::negotiation",
            generation = handle.generation,
            from = %handle.ice_connection_state,
            to = %state,
            "ice connection state changed"
        );
        handle.ice_connection_state = state;
        true
    }

    pub fn on_data_channel_open(&mut self, channel: Arc<dyn DataChannel>) {
        if let Some(handle) = self.handle.as_mut() {
            tracing::info!(
                target: "parley::negotiation",
                generation = handle.generation,
                label = channel.label(),
                "data channel open"
            );
            handle.data_channel = Some(channel);
        }
    }

    pub fn on_data_channel_closed(&mut self) -> bool {
        match self.handle.as_mut() {
            Some(handle) => handle.data_channel.take().is_some(),
            None => false,
        }
    }

    /// Returns `true` if the remote media changed.
    pub fn set_remote_media(&mut self, media: Option<RemoteMedia>) -> bool {
        let Some(handle) = self.handle.as_mut() else {
            return false;
        };
        if handle.remote_media == media {
            return false;
        }
        handle.remote_media = media;
        true
    }

    /// Closes and discards the peer connection along with every queue and
    /// flag attached to it.
    pub async fn reset(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        tracing::info!(
            target: "parley::negotiation",
            generation = handle.generation,
            queued_candidates = handle.pending_ice_candidates.len(),
            "closing peer connection"
        );
        if let Some(channel) = handle.data_channel.as_ref() {
            channel.close().await;
        }
        if let Err(err) = handle.connection.close().await {
            log_close_error(handle.generation, &err);
        }
    }
}

fn log_close_error(generation: u64, err: &EngineError) {
    tracing::debug!(
        target: "parley::negotiation",
        generation,
        error = %err,
        "peer connection close failed"
    );
}
