//! Optional video call layered on an established peer connection.
//!
//! The machine is pure: every transition returns the [`CallEffect`]s the
//! session must carry out (send a control message, touch local media,
//! renegotiate, notify the UI) in order.

use std::fmt;

use uuid::Uuid;

use crate::context::Role;
use crate::error::CallError;
use crate::protocol::{CallAction, PeerMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallState {
    Idle,
    Inviting,
    Invited,
    Active,
    Ending,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CallState::Idle => "idle",
            CallState::Inviting => "inviting",
            CallState::Invited => "invited",
            CallState::Active => "active",
            CallState::Ending => "ending",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallNotice {
    InviteReceived,
    Accepted,
    Declined,
    Ended,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEffect {
    Send(PeerMessage),
    AttachLocalVideo,
    DetachLocalVideo,
    Renegotiate,
    ClearRemoteMedia,
    Notify(CallNotice),
}

pub struct CallStateMachine {
    local_role: Role,
    state: CallState,
    invite_id: Option<Uuid>,
    video_initiator: Option<Role>,
    /// Invite whose accept we already acted on.
    accepted_invite: Option<Uuid>,
}

impl CallStateMachine {
    pub fn new(local_role: Role) -> Self {
        Self {
            local_role,
            state: CallState::Idle,
            invite_id: None,
            video_initiator: None,
            accepted_invite: None,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn invite_id(&self) -> Option<Uuid> {
        self.invite_id
    }

    /// The party that owns renegotiation, while a call is active.
    pub fn video_initiator(&self) -> Option<Role> {
        match self.state {
            CallState::Active => self.video_initiator,
            _ => None,
        }
    }

    fn invalid(&self, action: &'static str) -> CallError {
        CallError::InvalidTransition {
            from: self.state,
            action,
        }
    }

    fn message(action: CallAction, invite_id: Uuid) -> CallEffect {
        CallEffect::Send(PeerMessage::Call { action, invite_id })
    }

    fn transition(&mut self, next: CallState) {
        if self.state != next {
            tracing::info!(
                target: "parley::call",
                role = %self.local_role,
                from = %self.state,
                to = %next,
                "call state changed"
            );
            self.state = next;
        }
    }

    fn clear(&mut self) {
        self.transition(CallState::Idle);
        self.invite_id = None;
        self.video_initiator = None;
    }

    pub fn send_invite(&mut self) -> Result<Vec<CallEffect>, CallError> {
        if self.state != CallState::Idle {
            return Err(self.invalid("send invite"));
        }
        let invite_id = Uuid::new_v4();
        self.invite_id = Some(invite_id);
        self.video_initiator = Some(self.local_role);
        self.transition(CallState::Inviting);
        Ok(vec![Self::message(CallAction::Invite, invite_id)])
    }

    pub fn accept_invite(&mut self, has_peer_connection: bool) -> Result<Vec<CallEffect>, CallError> {
        if self.state != CallState::Invited {
            return Err(self.invalid("accept invite"));
        }
        if !has_peer_connection {
            return Err(CallError::NoPeerConnection);
        }
        let Some(invite_id) = self.invite_id else {
            return Err(self.invalid("accept invite"));
        };
        self.transition(CallState::Active);
        // The inviter owns this round: the renegotiation request below is
        // expected to be a no-op here.
        Ok(vec![
            Self::message(CallAction::Accept, invite_id),
            CallEffect::AttachLocalVideo,
            CallEffect::Renegotiate,
        ])
    }

    pub fn decline_invite(&mut self) -> Result<Vec<CallEffect>, CallError> {
        if self.state != CallState::Invited {
            return Err(self.invalid("decline invite"));
        }
        let Some(invite_id) = self.invite_id else {
            return Err(self.invalid("decline invite"));
        };
        self.clear();
        Ok(vec![Self::message(CallAction::Decline, invite_id)])
    }

    /// Ends an active call or cancels an unanswered invite. An active call
    /// passes through `Ending`; call [`finish_ending`](Self::finish_ending)
    /// once the effects ran.
    pub fn end_call(&mut self, has_peer_connection: bool) -> Result<Vec<CallEffect>, CallError> {
        match self.state {
            CallState::Inviting => {
                let Some(invite_id) = self.invite_id else {
                    return Err(self.invalid("cancel invite"));
                };
                self.clear();
                Ok(vec![Self::message(CallAction::End, invite_id)])
            }
            CallState::Active => {
                if !has_peer_connection {
                    return Err(CallError::NoPeerConnection);
                }
                let invite_id = self.invite_id.unwrap_or_else(Uuid::nil);
                self.transition(CallState::Ending);
                Ok(vec![
                    Self::message(CallAction::End, invite_id),
                    CallEffect::DetachLocalVideo,
                    CallEffect::ClearRemoteMedia,
                    CallEffect::Renegotiate,
                    CallEffect::Notify(CallNotice::Ended),
                ])
            }
            _ => Err(self.invalid("end call")),
        }
    }

    pub fn finish_ending(&mut self) {
        if self.state == CallState::Ending {
            self.clear();
        }
    }

    pub fn on_remote_invite(&mut self, invite_id: Uuid) -> Vec<CallEffect> {
        match self.state {
            CallState::Idle => {
                self.invite_id = Some(invite_id);
                self.video_initiator = Some(self.local_role.peer());
                self.transition(CallState::Invited);
                vec![CallEffect::Notify(CallNotice::InviteReceived)]
            }
            CallState::Inviting if self.local_role == Role::Guest => {
                // Crossed invites: the Host's invite stands.
                tracing::info!(
                    target: "parley::call",
                    "crossed invites; yielding to host invite"
                );
                self.invite_id = Some(invite_id);
                self.video_initiator = Some(Role::Host);
                self.transition(CallState::Invited);
                vec![CallEffect::Notify(CallNotice::InviteReceived)]
            }
            _ => {
                tracing::debug!(
                    target: "parley::call",
                    state = %self.state,
                    %invite_id,
                    "ignoring remote invite"
                );
                Vec::new()
            }
        }
    }

    pub fn on_remote_accept(&mut self, invite_id: Uuid) -> Vec<CallEffect> {
        if self.accepted_invite == Some(invite_id) {
            tracing::debug!(target: "parley::call", %invite_id, "duplicate accept ignored");
            return Vec::new();
        }
        if self.state != CallState::Inviting || self.invite_id != Some(invite_id) {
            tracing::debug!(
                target: "parley::call",
                state = %self.state,
                %invite_id,
                "ignoring unexpected accept"
            );
            return Vec::new();
        }
        self.accepted_invite = Some(invite_id);
        self.transition(CallState::Active);
        vec![
            CallEffect::AttachLocalVideo,
            CallEffect::Renegotiate,
            CallEffect::Notify(CallNotice::Accepted),
        ]
    }

    pub fn on_remote_decline(&mut self, invite_id: Uuid) -> Vec<CallEffect> {
        if self.state != CallState::Inviting || self.invite_id != Some(invite_id) {
            tracing::debug!(target: "parley::call", %invite_id, "ignoring unexpected decline");
            return Vec::new();
        }
        self.clear();
        vec![
            CallEffect::DetachLocalVideo,
            CallEffect::ClearRemoteMedia,
            CallEffect::Notify(CallNotice::Declined),
        ]
    }

    pub fn on_remote_end(
        &mut self,
        invite_id: Uuid,
        has_peer_connection: bool,
    ) -> Result<Vec<CallEffect>, CallError> {
        match self.state {
            CallState::Invited | CallState::Inviting if self.invite_id == Some(invite_id) => {
                self.clear();
                Ok(vec![CallEffect::Notify(CallNotice::Ended)])
            }
            CallState::Active => {
                if !has_peer_connection {
                    return Err(CallError::NoPeerConnection);
                }
                self.transition(CallState::Ending);
                let effects = vec![
                    CallEffect::DetachLocalVideo,
                    CallEffect::ClearRemoteMedia,
                    CallEffect::Renegotiate,
                    CallEffect::Notify(CallNotice::Ended),
                ];
                Ok(effects)
            }
            _ => {
                tracing::debug!(
                    target: "parley::call",
                    state = %self.state,
                    %invite_id,
                    "ignoring remote end"
                );
                Ok(Vec::new())
            }
        }
    }

    /// Drops any call in progress without messaging the peer. Returns the
    /// invite that was in progress, if any.
    pub fn reset(&mut self) -> Option<Uuid> {
        let in_progress = match self.state {
            CallState::Idle => None,
            _ => Some(self.invite_id.unwrap_or_else(Uuid::nil)),
        };
        self.clear();
        in_progress
    }
}
