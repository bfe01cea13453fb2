//! Decides when a degraded peer connection needs an ICE restart or a full
//! rebuild.
//!
//! The monitor never touches the peer connection itself. It is fed ICE
//! states and lifecycle signals by the session actor and answers with a
//! [`RecoveryAction`]. Delayed re-checks are scheduled on the tokio timer
//! and come back into the actor as [`RecoveryTimer`] inputs; each carries a
//! token so a timer armed before a reset or a successful reconnect is
//! recognised as stale and ignored.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::SessionConfig;
use crate::engine::IceConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    None,
    RestartIce,
    FullReset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    GraceExpired,
    ResumeRecheck,
    /// An offer meant to restore connectivity has had a grace window to
    /// take effect.
    ReconnectCheck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryTimer {
    pub token: u64,
    pub kind: TimerKind,
}

pub type TimerSink = Arc<dyn Fn(RecoveryTimer) + Send + Sync>;

pub struct RecoveryMonitor {
    grace_window: Duration,
    resume_recheck_delay: Duration,
    max_ice_restarts: u32,
    restarts_without_connect: u32,
    token: u64,
    timer: Option<JoinHandle<()>>,
    sink: TimerSink,
}

impl RecoveryMonitor {
    pub fn new(config: &SessionConfig, sink: TimerSink) -> Self {
        Self {
            grace_window: config.ice_grace_window,
            resume_recheck_delay: config.resume_recheck_delay,
            max_ice_restarts: config.max_ice_restarts,
            restarts_without_connect: 0,
            token: 0,
            timer: None,
            sink,
        }
    }

    pub fn has_pending_timer(&self) -> bool {
        self.timer.is_some()
    }

    pub fn restarts_without_connect(&self) -> u32 {
        self.restarts_without_connect
    }

    /// Feeds an ICE state change.
    pub fn observe(&mut self, state: IceConnectionState, is_owner: bool) -> RecoveryAction {
        match state {
            IceConnectionState::Connected | IceConnectionState::Completed => {
                self.cancel();
                if self.restarts_without_connect > 0 {
                    tracing::info!(
                        target: "parley::recovery",
                        restarts = self.restarts_without_connect,
                        "connection recovered"
                    );
                }
                self.restarts_without_connect = 0;
                RecoveryAction::None
            }
            IceConnectionState::Disconnected => {
                if !is_owner {
                    tracing::debug!(
                        target: "parley::recovery",
                        "disconnected; waiting for owner to restart"
                    );
                    return RecoveryAction::None;
                }
                if self.timer.is_none() {
                    tracing::info!(
                        target: "parley::recovery",
                        grace_ms = self.grace_window.as_millis() as u64,
                        "ice disconnected; starting grace window"
                    );
                    self.schedule(TimerKind::GraceExpired, self.grace_window);
                }
                RecoveryAction::None
            }
            IceConnectionState::Failed => {
                self.cancel();
                if is_owner {
                    self.escalate()
                } else {
                    RecoveryAction::None
                }
            }
            IceConnectionState::New | IceConnectionState::Checking | IceConnectionState::Closed => {
                RecoveryAction::None
            }
        }
    }

    /// Handles a timer firing. `state` is the current ICE state.
    pub fn on_timer(
        &mut self,
        timer: RecoveryTimer,
        state: Option<IceConnectionState>,
        is_owner: bool,
    ) -> RecoveryAction {
        if timer.token != self.token {
            tracing::trace!(target: "parley::recovery", token = timer.token, "stale timer ignored");
            return RecoveryAction::None;
        }
        self.timer = None;
        let Some(state) = state else {
            return RecoveryAction::None;
        };
        if state.is_connected() || !is_owner {
            return RecoveryAction::None;
        }
        let degraded = match timer.kind {
            TimerKind::GraceExpired => matches!(
                state,
                IceConnectionState::Disconnected | IceConnectionState::Failed
            ),
            TimerKind::ResumeRecheck | TimerKind::ReconnectCheck => {
                !matches!(state, IceConnectionState::Closed)
            }
        };
        if degraded {
            tracing::info!(
                target: "parley::recovery",
                kind = ?timer.kind,
                %state,
                "connection still degraded"
            );
            self.escalate()
        } else {
            RecoveryAction::None
        }
    }

    /// Host application came back to the foreground.
    pub fn on_resume(&mut self, state: IceConnectionState, is_owner: bool) -> RecoveryAction {
        match state {
            IceConnectionState::Connected
            | IceConnectionState::Completed
            | IceConnectionState::Closed => RecoveryAction::None,
            IceConnectionState::Failed => {
                self.cancel();
                if is_owner {
                    self.escalate()
                } else {
                    RecoveryAction::None
                }
            }
            IceConnectionState::New
            | IceConnectionState::Checking
            | IceConnectionState::Disconnected => {
                if !is_owner {
                    return RecoveryAction::None;
                }
                // A snapshot taken right after resume is often transient.
                self.cancel();
                self.schedule(TimerKind::ResumeRecheck, self.resume_recheck_delay);
                RecoveryAction::None
            }
        }
    }

    fn escalate(&mut self) -> RecoveryAction {
        if self.restarts_without_connect >= self.max_ice_restarts {
            tracing::warn!(
                target: "parley::recovery",
                restarts = self.restarts_without_connect,
                "ice restart budget exhausted; escalating to full reset"
            );
            self.restarts_without_connect = 0;
            return RecoveryAction::FullReset;
        }
        self.restarts_without_connect += 1;
        tracing::info!(
            target: "parley::recovery",
            attempt = self.restarts_without_connect,
            "requesting ice restart"
        );
        // The restart offer or its answer can be lost like any other signal.
        self.schedule(TimerKind::ReconnectCheck, self.grace_window);
        RecoveryAction::RestartIce
    }

    /// Arms a check on a freshly rebuilt peer connection: if ICE is not up
    /// within the grace window, recovery escalates as for a failure.
    pub fn await_connection(&mut self) {
        self.schedule(TimerKind::ReconnectCheck, self.grace_window);
    }

    fn schedule(&mut self, kind: TimerKind, delay: Duration) {
        self.cancel();
        let timer = RecoveryTimer {
            token: self.token,
            kind,
        };
        let sink = Arc::clone(&self.sink);
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            sink(timer);
        }));
    }

    /// Cancels any pending timer. Timers already queued become stale.
    pub fn cancel(&mut self) {
        self.token = self.token.wrapping_add(1);
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Forgets all recovery progress, e.g. after a full reset.
    pub fn reset(&mut self) {
        self.cancel();
        self.restarts_without_connect = 0;
    }
}

impl Drop for RecoveryMonitor {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}
