//! Per-peer session state machine.
//!
//! Pure and synchronous. Every transition returns the [`SessionAction`]s the
//! node must execute (timers, transport teardown, removal); negotiation I/O
//! itself is driven by the node between transitions.
//!
//! ```text
//! Idle ──begin_offer/accept_offer──▶ Negotiating ──established──▶ Connected
//!                                      │  ▲   timeout                │ drop
//!                                      │  └──renegotiate─────────────┤
//!                                      ▼                             ▼
//!                                   Disconnected ◀───────────────────┘
//!                                      │ reconnect timer ──▶ Negotiating
//! any ──close──▶ Closed
//! ```

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::core::backoff::Backoff;
use crate::core::config::{
    MAX_PEER_RECONNECTS, NEGOTIATION_TIMEOUT, PEER_RECONNECT_INITIAL, PEER_RECONNECT_MAX,
};
use crate::core::connection::lane::FrameLane;
use crate::core::identity::PeerId;
use crate::core::session::candidate_queue::CandidateQueue;
use crate::core::signaling::IceCandidate;

pub const PEER_BACKOFF: Backoff =
    Backoff::new(PEER_RECONNECT_INITIAL, PEER_RECONNECT_MAX, MAX_PEER_RECONNECTS);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Negotiating,
    Connected,
    Disconnected,
    Closed,
}

impl ConnectionState {
    /// Negotiating or Connected.
    pub fn is_active(self) -> bool {
        matches!(self, ConnectionState::Negotiating | ConnectionState::Connected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionTimer {
    Negotiation,
    Reconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed on request (hangup, link teardown, superseded).
    Local,
    /// Dropped and not retried: peer unknown or signaling link down.
    NotRetried,
    /// Reconnect budget exhausted.
    Abandoned { attempts: u32 },
}

#[derive(Debug)]
pub enum SessionAction {
    ArmTimer { timer: SessionTimer, delay: Duration },
    CancelTimer(SessionTimer),
    CloseTransport(FrameLane),
    /// The session reached Closed; drop it from the registry.
    Remove { reason: CloseReason },
}

/// What the reconnect decision may consult.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectContext {
    pub peer_known: bool,
    pub link_ready: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectState {
    pub attempts: u32,
    pub pending: bool,
}

#[derive(Debug)]
pub struct PeerSession {
    pub peer_id: PeerId,
    pub role: Role,
    state: ConnectionState,
    epoch: u64,
    candidates: CandidateQueue,
    remote_description_set: bool,
    reconnect: ReconnectState,
    renegotiating: bool,
    lane: Option<FrameLane>,
}

impl PeerSession {
    pub fn new(peer_id: PeerId, role: Role) -> Self {
        Self {
            peer_id,
            role,
            state: ConnectionState::Idle,
            epoch: 0,
            candidates: CandidateQueue::new(),
            remote_description_set: false,
            reconnect: ReconnectState::default(),
            renegotiating: false,
            lane: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    #[cfg(test)]
    pub fn reconnect(&self) -> ReconnectState {
        self.reconnect
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect.pending
    }

    pub fn lane(&self) -> Option<&FrameLane> {
        self.lane.as_ref()
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    /// Negotiating over a transport that is already established.
    pub fn is_renegotiating(&self) -> bool {
        self.renegotiating
    }

    pub fn queued_candidates(&self) -> usize {
        self.candidates.len()
    }

    /// Epoch for the next transport. Events tagged with an older epoch are stale.
    pub fn next_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    /// An own initial offer that has not been answered yet (glare candidate).
    pub fn is_unanswered_offer(&self) -> bool {
        self.state == ConnectionState::Negotiating
            && self.role == Role::Initiator
            && !self.remote_description_set
            && !self.renegotiating
    }

    fn start_negotiating(&mut self, role: Role, lane: FrameLane) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        if let Some(old) = self.lane.replace(lane) {
            actions.push(SessionAction::CloseTransport(old));
        }
        self.role = role;
        self.state = ConnectionState::Negotiating;
        self.renegotiating = false;
        self.remote_description_set = false;
        self.candidates.clear();
        if self.reconnect.pending {
            self.reconnect.pending = false;
            actions.push(SessionAction::CancelTimer(SessionTimer::Reconnect));
        }
        actions.push(SessionAction::ArmTimer {
            timer: SessionTimer::Negotiation,
            delay: NEGOTIATION_TIMEOUT,
        });
        actions
    }

    /// Idle/Disconnected → Negotiating as initiator. The caller creates and
    /// sends the offer on `lane`.
    pub fn begin_offer(&mut self, lane: FrameLane) -> Vec<SessionAction> {
        debug!(event = "session_begin_offer", peer_id = %self.peer_id, epoch = self.epoch, "Starting negotiation");
        self.start_negotiating(Role::Initiator, lane)
    }

    /// Idle/Disconnected → Negotiating as responder. The caller applies the
    /// remote offer, then calls [`Self::on_remote_description_set`] and
    /// answers.
    pub fn accept_offer(&mut self, lane: FrameLane) -> Vec<SessionAction> {
        debug!(event = "session_accept_offer", peer_id = %self.peer_id, epoch = self.epoch, "Accepting offer");
        self.start_negotiating(Role::Responder, lane)
    }

    /// Connected → Negotiating on the existing transport. The reconnect
    /// attempt counter is left alone.
    pub fn renegotiate(&mut self) -> Option<Vec<SessionAction>> {
        if self.state != ConnectionState::Connected {
            return None;
        }
        self.state = ConnectionState::Negotiating;
        self.role = Role::Initiator;
        self.renegotiating = true;
        self.remote_description_set = false;
        Some(vec![SessionAction::ArmTimer {
            timer: SessionTimer::Negotiation,
            delay: NEGOTIATION_TIMEOUT,
        }])
    }

    /// Drop our own pending renegotiation so the remote one can be answered
    /// on the same transport. Negotiating → Connected.
    pub fn yield_renegotiation(&mut self) -> Vec<SessionAction> {
        if self.state != ConnectionState::Negotiating || !self.renegotiating {
            return Vec::new();
        }
        self.state = ConnectionState::Connected;
        self.renegotiating = false;
        vec![SessionAction::CancelTimer(SessionTimer::Negotiation)]
    }

    /// Returns the candidate if it can be applied now; otherwise it is queued.
    pub fn add_candidate(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.remote_description_set {
            Some(candidate)
        } else {
            self.candidates.push(candidate);
            None
        }
    }

    /// Mark the remote description as applied and hand back the queued
    /// candidates in arrival order.
    pub fn on_remote_description_set(&mut self) -> Vec<IceCandidate> {
        self.remote_description_set = true;
        self.candidates.drain()
    }

    /// Negotiating → Connected.
    pub fn on_established(&mut self) -> Vec<SessionAction> {
        if self.state != ConnectionState::Negotiating {
            return Vec::new();
        }
        self.state = ConnectionState::Connected;
        if !std::mem::replace(&mut self.renegotiating, false) {
            self.reconnect.attempts = 0;
        }
        info!(event = "session_connected", peer_id = %self.peer_id, "Peer connected");
        vec![SessionAction::CancelTimer(SessionTimer::Negotiation)]
    }

    /// Negotiating → Disconnected on timer expiry.
    pub fn on_negotiation_timeout(&mut self, ctx: ReconnectContext) -> Vec<SessionAction> {
        if self.state != ConnectionState::Negotiating {
            return Vec::new();
        }
        warn!(event = "negotiation_timeout", peer_id = %self.peer_id, "Negotiation did not complete in time");
        self.disconnect(ctx)
    }

    /// Connected/Negotiating → Disconnected on transport failure.
    pub fn on_transport_failed(&mut self, reason: &str, ctx: ReconnectContext) -> Vec<SessionAction> {
        if !self.state.is_active() {
            return Vec::new();
        }
        warn!(event = "transport_dropped", peer_id = %self.peer_id, reason = %reason, "Peer transport dropped");
        let mut actions = vec![SessionAction::CancelTimer(SessionTimer::Negotiation)];
        actions.extend(self.disconnect(ctx));
        actions
    }

    /// A reconnect attempt could not even build its transport. Counts against
    /// the reconnect budget like any other failed attempt.
    pub fn on_setup_failed(&mut self, reason: &str, ctx: ReconnectContext) -> Vec<SessionAction> {
        if self.state != ConnectionState::Disconnected || self.reconnect.pending {
            return Vec::new();
        }
        warn!(event = "transport_setup_failed", peer_id = %self.peer_id, reason = %reason, "Reconnect attempt failed");
        self.disconnect(ctx)
    }

    fn disconnect(&mut self, ctx: ReconnectContext) -> Vec<SessionAction> {
        self.state = ConnectionState::Disconnected;
        self.renegotiating = false;
        self.remote_description_set = false;
        self.candidates.clear();

        let mut actions = Vec::new();
        if let Some(lane) = self.lane.take() {
            actions.push(SessionAction::CloseTransport(lane));
        }

        if !ctx.peer_known || !ctx.link_ready {
            actions.extend(self.close_with(CloseReason::NotRetried));
            return actions;
        }

        self.reconnect.attempts += 1;
        let attempt = self.reconnect.attempts;
        if !PEER_BACKOFF.allows(attempt) {
            warn!(
                event = "peer_abandoned",
                peer_id = %self.peer_id,
                attempts = attempt - 1,
                "Reconnect budget exhausted"
            );
            actions.extend(self.close_with(CloseReason::Abandoned { attempts: attempt - 1 }));
            return actions;
        }

        let delay = PEER_BACKOFF.delay(attempt);
        info!(
            event = "peer_reconnect_scheduled",
            peer_id = %self.peer_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduling peer reconnect"
        );
        self.reconnect.pending = true;
        actions.push(SessionAction::ArmTimer {
            timer: SessionTimer::Reconnect,
            delay,
        });
        actions
    }

    /// The reconnect timer fired. Returns `true` if the caller should start a
    /// new outbound negotiation; `false` if something else already revived or
    /// closed the session.
    pub fn on_reconnect_timer(&mut self) -> bool {
        let was_pending = std::mem::replace(&mut self.reconnect.pending, false);
        was_pending && self.state == ConnectionState::Disconnected
    }

    /// Any state → Closed. A second call is a no-op.
    pub fn close(&mut self) -> Vec<SessionAction> {
        self.close_with(CloseReason::Local)
    }

    fn close_with(&mut self, reason: CloseReason) -> Vec<SessionAction> {
        if self.state == ConnectionState::Closed {
            return Vec::new();
        }
        self.state = ConnectionState::Closed;
        self.renegotiating = false;
        self.remote_description_set = false;
        self.candidates.clear();
        self.reconnect.pending = false;

        let mut actions = vec![
            SessionAction::CancelTimer(SessionTimer::Negotiation),
            SessionAction::CancelTimer(SessionTimer::Reconnect),
        ];
        if let Some(lane) = self.lane.take() {
            actions.push(SessionAction::CloseTransport(lane));
        }
        actions.push(SessionAction::Remove { reason });
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::transport::testing::RecordingTransport;

    const OPEN: ReconnectContext = ReconnectContext {
        peer_known: true,
        link_ready: true,
    };

    fn lane() -> FrameLane {
        FrameLane::new(RecordingTransport::new())
    }

    fn cand(n: u8) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n}"),
            sdp_mid: None,
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    fn armed(actions: &[SessionAction], which: SessionTimer) -> Vec<Duration> {
        actions
            .iter()
            .filter_map(|a| match a {
                SessionAction::ArmTimer { timer, delay } if *timer == which => Some(*delay),
                _ => None,
            })
            .collect()
    }

    fn removed(actions: &[SessionAction]) -> Option<CloseReason> {
        actions.iter().find_map(|a| match a {
            SessionAction::Remove { reason } => Some(*reason),
            _ => None,
        })
    }

    #[test]
    fn offer_arms_negotiation_timer_and_connects() {
        let mut s = PeerSession::new("bob".into(), Role::Initiator);
        let actions = s.begin_offer(lane());
        assert_eq!(s.state(), ConnectionState::Negotiating);
        assert_eq!(armed(&actions, SessionTimer::Negotiation), vec![NEGOTIATION_TIMEOUT]);

        let actions = s.on_established();
        assert_eq!(s.state(), ConnectionState::Connected);
        assert!(matches!(actions[..], [SessionAction::CancelTimer(SessionTimer::Negotiation)]));
        assert!(s.on_established().is_empty());
    }

    #[test]
    fn early_candidates_replay_once_in_order() {
        let mut s = PeerSession::new("bob".into(), Role::Responder);
        s.accept_offer(lane());
        assert!(s.add_candidate(cand(1)).is_none());
        assert!(s.add_candidate(cand(2)).is_none());
        assert_eq!(s.queued_candidates(), 2);

        let replay: Vec<_> = s.on_remote_description_set().into_iter().map(|c| c.candidate).collect();
        assert_eq!(replay, vec!["candidate:1", "candidate:2"]);
        assert!(s.on_remote_description_set().is_empty());
        assert_eq!(s.add_candidate(cand(3)).map(|c| c.candidate), Some("candidate:3".into()));
    }

    #[test]
    fn timeout_for_known_peer_schedules_exactly_one_reconnect() {
        let mut s = PeerSession::new("bob".into(), Role::Initiator);
        s.begin_offer(lane());
        let actions = s.on_negotiation_timeout(OPEN);

        assert_eq!(s.state(), ConnectionState::Disconnected);
        assert_eq!(armed(&actions, SessionTimer::Reconnect), vec![Duration::from_secs(1)]);
        assert!(actions.iter().any(|a| matches!(a, SessionAction::CloseTransport(_))));
        assert!(removed(&actions).is_none());
        assert!(s.reconnect_pending());
        assert!(s.on_negotiation_timeout(OPEN).is_empty());
    }

    #[test]
    fn timeout_for_unknown_peer_or_closed_link_closes() {
        for ctx in [
            ReconnectContext { peer_known: false, link_ready: true },
            ReconnectContext { peer_known: true, link_ready: false },
        ] {
            let mut s = PeerSession::new("bob".into(), Role::Initiator);
            s.begin_offer(lane());
            let actions = s.on_negotiation_timeout(ctx);
            assert_eq!(s.state(), ConnectionState::Closed);
            assert!(armed(&actions, SessionTimer::Reconnect).is_empty());
            assert_eq!(removed(&actions), Some(CloseReason::NotRetried));
        }
    }

    #[test]
    fn reconnect_budget_is_bounded_with_growing_delay() {
        let mut s = PeerSession::new("bob".into(), Role::Initiator);
        let mut delays = Vec::new();
        for _ in 0..MAX_PEER_RECONNECTS {
            s.begin_offer(lane());
            let actions = s.on_negotiation_timeout(OPEN);
            delays.extend(armed(&actions, SessionTimer::Reconnect));
            assert!(s.on_reconnect_timer());
        }
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_millis(1500),
                Duration::from_millis(2250)
            ]
        );

        s.begin_offer(lane());
        let actions = s.on_negotiation_timeout(OPEN);
        assert_eq!(s.state(), ConnectionState::Closed);
        assert_eq!(
            removed(&actions),
            Some(CloseReason::Abandoned {
                attempts: MAX_PEER_RECONNECTS
            })
        );
    }

    #[test]
    fn connecting_resets_attempts_but_renegotiation_does_not() {
        let mut s = PeerSession::new("bob".into(), Role::Initiator);
        s.begin_offer(lane());
        s.on_negotiation_timeout(OPEN);
        assert_eq!(s.reconnect().attempts, 1);
        assert!(s.on_reconnect_timer());
        s.begin_offer(lane());
        s.on_established();
        assert_eq!(s.reconnect().attempts, 0);

        s.on_transport_failed("ice failed", OPEN);
        assert_eq!(s.reconnect().attempts, 1);
        s.on_reconnect_timer();
        s.begin_offer(lane());
        s.on_remote_description_set();
        s.on_established();

        s.reconnect.attempts = 2;
        let actions = s.renegotiate().unwrap();
        assert_eq!(s.state(), ConnectionState::Negotiating);
        assert_eq!(armed(&actions, SessionTimer::Negotiation), vec![NEGOTIATION_TIMEOUT]);
        assert_eq!(s.reconnect().attempts, 2);
        assert!(s.is_renegotiating());
        assert!(!s.remote_description_set());
        s.on_remote_description_set();
        s.on_established();
        assert_eq!(s.state(), ConnectionState::Connected);
        assert_eq!(s.reconnect().attempts, 2);
        assert!(!s.is_renegotiating());
    }

    #[test]
    fn inbound_offer_supersedes_pending_reconnect() {
        let mut s = PeerSession::new("bob".into(), Role::Initiator);
        s.begin_offer(lane());
        s.on_negotiation_timeout(OPEN);
        let actions = s.accept_offer(lane());
        assert!(actions
            .iter()
            .any(|a| matches!(a, SessionAction::CancelTimer(SessionTimer::Reconnect))));
        assert_eq!(s.role, Role::Responder);
        assert!(!s.on_reconnect_timer());
    }

    #[test]
    fn close_is_idempotent_and_releases_everything() {
        let mut s = PeerSession::new("bob".into(), Role::Initiator);
        s.begin_offer(lane());
        s.add_candidate(cand(1));
        let actions = s.close();
        assert_eq!(s.state(), ConnectionState::Closed);
        assert!(actions.iter().any(|a| matches!(a, SessionAction::CloseTransport(_))));
        assert_eq!(removed(&actions), Some(CloseReason::Local));
        assert_eq!(s.queued_candidates(), 0);
        assert!(s.lane().is_none());
        assert!(s.close().is_empty());
    }

    #[test]
    fn unanswered_offer_detection() {
        let mut s = PeerSession::new("bob".into(), Role::Initiator);
        assert!(!s.is_unanswered_offer());
        s.begin_offer(lane());
        assert!(s.is_unanswered_offer());
        s.on_remote_description_set();
        assert!(!s.is_unanswered_offer());

        s.on_established();
        s.renegotiate().unwrap();
        assert!(!s.is_unanswered_offer());
    }

    #[test]
    fn yielding_renegotiation_keeps_the_transport() {
        let mut s = PeerSession::new("bob".into(), Role::Initiator);
        s.begin_offer(lane());
        s.on_remote_description_set();
        s.on_established();
        assert!(s.yield_renegotiation().is_empty());

        s.renegotiate().unwrap();
        let actions = s.yield_renegotiation();
        assert!(matches!(actions[..], [SessionAction::CancelTimer(SessionTimer::Negotiation)]));
        assert_eq!(s.state(), ConnectionState::Connected);
        assert!(!s.is_renegotiating());
        assert!(s.lane().is_some());
    }

    #[test]
    fn failed_reconnect_setup_spends_an_attempt() {
        let mut s = PeerSession::new("bob".into(), Role::Initiator);
        s.begin_offer(lane());
        s.on_negotiation_timeout(OPEN);
        assert!(s.on_setup_failed("factory down", OPEN).is_empty());

        assert!(s.on_reconnect_timer());
        let actions = s.on_setup_failed("factory down", OPEN);
        assert_eq!(s.reconnect().attempts, 2);
        assert_eq!(armed(&actions, SessionTimer::Reconnect), vec![Duration::from_millis(1500)]);
        assert!(s.reconnect_pending());

        for _ in 2..MAX_PEER_RECONNECTS {
            assert!(s.on_reconnect_timer());
            s.on_setup_failed("factory down", OPEN);
        }
        assert!(s.on_reconnect_timer());
        let actions = s.on_setup_failed("factory down", OPEN);
        assert_eq!(s.state(), ConnectionState::Closed);
        assert_eq!(
            removed(&actions),
            Some(CloseReason::Abandoned {
                attempts: MAX_PEER_RECONNECTS
            })
        );
    }
}
