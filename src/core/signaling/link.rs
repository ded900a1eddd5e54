//! Reconnecting control channel to the relay.
//!
//! Sync state machine; the node executes the returned [`LinkAction`]s. Each
//! socket attempt gets a generation number so that a late report from an
//! abandoned socket cannot disturb the current one.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::core::backoff::Backoff;
use crate::core::config::{CLOSE_NORMAL, LINK_RECONNECT_INITIAL, LINK_RECONNECT_MAX, MAX_LINK_RECONNECTS};
use crate::core::error::CallError;
use crate::core::identity::PeerId;
use crate::core::signaling::envelope::SignalingEnvelope;

pub const LINK_BACKOFF: Backoff =
    Backoff::new(LINK_RECONNECT_INITIAL, LINK_RECONNECT_MAX, MAX_LINK_RECONNECTS);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    /// Socket open, `register` sent, waiting for `registered`.
    Open,
    Ready,
    /// Reconnect budget exhausted; only a manual `connect` revives it.
    Failed,
}

#[derive(Debug, PartialEq)]
pub enum LinkAction {
    OpenSocket { generation: u64 },
    CloseSocket,
    Send(SignalingEnvelope),
    ArmReconnect(Duration),
    CancelReconnect,
    /// Close every peer session.
    TearDownSessions,
    /// Registered; proceed with these queued call intents.
    Ready(Vec<PeerId>),
    Fatal(CallError),
}

#[derive(Debug)]
pub struct SignalingLink {
    local: PeerId,
    state: LinkState,
    attempts: u32,
    generation: u64,
    user_closed: bool,
    queued: Vec<PeerId>,
}

impl SignalingLink {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            state: LinkState::Disconnected,
            attempts: 0,
            generation: 0,
            user_closed: false,
            queued: Vec::new(),
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    #[cfg(test)]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_ready(&self) -> bool {
        self.state == LinkState::Ready
    }

    /// Whether envelopes can be written to the socket.
    pub fn is_open(&self) -> bool {
        matches!(self.state, LinkState::Open | LinkState::Ready)
    }

    /// Open the link. A no-op while open or mid-connect.
    pub fn connect(&mut self) -> Vec<LinkAction> {
        match self.state {
            LinkState::Connecting | LinkState::Open | LinkState::Ready => {
                debug!(event = "link_connect_ignored", state = ?self.state, "Link already up or connecting");
                Vec::new()
            }
            LinkState::Failed | LinkState::Disconnected => {
                if self.state == LinkState::Failed {
                    self.attempts = 0;
                }
                self.user_closed = false;
                self.state = LinkState::Connecting;
                self.generation += 1;
                vec![
                    LinkAction::CancelReconnect,
                    LinkAction::OpenSocket {
                        generation: self.generation,
                    },
                ]
            }
        }
    }

    pub fn on_open(&mut self, generation: u64) -> Vec<LinkAction> {
        if generation != self.generation || self.state != LinkState::Connecting {
            return Vec::new();
        }
        info!(event = "link_open", generation, "Signaling socket open, registering");
        self.state = LinkState::Open;
        self.attempts = 0;
        vec![LinkAction::Send(SignalingEnvelope::register(&self.local))]
    }

    pub fn on_registered(&mut self) -> Vec<LinkAction> {
        if self.state != LinkState::Open {
            return Vec::new();
        }
        info!(event = "link_ready", peer_id = %self.local, "Registered with relay");
        self.state = LinkState::Ready;
        vec![LinkAction::Ready(std::mem::take(&mut self.queued))]
    }

    /// Hold a call intent until the link is registered. Returns `false` if
    /// the link is already ready and the caller should proceed directly.
    pub fn queue_intent(&mut self, peer_id: &PeerId) -> bool {
        if self.is_ready() {
            return false;
        }
        if !self.queued.contains(peer_id) {
            self.queued.push(peer_id.clone());
        }
        true
    }

    /// The socket of `generation` went away. `code` is the close code, if
    /// the relay sent one.
    pub fn on_close(&mut self, generation: u64, code: Option<u16>) -> Vec<LinkAction> {
        if generation != self.generation {
            return Vec::new();
        }
        if !matches!(self.state, LinkState::Connecting | LinkState::Open | LinkState::Ready) {
            return Vec::new();
        }
        self.state = LinkState::Disconnected;
        let mut actions = vec![LinkAction::TearDownSessions];

        if self.user_closed || code == Some(CLOSE_NORMAL) {
            info!(event = "link_closed", code = ?code, "Signaling link closed cleanly");
            return actions;
        }

        self.attempts += 1;
        if !LINK_BACKOFF.allows(self.attempts) {
            let attempts = self.attempts - 1;
            error!(event = "link_unavailable", attempts, "Signaling relay unreachable, giving up");
            self.state = LinkState::Failed;
            self.queued.clear();
            actions.push(LinkAction::Fatal(CallError::LinkUnavailable { attempts }));
            return actions;
        }

        let delay = LINK_BACKOFF.delay(self.attempts);
        warn!(
            event = "link_dropped",
            code = ?code,
            attempt = self.attempts,
            delay_ms = delay.as_millis() as u64,
            "Signaling link dropped, reconnecting"
        );
        actions.push(LinkAction::ArmReconnect(delay));
        actions
    }

    pub fn on_reconnect_timer(&mut self) -> Vec<LinkAction> {
        if self.state != LinkState::Disconnected || self.user_closed {
            return Vec::new();
        }
        self.connect()
    }

    /// User-initiated shutdown. No reconnect follows.
    pub fn disconnect(&mut self) -> Vec<LinkAction> {
        self.user_closed = true;
        self.queued.clear();
        let was_up = matches!(self.state, LinkState::Connecting | LinkState::Open | LinkState::Ready);
        self.state = LinkState::Disconnected;
        self.generation += 1;
        let mut actions = vec![LinkAction::CancelReconnect];
        if was_up {
            actions.push(LinkAction::CloseSocket);
            actions.push(LinkAction::TearDownSessions);
        }
        actions
    }
}
