//! Owns every [`PeerSession`], at most one per peer, and decides where an
//! inbound signaling envelope goes.

use std::collections::HashMap;

use tracing::warn;

use crate::core::error::CallError;
use crate::core::identity::PeerId;
use crate::core::session::peer::{ConnectionState, PeerSession, Role, SessionAction};
use crate::core::signaling::{SignalKind, SignalingEnvelope};

/// Where an inbound envelope is handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// `registered`: the link itself.
    Link,
    /// Presence notifications.
    Presence,
    /// An existing session for this peer.
    Session(PeerId),
    /// An offer from a peer with no session yet.
    NewInbound(PeerId),
    /// `call-*` signals, handled by call policy.
    CallPolicy(PeerId),
    Drop,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<PeerId, PeerSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&PeerSession> {
        self.sessions.get(peer_id)
    }

    pub fn get_mut(&mut self, peer_id: &PeerId) -> Option<&mut PeerSession> {
        self.sessions.get_mut(peer_id)
    }

    pub fn state(&self, peer_id: &PeerId) -> Option<ConnectionState> {
        self.sessions.get(peer_id).map(PeerSession::state)
    }

    fn create(&mut self, peer_id: &PeerId, role: Role) -> Result<&mut PeerSession, CallError> {
        if let Some(state) = self.state(peer_id) {
            if state.is_active() {
                return Err(CallError::SessionActive {
                    peer_id: peer_id.clone(),
                    state,
                });
            }
        }
        let session = self
            .sessions
            .entry(peer_id.clone())
            .or_insert_with(|| PeerSession::new(peer_id.clone(), role));
        session.role = role;
        Ok(session)
    }

    /// Session for a local call intent. An existing Idle or Disconnected
    /// session is reused (keeping its reconnect counter).
    pub fn create_outbound(&mut self, peer_id: &PeerId) -> Result<&mut PeerSession, CallError> {
        self.create(peer_id, Role::Initiator)
    }

    /// Session for an inbound offer.
    pub fn create_inbound(&mut self, peer_id: &PeerId) -> Result<&mut PeerSession, CallError> {
        self.create(peer_id, Role::Responder)
    }

    /// Close and remove the session. Unknown peers and repeated calls are no-ops.
    pub fn close(&mut self, peer_id: &PeerId) -> Vec<SessionAction> {
        match self.sessions.remove(peer_id) {
            Some(mut session) => session.close(),
            None => Vec::new(),
        }
    }

    /// Drop a session that already reached Closed.
    pub fn remove(&mut self, peer_id: &PeerId) {
        self.sessions.remove(peer_id);
    }

    /// Close every session (link teardown). Returns `(peer, actions)` pairs.
    pub fn close_all(&mut self) -> Vec<(PeerId, Vec<SessionAction>)> {
        self.sessions
            .drain()
            .map(|(peer, mut session)| {
                let actions = session.close();
                (peer, actions)
            })
            .collect()
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<_> = self
            .sessions
            .values()
            .filter(|s| s.state() == ConnectionState::Connected)
            .map(|s| s.peer_id.clone())
            .collect();
        peers.sort();
        peers
    }

    #[cfg(test)]
    pub fn active_count(&self) -> usize {
        self.sessions.values().filter(|s| s.state().is_active()).count()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Decide where `envelope` goes.
    pub fn route(&self, envelope: &SignalingEnvelope) -> Route {
        let kind = &envelope.kind;
        match kind {
            SignalKind::Registered => return Route::Link,
            SignalKind::UserList
            | SignalKind::UserJoined
            | SignalKind::UserOnline
            | SignalKind::UserLeft => return Route::Presence,
            _ if !kind.is_peer_directed() => {
                warn!(event = "envelope_unexpected_type", kind = %kind.as_str(), "Ignoring envelope");
                return Route::Drop;
            }
            _ => {}
        }

        let Some(sender) = envelope.sender() else {
            warn!(event = "envelope_missing_sender", kind = %kind.as_str(), "Peer-directed envelope without sender");
            return Route::Drop;
        };

        match kind {
            SignalKind::CallRequest
            | SignalKind::CallAccepted
            | SignalKind::CallRejected
            | SignalKind::CallBusy => Route::CallPolicy(sender.clone()),
            SignalKind::Offer if !self.sessions.contains_key(sender) => Route::NewInbound(sender.clone()),
            _ if self.sessions.contains_key(sender) => Route::Session(sender.clone()),
            _ => {
                warn!(
                    event = "envelope_unknown_peer",
                    kind = %kind.as_str(),
                    peer_id = %sender,
                    "Dropping envelope for a peer without a session"
                );
                Route::Drop
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::lane::FrameLane;
    use crate::core::connection::transport::testing::RecordingTransport;
    use serde_json::json;

    fn lane() -> FrameLane {
        FrameLane::new(RecordingTransport::new())
    }

    fn from(kind: SignalKind, sender: &str) -> SignalingEnvelope {
        let mut env = SignalingEnvelope::new(kind, json!({ "target": "me" }));
        env.from = Some(sender.into());
        env
    }

    #[test]
    fn rejects_second_active_session() {
        let mut reg = SessionRegistry::new();
        let bob: PeerId = "bob".into();
        reg.create_outbound(&bob).unwrap().begin_offer(lane());

        let err = reg.create_outbound(&bob).unwrap_err();
        assert_eq!(
            err,
            CallError::SessionActive {
                peer_id: "bob".into(),
                state: ConnectionState::Negotiating
            }
        );
        assert!(reg.create_inbound(&bob).is_err());
        assert_eq!(reg.active_count(), 1);

        reg.get_mut(&bob).unwrap().on_established();
        assert!(reg.create_inbound(&bob).is_err());
        assert_eq!(reg.connected_peers(), vec![bob.clone()]);
    }

    #[test]
    fn disconnected_session_is_reused_with_its_counter() {
        let mut reg = SessionRegistry::new();
        let bob: PeerId = "bob".into();
        let s = reg.create_outbound(&bob).unwrap();
        s.begin_offer(lane());
        s.on_negotiation_timeout(crate::core::session::ReconnectContext {
            peer_known: true,
            link_ready: true,
        });

        let s = reg.create_inbound(&bob).unwrap();
        assert_eq!(s.state(), ConnectionState::Disconnected);
        assert_eq!(s.role, Role::Responder);
        assert_eq!(s.reconnect().attempts, 1);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn close_removes_and_is_idempotent() {
        let mut reg = SessionRegistry::new();
        let bob: PeerId = "bob".into();
        reg.create_outbound(&bob).unwrap().begin_offer(lane());
        assert!(!reg.close(&bob).is_empty());
        assert!(reg.get(&bob).is_none());
        assert!(reg.close(&bob).is_empty());
        assert!(reg.create_outbound(&bob).is_ok());
    }

    #[test]
    fn routes_by_type_and_sender() {
        let mut reg = SessionRegistry::new();
        let bob: PeerId = "bob".into();

        assert_eq!(reg.route(&SignalingEnvelope::new(SignalKind::Registered, json!({}))), Route::Link);
        assert_eq!(reg.route(&from(SignalKind::UserJoined, "bob")), Route::Presence);
        assert_eq!(reg.route(&from(SignalKind::Offer, "bob")), Route::NewInbound(bob.clone()));
        assert_eq!(reg.route(&from(SignalKind::Answer, "bob")), Route::Drop);
        assert_eq!(reg.route(&from(SignalKind::IceCandidate, "bob")), Route::Drop);
        assert_eq!(reg.route(&from(SignalKind::CallRequest, "bob")), Route::CallPolicy(bob.clone()));

        reg.create_outbound(&bob).unwrap();
        assert_eq!(reg.route(&from(SignalKind::Answer, "bob")), Route::Session(bob.clone()));
        assert_eq!(reg.route(&from(SignalKind::Offer, "bob")), Route::Session(bob.clone()));
    }

    #[test]
    fn peer_directed_without_sender_is_dropped() {
        let reg = SessionRegistry::new();
        let env = SignalingEnvelope::new(SignalKind::Offer, json!({ "target": "me" }));
        assert_eq!(reg.route(&env), Route::Drop);
        let env = SignalingEnvelope::new(SignalKind::Unknown("x".into()), json!({}));
        assert_eq!(reg.route(&env), Route::Drop);
    }
}
