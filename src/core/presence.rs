//! Online set reported by the relay, reconciled against the known-peer set
//! and the live sessions.

use std::collections::HashSet;

use tracing::debug;

use crate::core::identity::PeerId;
use crate::core::peer_registry::KnownPeers;
use crate::core::session::SessionRegistry;
use crate::core::signaling::envelope::{SignalKind, SignalingEnvelope, UserListPayload};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceChange {
    Online(Vec<PeerId>),
    Offline(PeerId),
    None,
}

#[derive(Debug, Default)]
pub struct Presence {
    online: HashSet<PeerId>,
    /// Peers whose reconnect budget ran out. Skipped by the periodic pass
    /// until a fresh presence event or a manual call.
    abandoned: HashSet<PeerId>,
}

impl Presence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn online(&self) -> Vec<PeerId> {
        let mut peers: Vec<_> = self.online.iter().cloned().collect();
        peers.sort();
        peers
    }

    pub fn mark_abandoned(&mut self, peer_id: &PeerId) {
        self.abandoned.insert(peer_id.clone());
    }

    pub fn clear_abandoned(&mut self, peer_id: &PeerId) {
        self.abandoned.remove(peer_id);
    }

    /// Relay lost: nobody is known to be online any more.
    pub fn reset(&mut self) {
        self.online.clear();
    }

    pub fn apply(&mut self, envelope: &SignalingEnvelope, local: &PeerId) -> PresenceChange {
        match envelope.kind {
            SignalKind::UserList => {
                let users = envelope
                    .payload_as::<UserListPayload>()
                    .map(|p| p.users)
                    .unwrap_or_default();
                self.online = users.into_iter().filter(|u| u != local).collect();
                for peer in &self.online {
                    self.abandoned.remove(peer);
                }
                PresenceChange::Online(self.online())
            }
            SignalKind::UserJoined | SignalKind::UserOnline => match envelope.sender() {
                Some(peer) if peer != local => {
                    self.online.insert(peer.clone());
                    self.abandoned.remove(peer);
                    PresenceChange::Online(vec![peer.clone()])
                }
                _ => PresenceChange::None,
            },
            SignalKind::UserLeft => match envelope.sender() {
                Some(peer) => {
                    self.online.remove(peer);
                    PresenceChange::Offline(peer.clone())
                }
                None => PresenceChange::None,
            },
            _ => PresenceChange::None,
        }
    }

    /// Known online peers that need an outbound session: no session, or one
    /// that is neither negotiating, connected nor waiting on a reconnect.
    pub fn reconcile(&self, known: &dyn KnownPeers, sessions: &SessionRegistry) -> Vec<PeerId> {
        let mut due: Vec<PeerId> = self
            .online
            .iter()
            .filter(|peer| known.is_known_peer(peer))
            .filter(|peer| !self.abandoned.contains(*peer))
            .filter(|peer| match sessions.get(peer) {
                None => true,
                Some(s) => !s.state().is_active() && !s.reconnect_pending(),
            })
            .cloned()
            .collect();
        due.sort();
        if !due.is_empty() {
            debug!(event = "presence_reconcile", peers = due.len(), "Initiating sessions for online friends");
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::lane::FrameLane;
    use crate::core::connection::transport::testing::RecordingTransport;
    use crate::core::session::ReconnectContext;
    use serde_json::json;

    fn joined(kind: SignalKind, who: &str) -> SignalingEnvelope {
        let mut env = SignalingEnvelope::new(kind, json!({}));
        env.uuid = Some(who.into());
        env
    }

    fn known(ids: &[&str]) -> HashSet<PeerId> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn tracks_online_set() {
        let me: PeerId = "me".into();
        let mut p = Presence::new();
        let list = SignalingEnvelope::new(SignalKind::UserList, json!({ "users": ["me", "bob", "carol"] }));
        assert_eq!(p.apply(&list, &me), PresenceChange::Online(vec!["bob".into(), "carol".into()]));

        p.apply(&joined(SignalKind::UserOnline, "dave"), &me);
        p.apply(&joined(SignalKind::UserLeft, "bob"), &me);
        assert_eq!(p.online(), vec!["carol".to_string(), "dave".to_string()]);
        assert_eq!(p.apply(&joined(SignalKind::UserJoined, "me"), &me), PresenceChange::None);
    }

    #[test]
    fn reconcile_skips_active_pending_unknown_and_abandoned() {
        let me: PeerId = "me".into();
        let mut p = Presence::new();
        for who in ["bob", "carol", "dave", "erin", "frank"] {
            p.apply(&joined(SignalKind::UserJoined, who), &me);
        }
        let friends = known(&["bob", "carol", "dave", "erin"]);

        let mut sessions = SessionRegistry::new();
        sessions
            .create_outbound(&"bob".into())
            .unwrap()
            .begin_offer(FrameLane::new(RecordingTransport::new()));
        let carol = sessions.create_outbound(&"carol".into()).unwrap();
        carol.begin_offer(FrameLane::new(RecordingTransport::new()));
        carol.on_negotiation_timeout(ReconnectContext {
            peer_known: true,
            link_ready: true,
        });
        p.mark_abandoned(&"erin".into());

        assert_eq!(p.reconcile(&friends, &sessions), vec!["dave".to_string()]);

        p.apply(&joined(SignalKind::UserOnline, "erin"), &me);
        assert_eq!(p.reconcile(&friends, &sessions), vec!["dave".to_string(), "erin".to_string()]);
    }
}
