//! Routing table of the relay: which connection speaks for which PeerId.
//!
//! Pure bookkeeping. Every call returns the envelopes to write and the
//! connection each one goes to; the server does the writing.

use std::collections::HashMap;

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::core::identity::PeerId;
use crate::core::signaling::envelope::UuidPayload;
use crate::core::signaling::{SignalKind, SignalingEnvelope};

pub type ConnId = u64;

#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub conn: ConnId,
    pub envelope: SignalingEnvelope,
}

#[derive(Debug, Default)]
pub struct Hub {
    routes: HashMap<PeerId, ConnId>,
    bound: HashMap<ConnId, PeerId>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle one envelope received on `conn`.
    pub fn on_message(&mut self, conn: ConnId, envelope: SignalingEnvelope) -> Vec<Delivery> {
        if envelope.kind == SignalKind::Register {
            let uuid = envelope
                .payload_as::<UuidPayload>()
                .map(|p| p.uuid)
                .ok()
                .or_else(|| envelope.uuid.clone());
            return match uuid {
                Some(uuid) if !uuid.is_empty() => self.register(conn, uuid),
                _ => {
                    debug!(event = "relay_register_invalid", conn, "Register without uuid");
                    Vec::new()
                }
            };
        }
        self.forward(conn, envelope)
    }

    fn register(&mut self, conn: ConnId, uuid: PeerId) -> Vec<Delivery> {
        if let Some(previous) = self.bound.insert(conn, uuid.clone()) {
            if previous != uuid && self.routes.get(&previous) == Some(&conn) {
                self.routes.remove(&previous);
            }
        }
        if let Some(old) = self.routes.insert(uuid.clone(), conn) {
            if old != conn {
                self.bound.remove(&old);
                info!(event = "relay_route_replaced", peer_id = %uuid, old, conn, "Peer re-registered");
            }
        }
        info!(event = "relay_registered", peer_id = %uuid, conn, peers = self.routes.len(), "Peer registered");

        let mut others: Vec<PeerId> = self.routes.keys().filter(|p| **p != uuid).cloned().collect();
        others.sort();

        let mut out = vec![
            Delivery {
                conn,
                envelope: SignalingEnvelope::new(SignalKind::Registered, json!({ "uuid": uuid })),
            },
            Delivery {
                conn,
                envelope: SignalingEnvelope::new(SignalKind::UserList, json!({ "users": others })),
            },
        ];
        out.extend(self.broadcast(SignalKind::UserJoined, &uuid, conn));
        out
    }

    fn forward(&self, conn: ConnId, mut envelope: SignalingEnvelope) -> Vec<Delivery> {
        let Some(sender) = self.bound.get(&conn) else {
            debug!(event = "relay_unregistered_sender", conn, kind = %envelope.kind.as_str(), "Dropping message");
            return Vec::new();
        };
        let Some(target) = envelope.target().map(str::to_string) else {
            debug!(event = "relay_no_target", peer_id = %sender, kind = %envelope.kind.as_str(), "Dropping message");
            return Vec::new();
        };
        let Some(&to) = self.routes.get(&target) else {
            debug!(event = "relay_unknown_target", peer_id = %sender, target = %target, "Dropping message");
            return Vec::new();
        };
        envelope.from = Some(sender.clone());
        if let Value::Object(payload) = &mut envelope.payload {
            payload.insert("from".into(), Value::String(sender.clone()));
        }
        vec![Delivery { conn: to, envelope }]
    }

    /// `conn` went away. Unbinds its id if the id still routes to it.
    pub fn on_close(&mut self, conn: ConnId) -> Vec<Delivery> {
        let Some(uuid) = self.bound.remove(&conn) else {
            return Vec::new();
        };
        if self.routes.get(&uuid) != Some(&conn) {
            return Vec::new();
        }
        self.routes.remove(&uuid);
        info!(event = "relay_unregistered", peer_id = %uuid, conn, peers = self.routes.len(), "Peer left");
        self.broadcast(SignalKind::UserLeft, &uuid, conn)
    }

    fn broadcast(&self, kind: SignalKind, uuid: &PeerId, except: ConnId) -> Vec<Delivery> {
        let mut envelope = SignalingEnvelope::new(kind, json!({}));
        envelope.uuid = Some(uuid.clone());
        let mut targets: Vec<ConnId> = self.routes.values().copied().filter(|c| *c != except).collect();
        targets.sort_unstable();
        targets
            .into_iter()
            .map(|conn| Delivery {
                conn,
                envelope: envelope.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register(hub: &mut Hub, conn: ConnId, uuid: &str) -> Vec<Delivery> {
        hub.on_message(conn, SignalingEnvelope::register(&uuid.to_string()))
    }

    fn kinds(out: &[Delivery]) -> Vec<(ConnId, SignalKind)> {
        out.iter().map(|d| (d.conn, d.envelope.kind.clone())).collect()
    }

    #[test]
    fn register_replies_lists_and_announces() {
        let mut hub = Hub::new();
        register(&mut hub, 1, "alice");
        let out = register(&mut hub, 2, "bob");

        assert_eq!(
            kinds(&out),
            vec![(2, SignalKind::Registered), (2, SignalKind::UserList), (1, SignalKind::UserJoined)]
        );
        assert_eq!(out[0].envelope.payload["uuid"], "bob");
        assert_eq!(out[1].envelope.payload["users"], json!(["alice"]));
        assert_eq!(out[2].envelope.sender(), Some(&"bob".to_string()));
    }

    #[test]
    fn forwards_to_target_with_sender() {
        let mut hub = Hub::new();
        register(&mut hub, 1, "alice");
        register(&mut hub, 2, "bob");

        let offer = SignalingEnvelope::call(SignalKind::Offer, &"alice".into(), &"bob".into());
        let out = hub.on_message(1, offer);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].conn, 2);
        assert_eq!(out[0].envelope.from.as_deref(), Some("alice"));
        assert_eq!(out[0].envelope.payload["from"], "alice");

        let lost = SignalingEnvelope::call(SignalKind::Offer, &"alice".into(), &"nobody".into());
        assert!(hub.on_message(1, lost).is_empty());
        let anonymous = SignalingEnvelope::call(SignalKind::Offer, &"carol".into(), &"bob".into());
        assert!(hub.on_message(9, anonymous).is_empty());
    }

    #[test]
    fn reregistration_takes_over_the_route() {
        let mut hub = Hub::new();
        register(&mut hub, 1, "alice");
        register(&mut hub, 2, "bob");
        register(&mut hub, 3, "bob");

        // The stale connection closing must not unbind the new one.
        assert!(hub.on_close(2).is_empty());
        assert_eq!(hub.routes.len(), 2);

        let out = hub.on_message(1, SignalingEnvelope::call(SignalKind::CallRequest, &"alice".into(), &"bob".into()));
        assert_eq!(out[0].conn, 3);

        let left = hub.on_close(3);
        assert_eq!(kinds(&left), vec![(1, SignalKind::UserLeft)]);
        assert_eq!(left[0].envelope.uuid.as_deref(), Some("bob"));
        assert_eq!(hub.routes.len(), 1);
    }
}
