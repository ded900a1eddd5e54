//! Cancellable one-shot timers feeding the node queue.
//!
//! Every arm gets a fresh token. A fire is only honoured if its token is
//! still the armed one, so a timer that was cancelled or re-armed while its
//! message was already queued is ignored.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::identity::PeerId;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey {
    LinkReconnect,
    Negotiation(PeerId),
    PeerReconnect(PeerId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerFired {
    pub key: TimerKey,
    pub token: u64,
}

pub struct Timers<E> {
    next_token: u64,
    armed: HashMap<TimerKey, (u64, JoinHandle<()>)>,
    events: mpsc::UnboundedSender<E>,
}

impl<E> Timers<E>
where
    E: From<TimerFired> + Send + 'static,
{
    pub fn new(events: mpsc::UnboundedSender<E>) -> Self {
        Self {
            next_token: 0,
            armed: HashMap::new(),
            events,
        }
    }

    /// Arm `key`, replacing any timer already armed for it.
    pub fn arm(&mut self, key: TimerKey, delay: Duration) {
        self.cancel(&key);
        self.next_token += 1;
        let token = self.next_token;
        let events = self.events.clone();
        let fired = TimerFired {
            key: key.clone(),
            token,
        };
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(E::from(fired));
        });
        self.armed.insert(key, (token, handle));
    }

    /// Cancel `key`. Cancelling an unarmed key is a no-op.
    pub fn cancel(&mut self, key: &TimerKey) {
        if let Some((_, handle)) = self.armed.remove(key) {
            handle.abort();
        }
    }

    /// Cancel every timer belonging to `peer_id`.
    pub fn cancel_peer(&mut self, peer_id: &PeerId) {
        self.cancel(&TimerKey::Negotiation(peer_id.clone()));
        self.cancel(&TimerKey::PeerReconnect(peer_id.clone()));
    }

    /// Consume a fire. Returns `false` for a stale one.
    pub fn fired(&mut self, fired: &TimerFired) -> bool {
        match self.armed.get(&fired.key) {
            Some((token, _)) if *token == fired.token => {
                self.armed.remove(&fired.key);
                true
            }
            _ => false,
        }
    }

    #[cfg(test)]
    pub fn is_armed(&self, key: &TimerKey) -> bool {
        self.armed.contains_key(key)
    }

    pub fn cancel_all(&mut self) {
        for (_, (_, handle)) in self.armed.drain() {
            handle.abort();
        }
    }
}

impl<E> Drop for Timers<E> {
    fn drop(&mut self) {
        for (_, (_, handle)) in self.armed.drain() {
            handle.abort();
        }
    }
}
