//! Persistent friends registry: the known-peer set.
//!
//! Stores `{peer_id, name?, added}` records in `<data_dir>/friends.json`.
//! Presence reconciliation and the reconnect decision only read it through
//! [`KnownPeers`]; the console's `/friend` and `/unfriend` commands write it.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::core::identity::PeerId;

/// Membership test against the known-peer set.
pub trait KnownPeers: Send + Sync {
    fn is_known_peer(&self, peer_id: &PeerId) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendRecord {
    pub peer_id: PeerId,
    #[serde(default)]
    pub name: Option<String>,
    /// Unix seconds when the friend was added.
    #[serde(default)]
    pub added: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct FriendRegistry {
    pub peers: HashMap<PeerId, FriendRecord>,
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl FriendRegistry {
    /// Load the registry stored at `path` (or return an empty one bound to it).
    pub fn load(path: &Path) -> Self {
        let mut registry = if path.exists() {
            Self::read_from_file(path)
        } else {
            Self::default()
        };
        registry.path = Some(path.to_path_buf());
        registry
    }

    fn read_from_file(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<FriendRegistry>(&content) {
                Ok(reg) => {
                    debug!(event = "friends_loaded", peers = reg.peers.len(), "Friends registry loaded");
                    reg
                }
                Err(e) => {
                    error!(
                        event = "friends_parse_failure",
                        error = %e,
                        "Failed to parse friends registry, starting fresh"
                    );
                    Self::default()
                }
            },
            Err(e) => {
                warn!(event = "friends_read_failure", error = %e, "Failed to read friends registry");
                Self::default()
            }
        }
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let content = serde_json::to_string_pretty(self)?;
        crate::utils::atomic_write::atomic_write(path, content.as_bytes())
    }

    /// Add (or rename) a friend. Returns `true` if the peer was new.
    pub fn add(&mut self, peer_id: &str, name: Option<String>) -> Result<bool> {
        let fresh = match self.peers.get_mut(peer_id) {
            Some(record) => {
                if name.is_some() {
                    record.name = name;
                }
                false
            }
            None => {
                self.peers.insert(
                    peer_id.to_string(),
                    FriendRecord {
                        peer_id: peer_id.to_string(),
                        name,
                        added: crate::core::now_unix(),
                    },
                );
                true
            }
        };
        self.save()?;
        Ok(fresh)
    }

    /// Remove a friend. Returns `true` if it was present.
    pub fn remove(&mut self, peer_id: &str) -> Result<bool> {
        let removed = self.peers.remove(peer_id).is_some();
        if removed {
            self.save()?;
        }
        Ok(removed)
    }

    /// All friends, oldest first.
    pub fn all(&self) -> Vec<&FriendRecord> {
        let mut all: Vec<_> = self.peers.values().collect();
        all.sort_by(|a, b| a.added.cmp(&b.added).then_with(|| a.peer_id.cmp(&b.peer_id)));
        all
    }
}

impl KnownPeers for FriendRegistry {
    fn is_known_peer(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }
}

impl KnownPeers for HashSet<PeerId> {
    fn is_known_peer(&self, peer_id: &PeerId) -> bool {
        self.contains(peer_id)
    }
}
