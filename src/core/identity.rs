//! Stable local identity.
//!
//! The PeerId is a UUID v4 string generated on first start and persisted in
//! `<data_dir>/identity.json`. It is what the relay routes on, so it must not
//! change across restarts.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Opaque peer identifier as carried on the signaling wire.
pub type PeerId = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalIdentity {
    pub peer_id: PeerId,
    /// Unix seconds of first start.
    #[serde(default)]
    pub created: u64,
}

impl LocalIdentity {
    pub fn generate() -> Self {
        Self {
            peer_id: uuid::Uuid::new_v4().to_string(),
            created: crate::core::now_unix(),
        }
    }

    /// Load the identity at `path`, creating and persisting one if absent.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let identity: Self = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            if identity.peer_id.trim().is_empty() {
                return Err(anyhow!("identity file {} has an empty peer_id", path.display()));
            }
            return Ok(identity);
        }

        let identity = Self::generate();
        let content = serde_json::to_string_pretty(&identity)?;
        crate::utils::atomic_write::atomic_write(path, content.as_bytes())?;
        info!(event = "identity_created", peer_id = %identity.peer_id, "Generated local identity");
        Ok(identity)
    }
}
