//! JSON control frames carried as text messages on the data channel.
//!
//! A `file-chunk` frame is always followed by exactly one binary frame
//! holding that chunk's bytes; nothing else may be sent in between on the
//! same channel.

use serde::{Deserialize, Serialize};

use crate::core::config::CHUNK_SIZE;
use crate::core::error::CallError;
use crate::core::identity::PeerId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub content: String,
    pub sender: PeerId,
    /// RFC 3339.
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub content: String,
    pub sender: PeerId,
    pub timestamp: String,
}

impl Post {
    /// A new post with a fresh id, stamped now.
    pub fn new(sender: &PeerId, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            content: content.into(),
            sender: sender.clone(),
            timestamp: now_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub file_id: String,
    pub name: String,
    pub size: u64,
    #[serde(default)]
    pub file_type: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,
}

fn default_chunk_size() -> u32 {
    CHUNK_SIZE as u32
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkHeader {
    pub file_id: String,
    pub index: u32,
    pub last: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlFrame {
    DirectMessage(ChatMessage),
    Post(Post),
    DeletePost {
        #[serde(rename = "postId")]
        post_id: String,
    },
    FileMetadata(FileMetadata),
    FileChunk(ChunkHeader),
}

impl ControlFrame {
    pub fn parse(text: &str) -> Result<Self, CallError> {
        serde_json::from_str(text).map_err(|e| CallError::Protocol(format!("bad control frame: {e}")))
    }

    pub fn to_text(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn direct_message(sender: &PeerId, content: impl Into<String>) -> Self {
        ControlFrame::DirectMessage(ChatMessage {
            content: content.into(),
            sender: sender.clone(),
            timestamp: now_rfc3339(),
        })
    }
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
