//! Failure taxonomy reported to the application layer.
//!
//! Plumbing code uses `anyhow::Result`; once a failure becomes terminal for a
//! link, a peer, or a transfer it is classified into a [`CallError`] and
//! surfaced as an `AppEvent`. A `CallError` never aborts unrelated sessions.

use thiserror::Error;

use crate::core::session::ConnectionState;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// Signaling relay unreachable after the bounded reconnect budget.
    #[error("signaling link unavailable after {attempts} reconnect attempts")]
    LinkUnavailable { attempts: u32 },

    /// A peer session did not reach `Connected` in time.
    #[error("negotiation with {peer_id} timed out")]
    NegotiationTimeout { peer_id: String },

    /// A remote candidate could not be applied. Never fatal.
    #[error("candidate from {peer_id} rejected: {reason}")]
    CandidateApplyFailure { peer_id: String, reason: String },

    /// A chunk pair could not be sent after all retries.
    #[error("chunk {index} of {file_id} failed after {attempts} attempts: {reason}")]
    ChunkSendFailure {
        file_id: String,
        index: u32,
        attempts: u32,
        reason: String,
    },

    /// The persisted chunks do not reproduce the announced file.
    #[error("transfer {file_id}: expected {expected} chunks, found {found}")]
    ChunkAssemblyMismatch {
        file_id: String,
        expected: u32,
        found: u32,
    },

    /// The chunk store (or another local store) could not be used.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A session for this peer is already negotiating or connected.
    #[error("session with {peer_id} already {state:?}")]
    SessionActive {
        peer_id: String,
        state: ConnectionState,
    },

    /// The intent needs a connected session with this peer.
    #[error("no connected session with {peer_id}")]
    NotConnected { peer_id: String },

    /// Malformed envelope or control frame.
    #[error("protocol violation: {0}")]
    Protocol(String),
}
