//! Peer sessions: candidate queuing, the per-peer state machine and the
//! registry that keeps at most one live session per peer.

pub mod candidate_queue;
pub mod peer;
pub mod registry;

pub use peer::{
    CloseReason, ConnectionState, PeerSession, ReconnectContext, Role, SessionAction, SessionTimer,
};
pub use registry::{Route, SessionRegistry};
