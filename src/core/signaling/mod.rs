//! Relay signaling: wire envelopes, the reconnecting link state machine and
//! the WebSocket task behind it.

pub mod envelope;
pub mod link;
pub mod socket;

pub use envelope::{IceCandidate, SessionDescription, SignalKind, SignalingEnvelope};
pub use link::{LinkAction, SignalingLink};
pub use socket::{Connector, SocketEvent, SocketHandle, WsConnector};
