//! Centralized configuration constants for CyberCall.
//!
//! All tunable parameters live here so they can be reviewed and adjusted
//! in a single place. Wire-format names (envelope types, frame tags) stay in
//! their respective modules.

use std::time::Duration;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Default chunk size in bytes (16 KB).
///
/// Browsers cap a single data-channel message well above this, but 16 KB is
/// the largest size every WebRTC stack accepts without fragmentation quirks.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Largest chunk size accepted locally or from a peer's `file-metadata`.
/// Matches the default SCTP message limit of the WebRTC stack.
pub const MAX_CHUNK_SIZE: u32 = 64 * 1024;

/// Most chunks one transfer may announce. Bounds the per-transfer index
/// bitmap (512 KiB at the limit).
pub const MAX_FILE_CHUNKS: u32 = 1 << 22;

/// Retries per chunk pair (control frame + binary frame) after the first
/// attempt fails. After the last retry the whole transfer fails.
pub const MAX_CHUNK_RETRIES: u32 = 3;

/// First delay between chunk retries.
pub const CHUNK_RETRY_INITIAL: Duration = Duration::from_millis(200);

/// Upper bound for the chunk retry delay.
pub const CHUNK_RETRY_MAX: Duration = Duration::from_secs(2);

// ── Backoff ──────────────────────────────────────────────────────────────────

/// Growth factor shared by every capped-exponential backoff (link, peer, chunk).
pub const BACKOFF_FACTOR: f64 = 1.5;

// ── Signaling link ───────────────────────────────────────────────────────────

/// Default relay URL used when neither the CLI nor `config.toml` sets one.
pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8765/ws/signaling/";

/// Maximum consecutive reconnect attempts before the link gives up and the
/// user has to restart.
pub const MAX_LINK_RECONNECTS: u32 = 10;

/// Delay before the first link reconnect attempt.
pub const LINK_RECONNECT_INITIAL: Duration = Duration::from_secs(1);

/// Cap for the link reconnect delay.
pub const LINK_RECONNECT_MAX: Duration = Duration::from_secs(10);

/// Timeout for the WebSocket handshake with the relay.
pub const LINK_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// WebSocket close code for a normal, intentional closure.
pub const CLOSE_NORMAL: u16 = 1000;

// ── Peer sessions ────────────────────────────────────────────────────────────

/// Time a session may spend in `Negotiating` before it is torn down.
pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum reconnect attempts per peer before the peer is abandoned.
pub const MAX_PEER_RECONNECTS: u32 = 3;

/// Delay before the first per-peer reconnect attempt.
pub const PEER_RECONNECT_INITIAL: Duration = Duration::from_secs(1);

/// Cap for the per-peer reconnect delay.
pub const PEER_RECONNECT_MAX: Duration = Duration::from_secs(10);

/// Default STUN server handed to the WebRTC stack.
pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

/// Label of the single data channel created by the initiator.
pub const DATA_CHANNEL_LABEL: &str = "chat";

// ── Presence ─────────────────────────────────────────────────────────────────

/// Interval of the presence reconciliation loop.
pub const PRESENCE_INTERVAL: Duration = Duration::from_secs(5);

// ── Relay ────────────────────────────────────────────────────────────────────

/// Default listen address of the relay server.
pub const DEFAULT_RELAY_LISTEN: &str = "0.0.0.0:8765";

/// Outgoing message queue per relay connection.
pub const RELAY_CLIENT_QUEUE: usize = 128;
