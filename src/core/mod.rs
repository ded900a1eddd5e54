pub mod backoff;
pub mod config;
pub mod connection;
pub mod error;
pub mod identity;
pub mod node;
pub mod peer_registry;
pub mod persistence;
pub mod presence;
pub mod session;
pub mod signaling;
pub mod timers;
pub mod transfer;

/// Seconds since the Unix epoch.
pub fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
