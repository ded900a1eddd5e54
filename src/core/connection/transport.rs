//! Transport seam between the session state machine and the WebRTC stack.
//!
//! A transport is created per negotiation attempt and tagged with the
//! session's epoch; everything it reports goes through a [`TransportSink`].

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

use crate::core::identity::PeerId;
use crate::core::session::Role;
use crate::core::signaling::{IceCandidate, SessionDescription};

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A local ICE candidate to trickle to the remote side.
    LocalCandidate(IceCandidate),
    /// The data channel is open.
    Established,
    /// The path failed or was closed by the remote.
    Dropped { reason: String },
    Text(String),
    Binary(Bytes),
}

/// Where a transport reports its events.
#[derive(Clone)]
pub struct TransportSink {
    emit: Arc<dyn Fn(TransportEvent) + Send + Sync>,
}

impl TransportSink {
    pub fn new(emit: impl Fn(TransportEvent) + Send + Sync + 'static) -> Self {
        Self {
            emit: Arc::new(emit),
        }
    }

    pub fn emit(&self, event: TransportEvent) {
        (self.emit)(event)
    }
}

impl fmt::Debug for TransportSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TransportSink")
    }
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create a local offer and apply it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Create a local answer (after the remote offer was applied) and apply it.
    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_remote_description(&self, sdp: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn send_text(&self, text: &str) -> Result<()>;

    async fn send_binary(&self, data: Bytes) -> Result<()>;

    /// Release the underlying connection. Idempotent.
    async fn close(&self);
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        peer_id: &PeerId,
        role: Role,
        epoch: u64,
        sink: TransportSink,
    ) -> Result<Arc<dyn PeerTransport>>;
}

#[cfg(test)]
pub mod testing {
    //! Recording transport used by the session, transfer and node tests.

    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;

    use anyhow::anyhow;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        CreateOffer,
        CreateAnswer,
        SetRemote(SessionDescription),
        AddCandidate(IceCandidate),
        Text(String),
        Binary(Bytes),
        Close,
    }

    #[derive(Default)]
    pub struct RecordingTransport {
        pub calls: Mutex<Vec<Call>>,
        /// Number of upcoming `send_binary` calls that fail.
        pub fail_binary: AtomicU32,
        /// Candidates containing this marker are rejected.
        pub reject_candidate: Mutex<Option<String>>,
    }

    impl RecordingTransport {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        pub fn texts(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Text(t) => Some(t),
                    _ => None,
                })
                .collect()
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl PeerTransport for RecordingTransport {
        async fn create_offer(&self) -> Result<SessionDescription> {
            self.record(Call::CreateOffer);
            Ok(SessionDescription::offer("v=0 offer"))
        }

        async fn create_answer(&self) -> Result<SessionDescription> {
            self.record(Call::CreateAnswer);
            Ok(SessionDescription::answer("v=0 answer"))
        }

        async fn set_remote_description(&self, sdp: SessionDescription) -> Result<()> {
            self.record(Call::SetRemote(sdp));
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
            let reject = self.reject_candidate.lock().unwrap().clone();
            if let Some(marker) = reject {
                if candidate.candidate.contains(&marker) {
                    return Err(anyhow!("malformed candidate"));
                }
            }
            self.record(Call::AddCandidate(candidate));
            Ok(())
        }

        async fn send_text(&self, text: &str) -> Result<()> {
            self.record(Call::Text(text.to_string()));
            Ok(())
        }

        async fn send_binary(&self, data: Bytes) -> Result<()> {
            let failing = self
                .fail_binary
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(anyhow!("data channel buffer full"));
            }
            self.record(Call::Binary(data));
            Ok(())
        }

        async fn close(&self) {
            self.record(Call::Close);
        }
    }

    /// Factory handing out fresh recording transports and remembering them.
    #[derive(Default)]
    pub struct RecordingFactory {
        pub created: Mutex<Vec<(PeerId, Role, u64, Arc<RecordingTransport>, TransportSink)>>,
        /// While set, `create` fails.
        pub failing: AtomicBool,
    }

    impl RecordingFactory {
        pub fn last(&self) -> Option<(Arc<RecordingTransport>, TransportSink)> {
            self.created
                .lock()
                .unwrap()
                .last()
                .map(|(_, _, _, t, s)| (t.clone(), s.clone()))
        }

        pub fn count(&self) -> usize {
            self.created.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl TransportFactory for RecordingFactory {
        async fn create(
            &self,
            peer_id: &PeerId,
            role: Role,
            epoch: u64,
            sink: TransportSink,
        ) -> Result<Arc<dyn PeerTransport>> {
            if self.failing.load(Ordering::Acquire) {
                return Err(anyhow!("no network interfaces"));
            }
            let transport = RecordingTransport::new();
            self.created
                .lock()
                .unwrap()
                .push((peer_id.clone(), role, epoch, transport.clone(), sink));
            Ok(transport)
        }
    }
}
