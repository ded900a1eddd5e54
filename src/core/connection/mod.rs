//! Peer data path: the transport seam, its WebRTC implementation and the
//! per-peer send lane.

pub mod lane;
pub mod rtc;
pub mod transport;

pub use lane::FrameLane;
pub use rtc::WebRtcFactory;
pub use transport::{TransportEvent, TransportFactory, TransportSink};
