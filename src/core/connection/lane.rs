//! Per-peer send lane.
//!
//! Binary frames are matched to the `file-chunk` header sent just before
//! them, so every outbound frame to a peer goes through one lock: a chunk's
//! header and bytes are sent back to back, and nothing else can slip in
//! between.

use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use tokio::sync::Mutex;

use crate::core::connection::transport::PeerTransport;
use crate::core::transfer::frames::{ChunkHeader, ControlFrame};

#[derive(Clone)]
pub struct FrameLane {
    transport: Arc<dyn PeerTransport>,
    guard: Arc<Mutex<()>>,
}

impl FrameLane {
    pub fn new(transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            transport,
            guard: Arc::new(Mutex::new(())),
        }
    }

    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    pub async fn send_frame(&self, frame: &ControlFrame) -> Result<()> {
        let text = frame.to_text()?;
        let _lane = self.guard.lock().await;
        self.transport.send_text(&text).await
    }

    /// Send a chunk header immediately followed by its bytes.
    pub async fn send_pair(&self, header: &ChunkHeader, data: Bytes) -> Result<()> {
        let text = ControlFrame::FileChunk(header.clone()).to_text()?;
        let _lane = self.guard.lock().await;
        self.transport.send_text(&text).await?;
        self.transport.send_binary(data).await
    }
}

impl std::fmt::Debug for FrameLane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FrameLane")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::transport::testing::{Call, RecordingTransport};

    #[tokio::test]
    async fn concurrent_pairs_never_interleave() {
        let transport = RecordingTransport::new();
        let lane = FrameLane::new(transport.clone());

        let mut tasks = Vec::new();
        for file in ["a", "b", "c"] {
            let lane = lane.clone();
            tasks.push(tokio::spawn(async move {
                for index in 0..5u32 {
                    let header = ChunkHeader {
                        file_id: file.to_string(),
                        index,
                        last: index == 4,
                    };
                    let data = Bytes::from(format!("{file}{index}"));
                    lane.send_pair(&header, data).await.unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        let calls = transport.calls();
        assert_eq!(calls.len(), 30);
        for pair in calls.chunks(2) {
            let (Call::Text(text), Call::Binary(data)) = (&pair[0], &pair[1]) else {
                panic!("unpaired frames: {pair:?}");
            };
            let ControlFrame::FileChunk(h) = ControlFrame::parse(text).unwrap() else {
                panic!("not a chunk header");
            };
            assert_eq!(&data[..], format!("{}{}", h.file_id, h.index).as_bytes());
        }
    }
}
