//! Chunked file transfer over an established peer transport.
//!
//! - `frames`: data-channel control protocol
//! - `chunk`: chunk arithmetic and received-index bitmap
//! - `store`: durable chunk staging (`ByteStore`)
//! - `sender`: per-file send task with bounded retries
//! - `receiver`: per-peer receive state and reassembly
//! - `delivery`: saving assembled files to the downloads directory

pub mod chunk;
pub mod delivery;
pub mod frames;
pub mod receiver;
pub mod sender;
pub mod store;

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::core::connection::lane::FrameLane;
use crate::core::error::CallError;
use crate::core::identity::PeerId;
use crate::utils::sos::SignalOfStop;

use frames::{ChunkHeader, FileMetadata};
use receiver::{InboundTransfers, ReceiveOutcome};
use sender::OutboundTransfer;
use store::ByteStore;

/// Reported by send tasks.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Progress {
        peer_id: PeerId,
        file_id: String,
        percent: u8,
    },
    Sent {
        peer_id: PeerId,
        file_id: String,
    },
    Failed {
        peer_id: PeerId,
        file_id: String,
        error: CallError,
    },
}

/// Owns inbound state per peer and a stop signal per running send task.
pub struct TransferManager {
    store: Arc<dyn ByteStore>,
    chunk_size: u32,
    inbound: HashMap<PeerId, InboundTransfers>,
    outbound: HashMap<(PeerId, String), SignalOfStop>,
}

impl TransferManager {
    pub fn new(store: Arc<dyn ByteStore>, chunk_size: u32) -> Self {
        Self {
            store,
            chunk_size,
            inbound: HashMap::new(),
            outbound: HashMap::new(),
        }
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Spawn the send task for `transfer`. Returns the file id.
    pub fn start_send<E>(
        &mut self,
        transfer: OutboundTransfer,
        lane: FrameLane,
        events: mpsc::UnboundedSender<E>,
    ) -> String
    where
        E: From<TransferEvent> + Send + 'static,
    {
        let key = (transfer.peer_id.clone(), transfer.meta.file_id.clone());
        let sos = SignalOfStop::new();
        info!(
            event = "transfer_started",
            peer_id = %key.0,
            file_id = %key.1,
            name = %transfer.meta.name,
            size = transfer.meta.size,
            "Sending file"
        );
        tokio::spawn(sender::run_send(transfer, lane, sos.clone(), events));
        let file_id = key.1.clone();
        self.outbound.insert(key, sos);
        file_id
    }

    /// Forget a send task that reported `Sent` or `Failed`.
    pub fn on_send_finished(&mut self, peer_id: &PeerId, file_id: &str) {
        self.outbound.remove(&(peer_id.clone(), file_id.to_string()));
    }

    #[cfg(test)]
    pub fn outbound_count(&self, peer_id: &PeerId) -> usize {
        self.outbound.keys().filter(|(p, _)| p == peer_id).count()
    }

    pub async fn on_metadata(&mut self, peer_id: &PeerId, meta: FileMetadata) -> ReceiveOutcome {
        self.inbound
            .entry(peer_id.clone())
            .or_default()
            .on_metadata(meta, self.store.as_ref())
            .await
    }

    pub fn on_chunk_header(&mut self, peer_id: &PeerId, header: ChunkHeader) {
        self.inbound.entry(peer_id.clone()).or_default().on_chunk_header(header);
    }

    pub async fn on_binary(&mut self, peer_id: &PeerId, data: Bytes) -> ReceiveOutcome {
        match self.inbound.get_mut(peer_id) {
            Some(rx) => rx.on_binary(data, self.store.as_ref()).await,
            None => {
                warn!(event = "binary_without_header", peer_id = %peer_id, "Dropping unannounced binary frame");
                ReceiveOutcome::Ignored
            }
        }
    }

    /// Stop every send task to `peer_id` and abandon its inbound transfers.
    /// Returns the file ids that were abandoned, outbound first.
    pub async fn abort_peer(&mut self, peer_id: &PeerId) -> Vec<String> {
        let mut aborted = Vec::new();
        self.outbound.retain(|(p, file_id), sos| {
            if p == peer_id {
                sos.cancel();
                aborted.push(file_id.clone());
                false
            } else {
                true
            }
        });
        aborted.sort();
        if let Some(mut rx) = self.inbound.remove(peer_id) {
            let mut inbound = rx.abort_all(self.store.as_ref()).await;
            inbound.sort();
            aborted.extend(inbound);
        }
        aborted
    }

    /// Purge chunks left behind by a previous run. Returns the abandoned ids.
    pub async fn sweep_stale(&self) -> Result<Vec<String>, CallError> {
        let ids = self
            .store
            .list_file_ids()
            .await
            .map_err(|e| CallError::StorageUnavailable(e.to_string()))?;
        for id in &ids {
            if let Err(e) = self.store.delete_all_by_file_id(id).await {
                warn!(event = "chunk_purge_failure", file_id = %id, error = %e, "Failed to purge stale chunks");
            }
        }
        if !ids.is_empty() {
            info!(event = "stale_chunks_swept", transfers = ids.len(), "Abandoned interrupted transfers");
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::transport::testing::{Call, RecordingTransport};
    use frames::ControlFrame;
    use receiver::Artifact;
    use store::MemoryChunkStore;

    /// Send `data` through a recording transport and replay the recorded
    /// frames into a receiver. Returns the artifact and the binary frame count.
    async fn replay_through_frames(name: &str, data: Bytes, chunk_size: u32) -> (Artifact, usize, String) {
        let store = Arc::new(MemoryChunkStore::new());
        let mut sender_side = TransferManager::new(Arc::new(MemoryChunkStore::new()), chunk_size);
        let mut receiver_side = TransferManager::new(store.clone(), chunk_size);
        let transport = RecordingTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<TransferEvent>();

        let transfer = OutboundTransfer::from_bytes(&"bob".into(), name, data, chunk_size);
        let file_id = sender_side.start_send(transfer, FrameLane::new(transport.clone()), tx);

        loop {
            match rx.recv().await {
                Some(TransferEvent::Sent { .. }) => break,
                Some(TransferEvent::Failed { error, .. }) => panic!("send failed: {error}"),
                Some(_) => continue,
                None => panic!("sender vanished"),
            }
        }
        sender_side.on_send_finished(&"bob".into(), &file_id);
        assert_eq!(sender_side.outbound_count(&"bob".into()), 0);

        let alice: PeerId = "alice".into();
        let mut artifact = None;
        let mut binaries = 0;
        for call in transport.calls() {
            match call {
                Call::Text(text) => match ControlFrame::parse(&text).unwrap() {
                    ControlFrame::FileMetadata(meta) => {
                        receiver_side.on_metadata(&alice, meta).await;
                    }
                    ControlFrame::FileChunk(h) => receiver_side.on_chunk_header(&alice, h),
                    other => panic!("unexpected frame {other:?}"),
                },
                Call::Binary(bytes) => {
                    binaries += 1;
                    if let ReceiveOutcome::Assembled(a) = receiver_side.on_binary(&alice, bytes).await {
                        artifact = Some(a);
                    }
                }
                other => panic!("unexpected call {other:?}"),
            }
        }
        assert!(store.list_file_ids().await.unwrap().is_empty());
        (artifact.expect("assembled"), binaries, file_id)
    }

    fn pattern(len: usize) -> Bytes {
        (0..len).map(|i| (i * 7) as u8).collect::<Vec<_>>().into()
    }

    #[tokio::test]
    async fn end_to_end_through_recorded_frames() {
        let data = pattern(50_000);
        let (artifact, binaries, file_id) = replay_through_frames("pic.png", data.clone(), 16384).await;
        assert_eq!(artifact.file_id, file_id);
        assert_eq!(artifact.mime, "image/png");
        assert_eq!(artifact.data, data);
        assert_eq!(binaries, 4);
    }

    #[tokio::test]
    async fn any_size_survives_any_chunk_size() {
        let cases: [(usize, u32); 9] = [
            (0, 16384),
            (1, 1),
            (7, 1),
            (100, 100),
            (101, 100),
            (999, 1000),
            (16384, 16384),
            (16385, 16384),
            (65536, 65536),
        ];
        for (size, chunk_size) in cases {
            let data = pattern(size);
            let (artifact, binaries, _) = replay_through_frames("a.bin", data.clone(), chunk_size).await;
            assert_eq!(artifact.data, data, "size {size}, chunk {chunk_size}");
            assert_eq!(
                binaries as u32,
                chunk::expected_chunk_count(size as u64, chunk_size),
                "size {size}, chunk {chunk_size}"
            );
        }
    }

    #[tokio::test]
    async fn sweep_purges_leftovers() {
        let store = Arc::new(MemoryChunkStore::new());
        store.put("old", 0, Bytes::from_static(b"x")).await.unwrap();
        store.put("older", 3, Bytes::from_static(b"y")).await.unwrap();
        let manager = TransferManager::new(store.clone(), 16384);

        assert_eq!(manager.sweep_stale().await.unwrap(), vec!["old".to_string(), "older".to_string()]);
        assert!(store.list_file_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn abort_peer_purges_inbound_state() {
        let store = Arc::new(MemoryChunkStore::new());
        let mut manager = TransferManager::new(store.clone(), 16384);
        let peer: PeerId = "bob".into();
        manager
            .on_metadata(
                &peer,
                FileMetadata {
                    file_id: "f1".into(),
                    name: "a".into(),
                    size: 32768,
                    file_type: String::new(),
                    chunk_size: 16384,
                },
            )
            .await;
        manager.on_chunk_header(
            &peer,
            ChunkHeader {
                file_id: "f1".into(),
                index: 0,
                last: false,
            },
        );
        manager.on_binary(&peer, Bytes::from(vec![0u8; 16384])).await;

        assert_eq!(manager.abort_peer(&peer).await, vec!["f1".to_string()]);
        assert!(store.list_file_ids().await.unwrap().is_empty());
        assert_eq!(manager.on_binary(&peer, Bytes::from_static(b"z")).await, ReceiveOutcome::Ignored);
    }
}
