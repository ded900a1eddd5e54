//! Receive pipeline for one peer.
//!
//! `file-metadata` opens an inbound transfer. Each `file-chunk` header names
//! the binary frame that follows it; that frame is staged in the byte store.
//! The chunk flagged `last` triggers assembly: the store must hold exactly
//! the indices `0..N-1` and their bytes must add up to the announced size.
//! Chunks for a fileId are purged once the transfer ends either way.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use crate::core::error::CallError;
use crate::core::transfer::chunk::{check_bounds, expected_chunk_count, progress_percent, ChunkBitmap};
use crate::core::transfer::frames::{ChunkHeader, FileMetadata};
use crate::core::transfer::store::ByteStore;

#[derive(Debug)]
pub struct InboundTransfer {
    pub meta: FileMetadata,
    pub expected_chunks: u32,
    pub received_bytes: u64,
    seen: ChunkBitmap,
}

impl InboundTransfer {
    fn new(meta: FileMetadata) -> Self {
        let expected_chunks = expected_chunk_count(meta.size, meta.chunk_size);
        Self {
            meta,
            expected_chunks,
            received_bytes: 0,
            seen: ChunkBitmap::new(expected_chunks),
        }
    }
}

/// A fully reassembled file.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub file_id: String,
    pub name: String,
    pub mime: String,
    pub data: Bytes,
}

#[derive(Debug, PartialEq)]
pub enum ReceiveOutcome {
    Opened {
        file_id: String,
        name: String,
        size: u64,
    },
    Progress {
        file_id: String,
        received_bytes: u64,
        percent: u8,
    },
    Assembled(Artifact),
    Failed {
        file_id: String,
        error: CallError,
    },
    /// Frame dropped (no header, or no open transfer).
    Ignored,
}

#[derive(Debug, Default)]
pub struct InboundTransfers {
    transfers: HashMap<String, InboundTransfer>,
    pending: Option<ChunkHeader>,
}

impl InboundTransfers {
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn get(&self, file_id: &str) -> Option<&InboundTransfer> {
        self.transfers.get(file_id)
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    pub async fn on_metadata(&mut self, meta: FileMetadata, store: &dyn ByteStore) -> ReceiveOutcome {
        let file_id = meta.file_id.clone();
        if let Err(error) = check_bounds(meta.size, meta.chunk_size) {
            warn!(event = "metadata_rejected", file_id = %file_id, error = %error, "Refusing inbound transfer");
            return ReceiveOutcome::Failed { file_id, error };
        }
        if self.transfers.remove(&file_id).is_some() {
            warn!(event = "transfer_restarted", file_id = %file_id, "Metadata for an open transfer, restarting it");
        }
        if let Err(e) = store.delete_all_by_file_id(&file_id).await {
            return ReceiveOutcome::Failed {
                file_id,
                error: CallError::StorageUnavailable(e.to_string()),
            };
        }
        if self.pending.as_ref().is_some_and(|h| h.file_id == file_id) {
            self.pending = None;
        }

        let transfer = InboundTransfer::new(meta);
        debug!(
            event = "transfer_opened",
            file_id = %file_id,
            size = transfer.meta.size,
            chunks = transfer.expected_chunks,
            "Inbound transfer opened"
        );
        let outcome = ReceiveOutcome::Opened {
            file_id: file_id.clone(),
            name: transfer.meta.name.clone(),
            size: transfer.meta.size,
        };
        self.transfers.insert(file_id, transfer);
        outcome
    }

    /// Remember which chunk the next binary frame carries.
    pub fn on_chunk_header(&mut self, header: ChunkHeader) {
        if let Some(previous) = self.pending.replace(header) {
            warn!(
                event = "chunk_header_replaced",
                file_id = %previous.file_id,
                index = previous.index,
                "Chunk header never got its binary frame"
            );
        }
    }

    pub async fn on_binary(&mut self, data: Bytes, store: &dyn ByteStore) -> ReceiveOutcome {
        let Some(header) = self.pending.take() else {
            warn!(event = "binary_without_header", len = data.len(), "Dropping unannounced binary frame");
            return ReceiveOutcome::Ignored;
        };
        let Some(transfer) = self.transfers.get_mut(&header.file_id) else {
            warn!(
                event = "binary_for_unknown_transfer",
                file_id = %header.file_id,
                index = header.index,
                "Dropping chunk for a transfer that is not open"
            );
            return ReceiveOutcome::Ignored;
        };

        let len = data.len() as u64;
        if let Err(e) = store.put(&header.file_id, header.index, data).await {
            let error = CallError::StorageUnavailable(e.to_string());
            return self.fail(&header.file_id, error, store).await;
        }
        if transfer.seen.set(header.index) {
            transfer.received_bytes += len;
        }

        if !header.last {
            return ReceiveOutcome::Progress {
                file_id: header.file_id,
                received_bytes: transfer.received_bytes,
                percent: progress_percent(transfer.received_bytes, transfer.meta.size),
            };
        }
        self.assemble(&header.file_id, store).await
    }

    async fn assemble(&mut self, file_id: &str, store: &dyn ByteStore) -> ReceiveOutcome {
        let Some(transfer) = self.transfers.remove(file_id) else {
            return ReceiveOutcome::Ignored;
        };
        let loaded = store.get_all_by_file_id(file_id).await;
        if let Err(e) = store.delete_all_by_file_id(file_id).await {
            warn!(event = "chunk_purge_failure", file_id = %file_id, error = %e, "Failed to purge chunks");
        }
        let chunks = match loaded {
            Ok(chunks) => chunks,
            Err(e) => {
                return ReceiveOutcome::Failed {
                    file_id: file_id.to_string(),
                    error: CallError::StorageUnavailable(e.to_string()),
                }
            }
        };

        let mismatch = || ReceiveOutcome::Failed {
            file_id: file_id.to_string(),
            error: CallError::ChunkAssemblyMismatch {
                file_id: file_id.to_string(),
                expected: transfer.expected_chunks,
                found: chunks.len() as u32,
            },
        };
        if chunks.len() as u64 != transfer.expected_chunks as u64 {
            return mismatch();
        }
        // Store returns ascending indices; with the right count they must be 0..N-1.
        if chunks.iter().enumerate().any(|(i, (index, _))| *index as usize != i) {
            return mismatch();
        }
        let total: u64 = chunks.iter().map(|(_, b)| b.len() as u64).sum();
        if total != transfer.meta.size {
            return mismatch();
        }

        let mut data = BytesMut::with_capacity(total as usize);
        for (_, chunk) in &chunks {
            data.extend_from_slice(chunk);
        }
        ReceiveOutcome::Assembled(Artifact {
            file_id: transfer.meta.file_id,
            name: transfer.meta.name,
            mime: transfer.meta.file_type,
            data: data.freeze(),
        })
    }

    async fn fail(&mut self, file_id: &str, error: CallError, store: &dyn ByteStore) -> ReceiveOutcome {
        self.transfers.remove(file_id);
        if let Err(e) = store.delete_all_by_file_id(file_id).await {
            warn!(event = "chunk_purge_failure", file_id = %file_id, error = %e, "Failed to purge chunks");
        }
        ReceiveOutcome::Failed {
            file_id: file_id.to_string(),
            error,
        }
    }

    /// Abandon every open transfer and purge its chunks. Returns the file ids.
    pub async fn abort_all(&mut self, store: &dyn ByteStore) -> Vec<String> {
        self.pending = None;
        let ids: Vec<String> = self.transfers.drain().map(|(id, _)| id).collect();
        for id in &ids {
            if let Err(e) = store.delete_all_by_file_id(id).await {
                warn!(event = "chunk_purge_failure", file_id = %id, error = %e, "Failed to purge chunks");
            }
        }
        ids
    }
}
