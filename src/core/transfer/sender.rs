//! Send pipeline for one outbound file.
//!
//! Runs as its own task. Sends `file-metadata`, then one (header, bytes)
//! pair per chunk through the peer's [`FrameLane`]. A failed pair is retried
//! with capped backoff; once the retries are spent the transfer fails and no
//! further chunk is attempted. The stop signal is checked before every
//! attempt and after every backoff, so a closed session stops the task
//! without sending anything more.

use std::io::SeekFrom;
use std::path::PathBuf;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::backoff::Backoff;
use crate::core::config::{CHUNK_RETRY_INITIAL, CHUNK_RETRY_MAX, MAX_CHUNK_RETRIES};
use crate::core::connection::lane::FrameLane;
use crate::core::error::CallError;
use crate::core::identity::PeerId;
use crate::core::transfer::chunk::{check_bounds, chunk_range, expected_chunk_count, is_last, progress_percent};
use crate::core::transfer::frames::{ChunkHeader, ControlFrame, FileMetadata};
use crate::core::transfer::TransferEvent;
use crate::utils::sos::SignalOfStop;

pub const CHUNK_BACKOFF: Backoff = Backoff::new(CHUNK_RETRY_INITIAL, CHUNK_RETRY_MAX, MAX_CHUNK_RETRIES);

#[derive(Debug, Clone)]
pub enum ByteSource {
    Path(PathBuf),
    #[cfg(test)]
    Memory(Bytes),
}

/// Everything needed to run one outbound transfer.
#[derive(Debug, Clone)]
pub struct OutboundTransfer {
    pub peer_id: PeerId,
    pub meta: FileMetadata,
    pub source: ByteSource,
}

impl OutboundTransfer {
    /// Describe a file on disk. Name and size come from the file system.
    pub async fn from_path(peer_id: &PeerId, path: PathBuf, chunk_size: u32) -> Result<Self> {
        let size = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?
            .len();
        check_bounds(size, chunk_size)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let file_type = guess_mime(&name).to_string();
        Ok(Self {
            peer_id: peer_id.clone(),
            meta: FileMetadata {
                file_id: uuid::Uuid::new_v4().to_string(),
                name,
                size,
                file_type,
                chunk_size,
            },
            source: ByteSource::Path(path),
        })
    }

    #[cfg(test)]
    pub fn from_bytes(peer_id: &PeerId, name: &str, data: Bytes, chunk_size: u32) -> Self {
        Self {
            peer_id: peer_id.clone(),
            meta: FileMetadata {
                file_id: uuid::Uuid::new_v4().to_string(),
                name: name.to_string(),
                size: data.len() as u64,
                file_type: guess_mime(name).to_string(),
                chunk_size,
            },
            source: ByteSource::Memory(data),
        }
    }
}

/// Best-effort MIME type from a file extension.
pub fn guess_mime(name: &str) -> &'static str {
    let ext = name.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase()).unwrap_or_default();
    match ext.as_str() {
        "txt" | "log" | "md" => "text/plain",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        _ => "application/octet-stream",
    }
}

enum Reader {
    File(tokio::fs::File),
    #[cfg(test)]
    Memory(Bytes),
}

impl Reader {
    async fn open(source: &ByteSource) -> Result<Self> {
        Ok(match source {
            ByteSource::Path(path) => Reader::File(
                tokio::fs::File::open(path)
                    .await
                    .with_context(|| format!("opening {}", path.display()))?,
            ),
            #[cfg(test)]
            ByteSource::Memory(bytes) => Reader::Memory(bytes.clone()),
        })
    }

    async fn read(&mut self, offset: u64, len: usize) -> Result<Bytes> {
        match self {
            Reader::File(file) => {
                file.seek(SeekFrom::Start(offset)).await?;
                let mut buf = vec![0u8; len];
                file.read_exact(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
            #[cfg(test)]
            Reader::Memory(bytes) => {
                let start = offset as usize;
                Ok(bytes.slice(start..start + len))
            }
        }
    }
}

/// Run an outbound transfer to completion, failure or cancellation.
pub async fn run_send<E>(
    transfer: OutboundTransfer,
    lane: FrameLane,
    sos: SignalOfStop,
    events: mpsc::UnboundedSender<E>,
) where
    E: From<TransferEvent> + Send,
{
    let peer_id = transfer.peer_id.clone();
    let file_id = transfer.meta.file_id.clone();
    let report = |event: TransferEvent| {
        let _ = events.send(E::from(event));
    };

    match send_all(&transfer, &lane, &sos, &report).await {
        Ok(true) => {
            info!(event = "transfer_sent", peer_id = %peer_id, file_id = %file_id, "File sent");
            report(TransferEvent::Sent { peer_id, file_id });
        }
        Ok(false) => {
            debug!(event = "transfer_cancelled", peer_id = %peer_id, file_id = %file_id, "Send stopped");
        }
        Err(error) => {
            warn!(event = "transfer_send_failure", peer_id = %peer_id, file_id = %file_id, error = %error, "File send failed");
            report(TransferEvent::Failed {
                peer_id,
                file_id,
                error,
            });
        }
    }
}

/// `Ok(false)` means cancelled.
async fn send_all(
    transfer: &OutboundTransfer,
    lane: &FrameLane,
    sos: &SignalOfStop,
    report: &(dyn Fn(TransferEvent) + Sync),
) -> Result<bool, CallError> {
    let meta = &transfer.meta;
    let total = expected_chunk_count(meta.size, meta.chunk_size);

    if sos.cancelled() {
        return Ok(false);
    }
    if let Err(e) = lane.send_frame(&ControlFrame::FileMetadata(meta.clone())).await {
        return Err(CallError::ChunkSendFailure {
            file_id: meta.file_id.clone(),
            index: 0,
            attempts: 1,
            reason: format!("metadata: {e}"),
        });
    }

    let mut reader = Reader::open(&transfer.source)
        .await
        .map_err(|e| CallError::StorageUnavailable(e.to_string()))?;
    let mut sent = 0u64;

    for index in 0..total {
        let (offset, len) = chunk_range(index, meta.size, meta.chunk_size);
        let data = reader
            .read(offset, len)
            .await
            .map_err(|e| CallError::StorageUnavailable(e.to_string()))?;
        let header = ChunkHeader {
            file_id: meta.file_id.clone(),
            index,
            last: is_last(offset, len, meta.size),
        };

        let mut attempt = 0u32;
        loop {
            if sos.cancelled() {
                return Ok(false);
            }
            match lane.send_pair(&header, data.clone()).await {
                Ok(()) => break,
                Err(e) => {
                    attempt += 1;
                    if !CHUNK_BACKOFF.allows(attempt) {
                        return Err(CallError::ChunkSendFailure {
                            file_id: meta.file_id.clone(),
                            index,
                            attempts: attempt,
                            reason: e.to_string(),
                        });
                    }
                    let delay = CHUNK_BACKOFF.delay(attempt);
                    debug!(
                        event = "chunk_retry",
                        file_id = %meta.file_id,
                        index,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying chunk"
                    );
                    if !sos.sleep(delay).await {
                        return Ok(false);
                    }
                }
            }
        }

        sent += len as u64;
        report(TransferEvent::Progress {
            peer_id: transfer.peer_id.clone(),
            file_id: meta.file_id.clone(),
            percent: progress_percent(sent, meta.size),
        });
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::transport::testing::{Call, RecordingTransport};
    use std::sync::atomic::Ordering;

    fn collect(rx: &mut mpsc::UnboundedReceiver<TransferEvent>) -> Vec<TransferEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn sends_metadata_then_interleaved_pairs() {
        let transport = RecordingTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<TransferEvent>();
        let data: Bytes = (0..40_000u32).map(|i| i as u8).collect::<Vec<_>>().into();
        let transfer = OutboundTransfer::from_bytes(&"bob".into(), "a.bin", data.clone(), 16384);
        let file_id = transfer.meta.file_id.clone();

        run_send(transfer, FrameLane::new(transport.clone()), SignalOfStop::new(), tx).await;

        let calls = transport.calls();
        assert_eq!(calls.len(), 7);
        let Call::Text(first) = &calls[0] else { panic!() };
        assert!(matches!(ControlFrame::parse(first).unwrap(), ControlFrame::FileMetadata(_)));

        let mut rebuilt = Vec::new();
        let mut lasts = Vec::new();
        for pair in calls[1..].chunks(2) {
            let (Call::Text(t), Call::Binary(b)) = (&pair[0], &pair[1]) else { panic!() };
            let ControlFrame::FileChunk(h) = ControlFrame::parse(t).unwrap() else { panic!() };
            lasts.push(h.last);
            rebuilt.extend_from_slice(b);
        }
        assert_eq!(lasts, vec![false, false, true]);
        assert_eq!(rebuilt, data.to_vec());

        let events = collect(&mut rx);
        let percents: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                TransferEvent::Progress { percent, .. } => Some(*percent),
                _ => None,
            })
            .collect();
        assert_eq!(percents, vec![41, 82, 100]);
        assert_eq!(
            events.last(),
            Some(&TransferEvent::Sent {
                peer_id: "bob".into(),
                file_id
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried() {
        let transport = RecordingTransport::new();
        transport.fail_binary.store(2, Ordering::Release);
        let (tx, mut rx) = mpsc::unbounded_channel::<TransferEvent>();
        let transfer = OutboundTransfer::from_bytes(&"bob".into(), "a.txt", Bytes::from_static(b"hi"), 16384);

        run_send(transfer, FrameLane::new(transport.clone()), SignalOfStop::new(), tx).await;

        let binaries = transport.calls().into_iter().filter(|c| matches!(c, Call::Binary(_))).count();
        assert_eq!(binaries, 1);
        // Each attempt re-sends the header.
        assert_eq!(transport.texts().len(), 4);
        assert!(matches!(collect(&mut rx).last(), Some(TransferEvent::Sent { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail_without_touching_later_chunks() {
        let transport = RecordingTransport::new();
        transport.fail_binary.store(u32::MAX, Ordering::Release);
        let (tx, mut rx) = mpsc::unbounded_channel::<TransferEvent>();
        let transfer = OutboundTransfer::from_bytes(&"bob".into(), "a.bin", Bytes::from(vec![0u8; 40_000]), 16384);

        run_send(transfer, FrameLane::new(transport.clone()), SignalOfStop::new(), tx).await;

        let headers: Vec<ChunkHeader> = transport
            .texts()
            .iter()
            .filter_map(|t| match ControlFrame::parse(t).unwrap() {
                ControlFrame::FileChunk(h) => Some(h),
                _ => None,
            })
            .collect();
        assert_eq!(headers.len(), 1 + MAX_CHUNK_RETRIES as usize);
        assert!(headers.iter().all(|h| h.index == 0));

        match collect(&mut rx).pop() {
            Some(TransferEvent::Failed {
                error: CallError::ChunkSendFailure { index, attempts, .. },
                ..
            }) => {
                assert_eq!(index, 0);
                assert_eq!(attempts, MAX_CHUNK_RETRIES + 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_silently() {
        let transport = RecordingTransport::new();
        transport.fail_binary.store(u32::MAX, Ordering::Release);
        let (tx, mut rx) = mpsc::unbounded_channel::<TransferEvent>();
        let transfer = OutboundTransfer::from_bytes(&"bob".into(), "a.bin", Bytes::from_static(b"x"), 16384);
        let sos = SignalOfStop::new();

        let task = tokio::spawn(run_send(transfer, FrameLane::new(transport.clone()), sos.clone(), tx));
        tokio::task::yield_now().await;
        sos.cancel();
        task.await.unwrap();

        assert!(collect(&mut rx).is_empty());
        assert!(transport.texts().len() < 1 + 1 + MAX_CHUNK_RETRIES as usize);
    }

    #[tokio::test]
    async fn reads_chunks_from_disk() {
        let dir = std::env::temp_dir().join("cybercall_test_sender_disk");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("notes.txt");
        let content: Vec<u8> = (0..20_000u32).map(|i| (i % 97) as u8).collect();
        std::fs::write(&path, &content).unwrap();

        let transfer = OutboundTransfer::from_path(&"bob".into(), path, 16384).await.unwrap();
        assert_eq!(transfer.meta.size, 20_000);
        assert_eq!(transfer.meta.file_type, "text/plain");
        let transport = RecordingTransport::new();
        let (tx, _rx) = mpsc::unbounded_channel::<TransferEvent>();
        run_send(transfer, FrameLane::new(transport.clone()), SignalOfStop::new(), tx).await;

        let bytes: Vec<u8> = transport
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Binary(b) => Some(b.to_vec()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(bytes, content);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
