//! Durable staging of received chunks, keyed by `(fileId, index)`.
//!
//! `FsChunkStore` lays chunks out as `<root>/<fileId>/<index>.chunk`; a chunk
//! file only appears once its bytes are fully written, so a crash never
//! leaves a truncated chunk behind. `MemoryChunkStore` is the non-durable
//! fallback when the data directory cannot be used.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[async_trait]
pub trait ByteStore: Send + Sync {
    /// Store one chunk. Storing the same `(file_id, index)` again replaces it.
    async fn put(&self, file_id: &str, index: u32, bytes: Bytes) -> Result<()>;

    /// All chunks stored for `file_id`, in ascending index order.
    async fn get_all_by_file_id(&self, file_id: &str) -> Result<Vec<(u32, Bytes)>>;

    /// Remove every chunk for `file_id`. Removing nothing is not an error.
    async fn delete_all_by_file_id(&self, file_id: &str) -> Result<()>;

    /// File ids that currently have at least one chunk directory.
    async fn list_file_ids(&self) -> Result<Vec<String>>;
}

// ── File system ──────────────────────────────────────────────────────────────

pub struct FsChunkStore {
    root: PathBuf,
}

/// Map a file id onto a single safe path component, reversibly.
fn encode_file_id(file_id: &str) -> String {
    let mut out = String::with_capacity(file_id.len());
    for b in file_id.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
            out.push(b as char);
        } else {
            out.push_str(&format!("~{b:02x}"));
        }
    }
    if out.is_empty() {
        out.push('~');
    }
    out
}

fn decode_file_id(encoded: &str) -> Option<String> {
    if encoded == "~" {
        return Some(String::new());
    }
    let raw = encoded.as_bytes();
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'~' {
            let hex = encoded.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(raw[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

impl FsChunkStore {
    pub fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)
            .with_context(|| format!("creating chunk store {}", root.display()))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn dir_for(&self, file_id: &str) -> PathBuf {
        self.root.join(encode_file_id(file_id))
    }
}

#[async_trait]
impl ByteStore for FsChunkStore {
    async fn put(&self, file_id: &str, index: u32, bytes: Bytes) -> Result<()> {
        let dir = self.dir_for(file_id);
        tokio::fs::create_dir_all(&dir).await?;
        let tmp = dir.join(format!("{index}.chunk.tmp"));
        let path = dir.join(format!("{index}.chunk"));

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("committing chunk {index} of {file_id}"))?;
        Ok(())
    }

    async fn get_all_by_file_id(&self, file_id: &str) -> Result<Vec<(u32, Bytes)>> {
        let dir = self.dir_for(file_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut chunks = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(index) = name
                .to_str()
                .and_then(|n| n.strip_suffix(".chunk"))
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            let data = tokio::fs::read(entry.path()).await?;
            chunks.push((index, Bytes::from(data)));
        }
        chunks.sort_by_key(|(index, _)| *index);
        Ok(chunks)
    }

    async fn delete_all_by_file_id(&self, file_id: &str) -> Result<()> {
        match tokio::fs::remove_dir_all(self.dir_for(file_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_file_ids(&self) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let decoded = name.to_str().and_then(decode_file_id);
            match decoded {
                Some(id) => ids.push(id),
                None => {
                    return Err(anyhow!(
                        "unrecognised entry {} in chunk store",
                        entry.path().display()
                    ))
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

// ── Memory ───────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryChunkStore {
    files: Mutex<HashMap<String, BTreeMap<u32, Bytes>>>,
    failing: AtomicBool,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put` fail (storage outage).
    #[cfg(test)]
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }
}

#[async_trait]
impl ByteStore for MemoryChunkStore {
    async fn put(&self, file_id: &str, index: u32, bytes: Bytes) -> Result<()> {
        if self.failing.load(Ordering::Acquire) {
            return Err(anyhow!("chunk store unavailable"));
        }
        self.files
            .lock()
            .await
            .entry(file_id.to_string())
            .or_default()
            .insert(index, bytes);
        Ok(())
    }

    async fn get_all_by_file_id(&self, file_id: &str) -> Result<Vec<(u32, Bytes)>> {
        Ok(self
            .files
            .lock()
            .await
            .get(file_id)
            .map(|chunks| chunks.iter().map(|(i, b)| (*i, b.clone())).collect())
            .unwrap_or_default())
    }

    async fn delete_all_by_file_id(&self, file_id: &str) -> Result<()> {
        self.files.lock().await.remove(file_id);
        Ok(())
    }

    async fn list_file_ids(&self) -> Result<Vec<String>> {
        let mut ids: Vec<_> = self.files.lock().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_id_encoding_is_reversible() {
        for id in ["f1", "../etc/passwd", "a b~c", "", "č"] {
            let enc = encode_file_id(id);
            assert!(!enc.contains('/') && !enc.contains('.'));
            assert_eq!(decode_file_id(&enc).as_deref(), Some(id));
        }
    }

    #[tokio::test]
    async fn fs_store_survives_reopen_and_orders_by_index() {
        let dir = std::env::temp_dir().join("cybercall_test_chunk_store");
        let _ = std::fs::remove_dir_all(&dir);

        let store = FsChunkStore::open(&dir).unwrap();
        store.put("f/1", 1, Bytes::from_static(b"world")).await.unwrap();
        store.put("f/1", 0, Bytes::from_static(b"hello ")).await.unwrap();
        store.put("f/1", 1, Bytes::from_static(b"world")).await.unwrap();
        drop(store);

        let store = FsChunkStore::open(&dir).unwrap();
        assert_eq!(store.list_file_ids().await.unwrap(), vec!["f/1".to_string()]);
        let chunks = store.get_all_by_file_id("f/1").await.unwrap();
        assert_eq!(chunks.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(&chunks[0].1[..], b"hello ");

        store.delete_all_by_file_id("f/1").await.unwrap();
        store.delete_all_by_file_id("f/1").await.unwrap();
        assert!(store.get_all_by_file_id("f/1").await.unwrap().is_empty());
        assert!(store.list_file_ids().await.unwrap().is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn memory_store_can_simulate_outage() {
        let store = MemoryChunkStore::new();
        store.put("f", 0, Bytes::from_static(b"x")).await.unwrap();
        store.set_failing(true);
        assert!(store.put("f", 1, Bytes::from_static(b"y")).await.is_err());
        assert_eq!(store.get_all_by_file_id("f").await.unwrap().len(), 1);
    }
}
