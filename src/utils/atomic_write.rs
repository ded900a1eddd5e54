//! Write-to-temp-then-rename for every persisted file (identity, friends,
//! posts, delivered downloads).
//!
//! - The temp file sits next to the target so the rename stays on one mount.
//! - On rename failure the temp file is removed.
//! - Parent directories are created if absent.

use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::error;

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Atomically write `content` to `path`.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(path);

    std::fs::write(&tmp, content).map_err(|e| {
        error!(event = "atomic_write_failure", path = %tmp.display(), error = %e, "Failed to write temp file");
        e
    })?;

    std::fs::rename(&tmp, path).map_err(|e| {
        error!(
            event = "atomic_rename_failure",
            from = %tmp.display(),
            to = %path.display(),
            error = %e,
            "Failed to rename temp file"
        );
        let _ = std::fs::remove_file(&tmp);
        e
    })?;

    Ok(())
}

/// Async variant for large payloads written from the node task.
pub async fn atomic_write_async(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = tmp_path(path);

    if let Err(e) = tokio::fs::write(&tmp, content).await {
        error!(event = "atomic_write_failure", path = %tmp.display(), error = %e, "Failed to write temp file");
        return Err(e.into());
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        error!(
            event = "atomic_rename_failure",
            from = %tmp.display(),
            to = %path.display(),
            error = %e,
            "Failed to rename temp file"
        );
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overwrites_and_leaves_no_temp_file() {
        let dir = std::env::temp_dir().join("cybercall_test_atomic");
        let _ = std::fs::remove_dir_all(&dir);
        let path = dir.join("nested").join("state.json");

        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        assert!(!tmp_path(&path).exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn async_write_keeps_binary_content() {
        let dir = std::env::temp_dir().join("cybercall_test_atomic_async");
        let _ = std::fs::remove_dir_all(&dir);
        let path = dir.join("photo.png");

        atomic_write_async(&path, &[0u8, 159, 146, 150]).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), vec![0u8, 159, 146, 150]);
        assert!(!tmp_path(&path).exists());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
