//! Writing assembled files into the downloads directory.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::core::transfer::receiver::Artifact;
use crate::utils::atomic_write::atomic_write_async;

const MAX_SUFFIX: u32 = 10_000;

/// Reduce a peer-supplied name to a single safe path component.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| match c {
            ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim_matches(|c: char| c == '.' || c.is_whitespace());
    if trimmed.is_empty() {
        "download".to_string()
    } else {
        trimmed.to_string()
    }
}

/// `dir/name`, or `dir/stem (n).ext` for the first `n` not taken yet.
pub async fn unique_path(dir: &Path, name: &str) -> Result<PathBuf> {
    let candidate = dir.join(name);
    if !tokio::fs::try_exists(&candidate).await? {
        return Ok(candidate);
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    };
    for n in 1..MAX_SUFFIX {
        let file = match ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        let candidate = dir.join(file);
        if !tokio::fs::try_exists(&candidate).await? {
            return Ok(candidate);
        }
    }
    bail!("no free file name for {name} in {}", dir.display())
}

/// Write `artifact` into `downloads` without replacing an existing file.
pub async fn deliver(downloads: &Path, artifact: &Artifact) -> Result<PathBuf> {
    tokio::fs::create_dir_all(downloads)
        .await
        .with_context(|| format!("creating {}", downloads.display()))?;
    let path = unique_path(downloads, &sanitize_file_name(&artifact.name)).await?;
    atomic_write_async(&path, &artifact.data).await?;
    info!(
        event = "file_delivered",
        file_id = %artifact.file_id,
        path = %path.display(),
        size = artifact.data.len(),
        "File saved"
    );
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn sanitizes_names() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\x\\a?b.txt"), "a_b.txt");
        assert_eq!(sanitize_file_name(".."), "download");
        assert_eq!(sanitize_file_name("  report.pdf "), "report.pdf");
    }

    #[tokio::test]
    async fn never_overwrites() {
        let dir = std::env::temp_dir().join(format!("cybercall_test_delivery_{}", uuid::Uuid::new_v4()));
        let artifact = Artifact {
            file_id: "f1".into(),
            name: "note.txt".into(),
            mime: "text/plain".into(),
            data: Bytes::from_static(b"hello"),
        };

        let first = deliver(&dir, &artifact).await.unwrap();
        let second = deliver(&dir, &artifact).await.unwrap();
        assert_eq!(first, dir.join("note.txt"));
        assert_eq!(second, dir.join("note (1).txt"));
        assert_eq!(std::fs::read(&second).unwrap(), b"hello");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
