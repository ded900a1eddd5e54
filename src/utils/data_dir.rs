//! Data directory for persistent endpoint state.
//!
//! Defaults to `~/.cybercall/` but can be overridden via `--conf`. Resolved
//! once in `main` and passed down; nothing reads it from a global.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Use `custom` if given, otherwise `~/.cybercall/`. Creates the directory.
    pub fn resolve(custom: Option<&Path>) -> Result<Self> {
        let root = match custom {
            Some(p) => p.to_path_buf(),
            None => dirs::home_dir()
                .ok_or_else(|| anyhow!("no home directory found, pass --conf"))?
                .join(".cybercall"),
        };
        std::fs::create_dir_all(&root)
            .with_context(|| format!("creating data dir {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn identity(&self) -> PathBuf {
        self.root.join("identity.json")
    }

    pub fn friends(&self) -> PathBuf {
        self.root.join("friends.json")
    }

    pub fn posts(&self) -> PathBuf {
        self.root.join("posts.json")
    }

    pub fn chunks(&self) -> PathBuf {
        self.root.join("chunks")
    }

    pub fn downloads(&self) -> PathBuf {
        self.root.join("downloads")
    }

    pub fn log_file(&self) -> PathBuf {
        self.root.join("logs").join("cybercall.log")
    }
}
