//! Posts archive: `post` frames received from peers (and our own), keyed by
//! id in `<data_dir>/posts.json`. Failures are logged by the caller and never
//! touch sessions.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::core::transfer::frames::Post;

#[derive(Serialize, Deserialize, Default, Debug)]
pub struct PostArchive {
    pub posts: BTreeMap<String, Post>,
    #[serde(skip)]
    path: PathBuf,
}

impl PostArchive {
    pub fn load(path: &Path) -> Result<Self> {
        let mut archive = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str::<PostArchive>(&content)?
        } else {
            Self::default()
        };
        archive.path = path.to_path_buf();
        Ok(archive)
    }

    /// An empty archive that will be written to `path`.
    pub fn empty(path: &Path) -> Self {
        Self {
            posts: BTreeMap::new(),
            path: path.to_path_buf(),
        }
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        crate::utils::atomic_write::atomic_write(&self.path, content.as_bytes())
    }

    /// Store a post. Returns `false` (and writes nothing) for a duplicate id.
    pub fn insert(&mut self, post: Post) -> Result<bool> {
        if self.posts.contains_key(&post.id) {
            return Ok(false);
        }
        self.posts.insert(post.id.clone(), post);
        self.save()?;
        Ok(true)
    }

    pub fn remove(&mut self, post_id: &str) -> Result<bool> {
        if self.posts.remove(post_id).is_none() {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post(id: &str) -> Post {
        Post {
            id: id.into(),
            content: "hello".into(),
            sender: "alice".into(),
            timestamp: "2026-01-01T00:00:00.000Z".into(),
        }
    }

    #[test]
    fn insert_is_idempotent_and_delete_persists() {
        let dir = std::env::temp_dir().join("cybercall_test_posts");
        let _ = std::fs::remove_dir_all(&dir);
        let path = dir.join("posts.json");

        let mut archive = PostArchive::load(&path).unwrap();
        assert!(archive.insert(post("p1")).unwrap());
        assert!(!archive.insert(post("p1")).unwrap());
        assert!(archive.insert(post("p2")).unwrap());
        assert!(archive.remove("p1").unwrap());
        assert!(!archive.remove("p1").unwrap());

        let reloaded = PostArchive::load(&path).unwrap();
        assert_eq!(reloaded.posts.keys().collect::<Vec<_>>(), vec!["p2"]);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
