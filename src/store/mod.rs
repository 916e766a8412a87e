pub mod models;
pub mod state;

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Name of the persisted package state document.
pub const STATE_FILENAME: &str = "state.json";

/// Name of the persisted inventory cache document.
pub const ORGA_CACHE_FILENAME: &str = "orga.json";

/// Pluggable blob store for persisted documents (package state, inventory
/// cache). Writes are atomic whole-object replacements.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read an object. Returns `None` if it does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write an object, replacing any previous version.
    async fn put(&self, key: &str, body: &[u8]) -> Result<()>;

    /// Last modification time of an object, if it exists.
    async fn last_modified(&self, key: &str) -> Result<Option<DateTime<Utc>>>;
}

/// Filesystem-backed object store rooted at a directory.
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Build a store from the `StateLocation` package setting. `file://`
    /// prefixes are accepted; anything else is treated as a plain path.
    pub fn from_location(location: &str) -> Self {
        let path = location.strip_prefix("file://").unwrap_or(location);
        Self::new(path)
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(body) => Ok(Some(body)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("Failed to read {}", path.display()))
            }
        }
    }

    async fn put(&self, key: &str, body: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write to a sibling temp file and rename so readers never observe a
        // partial document.
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, body)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }

    async fn last_modified(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        let path = self.path_for(key);
        match tokio::fs::metadata(&path).await {
            Ok(meta) => {
                let modified = meta.modified()?;
                Ok(Some(DateTime::<Utc>::from(modified)))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("Failed to stat {}", path.display()))
            }
        }
    }
}
