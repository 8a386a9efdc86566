//! Filesystem-backed artifact storage
//!
//! Layout: `<root>/<first 2 chars>/<encoded id>.json`, one pretty-printed JSON
//! record per artifact. The two-character shard bounds directory fan-out.

use super::StorageBackend;
use crate::artifact::Artifact;
use crate::{CcaError, Result};
use async_trait::async_trait;
use glob::{glob, Pattern};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

pub struct FileSystemStorage {
    root: PathBuf,
}

impl FileSystemStorage {
    /// Create storage rooted at `root`. The directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the record for `id`
    ///
    /// Bytes outside `[A-Za-z0-9._-]` are written as `%XX`, so distinct ids
    /// always map to distinct files.
    pub fn record_path(&self, id: &str) -> PathBuf {
        let file_stem = encode_id(id);
        // A shard of "." or ".." would leave the root; the empty id still needs one
        let mut shard: String = file_stem
            .chars()
            .take(2)
            .map(|c| if c == '.' { '_' } else { c })
            .collect();
        if shard.is_empty() {
            shard.push('_');
        }
        self.root.join(shard).join(format!("{}.json", file_stem))
    }

    /// Read and decode one record
    async fn read_record(path: &Path) -> Result<Artifact> {
        let content = fs::read_to_string(path).await?;
        serde_json::from_str(&content).map_err(|e| CcaError::CorruptRecord {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    fn record_files(&self) -> Result<Vec<PathBuf>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        // The root is literal; only the shard and file parts are wildcards
        let root = Pattern::escape(&self.root.to_string_lossy());
        let pattern = Path::new(&root).join("*").join("*.json");
        let pattern = pattern.to_string_lossy();
        let mut files = Vec::new();
        for entry in glob(&pattern).map_err(|e| CcaError::Config(format!("Invalid pattern: {}", e)))? {
            match entry {
                Ok(path) => files.push(path),
                Err(_) => continue,
            }
        }
        Ok(files)
    }
}

/// Percent-encode every byte outside `[A-Za-z0-9._-]`
fn encode_id(id: &str) -> String {
    let mut encoded = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.') {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    encoded
}

#[async_trait]
impl StorageBackend for FileSystemStorage {
    async fn store(&self, artifact: &Artifact) -> Result<()> {
        let path = self.record_path(&artifact.id);
        if let Some(shard_dir) = path.parent() {
            fs::create_dir_all(shard_dir).await?;
        }

        let content = serde_json::to_string_pretty(artifact)?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;

        debug!("Persisted artifact {} to {:?}", artifact.id, path);
        Ok(())
    }

    async fn retrieve(&self, id: &str) -> Result<Option<Artifact>> {
        let path = self.record_path(id);
        match Self::read_record(&path).await {
            // A hand-placed file may carry a different id than its name says
            Ok(artifact) if artifact.id == id => Ok(Some(artifact)),
            Ok(_) => Ok(None),
            Err(CcaError::Io(e)) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(CcaError::CorruptRecord { path, reason }) => {
                warn!("Ignoring corrupt record {:?}: {}", path, reason);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn list(&self) -> Result<Vec<Artifact>> {
        let mut artifacts = Vec::new();
        for path in self.record_files()? {
            match Self::read_record(&path).await {
                Ok(artifact) => artifacts.push(artifact),
                Err(e) => {
                    warn!("Skipping unreadable record {:?}: {}", path, e);
                    continue;
                }
            }
        }
        Ok(artifacts)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let path = self.record_path(id);
        match Self::read_record(&path).await {
            Ok(artifact) if artifact.id != id => {
                debug!("Not deleting {:?}: record belongs to {}", path, artifact.id);
                return Ok(());
            }
            Err(CcaError::Io(e)) if e.kind() == ErrorKind::NotFound => return Ok(()),
            _ => {}
        }
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear(&self) -> Result<()> {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
