//! Durable artifact storage
//!
//! `ArtifactStorage` picks a backend from config and adds the policies that
//! sit above any backend (retention). Backends only know how to persist,
//! enumerate and delete records by id.

mod filesystem;

pub use filesystem::FileSystemStorage;

use crate::artifact::Artifact;
use crate::config::{StorageBackendKind, StorageConfig};
use crate::{CcaError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::info;

/// Aggregate storage statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    pub count: usize,
    /// Sum of content lengths in characters
    pub size: usize,
}

/// Persistence contract for artifacts
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Persist an artifact, replacing any record with the same id
    async fn store(&self, artifact: &Artifact) -> Result<()>;

    /// Look up an artifact by id. Absence is `Ok(None)`.
    async fn retrieve(&self, id: &str) -> Result<Option<Artifact>>;

    /// Every readable record. Unreadable records are skipped.
    async fn list(&self) -> Result<Vec<Artifact>>;

    /// Remove a record; missing ids are not an error
    async fn delete(&self, id: &str) -> Result<()>;

    /// Remove every record
    async fn clear(&self) -> Result<()>;

    /// Case-insensitive substring search over content and tags
    async fn search(&self, query: &str) -> Result<Vec<Artifact>> {
        let query_lower = query.to_lowercase();
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|a| a.matches(&query_lower))
            .collect())
    }

    async fn stats(&self) -> Result<StorageStats> {
        let artifacts = self.list().await?;
        Ok(StorageStats {
            count: artifacts.len(),
            size: artifacts.iter().map(Artifact::size).sum(),
        })
    }
}

/// Storage manager used by the memory system
pub struct ArtifactStorage {
    backend: Box<dyn StorageBackend>,
    retention_days: Option<u64>,
}

impl ArtifactStorage {
    /// Build storage for `config`, rooted at `root`
    pub fn new(config: &StorageConfig, root: std::path::PathBuf) -> Result<Self> {
        let backend: Box<dyn StorageBackend> = match config.backend {
            StorageBackendKind::Filesystem => Box::new(FileSystemStorage::new(root)),
            other => return Err(CcaError::UnsupportedBackend(other.as_str().to_string())),
        };
        Ok(Self {
            backend,
            retention_days: config.retention_days,
        })
    }

    /// Wrap an arbitrary backend
    pub fn with_backend(backend: Box<dyn StorageBackend>, retention_days: Option<u64>) -> Self {
        Self {
            backend,
            retention_days,
        }
    }

    pub async fn store(&self, artifact: &Artifact) -> Result<()> {
        self.backend.store(artifact).await
    }

    pub async fn retrieve(&self, id: &str) -> Result<Option<Artifact>> {
        self.backend.retrieve(id).await
    }

    pub async fn search(&self, query: &str) -> Result<Vec<Artifact>> {
        self.backend.search(query).await
    }

    pub async fn list(&self) -> Result<Vec<Artifact>> {
        self.backend.list().await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.backend.delete(id).await
    }

    pub async fn clear(&self) -> Result<()> {
        self.backend.clear().await
    }

    pub async fn stats(&self) -> Result<StorageStats> {
        self.backend.stats().await
    }

    /// Delete records older than the retention window. Returns how many were removed.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let Some(days) = self.retention_days else {
            return Ok(0);
        };
        let cutoff = now - Duration::days(days as i64);
        let mut removed = 0;
        for artifact in self.backend.list().await? {
            if artifact.timestamp < cutoff {
                self.backend.delete(&artifact.id).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Purged {} artifacts older than {} days", removed, days);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{ArtifactType, ScopeType};
    use tempfile::TempDir;

    fn make_storage(retention_days: Option<u64>) -> (TempDir, ArtifactStorage) {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig {
            retention_days,
            ..StorageConfig::default()
        };
        let storage = ArtifactStorage::new(&config, dir.path().join("memory")).unwrap();
        (dir, storage)
    }

    #[test]
    fn test_database_backend_unsupported() {
        let config = StorageConfig {
            backend: StorageBackendKind::Database,
            ..StorageConfig::default()
        };
        let result = ArtifactStorage::new(&config, "/tmp/unused".into());
        assert!(matches!(result, Err(CcaError::UnsupportedBackend(b)) if b == "database"));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (_dir, storage) = make_storage(Some(30));
        let now = Utc::now();

        let fresh = Artifact::new("fresh", ArtifactType::Pattern, "new", ScopeType::Repository)
            .with_timestamp(now - Duration::days(1));
        let stale = Artifact::new("stale", ArtifactType::Pattern, "old", ScopeType::Repository)
            .with_timestamp(now - Duration::days(45));
        storage.store(&fresh).await.unwrap();
        storage.store(&stale).await.unwrap();

        assert_eq!(storage.purge_expired(now).await.unwrap(), 1);
        assert!(storage.retrieve("fresh").await.unwrap().is_some());
        assert!(storage.retrieve("stale").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_without_retention_is_noop() {
        let (_dir, storage) = make_storage(None);
        let ancient = Artifact::new("old", ArtifactType::BuildLog, "log", ScopeType::Session)
            .with_timestamp(Utc::now() - Duration::days(3650));
        storage.store(&ancient).await.unwrap();

        assert_eq!(storage.purge_expired(Utc::now()).await.unwrap(), 0);
        assert_eq!(storage.stats().await.unwrap().count, 1);
    }
}
