//! Hierarchical memory: scope routing, fan-out retrieval and task context injection.

use super::compression::{CompressionOptions, ContextCompressionEngine};
use super::scope::{Scope, ScopeStats, TaskContext};
use crate::artifact::{Artifact, ScopeType};
use crate::config::MemoryConfig;
use crate::storage::ArtifactStorage;
use crate::{CcaError, Result};
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Per-scope share of a retrieval result
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScopeBreakdown {
    pub artifacts: usize,
    pub tokens: usize,
}

/// Context returned by `retrieve`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievedContext {
    pub artifacts: Vec<Artifact>,
    pub compression_ratio: f64,
    pub total_tokens: usize,
    /// Breakdown over the returned artifacts only, keyed by scope name
    pub scopes: BTreeMap<String, ScopeBreakdown>,
}

/// Aggregate statistics across every registered scope
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub scopes: usize,
    pub artifacts: usize,
    pub total_tokens: usize,
}

/// Multi-scope memory for a repository and its submodules
pub struct HierarchicalMemory {
    config: MemoryConfig,
    /// Registration order: repository, submodules, session, then task scopes
    scopes: RwLock<Vec<Arc<Scope>>>,
    compression: ContextCompressionEngine,
    storage: ArtifactStorage,
}

impl HierarchicalMemory {
    /// Create the memory with its fixed scopes. Task scopes are created on demand.
    pub fn new(config: MemoryConfig) -> Result<Self> {
        let storage = ArtifactStorage::new(&config.storage, config.storage_path())?;
        Ok(Self::with_storage(config, storage))
    }

    /// Create the memory over an already-built storage
    pub fn with_storage(config: MemoryConfig, storage: ArtifactStorage) -> Self {
        let budgets = config.compression.scope_budgets;
        let mut scopes = Vec::with_capacity(config.submodules.len() + 2);
        scopes.push(Arc::new(Scope::repository(
            config.repository.clone(),
            budgets.repository,
        )));
        for submodule in &config.submodules {
            scopes.push(Arc::new(Scope::submodule(
                submodule.clone(),
                config.repository.clone(),
                budgets.submodule,
            )));
        }
        scopes.push(Arc::new(Scope::session(None, budgets.session)));

        debug!("Initialized {} scopes", scopes.len());

        Self {
            compression: ContextCompressionEngine::new(config.compression.clone()),
            config,
            scopes: RwLock::new(scopes),
            storage,
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn storage(&self) -> &ArtifactStorage {
        &self.storage
    }

    /// Rebuild scope indexes from durable storage.
    ///
    /// Task-scoped records recreate their task scope (without injection);
    /// records whose scope cannot exist are skipped. Returns how many were loaded.
    ///
    /// Task contexts are not persisted, so a recreated task scope has an empty
    /// title, description and label set.
    pub async fn initialize(&self) -> Result<usize> {
        let mut loaded = 0;
        for artifact in self.storage.list().await? {
            let scope_name = artifact.scope_name();
            if artifact.metadata.scope == ScopeType::Task && self.find_scope(&scope_name).await.is_none() {
                if let Some(task_id) = artifact.metadata.task_id.clone() {
                    self.register_task_scope(&task_id, TaskContext::default()).await?;
                }
            }
            let Some(scope) = self.find_scope(&scope_name).await else {
                warn!("Skipping artifact {}: no scope {}", artifact.id, scope_name);
                continue;
            };
            match scope.store(artifact).await {
                Ok(()) => loaded += 1,
                Err(e) => warn!("Skipping persisted artifact: {}", e),
            }
        }
        info!("Loaded {} artifacts from storage", loaded);
        Ok(loaded)
    }

    /// Store an artifact in its owning scope, then persist it.
    ///
    /// Nothing is persisted when the scope is missing or rejects the artifact,
    /// or when its confidence is outside `[0, 1]`.
    pub async fn store(&self, artifact: Artifact) -> Result<()> {
        if let Some(confidence) = artifact.metadata.confidence {
            if !(0.0..=1.0).contains(&confidence) {
                return Err(CcaError::Admission(format!(
                    "Confidence of {} must be within [0, 1], got {}",
                    artifact.id, confidence
                )));
            }
        }

        let scope_name = artifact.scope_name();
        let scope = self
            .find_scope(&scope_name)
            .await
            .ok_or_else(|| CcaError::Admission(format!("Scope not found: {}", scope_name)))?;

        scope.store(artifact.clone()).await?;
        self.storage.store(&artifact).await
    }

    /// Retrieve context for `query` from every non-task scope plus `active_scope`.
    pub async fn retrieve(&self, query: &str, active_scope: Option<&str>) -> Result<RetrievedContext> {
        let scopes: Vec<Arc<Scope>> = self
            .scopes
            .read()
            .await
            .iter()
            .filter(|s| !s.is_task() || Some(s.name()) == active_scope)
            .cloned()
            .collect();

        let pooled: Vec<Artifact> = join_all(scopes.iter().map(|s| s.retrieve(query)))
            .await
            .into_iter()
            .flatten()
            .collect();

        let options = CompressionOptions::new(self.config.compression.target_tokens)
            .with_active_scope(active_scope.map(str::to_string));
        let compressed = self.compression.compress(pooled, &options);

        let mut breakdown: BTreeMap<String, ScopeBreakdown> = BTreeMap::new();
        for artifact in &compressed.artifacts {
            let entry = breakdown.entry(artifact.scope_name()).or_default();
            entry.artifacts += 1;
            entry.tokens += artifact.tokens();
        }

        Ok(RetrievedContext {
            artifacts: compressed.artifacts,
            compression_ratio: compressed.ratio,
            total_tokens: compressed.total_tokens,
            scopes: breakdown,
        })
    }

    /// Raw matches from a single named scope, without compression
    pub async fn retrieve_from_scope(&self, scope_name: &str, query: &str) -> Result<Vec<Artifact>> {
        let scope = self
            .find_scope(scope_name)
            .await
            .ok_or_else(|| CcaError::Admission(format!("Scope not found: {}", scope_name)))?;
        Ok(scope.retrieve(query).await)
    }

    /// Create a task scope and inject relevant artifacts from the other scopes.
    ///
    /// Returns the number of artifacts injected.
    pub async fn create_task_scope(&self, task_id: &str, task_context: TaskContext) -> Result<usize> {
        let query = task_context.query();
        self.register_task_scope(task_id, task_context).await?;
        info!("Created task scope task:{}", task_id);

        let injected = self.inject_relevant_notes(task_id, &query).await?;
        info!("Injected {} artifacts into task:{}", injected, task_id);
        Ok(injected)
    }

    async fn register_task_scope(&self, task_id: &str, task_context: TaskContext) -> Result<()> {
        let scope = Scope::task(
            task_id,
            task_context,
            self.config.compression.scope_budgets.task,
        );
        let mut scopes = self.scopes.write().await;
        if scopes.iter().any(|s| s.name() == scope.name()) {
            return Err(CcaError::DuplicateScope(scope.name().to_string()));
        }
        scopes.push(Arc::new(scope));
        Ok(())
    }

    async fn inject_relevant_notes(&self, task_id: &str, query: &str) -> Result<usize> {
        let scope_name = format!("task:{}", task_id);
        let context = self.retrieve(query, Some(&scope_name)).await?;

        let mut injected = 0;
        for source in context.artifacts {
            self.store(task_copy(source, task_id)).await?;
            injected += 1;
        }
        Ok(injected)
    }

    /// Empty every scope, task scopes included. Scopes stay registered and storage is untouched.
    pub async fn clear(&self) {
        for scope in self.scopes.read().await.iter() {
            scope.clear().await;
        }
    }

    /// `clear` plus removal of every durable record
    pub async fn purge(&self) -> Result<()> {
        self.clear().await;
        self.storage.clear().await
    }

    pub async fn stats(&self) -> MemoryStats {
        let scopes = self.scopes.read().await;
        let mut stats = MemoryStats {
            scopes: scopes.len(),
            ..MemoryStats::default()
        };
        for scope in scopes.iter() {
            let scope_stats = scope.stats().await;
            stats.artifacts += scope_stats.artifacts;
            stats.total_tokens += scope_stats.tokens;
        }
        stats
    }

    pub async fn scope_names(&self) -> Vec<String> {
        self.scopes
            .read()
            .await
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    pub async fn scope_stats(&self, scope_name: &str) -> Option<ScopeStats> {
        Some(self.find_scope(scope_name).await?.stats().await)
    }

    async fn find_scope(&self, scope_name: &str) -> Option<Arc<Scope>> {
        self.scopes
            .read()
            .await
            .iter()
            .find(|s| s.name() == scope_name)
            .cloned()
    }
}

/// Copy of `source` re-homed into a task scope under a derived id
fn task_copy(source: Artifact, task_id: &str) -> Artifact {
    let mut copy = source;
    copy.id = format!("{}.task-{}", copy.id, task_id);
    copy.metadata.scope = ScopeType::Task;
    copy.metadata.task_id = Some(task_id.to_string());
    copy
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactType;
    use crate::memory::ScopeKind;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn make_memory(target_tokens: usize) -> (TempDir, HierarchicalMemory) {
        let dir = TempDir::new().unwrap();
        let config = MemoryConfig::new(PathBuf::from("/repo"))
            .with_submodules(["sdk", "juce_backend", "swift_frontend"])
            .with_storage_path(dir.path().join("memory"))
            .with_target_tokens(target_tokens);
        let memory = HierarchicalMemory::new(config).unwrap();
        (dir, memory)
    }

    fn repo(id: &str, content: &str) -> Artifact {
        Artifact::new(id, ArtifactType::Pattern, content, ScopeType::Repository)
    }

    fn sub(id: &str, submodule: &str, content: &str) -> Artifact {
        Artifact::new(id, ArtifactType::Pattern, content, ScopeType::Submodule).with_submodule(submodule)
    }

    #[tokio::test]
    async fn test_initial_scopes_in_order() {
        let (_dir, memory) = make_memory(10_000);
        assert_eq!(
            memory.scope_names().await,
            vec![
                "repository",
                "submodule:sdk",
                "submodule:juce_backend",
                "submodule:swift_frontend",
                "session"
            ]
        );
        assert_eq!(memory.stats().await.scopes, 5);
    }

    #[tokio::test]
    async fn test_store_routes_and_persists() {
        let (_dir, memory) = make_memory(10_000);
        memory.store(sub("s1", "sdk", "SDK pattern: use Vitest")).await.unwrap();

        assert_eq!(memory.scope_stats("submodule:sdk").await.unwrap().artifacts, 1);
        assert_eq!(memory.scope_stats("repository").await.unwrap().artifacts, 0);
        assert!(memory.storage().retrieve("s1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unknown_submodule_fails_without_persisting() {
        let (_dir, memory) = make_memory(10_000);
        let err = memory
            .store(sub("bad", "wrong_submodule", "Wrong artifact"))
            .await
            .unwrap_err();

        assert!(matches!(err, CcaError::Admission(_)));
        assert!(memory.storage().retrieve("bad").await.unwrap().is_none());
        assert_eq!(memory.stats().await.artifacts, 0);
    }

    #[tokio::test]
    async fn test_unknown_task_fails() {
        let (_dir, memory) = make_memory(10_000);
        let artifact = Artifact::new("t", ArtifactType::TestResult, "x", ScopeType::Task).with_task("bd-404");
        assert!(matches!(memory.store(artifact).await, Err(CcaError::Admission(_))));
    }

    #[tokio::test]
    async fn test_retrieve_pools_scopes_with_breakdown() {
        let (_dir, memory) = make_memory(10_000);
        memory
            .store(repo("r1", "Repository pattern: strict mode").with_tags(["typescript"]))
            .await
            .unwrap();
        memory.store(sub("s1", "sdk", "SDK pattern: Vitest")).await.unwrap();
        memory
            .store(Artifact::new("x1", ArtifactType::Conversation, "unrelated chat", ScopeType::Session))
            .await
            .unwrap();

        let context = memory.retrieve("pattern", None).await.unwrap();
        assert_eq!(context.artifacts.len(), 2);
        assert_eq!(context.compression_ratio, 1.0);
        assert_eq!(context.scopes.len(), 2);
        assert_eq!(context.scopes["repository"].artifacts, 1);
        assert_eq!(context.scopes["submodule:sdk"].tokens, 5);
        assert_eq!(
            context.total_tokens,
            context.scopes.values().map(|b| b.tokens).sum::<usize>()
        );
    }

    #[tokio::test]
    async fn test_breakdown_reflects_only_returned_artifacts() {
        let (_dir, memory) = make_memory(10);
        memory
            .store(repo("big", &format!("pattern {}", "x".repeat(200))).with_confidence(0.9))
            .await
            .unwrap();
        memory
            .store(sub("small", "sdk", "pattern a").with_confidence(0.4))
            .await
            .unwrap();

        let context = memory.retrieve("pattern", None).await.unwrap();
        assert_eq!(context.artifacts.len(), 1);
        assert_eq!(context.artifacts[0].id, "small");
        assert_eq!(context.compression_ratio, 0.5);
        assert!(!context.scopes.contains_key("repository"));
        assert!(context.total_tokens <= 10);
    }

    #[tokio::test]
    async fn test_duplicate_task_scope_rejected() {
        let (_dir, memory) = make_memory(10_000);
        memory
            .create_task_scope("T", TaskContext::new("Fix CI", "Python"))
            .await
            .unwrap();
        memory
            .store(Artifact::new("t1", ArtifactType::TestResult, "ok", ScopeType::Task).with_task("T"))
            .await
            .unwrap();

        let err = memory
            .create_task_scope("T", TaskContext::new("Again", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, CcaError::DuplicateScope(name) if name == "task:T"));
        assert_eq!(memory.scope_stats("task:T").await.unwrap().artifacts, 1);
        assert_eq!(memory.stats().await.scopes, 6);
    }

    #[tokio::test]
    async fn test_task_scopes_hidden_unless_active() {
        let (_dir, memory) = make_memory(10_000);
        memory
            .create_task_scope("bd-1", TaskContext::new("nothing matches", ""))
            .await
            .unwrap();
        memory
            .store(
                Artifact::new("t1", ArtifactType::DesignDecision, "deploy with canary", ScopeType::Task)
                    .with_task("bd-1"),
            )
            .await
            .unwrap();

        assert!(memory.retrieve("canary", None).await.unwrap().artifacts.is_empty());
        assert!(memory.retrieve("canary", Some("task:bd-2")).await.unwrap().artifacts.is_empty());
        assert_eq!(memory.retrieve("canary", Some("task:bd-1")).await.unwrap().artifacts.len(), 1);
    }

    #[tokio::test]
    async fn test_context_injection_copies_matches() {
        let (_dir, memory) = make_memory(10_000);
        memory
            .store(sub("p1", "juce_backend", "JUCE backend requires Python 3.10+ for CI").with_tags(["python"]))
            .await
            .unwrap();
        memory.store(repo("r1", "Unrelated convention")).await.unwrap();

        let injected = memory
            .create_task_scope("bd-456", TaskContext::new("python", ""))
            .await
            .unwrap();
        assert_eq!(injected, 1);

        let in_task = memory.retrieve_from_scope("task:bd-456", "python").await.unwrap();
        assert_eq!(in_task.len(), 1);
        assert_eq!(in_task[0].metadata.scope, ScopeType::Task);
        assert_eq!(in_task[0].metadata.task_id.as_deref(), Some("bd-456"));
        assert_eq!(in_task[0].metadata.submodule.as_deref(), Some("juce_backend"));

        // Source stays where it was, both records are durable
        assert_eq!(memory.retrieve_from_scope("submodule:juce_backend", "python").await.unwrap().len(), 1);
        assert_eq!(memory.storage().stats().await.unwrap().count, 3);

        let context = memory.retrieve("python", Some("task:bd-456")).await.unwrap();
        assert_eq!(context.artifacts.len(), 2);
        assert_eq!(context.scopes["task:bd-456"].artifacts, 1);
        assert_eq!(context.scopes["submodule:juce_backend"].artifacts, 1);
    }

    #[tokio::test]
    async fn test_clear_keeps_scopes() {
        let (_dir, memory) = make_memory(10_000);
        memory.store(repo("r1", "alpha beta")).await.unwrap();
        memory.create_task_scope("T", TaskContext::new("alpha", "")).await.unwrap();
        assert_eq!(memory.stats().await.artifacts, 2);

        memory.clear().await;
        let stats = memory.stats().await;
        assert_eq!(stats.artifacts, 0);
        assert_eq!(stats.total_tokens, 0);
        assert_eq!(stats.scopes, 6);
        // Durable records survive a plain clear
        assert_eq!(memory.storage().stats().await.unwrap().count, 2);
    }

    #[tokio::test]
    async fn test_purge_removes_durable_records() {
        let (_dir, memory) = make_memory(10_000);
        memory.store(repo("r1", "a")).await.unwrap();
        memory.purge().await.unwrap();
        assert_eq!(memory.storage().stats().await.unwrap().count, 0);
    }

    #[tokio::test]
    async fn test_initialize_rehydrates_scopes() {
        let dir = TempDir::new().unwrap();
        let config = MemoryConfig::new(PathBuf::from("/repo"))
            .with_submodules(["sdk"])
            .with_storage_path(dir.path().join("memory"));

        {
            let memory = HierarchicalMemory::new(config.clone()).unwrap();
            memory.store(sub("s1", "sdk", "vitest setup")).await.unwrap();
            memory.create_task_scope("bd-9", TaskContext::new("vitest", "")).await.unwrap();
        }

        // A submodule dropped from config leaves its records unloadable
        let orphan = sub("o1", "legacy", "old stuff");
        crate::storage::StorageBackend::store(
            &crate::storage::FileSystemStorage::new(dir.path().join("memory")),
            &orphan,
        )
        .await
        .unwrap();

        let memory = HierarchicalMemory::new(config).unwrap();
        assert_eq!(memory.initialize().await.unwrap(), 2);
        assert_eq!(memory.scope_stats("submodule:sdk").await.unwrap().artifacts, 1);
        assert_eq!(memory.scope_stats("task:bd-9").await.unwrap().artifacts, 1);
        assert_eq!(memory.stats().await.scopes, 4);

        let task = memory.find_scope("task:bd-9").await.unwrap();
        match task.kind() {
            ScopeKind::Task { task_context, .. } => assert_eq!(task_context, &TaskContext::default()),
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_out_of_range_confidence_rejected() {
        let (_dir, memory) = make_memory(100_000);

        for (id, confidence) in [("n1", f64::NAN), ("hi", 7.5), ("lo", -0.1)] {
            let err = memory.store(repo(id, "build cache").with_confidence(confidence)).await.unwrap_err();
            assert!(matches!(err, CcaError::Admission(_)));
            assert!(memory.storage().retrieve(id).await.unwrap().is_none());
        }
        assert!(memory.retrieve("build", None).await.unwrap().artifacts.is_empty());

        memory.store(repo("edge", "build cache").with_confidence(1.0)).await.unwrap();
        memory.store(repo("zero", "build cache").with_confidence(0.0)).await.unwrap();
        assert_eq!(memory.stats().await.artifacts, 2);
    }

    #[tokio::test]
    async fn test_session_scope_accepts_session_artifacts() {
        let (_dir, memory) = make_memory(10_000);
        memory
            .store(Artifact::new("c1", ArtifactType::Conversation, "discussion", ScopeType::Session))
            .await
            .unwrap();
        let context = memory.retrieve("discussion", None).await.unwrap();
        assert_eq!(context.scopes["session"].artifacts, 1);
    }
}
