//! Scopes: named partitions of artifacts
//!
//! All four kinds share one contract (store/retrieve/clear/stats) and differ
//! only in which artifacts they admit. The kind is a tag on a single `Scope`
//! type rather than four separate types.

use crate::artifact::{Artifact, ScopeType};
use crate::{CcaError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Maximum length of the query built from a task context
pub const TASK_QUERY_MAX_CHARS: usize = 500;

/// Context describing a task (usually an issue from the tracker)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    /// Any other fields the producer attached
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskContext {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            ..Self::default()
        }
    }

    /// Retrieval query for context injection: title and description, capped at 500 chars
    pub fn query(&self) -> String {
        format!("{} {}", self.title, self.description)
            .chars()
            .take(TASK_QUERY_MAX_CHARS)
            .collect()
    }
}

/// Scope kind together with its construction parameters
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ScopeKind {
    Repository {
        repository: PathBuf,
    },
    Submodule {
        submodule: String,
        repository: PathBuf,
    },
    Session {
        session_id: String,
    },
    Task {
        task_id: String,
        task_context: TaskContext,
    },
}

impl ScopeKind {
    /// Canonical scope name: `repository`, `submodule:<name>`, `session`, `task:<id>`
    pub fn scope_name(&self) -> String {
        match self {
            Self::Repository { .. } => "repository".to_string(),
            Self::Submodule { submodule, .. } => format!("submodule:{}", submodule),
            Self::Session { .. } => "session".to_string(),
            Self::Task { task_id, .. } => format!("task:{}", task_id),
        }
    }

    /// Admission rule for this kind
    fn admit(&self, artifact: &Artifact) -> Result<()> {
        let metadata = &artifact.metadata;
        match self {
            Self::Repository { .. } if metadata.scope != ScopeType::Repository => {
                Err(CcaError::Admission(format!(
                    "Artifact {} has scope {}, not repository",
                    artifact.id, metadata.scope
                )))
            }
            Self::Submodule { submodule, .. } if metadata.submodule.as_ref() != Some(submodule) => {
                Err(CcaError::Admission(format!(
                    "Artifact belongs to submodule {}, not {}",
                    metadata.submodule.as_deref().unwrap_or("<none>"),
                    submodule
                )))
            }
            Self::Session { .. } if metadata.scope != ScopeType::Session => {
                Err(CcaError::Admission(format!(
                    "Artifact {} has scope {}, not session",
                    artifact.id, metadata.scope
                )))
            }
            Self::Task { task_id, .. } if metadata.task_id.as_ref() != Some(task_id) => {
                Err(CcaError::Admission(format!(
                    "Artifact belongs to task {}, not {}",
                    metadata.task_id.as_deref().unwrap_or("<none>"),
                    task_id
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Immutable construction parameters of a scope
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScopeConfig {
    pub kind: ScopeKind,
    /// Share of the global token target, informational only
    pub token_budget: f64,
}

/// Scope statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScopeStats {
    pub artifacts: usize,
    pub tokens: usize,
    /// Sum of content lengths in characters
    pub size: usize,
}

/// A named partition of artifacts with an admission rule
#[derive(Debug)]
pub struct Scope {
    name: String,
    config: ScopeConfig,
    artifacts: RwLock<HashMap<String, Artifact>>,
}

impl Scope {
    fn with_kind(kind: ScopeKind, token_budget: f64) -> Self {
        Self {
            name: kind.scope_name(),
            config: ScopeConfig { kind, token_budget },
            artifacts: RwLock::new(HashMap::new()),
        }
    }

    /// Project-wide patterns and conventions
    pub fn repository(repository: PathBuf, token_budget: f64) -> Self {
        Self::with_kind(ScopeKind::Repository { repository }, token_budget)
    }

    /// Patterns specific to one submodule
    pub fn submodule(submodule: impl Into<String>, repository: PathBuf, token_budget: f64) -> Self {
        Self::with_kind(
            ScopeKind::Submodule {
                submodule: submodule.into(),
                repository,
            },
            token_budget,
        )
    }

    /// Current development session. A session id is generated when none is given.
    pub fn session(session_id: Option<String>, token_budget: f64) -> Self {
        let session_id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        Self::with_kind(ScopeKind::Session { session_id }, token_budget)
    }

    /// Context for a single task
    pub fn task(task_id: impl Into<String>, task_context: TaskContext, token_budget: f64) -> Self {
        Self::with_kind(
            ScopeKind::Task {
                task_id: task_id.into(),
                task_context,
            },
            token_budget,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &ScopeKind {
        &self.config.kind
    }

    pub fn config(&self) -> &ScopeConfig {
        &self.config
    }

    pub fn is_task(&self) -> bool {
        matches!(self.config.kind, ScopeKind::Task { .. })
    }

    /// Upsert an artifact by id; fails without storing if the artifact is not admissible
    pub async fn store(&self, artifact: Artifact) -> Result<()> {
        self.config.kind.admit(&artifact)?;
        debug!("Scope {} stored artifact {}", self.name, artifact.id);
        self.artifacts
            .write()
            .await
            .insert(artifact.id.clone(), artifact);
        Ok(())
    }

    /// Every artifact whose content or tags contain `query`, case-insensitively.
    ///
    /// No ranking and no guaranteed order.
    pub async fn retrieve(&self, query: &str) -> Vec<Artifact> {
        let query_lower = query.to_lowercase();
        self.artifacts
            .read()
            .await
            .values()
            .filter(|a| a.matches(&query_lower))
            .cloned()
            .collect()
    }

    pub async fn get(&self, id: &str) -> Option<Artifact> {
        self.artifacts.read().await.get(id).cloned()
    }

    pub async fn clear(&self) {
        self.artifacts.write().await.clear();
    }

    pub async fn stats(&self) -> ScopeStats {
        let artifacts = self.artifacts.read().await;
        ScopeStats {
            artifacts: artifacts.len(),
            tokens: artifacts.values().map(Artifact::tokens).sum(),
            size: artifacts.values().map(Artifact::size).sum(),
        }
    }
}
