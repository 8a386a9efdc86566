//! CCA Memory - hierarchical context memory
//!
//! Keeps small, per-context memory for an AI coding assistant working across a
//! repository with several submodules:
//! - Artifacts (patterns, errors, decisions, logs) are routed to a scope
//!   (repository, submodule, session or task)
//! - Retrieval is lexical and fans out across scopes
//! - A compression engine trims the pooled hits to a token budget
//! - Every stored artifact is persisted to a sharded on-disk store

pub mod artifact;
pub mod beads;
pub mod config;
pub mod memory;
pub mod protocol;
pub mod server;
pub mod storage;

pub use artifact::{estimate_tokens, Artifact, ArtifactMetadata, ArtifactType, ScopeType};
pub use config::MemoryConfig;
pub use memory::{
    CompressionOptions, CompressionResult, ContextCompressionEngine, HierarchicalMemory,
    MemoryStats, RetrievedContext, Scope, TaskContext,
};
pub use storage::{ArtifactStorage, StorageBackend};

use std::path::PathBuf;

/// Result type for memory operations
pub type Result<T> = std::result::Result<T, CcaError>;

/// Errors that can occur in the memory system
#[derive(Debug, thiserror::Error)]
pub enum CcaError {
    /// Artifact does not belong to the target scope, or the scope does not exist
    #[error("Admission error: {0}")]
    Admission(String),

    #[error("Task scope already exists: {0}")]
    DuplicateScope(String),

    /// A persisted record could not be decoded
    #[error("Corrupt record {path:?}: {reason}")]
    CorruptRecord { path: PathBuf, reason: String },

    #[error("Unsupported storage backend: {0}")]
    UnsupportedBackend(String),

    #[error("Beads error: {0}")]
    Beads(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}
