//! Memory module
//!
//! Scopes, the compression engine and the hierarchical memory that ties
//! them to durable storage.

mod compression;
mod hierarchical;
mod scope;

pub use compression::{CompressionOptions, CompressionResult, ContextCompressionEngine};
pub use hierarchical::{HierarchicalMemory, MemoryStats, RetrievedContext, ScopeBreakdown};
pub use scope::{Scope, ScopeConfig, ScopeKind, ScopeStats, TaskContext, TASK_QUERY_MAX_CHARS};
