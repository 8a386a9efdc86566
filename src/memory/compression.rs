//! Context compression: fit a pooled candidate set into a token budget.
//!
//! Candidates are ranked by importance (confidence, then recency) and packed
//! greedily. This is a 0/1-knapsack approximation: an artifact that does not
//! fit the remaining budget is skipped, never truncated, so the result can
//! fall short of the target. The ranking rule is part of the contract.

use crate::artifact::Artifact;
use crate::config::CompressionConfig;
use serde::Serialize;
use std::cmp::Ordering;
use tracing::debug;

/// Options for a single compression pass
#[derive(Debug, Clone, Default)]
pub struct CompressionOptions {
    pub target_tokens: usize,
    /// Scope the caller is working in (currently does not affect ranking)
    pub active_scope: Option<String>,
    /// Reserved; critical artifacts get no special treatment yet
    pub preserve_critical: bool,
}

impl CompressionOptions {
    pub fn new(target_tokens: usize) -> Self {
        Self {
            target_tokens,
            ..Self::default()
        }
    }

    pub fn with_active_scope(mut self, active_scope: Option<String>) -> Self {
        self.active_scope = active_scope;
        self
    }
}

/// Outcome of a compression pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionResult {
    pub artifacts: Vec<Artifact>,
    /// `selected / input`, 0 for empty input
    pub ratio: f64,
    pub total_tokens: usize,
    pub original_tokens: usize,
}

/// Selects an importance-ordered subset of artifacts that fits a budget
#[derive(Debug, Clone)]
pub struct ContextCompressionEngine {
    config: CompressionConfig,
}

impl ContextCompressionEngine {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    pub fn compress(&self, artifacts: Vec<Artifact>, options: &CompressionOptions) -> CompressionResult {
        if artifacts.is_empty() {
            return CompressionResult::default();
        }

        let original_tokens: usize = artifacts.iter().map(Artifact::tokens).sum();
        let input_len = artifacts.len();

        if original_tokens <= options.target_tokens {
            return CompressionResult {
                artifacts,
                ratio: 1.0,
                total_tokens: original_tokens,
                original_tokens,
            };
        }

        let mut sorted = artifacts;
        sorted.sort_by(by_importance);

        let mut selected = Vec::new();
        let mut total_tokens = 0;
        for artifact in sorted {
            let tokens = artifact.tokens();
            if total_tokens + tokens <= options.target_tokens {
                total_tokens += tokens;
                selected.push(artifact);
            }
            if total_tokens >= options.target_tokens {
                break;
            }
        }

        debug!(
            "Compressed {} artifacts ({} tokens) to {} ({} tokens, target {})",
            input_len,
            original_tokens,
            selected.len(),
            total_tokens,
            options.target_tokens
        );

        CompressionResult {
            ratio: selected.len() as f64 / input_len as f64,
            artifacts: selected,
            total_tokens,
            original_tokens,
        }
    }
}

/// Higher confidence first, then more recent first
fn by_importance(a: &Artifact, b: &Artifact) -> Ordering {
    b.importance()
        .total_cmp(&a.importance())
        .then_with(|| b.timestamp.cmp(&a.timestamp))
}
