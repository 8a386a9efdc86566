//! Artifact data model
//!
//! An artifact is a unit of remembered text (a pattern, an error, a decision,
//! a log) plus the metadata that decides which scope owns it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::CcaError;

/// Approximate characters per token for budget estimation
const APPROX_CHARS_PER_TOKEN: usize = 4;

/// Estimate the token cost of a piece of text: `ceil(chars / 4)`.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(APPROX_CHARS_PER_TOKEN)
}

/// Scope level an artifact declares in its metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeType {
    Repository,
    Submodule,
    Session,
    Task,
}

impl ScopeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Repository => "repository",
            Self::Submodule => "submodule",
            Self::Session => "session",
            Self::Task => "task",
        }
    }
}

impl fmt::Display for ScopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScopeType {
    type Err = CcaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "repository" => Ok(Self::Repository),
            "submodule" => Ok(Self::Submodule),
            "session" => Ok(Self::Session),
            "task" => Ok(Self::Task),
            other => Err(CcaError::Admission(format!("unrecognized scope: {}", other))),
        }
    }
}

/// Kind of artifact.
///
/// Unknown kinds coming from an external feed are kept verbatim in `Other`
/// rather than rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ArtifactType {
    CodeDiff,
    ErrorMessage,
    DesignDecision,
    BuildLog,
    TestResult,
    Conversation,
    Pattern,
    SuccessfulTrajectory,
    FailedTrajectory,
    KnowledgeState,
    Other(String),
}

impl ArtifactType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::CodeDiff => "code_diff",
            Self::ErrorMessage => "error_message",
            Self::DesignDecision => "design_decision",
            Self::BuildLog => "build_log",
            Self::TestResult => "test_result",
            Self::Conversation => "conversation",
            Self::Pattern => "pattern",
            Self::SuccessfulTrajectory => "successful_trajectory",
            Self::FailedTrajectory => "failed_trajectory",
            Self::KnowledgeState => "knowledge_state",
            Self::Other(name) => name,
        }
    }
}

impl From<String> for ArtifactType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "code_diff" => Self::CodeDiff,
            "error_message" => Self::ErrorMessage,
            "design_decision" => Self::DesignDecision,
            "build_log" => Self::BuildLog,
            "test_result" => Self::TestResult,
            "conversation" => Self::Conversation,
            "pattern" => Self::Pattern,
            "successful_trajectory" => Self::SuccessfulTrajectory,
            "failed_trajectory" => Self::FailedTrajectory,
            "knowledge_state" => Self::KnowledgeState,
            _ => Self::Other(value),
        }
    }
}

impl From<ArtifactType> for String {
    fn from(value: ArtifactType) -> Self {
        match value {
            ArtifactType::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task outcome, reserved for trajectory learning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

/// Metadata attached to every artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactMetadata {
    pub scope: ScopeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submodule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Importance in `[0, 1]`; treated as 0.5 when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trajectory: Option<String>,
}

impl ArtifactMetadata {
    pub fn new(scope: ScopeType) -> Self {
        Self {
            scope,
            submodule: None,
            task_id: None,
            file: None,
            language: None,
            tags: Vec::new(),
            confidence: None,
            related: Vec::new(),
            outcome: None,
            trajectory: None,
        }
    }
}

/// A remembered unit of text.
///
/// Immutable by convention: storing a new artifact under an existing id
/// replaces the old one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    #[serde(rename = "type")]
    pub artifact_type: ArtifactType,
    pub content: String,
    pub metadata: ArtifactMetadata,
    pub timestamp: DateTime<Utc>,
}

impl Artifact {
    /// Create an artifact stamped with the current time
    pub fn new(
        id: impl Into<String>,
        artifact_type: ArtifactType,
        content: impl Into<String>,
        scope: ScopeType,
    ) -> Self {
        Self {
            id: id.into(),
            artifact_type,
            content: content.into(),
            metadata: ArtifactMetadata::new(scope),
            timestamp: Utc::now(),
        }
    }

    pub fn with_submodule(mut self, submodule: impl Into<String>) -> Self {
        self.metadata.submodule = Some(submodule.into());
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.metadata.task_id = Some(task_id.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metadata.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.metadata.confidence = Some(confidence);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Estimated token cost of the content
    pub fn tokens(&self) -> usize {
        estimate_tokens(&self.content)
    }

    /// Content length in characters
    pub fn size(&self) -> usize {
        self.content.chars().count()
    }

    /// Confidence used for ranking
    pub fn importance(&self) -> f64 {
        self.metadata.confidence.unwrap_or(0.5)
    }

    /// Case-insensitive substring match against content and the space-joined tag list.
    ///
    /// `query_lower` must already be lowercased.
    pub fn matches(&self, query_lower: &str) -> bool {
        self.content.to_lowercase().contains(query_lower)
            || self.metadata.tags.join(" ").to_lowercase().contains(query_lower)
    }

    /// Name of the scope that owns this artifact
    pub fn scope_name(&self) -> String {
        scope_name_for(&self.metadata)
    }
}

/// Resolve the owning scope name from metadata.
///
/// `task` + taskId → `task:<id>`, `submodule` + submodule → `submodule:<name>`,
/// anything else → the bare scope name.
pub fn scope_name_for(metadata: &ArtifactMetadata) -> String {
    match (metadata.scope, &metadata.task_id, &metadata.submodule) {
        (ScopeType::Task, Some(task_id), _) => format!("task:{}", task_id),
        (ScopeType::Submodule, _, Some(submodule)) => format!("submodule:{}", submodule),
        (scope, _, _) => scope.as_str().to_string(),
    }
}
