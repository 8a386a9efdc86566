//! Beads (`bd`) CLI integration

use crate::artifact::{Artifact, ArtifactType, ScopeType};
use crate::{CcaError, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tokio::process::Command;
use tracing::debug;

/// Confidence given to notes learned from closed issues
pub const NOTE_CONFIDENCE: f64 = 0.8;

/// Tag carried by every learned note
pub const AUTO_LEARNED_TAG: &str = "auto-learned";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Open,
    Closed,
    InProgress,
    Blocked,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueDependency {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: String,
}

/// An issue as reported by `bd ... --json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeadsIssue {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: IssueStatus,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub issue_type: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub closed_at: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<IssueDependency>,
}

impl BeadsIssue {
    pub fn is_closed(&self) -> bool {
        self.status == IssueStatus::Closed
    }

    fn matches(&self, query_lower: &str) -> bool {
        self.title.to_lowercase().contains(query_lower)
            || self.description.to_lowercase().contains(query_lower)
            || self.labels.join(" ").to_lowercase().contains(query_lower)
    }
}

/// Issue counts by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IssueStats {
    pub total: usize,
    pub open: usize,
    pub closed: usize,
    pub in_progress: usize,
    pub blocked: usize,
}

impl IssueStats {
    pub fn from_issues(issues: &[BeadsIssue]) -> Self {
        let count = |status| issues.iter().filter(|i| i.status == status).count();
        Self {
            total: issues.len(),
            open: count(IssueStatus::Open),
            closed: count(IssueStatus::Closed),
            in_progress: count(IssueStatus::InProgress),
            blocked: count(IssueStatus::Blocked),
        }
    }
}

/// Parse `bd` output: a JSON array, a single object, or one object per line.
///
/// Entries that fail to decode or lack an id or title are dropped.
pub fn parse_issue_list(stdout: &str) -> Vec<BeadsIssue> {
    let values: Vec<Value> = match serde_json::from_str::<Value>(stdout.trim()) {
        Ok(Value::Array(items)) => items,
        Ok(item @ Value::Object(_)) => vec![item],
        _ => stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect(),
    };

    values
        .into_iter()
        .filter_map(|v| serde_json::from_value::<BeadsIssue>(v).ok())
        .filter(|issue| !issue.id.is_empty() && !issue.title.is_empty())
        .collect()
}

/// Adapter over the `bd` command line tool
#[derive(Debug, Clone)]
pub struct BeadsIntegration {
    database_path: PathBuf,
    program: String,
}

impl BeadsIntegration {
    /// `bd` commands run inside `database_path`
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
            program: "bd".to_string(),
        }
    }

    /// Use a different executable in place of `bd`
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    /// Check if `bd` can be executed
    pub async fn is_available(&self) -> bool {
        Command::new(&self.program)
            .arg("--help")
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        debug!("Running {} {}", self.program, args.join(" "));
        let output = Command::new(&self.program)
            .args(args)
            .current_dir(&self.database_path)
            .output()
            .await
            .map_err(|e| CcaError::Beads(format!("Failed to run {}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CcaError::Beads(format!(
                "{} {} failed: {}",
                self.program,
                args.join(" "),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    pub async fn get_issue(&self, issue_id: &str) -> Result<BeadsIssue> {
        let stdout = self.run(&["show", issue_id, "--json"]).await?;
        parse_issue_list(&stdout)
            .into_iter()
            .next()
            .ok_or_else(|| CcaError::Beads(format!("Issue not found: {}", issue_id)))
    }

    pub async fn list_issues(&self) -> Result<Vec<BeadsIssue>> {
        Ok(parse_issue_list(&self.run(&["list", "--json"]).await?))
    }

    /// Issues with no open blockers
    pub async fn ready_issues(&self) -> Result<Vec<BeadsIssue>> {
        Ok(parse_issue_list(&self.run(&["ready", "--json"]).await?))
    }

    /// Case-insensitive search over title, description and labels
    pub async fn search_issues(&self, query: &str) -> Result<Vec<BeadsIssue>> {
        let query_lower = query.to_lowercase();
        Ok(self
            .list_issues()
            .await?
            .into_iter()
            .filter(|i| i.matches(&query_lower))
            .collect())
    }

    pub async fn issues_by_label(&self, label: &str) -> Result<Vec<BeadsIssue>> {
        Ok(self
            .list_issues()
            .await?
            .into_iter()
            .filter(|i| i.labels.iter().any(|l| l == label))
            .collect())
    }

    pub async fn stats(&self) -> Result<IssueStats> {
        Ok(IssueStats::from_issues(&self.list_issues().await?))
    }

    /// Fetch an issue and render its note
    pub async fn generate_note_for(&self, issue_id: &str) -> Result<String> {
        let issue = self.get_issue(issue_id).await?;
        Ok(generate_note(&issue, &self.repository_name(), Utc::now()))
    }

    /// Name shown in notes: the last component of the database path
    pub fn repository_name(&self) -> String {
        self.database_path
            .canonicalize()
            .unwrap_or_else(|_| self.database_path.clone())
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "repository".to_string())
    }
}

fn solution_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?im)fix[:\s]+(.+)$",
            r"(?im)solution[:\s]+(.+)$",
            r"(?im)resolved by[:\s]+(.+)$",
            r"(?im)approach[:\s]+(.+)$",
            r"(?im)implementation[:\s]+(.+)$",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

fn problem_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?im)error[:\s]+(.+)$",
            r"(?im)problem[:\s]+(.+)$",
            r"(?im)issue[:\s]+(.+)$",
            r"(?im)bug[:\s]+(.+)$",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

fn implementation_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?im)implementation[:\s]+(.+)$",
            r"(?im)code[:\s]+(.+)$",
            r"(?im)changes[:\s]+(.+)$",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

fn first_capture(patterns: &[Regex], text: &str) -> Option<String> {
    patterns.iter().find_map(|re| {
        re.captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
    })
}

/// Solution fragments: text following `fix`, `solution`, `resolved by`,
/// `approach` or `implementation` up to the end of the line
pub fn extract_patterns(text: &str) -> Vec<String> {
    solution_patterns()
        .iter()
        .flat_map(|re| re.captures_iter(text))
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// List items following a `Solution:`/`Fix:`/`Approach:`/`Resolution:` heading,
/// up to the first blank line
fn solution_steps(description: &str) -> Vec<String> {
    static HEADING: OnceLock<Option<Regex>> = OnceLock::new();
    static NUMBERED: OnceLock<Option<Regex>> = OnceLock::new();
    let heading = HEADING.get_or_init(|| Regex::new(r"(?i)^(solution|fix|approach|resolution)[:\s]").ok());
    let numbered = NUMBERED.get_or_init(|| Regex::new(r"^\d+\.").ok());
    let (Some(heading), Some(numbered)) = (heading, numbered) else {
        return Vec::new();
    };

    let mut steps = Vec::new();
    let mut in_solution = false;
    for line in description.lines() {
        let trimmed = line.trim();
        if heading.is_match(trimmed) {
            in_solution = true;
            continue;
        }
        if !in_solution {
            continue;
        }
        if trimmed.starts_with('-') || numbered.is_match(trimmed) {
            steps.push(trimmed.to_string());
        } else if trimmed.is_empty() {
            break;
        }
    }
    steps
}

/// Render a markdown note describing how an issue was resolved
pub fn generate_note(issue: &BeadsIssue, repository: &str, generated_at: DateTime<Utc>) -> String {
    let patterns = extract_patterns(&issue.description);

    let problem = first_capture(problem_patterns(), &issue.description)
        .map(|p| format!("- {}", p))
        .unwrap_or_else(|| "- See issue description for details".to_string());

    let steps = solution_steps(&issue.description);
    let solution = if steps.is_empty() {
        "1. Implemented solution per issue description".to_string()
    } else {
        steps.join("\n")
    };

    let implementation = first_capture(implementation_patterns(), &issue.description)
        .map(|p| format!("- {}", p))
        .unwrap_or_else(|| "- See issue description for implementation details".to_string());

    let related = if issue.dependencies.is_empty() {
        "None".to_string()
    } else {
        issue
            .dependencies
            .iter()
            .map(|d| format!("- {}: {}", d.id, d.title))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "# Note: {title}\n\n\
         **Issue:** {id}\n\
         **Repository:** {repository}\n\
         **Generated:** {generated}\n\
         **Patterns found:** {count}\n\n\
         ## Problem Pattern\n{problem}\n\n\
         ## Solution Strategy\n{solution}\n\n\
         ## Implementation Details\n{implementation}\n\n\
         ## Related Issues\n{related}\n\n\
         ## Tags\n{tags}\n\n\
         ---\n\
         *Note generated automatically from resolved Beads issue*\n",
        title = issue.title,
        id = issue.id,
        repository = repository,
        generated = generated_at.to_rfc3339(),
        count = patterns.len(),
        problem = problem,
        solution = solution,
        implementation = implementation,
        related = related,
        tags = issue.labels.join(", "),
    )
}

/// Repository-scoped pattern artifact for a learned note.
///
/// The id depends only on the issue, so delivering the same note twice
/// replaces the earlier record.
pub fn note_artifact(issue_id: &str, note: impl Into<String>) -> Artifact {
    Artifact::new(
        format!("note-{}", issue_id),
        ArtifactType::Pattern,
        note,
        ScopeType::Repository,
    )
    .with_tags([AUTO_LEARNED_TAG, issue_id])
    .with_confidence(NOTE_CONFIDENCE)
}
