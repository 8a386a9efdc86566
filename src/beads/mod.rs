//! Beads issue-tracker feed
//!
//! Reads issues through the `bd` CLI and turns resolved ones into
//! repository-scoped notes.

mod integration;
mod watcher;

pub use integration::{
    extract_patterns, generate_note, note_artifact, parse_issue_list, BeadsIntegration, BeadsIssue,
    IssueDependency, IssueStats, IssueStatus, AUTO_LEARNED_TAG, NOTE_CONFIDENCE,
};
pub use watcher::{learn_from_issues, spawn_auto_learning, ClosedIssueTracker};
