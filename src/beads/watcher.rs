//! Auto-learning from closed issues

use super::integration::{generate_note, note_artifact, BeadsIntegration, BeadsIssue};
use crate::memory::HierarchicalMemory;
use crate::Result;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Remembers which issues were already closed.
///
/// The first observation only seeds the set; later observations report issues
/// that closed since the previous one.
#[derive(Debug, Default)]
pub struct ClosedIssueTracker {
    known: HashSet<String>,
    seeded: bool,
}

impl ClosedIssueTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_seeded(&self) -> bool {
        self.seeded
    }

    /// Record a listing; returns the issues that are newly closed
    pub fn observe(&mut self, issues: &[BeadsIssue]) -> Vec<BeadsIssue> {
        let mut newly_closed = Vec::new();
        for issue in issues.iter().filter(|i| i.is_closed()) {
            if self.known.insert(issue.id.clone()) && self.seeded {
                newly_closed.push(issue.clone());
            }
        }
        self.seeded = true;
        newly_closed
    }
}

/// Store a note for each issue into `memory`. Returns how many were stored.
pub async fn learn_from_issues(
    memory: &HierarchicalMemory,
    beads: &BeadsIntegration,
    issues: &[BeadsIssue],
) -> Result<usize> {
    let repository = beads.repository_name();
    let mut learned = 0;
    for listed in issues {
        // `bd show` carries the full description; the listing may not
        let issue = match beads.get_issue(&listed.id).await {
            Ok(issue) => issue,
            Err(e) => {
                debug!("Using listed issue {}: {}", listed.id, e);
                listed.clone()
            }
        };
        let note = generate_note(&issue, &repository, Utc::now());
        memory.store(note_artifact(&issue.id, note)).await?;
        info!("Learned note from closed issue {}", issue.id);
        learned += 1;
    }
    Ok(learned)
}

/// Poll `bd` for newly closed issues and store a note for each.
///
/// The first successful listing seeds the tracker. Failures are logged and
/// retried on the next tick.
pub fn spawn_auto_learning(
    memory: Arc<HierarchicalMemory>,
    beads: BeadsIntegration,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tracker = ClosedIssueTracker::new();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let issues = match beads.list_issues().await {
                Ok(issues) => issues,
                Err(e) => {
                    warn!("Error checking for resolved issues: {}", e);
                    continue;
                }
            };

            let seeding = !tracker.is_seeded();
            let newly_closed = tracker.observe(&issues);
            if seeding {
                debug!("Seeded closed-issue tracker from {} issues", issues.len());
                continue;
            }

            if let Err(e) = learn_from_issues(&memory, &beads, &newly_closed).await {
                warn!("Failed to store learned note: {}", e);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beads::integration::{parse_issue_list, AUTO_LEARNED_TAG};
    use crate::config::MemoryConfig;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn listing(json: &str) -> Vec<BeadsIssue> {
        parse_issue_list(json)
    }

    #[test]
    fn test_tracker_seeds_then_reports_new_closures() {
        let mut tracker = ClosedIssueTracker::new();
        let first = listing(
            r#"[{"id":"a","title":"A","status":"closed"},{"id":"b","title":"B","status":"open"}]"#,
        );
        assert!(tracker.observe(&first).is_empty());
        assert!(tracker.is_seeded());

        let second = listing(
            r#"[{"id":"a","title":"A","status":"closed"},{"id":"b","title":"B","status":"closed"}]"#,
        );
        let closed: Vec<String> = tracker.observe(&second).into_iter().map(|i| i.id).collect();
        assert_eq!(closed, vec!["b"]);

        // Already reported
        assert!(tracker.observe(&second).is_empty());
    }

    #[test]
    fn test_tracker_seed_with_no_issues() {
        let mut tracker = ClosedIssueTracker::new();
        assert!(tracker.observe(&[]).is_empty());
        let later = listing(r#"[{"id":"x","title":"X","status":"closed"}]"#);
        assert_eq!(tracker.observe(&later).len(), 1);
    }

    #[tokio::test]
    async fn test_learned_notes_are_idempotent() {
        let dir = TempDir::new().unwrap();
        let config = MemoryConfig::new(PathBuf::from("/repo"))
            .with_storage_path(dir.path().join("memory"));
        let memory = HierarchicalMemory::new(config).unwrap();
        let beads = BeadsIntegration::new(dir.path()).with_program("definitely-not-bd-xyz");

        let issues = listing(r#"[{"id":"bd-5","title":"Flaky test","description":"Fix: retry once","status":"closed"}]"#);
        assert_eq!(learn_from_issues(&memory, &beads, &issues).await.unwrap(), 1);
        assert_eq!(learn_from_issues(&memory, &beads, &issues).await.unwrap(), 1);

        let stored = memory.retrieve_from_scope("repository", AUTO_LEARNED_TAG).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, "note-bd-5");
        assert!(stored[0].content.contains("# Note: Flaky test"));
        assert_eq!(memory.storage().stats().await.unwrap().count, 1);
    }
}
