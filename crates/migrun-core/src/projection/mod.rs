//! Pure folds over the event log.
//!
//! Every `project_*` function takes the full record history and returns a
//! fresh view, so replaying a history after reconnect yields the same
//! output. [`Projections`] caches the latest outputs and only reruns the
//! folds whose input kinds changed.

pub mod activity;
pub mod audit;
pub mod file_tree;
pub mod phases;
pub mod terminal;

pub use activity::{project_activity, ActivityState, AgentPhase};
pub use audit::{project_audit_report, AuditPhase, AuditReport, AuditState};
pub use file_tree::{project_file_tree, FileNode, FileStatus, FileTree, NodeKind};
pub use phases::{project_phases, PhaseStatus, PhaseTimeline};
pub use terminal::{project_transcript, Transcript};

use crate::{EventKind, EventRecord};
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Projections {
    pub file_tree: Arc<FileTree>,
    pub transcript: Arc<Transcript>,
    pub activity: Arc<ActivityState>,
    pub phases: Arc<PhaseTimeline>,
}

impl Projections {
    pub fn rebuild(records: &[EventRecord]) -> Self {
        Self {
            file_tree: Arc::new(project_file_tree(records)),
            transcript: Arc::new(project_transcript(records)),
            activity: Arc::new(project_activity(records)),
            phases: Arc::new(project_phases(records)),
        }
    }

    /// Recomputes the views fed by `kind`. Returns true when any changed.
    pub fn refresh(&mut self, records: &[EventRecord], kind: EventKind) -> bool {
        let mut changed = false;
        if file_tree::accepts(kind) {
            changed |= replace_if_changed(&mut self.file_tree, project_file_tree(records));
        }
        if terminal::accepts(kind) {
            changed |= replace_if_changed(&mut self.transcript, project_transcript(records));
        }
        if activity::accepts(kind) {
            changed |= replace_if_changed(&mut self.activity, project_activity(records));
        }
        if phases::accepts(kind) {
            changed |= replace_if_changed(&mut self.phases, project_phases(records));
        }
        changed
    }
}

fn replace_if_changed<T: PartialEq>(slot: &mut Arc<T>, next: T) -> bool {
    if **slot == next {
        return false;
    }
    *slot = Arc::new(next);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn refresh_matches_a_full_rebuild() {
        let at = |kind, ts: &str, payload| EventRecord::new(kind, None, Some(ts.into()), payload);
        let records = vec![
            at(EventKind::FileFound, "t1", json!({"path": "src/a.ts"})),
            at(EventKind::TerminalOutput, "t2", json!({"output": "scan"})),
            at(EventKind::ActivityUpdate, "t3", json!({"activity": "thinking"})),
            at(EventKind::PhaseStarted, "t4", json!({"phase": 1})),
        ];
        let mut incremental = Projections::default();
        for end in 1..=records.len() {
            incremental.refresh(&records[..end], records[end - 1].kind());
        }
        assert_eq!(incremental, Projections::rebuild(&records));
    }

    #[test]
    fn unrelated_kinds_leave_views_untouched() {
        let records = vec![EventRecord::new(
            EventKind::FileFound,
            None,
            None,
            json!({"path": "a.rs"}),
        )];
        let mut projections = Projections::rebuild(&records);
        let before = Arc::clone(&projections.file_tree);
        assert!(!projections.refresh(&records, EventKind::AuditComplete));
        assert!(Arc::ptr_eq(&before, &projections.file_tree));
    }
}
