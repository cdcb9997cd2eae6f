use crate::{EventKind, EventRecord};
use std::collections::HashSet;

/// Append-only, deduplicated, insertion-ordered record history for one job.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    records: Vec<EventRecord>,
    identities: HashSet<String>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the new log version, or `None` when a record with the same
    /// identity is already stored. The stored record is never replaced.
    pub fn append(&mut self, record: EventRecord) -> Option<u64> {
        if self.identities.contains(record.identity()) {
            return None;
        }
        self.identities.insert(record.identity().to_string());
        self.records.push(record);
        Some(self.version())
    }

    pub fn all(&self) -> &[EventRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn version(&self) -> u64 {
        self.records.len() as u64
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.identities.contains(identity)
    }

    pub fn of_kind(&self, kind: EventKind) -> impl Iterator<Item = &EventRecord> {
        self.records.iter().filter(move |record| record.kind() == kind)
    }

    pub fn last_of_kind(&self, kind: EventKind) -> Option<&EventRecord> {
        self.records.iter().rev().find(|record| record.kind() == kind)
    }
}
