use crate::{EventKind, EventRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Running,
    Completed,
    Failed,
}

impl PhaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseStatus::Running => "running",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Failed => "failed",
        }
    }

    pub fn is_finished(self) -> bool {
        !matches!(self, PhaseStatus::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhaseEntry {
    pub key: String,
    #[serde(default)]
    pub index: Option<u64>,
    #[serde(default)]
    pub name: Option<String>,
    pub status: PhaseStatus,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub finished_at: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhaseTimeline {
    pub phases: Vec<PhaseEntry>,
}

impl PhaseTimeline {
    pub fn get(&self, key: &str) -> Option<&PhaseEntry> {
        self.phases.iter().find(|entry| entry.key == key)
    }

    pub fn current(&self) -> Option<&PhaseEntry> {
        self.phases
            .iter()
            .rev()
            .find(|entry| entry.status == PhaseStatus::Running)
    }

    pub fn failed(&self) -> impl Iterator<Item = &PhaseEntry> {
        self.phases
            .iter()
            .filter(|entry| entry.status == PhaseStatus::Failed)
    }
}

pub fn accepts(kind: EventKind) -> bool {
    kind.is_phase_event()
}

/// Phases appear in first-seen order. A finished phase never returns to
/// running, even when a start record is replayed after it.
pub fn project_phases(records: &[EventRecord]) -> PhaseTimeline {
    let mut timeline = PhaseTimeline::default();
    for record in records {
        let status = match record.kind() {
            EventKind::PhaseStarted => PhaseStatus::Running,
            EventKind::PhaseCompleted => PhaseStatus::Completed,
            EventKind::PhaseError => PhaseStatus::Failed,
            _ => continue,
        };
        let payload = record.payload();
        let index = payload
            .get("phase")
            .or_else(|| payload.get("phase_index"))
            .and_then(Value::as_u64);
        let name = record
            .payload_str(&["name", "phase_name", "title"])
            .map(str::to_string)
            .or_else(|| {
                payload
                    .get("phase")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            });
        let Some(key) = index
            .map(|idx| idx.to_string())
            .or_else(|| name.clone())
        else {
            continue;
        };

        let position = match timeline.phases.iter().position(|entry| entry.key == key) {
            Some(position) => position,
            None => {
                timeline.phases.push(PhaseEntry {
                    key,
                    index,
                    name: None,
                    status: PhaseStatus::Running,
                    started_at: None,
                    finished_at: None,
                    error: None,
                });
                timeline.phases.len() - 1
            }
        };
        let entry = &mut timeline.phases[position];
        if entry.name.is_none() {
            entry.name = name;
        }
        match status {
            PhaseStatus::Running => {
                if entry.started_at.is_none() {
                    entry.started_at = record.timestamp().map(str::to_string);
                }
            }
            PhaseStatus::Completed | PhaseStatus::Failed => {
                if entry.status == PhaseStatus::Failed && status == PhaseStatus::Completed {
                    continue;
                }
                entry.status = status;
                entry.finished_at = record.timestamp().map(str::to_string);
                if status == PhaseStatus::Failed {
                    entry.error = record
                        .payload_str(&["error", "message"])
                        .map(str::to_string);
                }
            }
        }
    }
    timeline
}
