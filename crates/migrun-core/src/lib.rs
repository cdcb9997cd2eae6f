pub mod log;
pub mod plan;
pub mod projection;
pub mod record;
pub mod wire;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

pub use log::EventLog;
pub use record::EventRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TerminalOutput,
    FileFound,
    FileCreated,
    FileModified,
    ActivityUpdate,
    StuckWarning,
    PhaseStarted,
    PhaseCompleted,
    PhaseError,
    StatusChanged,
    AuditComplete,
    AuditError,
    Ping,
    Pong,
}

impl EventKind {
    pub const ALL: [EventKind; 14] = [
        EventKind::TerminalOutput,
        EventKind::FileFound,
        EventKind::FileCreated,
        EventKind::FileModified,
        EventKind::ActivityUpdate,
        EventKind::StuckWarning,
        EventKind::PhaseStarted,
        EventKind::PhaseCompleted,
        EventKind::PhaseError,
        EventKind::StatusChanged,
        EventKind::AuditComplete,
        EventKind::AuditError,
        EventKind::Ping,
        EventKind::Pong,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TerminalOutput => "terminal_output",
            EventKind::FileFound => "file_found",
            EventKind::FileCreated => "file_created",
            EventKind::FileModified => "file_modified",
            EventKind::ActivityUpdate => "activity_update",
            EventKind::StuckWarning => "stuck_warning",
            EventKind::PhaseStarted => "phase_started",
            EventKind::PhaseCompleted => "phase_completed",
            EventKind::PhaseError => "phase_error",
            EventKind::StatusChanged => "status_changed",
            EventKind::AuditComplete => "audit_complete",
            EventKind::AuditError => "audit_error",
            EventKind::Ping => "ping",
            EventKind::Pong => "pong",
        }
    }

    /// Transport keepalive frames. These never reach the event log.
    pub fn is_internal(&self) -> bool {
        matches!(self, EventKind::Ping | EventKind::Pong)
    }

    pub fn is_file_event(&self) -> bool {
        matches!(
            self,
            EventKind::FileFound | EventKind::FileCreated | EventKind::FileModified
        )
    }

    pub fn is_phase_event(&self) -> bool {
        matches!(
            self,
            EventKind::PhaseStarted | EventKind::PhaseCompleted | EventKind::PhaseError
        )
    }

    pub fn is_audit_terminal(&self) -> bool {
        matches!(self, EventKind::AuditComplete | EventKind::AuditError)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_ascii_lowercase();
        EventKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| format!("Unknown event kind: {input}"))
    }
}

/// Job status as reported by `status_changed` records.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Other(String),
}

impl JobStatus {
    pub fn as_str(&self) -> &str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Other(raw) => raw.as_str(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err("Empty job status".to_string());
        }
        let status = match trimmed.to_ascii_uppercase().as_str() {
            "PENDING" | "QUEUED" => JobStatus::Pending,
            "RUNNING" | "IN_PROGRESS" | "IN-PROGRESS" => JobStatus::Running,
            "COMPLETED" | "COMPLETE" | "SUCCEEDED" => JobStatus::Completed,
            "FAILED" | "FAILURE" | "ERROR" => JobStatus::Failed,
            other => JobStatus::Other(other.to_string()),
        };
        Ok(status)
    }
}

impl Serialize for JobStatus {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for JobStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
