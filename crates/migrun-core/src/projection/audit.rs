use crate::{EventKind, EventRecord};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Cosmetic progress never reaches this value before a terminal record.
pub const AUDIT_PROGRESS_CEILING: f64 = 95.0;
const AUDIT_PROGRESS_STEP: f64 = 0.1;
const DEFAULT_AUDIT_ERROR: &str = "audit failed";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditPhase {
    Idle,
    Auditing,
    Complete,
}

impl AuditPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditPhase::Idle => "idle",
            AuditPhase::Auditing => "auditing",
            AuditPhase::Complete => "complete",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AuditReport {
    #[serde(default)]
    pub modules: Vec<Value>,
    #[serde(default)]
    pub metrics: Map<String, Value>,
    #[serde(default, alias = "verification_logs", alias = "verification")]
    pub verification_log: Vec<Value>,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

impl AuditReport {
    /// Parity scalar from the report, falling back to its metrics.
    pub fn parity(&self) -> Option<f64> {
        const KEYS: [&str; 2] = ["parity", "parity_score"];
        KEYS.iter()
            .filter_map(|key| self.extra.get(*key))
            .chain(KEYS.iter().filter_map(|key| self.metrics.get(*key)))
            .find_map(Value::as_f64)
    }

    fn from_record(record: &EventRecord) -> Option<Self> {
        let payload = record.payload();
        let body = match payload.get("report") {
            Some(report @ Value::Object(_)) => report.clone(),
            _ => payload.clone(),
        };
        serde_json::from_value(body).ok()
    }
}

/// Audit poller state: Idle -> Auditing -> {Complete | Idle(error)}.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditState {
    pub phase: AuditPhase,
    pub progress: f64,
    #[serde(default)]
    pub report: Option<AuditReport>,
    #[serde(default)]
    pub parity: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Default for AuditState {
    fn default() -> Self {
        Self {
            phase: AuditPhase::Idle,
            progress: 0.0,
            report: None,
            parity: None,
            error: None,
        }
    }
}

impl AuditState {
    pub fn is_auditing(&self) -> bool {
        self.phase == AuditPhase::Auditing
    }

    pub fn begin(&mut self) {
        self.phase = AuditPhase::Auditing;
        self.progress = 0.0;
        self.error = None;
        self.report = None;
        self.parity = None;
    }

    /// Moves progress a fraction of the remaining distance toward the ceiling.
    pub fn advance(&mut self) {
        if self.phase != AuditPhase::Auditing {
            return;
        }
        let next = self.progress + (AUDIT_PROGRESS_CEILING - self.progress) * AUDIT_PROGRESS_STEP;
        if next < AUDIT_PROGRESS_CEILING {
            self.progress = next;
        }
    }

    /// Returns true when the record ended the audit.
    pub fn observe(&mut self, record: &EventRecord) -> bool {
        match record.kind() {
            EventKind::AuditError => {
                let message = record
                    .payload_str(&["error", "message", "detail"])
                    .unwrap_or(DEFAULT_AUDIT_ERROR);
                self.phase = AuditPhase::Idle;
                self.progress = 0.0;
                self.error = Some(message.to_string());
                true
            }
            EventKind::AuditComplete => {
                let report = AuditReport::from_record(record).unwrap_or_default();
                self.parity = report.parity();
                self.report = Some(report);
                self.phase = AuditPhase::Complete;
                self.progress = 100.0;
                self.error = None;
                true
            }
            _ => false,
        }
    }
}

pub fn accepts(kind: EventKind) -> bool {
    kind.is_audit_terminal()
}

/// Report carried by the latest `audit_complete` record, if any.
pub fn project_audit_report(records: &[EventRecord]) -> Option<AuditReport> {
    records
        .iter()
        .rev()
        .find(|record| record.kind() == EventKind::AuditComplete)
        .and_then(AuditReport::from_record)
}
