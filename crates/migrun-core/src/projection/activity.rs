use crate::record::parse_timestamp;
use crate::{EventKind, EventRecord};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Display refresh cadence for the derived activity duration.
pub const ACTIVITY_TICK: std::time::Duration = std::time::Duration::from_secs(1);

const IDLE_ACTIVITY: &str = "idle";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    Idle,
    Active,
    StuckFlagged,
}

impl AgentPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentPhase::Idle => "idle",
            AgentPhase::Active => "active",
            AgentPhase::StuckFlagged => "stuck",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityUpdate {
    pub activity: String,
    #[serde(default)]
    pub details: Option<Value>,
    #[serde(default, alias = "start_time", deserialize_with = "lenient_timestamp")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "phase_index", deserialize_with = "lenient_index")]
    pub phase: Option<u32>,
    #[serde(default, alias = "step_index", deserialize_with = "lenient_index")]
    pub step: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StuckWarning {
    pub activity: String,
    #[serde(default, alias = "elapsed_seconds")]
    pub duration_seconds: f64,
    #[serde(default)]
    pub last_successful_action: Option<Value>,
    #[serde(default)]
    pub likely_cause: Option<String>,
    #[serde(default)]
    pub suggestion: Option<String>,
    #[serde(default)]
    pub diagnostics: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ActivityState {
    pub current: Option<ActivityUpdate>,
    pub stuck: Option<StuckWarning>,
}

impl ActivityState {
    pub fn phase(&self) -> AgentPhase {
        match (&self.current, &self.stuck) {
            (Some(_), Some(_)) => AgentPhase::StuckFlagged,
            (Some(_), None) => AgentPhase::Active,
            (None, _) => AgentPhase::Idle,
        }
    }

    /// Time spent in the current activity as of `now`.
    pub fn elapsed(&self, now: DateTime<Utc>) -> Option<Duration> {
        let started = self.current.as_ref()?.started_at?;
        Some((now - started).max(Duration::zero()))
    }
}

pub fn accepts(kind: EventKind) -> bool {
    matches!(
        kind,
        EventKind::ActivityUpdate | EventKind::StuckWarning | EventKind::StatusChanged
    )
}

/// Last-write-wins fold in log order.
pub fn project_activity(records: &[EventRecord]) -> ActivityState {
    let mut state = ActivityState::default();
    for record in records {
        match record.kind() {
            EventKind::ActivityUpdate => {
                let Some(mut update) = parse_payload::<ActivityUpdate>(record) else {
                    continue;
                };
                if update.started_at.is_none() {
                    update.started_at = record.timestamp().and_then(parse_timestamp);
                }
                // Idle keeps the stuck annotation; a new activity clears it.
                if update.activity.eq_ignore_ascii_case(IDLE_ACTIVITY) {
                    state.current = None;
                } else {
                    state.stuck = None;
                    state.current = Some(update);
                }
            }
            EventKind::StuckWarning => {
                if let Some(warning) = parse_payload::<StuckWarning>(record) {
                    state.stuck = Some(warning);
                }
            }
            EventKind::StatusChanged => {
                if record.job_status().is_some_and(|status| status.is_terminal()) {
                    state.current = None;
                }
            }
            _ => {}
        }
    }
    state
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<Value> = Option::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(raw)) => parse_timestamp(&raw),
        Some(Value::Number(raw)) => parse_timestamp(&raw.to_string()),
        _ => None,
    })
}

/// Non-negative integers only; anything else reads as absent.
fn lenient_index<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<Value> = Option::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(Value::as_u64)
        .and_then(|raw| u32::try_from(raw).ok()))
}

fn parse_payload<T: serde::de::DeserializeOwned>(record: &EventRecord) -> Option<T> {
    serde_json::from_value(record.payload().clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn activity(payload: Value, ts: &str) -> EventRecord {
        EventRecord::new(EventKind::ActivityUpdate, None, Some(ts.to_string()), payload)
    }

    fn stuck(payload: Value, ts: &str) -> EventRecord {
        EventRecord::new(EventKind::StuckWarning, None, Some(ts.to_string()), payload)
    }

    #[test]
    fn stuck_warning_coexists_with_current_activity() {
        let records = vec![
            activity(
                json!({"activity": "executing_tool", "details": {"tool": "run_tests"}}),
                "2026-03-01T10:00:00Z",
            ),
            stuck(
                json!({
                    "activity": "executing_tool",
                    "duration_seconds": 120,
                    "likely_cause": "test suite hangs",
                    "suggestion": "check for open handles",
                    "last_successful_action": "edit src/app.ts"
                }),
                "2026-03-01T10:02:00Z",
            ),
        ];
        let state = project_activity(&records);
        assert_eq!(state.phase(), AgentPhase::StuckFlagged);
        let current = state.current.as_ref().expect("activity kept");
        assert_eq!(current.activity, "executing_tool");
        assert_eq!(current.details, Some(json!({"tool": "run_tests"})));
        let warning = state.stuck.as_ref().expect("stuck flagged");
        assert_eq!(warning.duration_seconds, 120.0);
        assert_eq!(warning.likely_cause.as_deref(), Some("test suite hangs"));
    }

    #[test]
    fn later_activity_replaces_and_clears_stuck() {
        let records = vec![
            activity(json!({"activity": "thinking", "details": "plan"}), "t1"),
            stuck(json!({"activity": "thinking", "duration_seconds": 300}), "t2"),
            activity(json!({"activity": "writing_file", "phase": 2, "step": 4}), "t3"),
        ];
        let state = project_activity(&records);
        assert_eq!(state.phase(), AgentPhase::Active);
        assert!(state.stuck.is_none());
        let current = state.current.unwrap();
        assert_eq!(current.activity, "writing_file");
        assert_eq!(current.details, None);
        assert_eq!((current.phase, current.step), (Some(2), Some(4)));
    }

    #[test]
    fn idle_activity_and_terminal_status_return_to_idle() {
        let records = vec![
            activity(json!({"activity": "thinking"}), "t1"),
            activity(json!({"activity": "idle"}), "t2"),
        ];
        assert_eq!(project_activity(&records).phase(), AgentPhase::Idle);

        let records = vec![
            activity(json!({"activity": "thinking"}), "t1"),
            EventRecord::new(
                EventKind::StatusChanged,
                None,
                None,
                json!({"status": "COMPLETED"}),
            ),
        ];
        assert_eq!(project_activity(&records).phase(), AgentPhase::Idle);
    }

    #[test]
    fn idle_keeps_stuck_annotation_until_new_activity() {
        let mut records = vec![
            activity(json!({"activity": "executing_tool"}), "t1"),
            stuck(json!({"activity": "executing_tool", "duration_seconds": 120}), "t2"),
            activity(json!({"activity": "idle"}), "t3"),
        ];
        let state = project_activity(&records);
        assert!(state.current.is_none());
        assert_eq!(state.stuck.as_ref().unwrap().duration_seconds, 120.0);
        assert_eq!(state.phase(), AgentPhase::Idle);

        records.push(activity(json!({"activity": "thinking"}), "t4"));
        let state = project_activity(&records);
        assert!(state.stuck.is_none());
        assert_eq!(state.phase(), AgentPhase::Active);
    }

    #[test]
    fn stuck_without_activity_after_terminal_status_is_idle() {
        let records = vec![
            activity(json!({"activity": "executing_tool"}), "t1"),
            stuck(json!({"activity": "executing_tool", "duration_seconds": 90}), "t2"),
            EventRecord::new(
                EventKind::StatusChanged,
                None,
                Some("t3".to_string()),
                json!({"status": "FAILED"}),
            ),
        ];
        let state = project_activity(&records);
        assert!(state.stuck.is_some());
        assert_eq!(state.phase(), AgentPhase::Idle);
    }

    #[test]
    fn non_integer_phase_still_replaces_activity() {
        for phase in [json!("transform"), json!(1.5), json!(-1)] {
            let records = vec![
                activity(json!({"activity": "thinking"}), "t1"),
                activity(json!({"activity": "writing_file", "phase": phase, "step": 3}), "t2"),
            ];
            let current = project_activity(&records).current.unwrap();
            assert_eq!(current.activity, "writing_file");
            assert_eq!((current.phase, current.step), (None, Some(3)));
        }
    }

    #[test]
    fn elapsed_uses_payload_start_then_record_timestamp() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 10, 1, 30).unwrap();
        let explicit = project_activity(&[activity(
            json!({"activity": "thinking", "started_at": "2026-03-01T10:00:00Z"}),
            "2026-03-01T10:01:00Z",
        )]);
        assert_eq!(explicit.elapsed(now), Some(Duration::seconds(90)));

        let implicit = project_activity(&[activity(
            json!({"activity": "thinking"}),
            "2026-03-01T10:01:00Z",
        )]);
        assert_eq!(implicit.elapsed(now), Some(Duration::seconds(30)));

        let numeric = project_activity(&[activity(
            json!({"activity": "thinking", "started_at": 1772359200}),
            "t1",
        )]);
        assert_eq!(numeric.elapsed(now), Some(Duration::seconds(90)));

        let future = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        assert_eq!(implicit.elapsed(future), Some(Duration::zero()));
    }

    #[test]
    fn malformed_payloads_are_ignored() {
        let records = vec![
            activity(json!({"activity": "thinking"}), "t1"),
            activity(json!({"details": "no tag"}), "t2"),
            stuck(json!({"duration_seconds": 5}), "t3"),
        ];
        let state = project_activity(&records);
        assert_eq!(state.current.unwrap().activity, "thinking");
        assert!(state.stuck.is_none());
    }

    #[test]
    fn fold_is_repeatable() {
        let records = vec![
            activity(json!({"activity": "thinking"}), "t1"),
            stuck(json!({"activity": "thinking", "duration_seconds": 61.5}), "t2"),
        ];
        assert_eq!(project_activity(&records), project_activity(&records));
    }
}
