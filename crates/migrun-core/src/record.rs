use crate::{EventKind, JobStatus};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// One immutable unit of progress information about a job.
///
/// The identity is fixed at construction: an explicit producer id when
/// present, otherwise a digest of kind, timestamp and canonical payload.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    kind: EventKind,
    id: Option<String>,
    timestamp: Option<String>,
    payload: Value,
    identity: String,
}

impl EventRecord {
    pub fn new(
        kind: EventKind,
        id: Option<String>,
        timestamp: Option<String>,
        payload: Value,
    ) -> Self {
        let id = id.filter(|value| !value.trim().is_empty());
        let timestamp = timestamp.filter(|value| !value.trim().is_empty());
        let payload = match payload {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        let identity = derive_identity(kind, id.as_deref(), timestamp.as_deref(), &payload);
        Self {
            kind,
            id,
            timestamp,
            payload,
            identity,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn timestamp(&self) -> Option<&str> {
        self.timestamp.as_deref()
    }

    pub fn timestamp_utc(&self) -> Option<DateTime<Utc>> {
        self.timestamp.as_deref().and_then(parse_timestamp)
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// First non-empty string among `keys` in the payload.
    pub fn payload_str(&self, keys: &[&str]) -> Option<&str> {
        keys.iter()
            .filter_map(|key| self.payload.get(*key))
            .filter_map(Value::as_str)
            .find(|value| !value.trim().is_empty())
    }

    /// Status carried by a `status_changed` record.
    pub fn job_status(&self) -> Option<JobStatus> {
        if self.kind != EventKind::StatusChanged {
            return None;
        }
        self.payload_str(&["status"])
            .and_then(|raw| raw.parse::<JobStatus>().ok())
    }
}

pub fn derive_identity(
    kind: EventKind,
    id: Option<&str>,
    timestamp: Option<&str>,
    payload: &Value,
) -> String {
    if let Some(id) = id {
        return format!("id:{id}");
    }
    let rendered = serde_json::to_string(&canonicalize_value(payload.clone()))
        .unwrap_or_default();
    let material = format!("{}|{}|{}", kind.as_str(), timestamp.unwrap_or(""), rendered);
    sha256_hex(material.as_bytes())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut output = String::with_capacity(digest.len() * 2);
    for byte in digest {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

fn canonicalize_value(value: Value) -> Value {
    match value {
        Value::Object(object) => {
            let mut entries: Vec<(String, Value)> = object.into_iter().collect();
            entries.sort_by(|left, right| left.0.cmp(&right.0));

            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key, canonicalize_value(value));
            }
            Value::Object(sorted)
        }
        Value::Array(values) => Value::Array(values.into_iter().map(canonicalize_value).collect()),
        scalar => scalar,
    }
}

/// Accepts RFC 3339 text or an epoch number in seconds or milliseconds.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    let numeric = raw.parse::<f64>().ok()?;
    if !numeric.is_finite() || numeric < 0.0 {
        return None;
    }
    let millis = if numeric >= 1e12 {
        numeric as i64
    } else {
        (numeric * 1000.0) as i64
    };
    Utc.timestamp_millis_opt(millis).single()
}
