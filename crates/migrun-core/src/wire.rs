use crate::{EventKind, EventRecord};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

/// Inbound push frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, alias = "event_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<String>,
}

impl WireFrame {
    pub fn is_internal(&self) -> bool {
        matches!(
            self.frame_type.trim().to_ascii_lowercase().as_str(),
            "ping" | "pong"
        )
    }

    pub fn belongs_to(&self, job_id: &str) -> bool {
        match self.job_id.as_deref() {
            Some(frame_job) if !frame_job.is_empty() => frame_job == job_id,
            _ => true,
        }
    }

    pub fn into_record(self) -> Result<EventRecord, FrameError> {
        let kind = self
            .frame_type
            .parse::<EventKind>()
            .map_err(|_| FrameError::UnknownKind(self.frame_type.clone()))?;
        if kind.is_internal() {
            return Err(FrameError::Internal(kind));
        }
        let mut payload = match self.payload {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(Value::Object(map)) => Value::Object(map),
            Some(other) => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                Value::Object(map)
            }
        };
        if kind == EventKind::StatusChanged {
            if let (Some(status), Value::Object(map)) = (self.status, &mut payload) {
                map.entry("status").or_insert(Value::String(status));
            }
        }
        Ok(EventRecord::new(kind, self.id, self.timestamp, payload))
    }
}

/// Item returned by the pull endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolledEvent {
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(
        default,
        alias = "timestamp",
        deserialize_with = "deserialize_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<String>,
}

impl PolledEvent {
    pub fn into_record(self) -> Result<EventRecord, FrameError> {
        WireFrame {
            frame_type: self.event_type,
            payload: Some(self.payload),
            job_id: None,
            status: None,
            id: self.id,
            timestamp: self.created_at,
        }
        .into_record()
    }
}

/// Outbound frames sent by the client on the push channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe { job_id: String },
    Ping { timestamp: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("buffer exceeds max size without delimiter: {size} > {max}")]
    OversizedBuffer { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("unknown event kind: {0}")]
    UnknownKind(String),
    #[error("internal frame is not an event record: {0}")]
    Internal(EventKind),
}

#[derive(Debug, Clone)]
pub struct DecodeReport<T> {
    pub frames: Vec<T>,
    pub errors: Vec<FrameError>,
}

impl<T> Default for DecodeReport<T> {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            errors: Vec::new(),
        }
    }
}

pub fn encode_text<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded = serde_json::to_string(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

/// Decodes one complete transport message that may hold several
/// newline-separated frames.
pub fn decode_message<T: DeserializeOwned>(
    message: &[u8],
    max_frame_bytes: usize,
) -> DecodeReport<T> {
    let mut decoder = FrameDecoder::new(max_frame_bytes);
    let mut report = decoder.push_chunk(message);
    let tail = decoder.finish();
    report.frames.extend(tail.frames);
    report.errors.extend(tail.errors);
    report
}

/// Incremental newline-delimited JSON decoder. A bad line is reported and
/// skipped; later lines still decode.
pub struct FrameDecoder {
    max_frame_bytes: usize,
    pending: Vec<u8>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl FrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            pending: Vec::new(),
        }
    }

    pub fn push_chunk<T: DeserializeOwned>(&mut self, chunk: &[u8]) -> DecodeReport<T> {
        let mut report = DecodeReport::default();
        self.pending.extend_from_slice(chunk);

        while let Some(newline_idx) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline_idx).collect();
            self.decode_line(&line, &mut report);
        }

        if self.pending.len() > self.max_frame_bytes {
            report.errors.push(FrameError::OversizedBuffer {
                size: self.pending.len(),
                max: self.max_frame_bytes,
            });
            self.pending.clear();
        }
        report
    }

    pub fn finish<T: DeserializeOwned>(&mut self) -> DecodeReport<T> {
        let mut report = DecodeReport::default();
        let rest = std::mem::take(&mut self.pending);
        self.decode_line(&rest, &mut report);
        report
    }

    fn decode_line<T: DeserializeOwned>(&self, line: &[u8], report: &mut DecodeReport<T>) {
        let trimmed = trim_ascii(line);
        if trimmed.is_empty() {
            return;
        }
        if trimmed.len() > self.max_frame_bytes {
            report.errors.push(FrameError::OversizedFrame {
                size: trimmed.len(),
                max: self.max_frame_bytes,
            });
            return;
        }
        match serde_json::from_slice(trimmed) {
            Ok(frame) => report.frames.push(frame),
            Err(err) => report.errors.push(FrameError::Decode(err.to_string())),
        }
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|byte| !byte.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|byte| !byte.is_ascii_whitespace())
        .map(|idx| idx + 1)
        .unwrap_or(start);
    &bytes[start..end.max(start)]
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<Value> = Option::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(_) => Err(serde::de::Error::custom(
            "expected string or number for timestamp",
        )),
    }
}
