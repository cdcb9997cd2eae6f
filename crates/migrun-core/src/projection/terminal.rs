use crate::{EventKind, EventRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

const TEXT_FIELDS: [&str; 3] = ["output", "content", "message"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TranscriptLine {
    pub identity: String,
    pub text: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transcript {
    pub lines: Vec<TranscriptLine>,
}

impl Transcript {
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Lines appended after the first `seen` entries.
    pub fn since(&self, seen: usize) -> &[TranscriptLine] {
        &self.lines[seen.min(self.lines.len())..]
    }
}

pub fn accepts(kind: EventKind) -> bool {
    kind == EventKind::TerminalOutput
}

pub fn project_transcript(records: &[EventRecord]) -> Transcript {
    let mut seen = HashSet::new();
    let mut lines = Vec::new();
    for record in records {
        if record.kind() != EventKind::TerminalOutput {
            continue;
        }
        let Some(text) = record.payload_str(&TEXT_FIELDS) else {
            continue;
        };
        if !seen.insert(record.identity()) {
            continue;
        }
        lines.push(TranscriptLine {
            identity: record.identity().to_string(),
            text: text.trim_end_matches(|ch: char| ch == '\r' || ch == '\n').to_string(),
            timestamp: record.timestamp().map(str::to_string),
        });
    }
    Transcript { lines }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn terminal(payload: serde_json::Value, ts: &str) -> EventRecord {
        EventRecord::new(EventKind::TerminalOutput, None, Some(ts.to_string()), payload)
    }

    #[test]
    fn first_non_empty_text_field_wins() {
        let records = vec![
            terminal(json!({"output": "", "content": "from content", "message": "m"}), "t1"),
            terminal(json!({"message": "from message"}), "t2"),
            terminal(json!({"output": "from output\n", "message": "m"}), "t3"),
        ];
        let transcript = project_transcript(&records);
        let texts: Vec<_> = transcript.lines.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, vec!["from content", "from message", "from output"]);
    }

    #[test]
    fn records_without_text_are_skipped() {
        let records = vec![
            terminal(json!({}), "t1"),
            terminal(json!({"output": 42}), "t2"),
            terminal(json!({"output": "   "}), "t3"),
            EventRecord::new(EventKind::PhaseError, None, None, json!({"message": "boom"})),
        ];
        assert!(project_transcript(&records).is_empty());
    }

    #[test]
    fn keeps_arrival_order_and_drops_repeats() {
        let a = terminal(json!({"output": "a"}), "t9");
        let b = terminal(json!({"output": "b"}), "t1");
        let records = vec![a.clone(), b, a];
        let transcript = project_transcript(&records);
        let texts: Vec<_> = transcript.lines.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b"]);
        assert_eq!(transcript.since(1).len(), 1);
        assert!(transcript.since(10).is_empty());
    }
}
