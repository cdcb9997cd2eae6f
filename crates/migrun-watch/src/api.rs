use async_trait::async_trait;
use migrun_core::wire::PolledEvent;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("api base url cannot carry a path: {0}")]
    InvalidBase(String),
    #[error("unexpected response body: {0}")]
    Decode(String),
}

/// Pull-side boundary of the job service.
#[async_trait]
pub trait JobApi: Send + Sync {
    /// Every event observed so far for the job.
    async fn list_events(&self, job_id: &str) -> Result<Vec<PolledEvent>, ApiError>;

    /// Asks the service to begin auditing the job. Does not return the report.
    async fn start_audit(&self, job_id: &str) -> Result<(), ApiError>;
}

#[derive(Clone)]
pub struct HttpJobApi {
    client: reqwest::Client,
    base: Url,
}

impl HttpJobApi {
    pub fn new(base: Url) -> Result<Self, ApiError> {
        if base.cannot_be_a_base() {
            return Err(ApiError::InvalidBase(base.to_string()));
        }
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { client, base })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn job_url(&self, job_id: &str, leaf: &str) -> Result<Url, ApiError> {
        job_endpoint(&self.base, job_id, leaf)
    }
}

#[async_trait]
impl JobApi for HttpJobApi {
    async fn list_events(&self, job_id: &str) -> Result<Vec<PolledEvent>, ApiError> {
        let url = self.job_url(job_id, "events")?;
        let response = self.client.get(url).send().await?;
        let response = ensure_success(response).await?;
        let body: Value = response.json().await?;
        parse_event_list(body)
    }

    async fn start_audit(&self, job_id: &str) -> Result<(), ApiError> {
        let url = self.job_url(job_id, "audit")?;
        let response = self.client.post(url).send().await?;
        ensure_success(response).await?;
        Ok(())
    }
}

/// `<base>/jobs/<job_id>/<leaf>`, with the job id escaped as one segment.
pub fn job_endpoint(base: &Url, job_id: &str, leaf: &str) -> Result<Url, ApiError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| ApiError::InvalidBase(base.to_string()))?
        .pop_if_empty()
        .extend(["jobs", job_id, leaf]);
    Ok(url)
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ApiError::Rejected {
        status: status.as_u16(),
        message: rejection_message(&body)
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string()),
    })
}

fn rejection_message(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
        if let Some(message) = ["detail", "error", "message"]
            .iter()
            .filter_map(|key| map.get(*key))
            .find_map(Value::as_str)
        {
            return Some(message.to_string());
        }
    }
    Some(trimmed.to_string())
}

/// Accepts a bare array or an `{"events": [...]}` envelope. Items that do
/// not look like events are skipped.
pub fn parse_event_list(body: Value) -> Result<Vec<PolledEvent>, ApiError> {
    let items = match body {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("events") {
            Some(Value::Array(items)) => items,
            _ => return Err(ApiError::Decode("missing events array".to_string())),
        },
        other => return Err(ApiError::Decode(format!("expected array, got {other}"))),
    };
    let mut events = Vec::with_capacity(items.len());
    for item in items {
        match serde_json::from_value::<PolledEvent>(item) {
            Ok(event) => events.push(event),
            Err(err) => warn!("poll_event_dropped: {err}"),
        }
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn endpoints_append_escaped_job_segment() {
        let base = Url::parse("http://svc.local/api/").unwrap();
        let url = job_endpoint(&base, "job 7", "events").unwrap();
        assert_eq!(url.as_str(), "http://svc.local/api/jobs/job%207/events");

        let bare = Url::parse("https://svc.local").unwrap();
        let url = job_endpoint(&bare, "j1", "audit").unwrap();
        assert_eq!(url.as_str(), "https://svc.local/jobs/j1/audit");
    }

    #[test]
    fn opaque_base_is_rejected() {
        let base = Url::parse("mailto:ops@svc.local").unwrap();
        assert!(matches!(HttpJobApi::new(base), Err(ApiError::InvalidBase(_))));
    }

    #[test]
    fn event_list_accepts_both_shapes_and_skips_junk() {
        let bare = parse_event_list(json!([
            {"event_type": "terminal_output", "payload": {"output": "hi"}},
            {"no_type": true}
        ]))
        .unwrap();
        assert_eq!(bare.len(), 1);

        let wrapped = parse_event_list(json!({
            "events": [{"event_type": "audit_error", "payload": {"error": "timeout"}}]
        }))
        .unwrap();
        assert_eq!(wrapped[0].event_type, "audit_error");

        assert!(matches!(parse_event_list(json!("nope")), Err(ApiError::Decode(_))));
    }

    #[test]
    fn rejection_prefers_structured_detail() {
        assert_eq!(
            rejection_message(r#"{"detail": "job not found"}"#).as_deref(),
            Some("job not found")
        );
        assert_eq!(rejection_message(" busy \n").as_deref(), Some("busy"));
        assert_eq!(rejection_message(""), None);
    }
}
