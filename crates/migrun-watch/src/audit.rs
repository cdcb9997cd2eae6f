use crate::api::JobApi;
use crate::transport::{PollSession, Transport, TransportError, TransportEvent};
use migrun_core::projection::AuditState;
use migrun_core::EventRecord;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum AuditStartError {
    #[error("audit start rejected: {0}")]
    Api(#[from] crate::api::ApiError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Drives `Idle -> Auditing -> {Complete | Idle(error)}` for one job:
/// requests the audit, polls the event collection, and stops polling on
/// the first terminal audit record.
pub struct AuditPoller {
    api: Arc<dyn JobApi>,
    interval: Duration,
    capacity: usize,
    state: AuditState,
    session: Option<PollSession>,
    events: Option<mpsc::Receiver<TransportEvent>>,
}

impl AuditPoller {
    pub fn new(api: Arc<dyn JobApi>, interval: Duration, capacity: usize) -> Self {
        Self {
            api,
            interval,
            capacity: capacity.max(1),
            state: AuditState::default(),
            session: None,
            events: None,
        }
    }

    pub fn state(&self) -> &AuditState {
        &self.state
    }

    pub fn is_polling(&self) -> bool {
        self.events.is_some()
    }

    /// `known` lists identities already in the consumer's log so a report
    /// from an earlier audit cannot end this one. A no-op while auditing.
    pub async fn start<I>(&mut self, job_id: &str, known: I) -> Result<(), AuditStartError>
    where
        I: IntoIterator<Item = String>,
    {
        if self.state.is_auditing() {
            return Ok(());
        }
        if let Err(err) = self.api.start_audit(job_id).await {
            warn!("audit_start_error: job={job_id} {err}");
            self.state.error = Some(err.to_string());
            return Err(err.into());
        }
        self.state.begin();

        let (tx, rx) = mpsc::channel(self.capacity);
        let mut session = PollSession::new(Arc::clone(&self.api), self.interval).with_seen(known);
        if let Err(err) = session.open(job_id, tx) {
            self.state = AuditState {
                error: Some(err.to_string()),
                ..AuditState::default()
            };
            return Err(err.into());
        }
        info!("audit_started: job={job_id}");
        self.session = Some(session);
        self.events = Some(rx);
        Ok(())
    }

    /// Next event from the poll feed, or `None` once it has ended.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        let event = self.events.as_mut()?.recv().await;
        if event.is_none() {
            self.detach();
        }
        event
    }

    /// Folds a newly appended record. Returns true when it ended the audit.
    pub fn observe(&mut self, record: &EventRecord) -> bool {
        let ended = self.state.observe(record);
        if ended {
            self.stop();
        }
        ended
    }

    /// Cosmetic progress step; only moves while auditing.
    pub fn tick(&mut self) -> bool {
        let before = self.state.progress;
        self.state.advance();
        self.state.progress != before
    }

    pub fn stop(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
        }
        self.events = None;
    }

    fn detach(&mut self) {
        self.session = None;
        self.events = None;
    }
}
