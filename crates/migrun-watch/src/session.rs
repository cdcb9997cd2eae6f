//! Job Session Controller: one transport, one event log and its
//! projections for a single job id.
//!
//! The controller is the only writer of its log. Transports feed it over
//! channels and views read immutable [`JobSnapshot`]s through
//! [`JobSession::subscribe`] or react through a [`SessionListener`].

use crate::api::{ApiError, HttpJobApi, JobApi};
use crate::audit::{AuditPoller, AuditStartError};
use crate::config::SessionConfig;
use crate::transport::{PushSession, Transport, TransportError, TransportEvent};
use migrun_core::plan::PlanDocument;
use migrun_core::projection::{
    project_audit_report, ActivityState, AuditPhase, AuditReport, AuditState, FileTree,
    PhaseTimeline, Projections, Transcript,
};
use migrun_core::{EventKind, EventLog, EventRecord, JobStatus};
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("job id must not be empty")]
    EmptyJobId,
    #[error("session is closed")]
    Closed,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Api(#[from] ApiError),
}

impl From<AuditStartError> for SessionError {
    fn from(err: AuditStartError) -> Self {
        match err {
            AuditStartError::Api(err) => SessionError::Api(err),
            AuditStartError::Transport(err) => SessionError::Transport(err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
    Closed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    Appended { version: u64, kind: EventKind },
    Duplicate { kind: EventKind },
    Status(JobStatus),
    Connection(ConnectionState),
    Audit(AuditPhase),
    Error(TransportError),
    /// The live feed stopped and will not resume.
    FeedFinished,
}

/// Read-only view handed to consumers.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub job_id: String,
    pub version: u64,
    pub status: Option<JobStatus>,
    pub connection: ConnectionState,
    pub file_tree: Arc<FileTree>,
    pub transcript: Arc<Transcript>,
    pub activity: Arc<ActivityState>,
    pub phases: Arc<PhaseTimeline>,
    pub audit: AuditState,
    pub plan: Option<Arc<PlanDocument>>,
    pub last_error: Option<String>,
}

impl JobSnapshot {
    fn empty(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            version: 0,
            status: None,
            connection: ConnectionState::Connecting,
            file_tree: Arc::default(),
            transcript: Arc::default(),
            activity: Arc::default(),
            phases: Arc::default(),
            audit: AuditState::default(),
            plan: None,
            last_error: None,
        }
    }
}

/// Callbacks for consumers that prefer push notifications to snapshots.
pub trait SessionListener: Send + Sync {
    fn on_record(&self, _record: &EventRecord) {}
    fn on_status_change(&self, _status: &JobStatus) {}
    fn on_connection(&self, _state: ConnectionState) {}
    fn on_error(&self, _error: &TransportError) {}
}

struct NoopListener;

impl SessionListener for NoopListener {}

/// Stable slot holding the current listener. Swapping the listener never
/// touches the transport.
#[derive(Clone)]
pub struct ListenerHandle {
    slot: Arc<RwLock<Arc<dyn SessionListener>>>,
}

impl Default for ListenerHandle {
    fn default() -> Self {
        Self {
            slot: Arc::new(RwLock::new(Arc::new(NoopListener))),
        }
    }
}

impl ListenerHandle {
    pub fn set(&self, listener: Arc<dyn SessionListener>) {
        let mut slot = self.slot.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = listener;
    }

    pub fn clear(&self) {
        self.set(Arc::new(NoopListener));
    }

    fn current(&self) -> Arc<dyn SessionListener> {
        let slot = self.slot.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&slot)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Feed {
    Live,
    Audit,
}

pub struct JobSession {
    job_id: String,
    config: SessionConfig,
    api: Arc<dyn JobApi>,
    transport: Option<Box<dyn Transport>>,
    events: mpsc::Receiver<TransportEvent>,
    live_done: bool,
    audit: AuditPoller,
    log: EventLog,
    projections: Projections,
    status: Option<JobStatus>,
    connection: ConnectionState,
    plan: Option<Arc<PlanDocument>>,
    last_error: Option<String>,
    listener: ListenerHandle,
    snapshot: watch::Sender<Arc<JobSnapshot>>,
    pending: VecDeque<SessionUpdate>,
    closed: bool,
}

impl JobSession {
    /// Opens a push-fed session against the configured service.
    pub fn open(job_id: &str, config: SessionConfig) -> Result<Self, SessionError> {
        let api: Arc<dyn JobApi> = Arc::new(HttpJobApi::new(config.api_url.clone())?);
        let transport = Box::new(PushSession::new(&config));
        Self::with_transport(job_id, config, api, transport)
    }

    pub fn with_transport(
        job_id: &str,
        config: SessionConfig,
        api: Arc<dyn JobApi>,
        mut transport: Box<dyn Transport>,
    ) -> Result<Self, SessionError> {
        let job_id = job_id.trim();
        if job_id.is_empty() {
            return Err(SessionError::EmptyJobId);
        }
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        transport.open(job_id, tx)?;
        info!("session_opened: job={job_id} transport={}", transport.name());

        let audit = AuditPoller::new(
            Arc::clone(&api),
            config.poll_interval,
            config.channel_capacity,
        );
        let (snapshot, _) = watch::channel(Arc::new(JobSnapshot::empty(job_id)));
        Ok(Self {
            job_id: job_id.to_string(),
            config,
            api,
            transport: Some(transport),
            events: rx,
            live_done: false,
            audit,
            log: EventLog::new(),
            projections: Projections::default(),
            status: None,
            connection: ConnectionState::Connecting,
            plan: None,
            last_error: None,
            listener: ListenerHandle::default(),
            snapshot,
            pending: VecDeque::new(),
            closed: false,
        })
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub fn projections(&self) -> &Projections {
        &self.projections
    }

    pub fn status(&self) -> Option<&JobStatus> {
        self.status.as_ref()
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn audit(&self) -> &AuditState {
        self.audit.state()
    }

    pub fn audit_report(&self) -> Option<AuditReport> {
        project_audit_report(self.log.all())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<JobSnapshot>> {
        self.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> Arc<JobSnapshot> {
        Arc::clone(&self.snapshot.borrow())
    }

    pub fn set_listener(&self, listener: Arc<dyn SessionListener>) {
        self.listener.set(listener);
    }

    pub fn listener_handle(&self) -> ListenerHandle {
        self.listener.clone()
    }

    /// Waits for the next change. Returns `None` once the session is closed
    /// or every feed has ended.
    pub async fn next_update(&mut self) -> Option<SessionUpdate> {
        loop {
            if let Some(update) = self.pending.pop_front() {
                return Some(update);
            }
            if self.closed {
                return None;
            }
            let polling = self.audit.is_polling();
            let (feed, event) = tokio::select! {
                event = self.events.recv(), if !self.live_done => match event {
                    Some(event) => (Feed::Live, event),
                    None => {
                        self.live_done = true;
                        continue;
                    }
                },
                event = self.audit.recv(), if polling => match event {
                    Some(event) => (Feed::Audit, event),
                    None => continue,
                },
                else => return None,
            };
            self.handle(feed, event);
        }
    }

    /// Applies one live-feed event synchronously and returns the updates it
    /// caused, in order.
    pub fn apply(&mut self, event: TransportEvent) -> Vec<SessionUpdate> {
        self.handle(Feed::Live, event);
        self.pending.drain(..).collect()
    }

    /// Appends one record as if a transport had delivered it.
    pub fn ingest(&mut self, record: EventRecord) -> Vec<SessionUpdate> {
        let status = record.job_status();
        self.handle(Feed::Live, TransportEvent::Record(record));
        if let Some(status) = status {
            self.handle(Feed::Live, TransportEvent::StatusChanged(status));
        }
        self.pending.drain(..).collect()
    }

    /// Requests an audit and starts polling for its result. A rejected
    /// request is returned immediately and leaves the audit idle.
    pub async fn start_audit(&mut self) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        let known: Vec<String> = self
            .log
            .all()
            .iter()
            .filter(|record| record.kind().is_audit_terminal())
            .map(|record| record.identity().to_string())
            .collect();
        let result = self.audit.start(&self.job_id, known).await;
        self.pending
            .push_back(SessionUpdate::Audit(self.audit.state().phase));
        self.publish();
        result.map_err(SessionError::from)
    }

    /// Display tick: advances cosmetic audit progress. Returns true when the
    /// snapshot changed.
    pub fn tick(&mut self) -> bool {
        if self.closed || !self.audit.tick() {
            return false;
        }
        self.publish();
        true
    }

    pub fn attach_plan(&mut self, plan: PlanDocument) {
        self.plan = Some(Arc::new(plan));
        self.publish();
    }

    /// Stops every feed. After this returns no listener fires and
    /// `next_update` yields `None`. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(transport) = self.transport.as_mut() {
            transport.close();
        }
        self.audit.stop();
        self.events.close();
        self.pending.clear();
        self.connection = ConnectionState::Closed;
        self.publish();
        info!("session_closed: job={}", self.job_id);
    }

    /// Tears this session down and opens a fresh one for `job_id` on the
    /// same transport, api and configuration. The listener carries over.
    pub fn retarget(mut self, job_id: &str) -> Result<JobSession, SessionError> {
        self.close();
        let transport = self.transport.take().ok_or(SessionError::Closed)?;
        let next = JobSession::with_transport(
            job_id,
            self.config.clone(),
            Arc::clone(&self.api),
            transport,
        )?;
        next.set_listener(self.listener.current());
        Ok(next)
    }

    fn handle(&mut self, feed: Feed, event: TransportEvent) {
        if self.closed {
            return;
        }
        match event {
            TransportEvent::Record(record) => self.append(record),
            TransportEvent::StatusChanged(status) => self.change_status(status),
            TransportEvent::Connected if feed == Feed::Live => {
                self.set_connection(ConnectionState::Connected)
            }
            TransportEvent::Disconnected { will_retry } if feed == Feed::Live => {
                let state = if will_retry {
                    ConnectionState::Reconnecting
                } else {
                    ConnectionState::Disconnected
                };
                self.set_connection(state);
            }
            TransportEvent::Connected | TransportEvent::Disconnected { .. } => {}
            TransportEvent::Error(error) => {
                debug!("session_feed_error: job={} {error}", self.job_id);
                self.last_error = Some(error.to_string());
                self.listener.current().on_error(&error);
                self.pending.push_back(SessionUpdate::Error(error));
                self.publish();
            }
            TransportEvent::Finished => match feed {
                Feed::Live => {
                    self.live_done = true;
                    self.set_connection(ConnectionState::Disconnected);
                    self.pending.push_back(SessionUpdate::FeedFinished);
                }
                Feed::Audit => self.audit.stop(),
            },
        }
    }

    fn append(&mut self, record: EventRecord) {
        let kind = record.kind();
        let Some(version) = self.log.append(record) else {
            self.pending.push_back(SessionUpdate::Duplicate { kind });
            return;
        };
        let records = self.log.all();
        self.projections.refresh(records, kind);
        let Some(appended) = records.last() else {
            return;
        };
        if kind.is_audit_terminal() {
            let before = self.audit.state().phase;
            self.audit.observe(appended);
            let after = self.audit.state().phase;
            if before != after {
                self.pending.push_back(SessionUpdate::Audit(after));
            }
        }
        self.listener.current().on_record(appended);
        self.pending
            .push_back(SessionUpdate::Appended { version, kind });
        self.publish();
    }

    fn change_status(&mut self, status: JobStatus) {
        if let Some(current) = &self.status {
            if current.is_terminal() {
                if *current != status {
                    warn!(
                        "session_status_ignored: job={} {} after {}",
                        self.job_id, status, current
                    );
                }
                return;
            }
            if *current == status {
                return;
            }
        }
        info!("session_status: job={} {status}", self.job_id);
        if status.is_terminal() {
            if let Some(transport) = self.transport.as_mut() {
                transport.mark_terminal();
            }
        }
        self.listener.current().on_status_change(&status);
        self.status = Some(status.clone());
        self.pending.push_back(SessionUpdate::Status(status));
        self.publish();
    }

    fn set_connection(&mut self, state: ConnectionState) {
        if self.connection == state {
            return;
        }
        self.connection = state;
        self.listener.current().on_connection(state);
        self.pending.push_back(SessionUpdate::Connection(state));
        self.publish();
    }

    fn publish(&self) {
        let snapshot = JobSnapshot {
            job_id: self.job_id.clone(),
            version: self.log.version(),
            status: self.status.clone(),
            connection: self.connection,
            file_tree: Arc::clone(&self.projections.file_tree),
            transcript: Arc::clone(&self.projections.transcript),
            activity: Arc::clone(&self.projections.activity),
            phases: Arc::clone(&self.projections.phases),
            audit: self.audit.state().clone(),
            plan: self.plan.clone(),
            last_error: self.last_error.clone(),
        };
        self.snapshot.send_replace(Arc::new(snapshot));
    }
}

impl Drop for JobSession {
    fn drop(&mut self) {
        self.close();
    }
}
