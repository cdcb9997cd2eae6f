//! Live event feeds for one job.
//!
//! A [`Transport`] owns a background task that turns whatever the remote
//! service speaks into [`TransportEvent`]s on a bounded channel. The
//! controller on the other end never learns which transport produced a
//! record.

pub mod poll;
pub mod push;

pub use poll::PollSession;
pub use push::{PushSession, ReconnectGate};

use migrun_core::wire::FrameError;
use migrun_core::{EventRecord, JobStatus};
use std::future::Future;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected { will_retry: bool },
    Record(EventRecord),
    StatusChanged(JobStatus),
    Error(TransportError),
    /// The transport stopped on its own and will emit nothing further.
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport must be opened inside a tokio runtime")]
    NoRuntime,
    #[error("invalid endpoint {0}")]
    InvalidEndpoint(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Receive(String),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("poll request failed: {0}")]
    Api(String),
}

pub trait Transport: Send {
    fn name(&self) -> &'static str;

    /// Starts the feed for `job_id`. Returns immediately; reopening an open
    /// transport replaces the previous feed.
    fn open(&mut self, job_id: &str, sink: mpsc::Sender<TransportEvent>)
        -> Result<(), TransportError>;

    /// The job reached a terminal status. The feed may drain what it still
    /// has but must not reconnect.
    fn mark_terminal(&mut self) {}

    /// Stops the feed. Safe to call repeatedly and from any state.
    fn close(&mut self);

    fn is_open(&self) -> bool;
}

pub(crate) fn spawn_feed<F>(future: F) -> Result<JoinHandle<()>, TransportError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let handle = Handle::try_current().map_err(|_| TransportError::NoRuntime)?;
    Ok(handle.spawn(future))
}

/// False once the receiving side is gone.
pub(crate) async fn emit(sink: &mpsc::Sender<TransportEvent>, event: TransportEvent) -> bool {
    sink.send(event).await.is_ok()
}

/// Forwards a record, followed by a status notification when it carries one.
pub(crate) async fn emit_record(
    sink: &mpsc::Sender<TransportEvent>,
    record: EventRecord,
) -> bool {
    let status = record.job_status();
    if !emit(sink, TransportEvent::Record(record)).await {
        return false;
    }
    match status {
        Some(status) => emit(sink, TransportEvent::StatusChanged(status)).await,
        None => true,
    }
}
