use super::{emit, emit_record, spawn_feed, Transport, TransportError, TransportEvent};
use crate::api::JobApi;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Pull-based feed: fetches the whole event collection on a fixed interval
/// and forwards only identities it has not seen yet. Stops itself after the
/// batch that first shows a terminal audit record.
pub struct PollSession {
    api: Arc<dyn JobApi>,
    interval: Duration,
    seen: HashSet<String>,
    task: Option<JoinHandle<()>>,
}

impl PollSession {
    pub fn new(api: Arc<dyn JobApi>, interval: Duration) -> Self {
        Self {
            api,
            interval,
            seen: HashSet::new(),
            task: None,
        }
    }

    /// Identities the consumer already holds; they are neither forwarded
    /// nor able to end the poll.
    pub fn with_seen<I>(mut self, identities: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        self.seen.extend(identities);
        self
    }
}

impl Transport for PollSession {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn open(
        &mut self,
        job_id: &str,
        sink: mpsc::Sender<TransportEvent>,
    ) -> Result<(), TransportError> {
        self.close();
        let task = spawn_feed(poll_loop(
            Arc::clone(&self.api),
            job_id.to_string(),
            self.interval,
            self.seen.clone(),
            sink,
        ))?;
        self.task = Some(task);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    fn is_open(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for PollSession {
    fn drop(&mut self) {
        self.close();
    }
}

async fn poll_loop(
    api: Arc<dyn JobApi>,
    job_id: String,
    period: Duration,
    mut seen: HashSet<String>,
    sink: mpsc::Sender<TransportEvent>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut connected = false;
    loop {
        ticker.tick().await;
        let events = match api.list_events(&job_id).await {
            Ok(events) => events,
            Err(err) => {
                warn!("poll_request_error: {err}");
                let error = TransportError::Api(err.to_string());
                if !emit(&sink, TransportEvent::Error(error)).await {
                    return;
                }
                continue;
            }
        };
        if !connected {
            connected = true;
            if !emit(&sink, TransportEvent::Connected).await {
                return;
            }
        }

        let mut forwarded = 0usize;
        let mut terminal = false;
        for event in events {
            let record = match event.into_record() {
                Ok(record) => record,
                Err(err) => {
                    debug!("poll_event_dropped: {err}");
                    continue;
                }
            };
            if !seen.insert(record.identity().to_string()) {
                continue;
            }
            terminal |= record.kind().is_audit_terminal();
            forwarded += 1;
            if !emit_record(&sink, record).await {
                return;
            }
        }
        if forwarded > 0 {
            debug!("poll_batch: job={job_id} new={forwarded}");
        }
        if terminal {
            info!("poll_finished: job={job_id}");
            let _ = emit(&sink, TransportEvent::Finished).await;
            return;
        }
    }
}
