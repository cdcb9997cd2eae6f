//! Scripted collaborators for unit tests.

use crate::api::{ApiError, JobApi};
use crate::transport::{Transport, TransportError, TransportEvent};
use async_trait::async_trait;
use migrun_core::wire::PolledEvent;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub fn polled(event_type: &str, id: Option<&str>, payload: Value) -> PolledEvent {
    PolledEvent {
        event_type: event_type.to_string(),
        payload,
        id: id.map(str::to_string),
        created_at: None,
    }
}

/// Plays back one batch per `list_events` call; the last batch repeats.
/// `Err(status)` entries answer with a rejection.
pub struct ScriptedApi {
    batches: Mutex<VecDeque<Result<Vec<PolledEvent>, u16>>>,
    last: Mutex<Vec<PolledEvent>>,
    start_failure: Option<u16>,
    list_calls: AtomicUsize,
    start_calls: AtomicUsize,
}

impl ScriptedApi {
    pub fn with_batches(batches: Vec<Result<Vec<PolledEvent>, u16>>) -> Self {
        Self {
            batches: Mutex::new(batches.into()),
            last: Mutex::new(Vec::new()),
            start_failure: None,
            list_calls: AtomicUsize::new(0),
            start_calls: AtomicUsize::new(0),
        }
    }

    pub fn failing_start(status: u16) -> Self {
        Self {
            start_failure: Some(status),
            ..Self::with_batches(Vec::new())
        }
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobApi for ScriptedApi {
    async fn list_events(&self, _job_id: &str) -> Result<Vec<PolledEvent>, ApiError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.batches.lock().unwrap().pop_front();
        match next {
            Some(Ok(batch)) => {
                *self.last.lock().unwrap() = batch.clone();
                Ok(batch)
            }
            Some(Err(status)) => Err(ApiError::Rejected {
                status,
                message: "scripted failure".to_string(),
            }),
            None => Ok(self.last.lock().unwrap().clone()),
        }
    }

    async fn start_audit(&self, _job_id: &str) -> Result<(), ApiError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        match self.start_failure {
            Some(status) => Err(ApiError::Rejected {
                status,
                message: "audit already running".to_string(),
            }),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
struct ProbeState {
    sink: Option<mpsc::Sender<TransportEvent>>,
    job_ids: Vec<String>,
    closes: usize,
    terminal_marks: usize,
}

/// Test-side view of a [`ScriptedTransport`].
#[derive(Clone, Default)]
pub struct TransportProbe {
    state: Arc<Mutex<ProbeState>>,
}

impl TransportProbe {
    pub fn sink(&self) -> mpsc::Sender<TransportEvent> {
        self.state
            .lock()
            .unwrap()
            .sink
            .clone()
            .expect("transport was never opened")
    }

    pub fn opened_jobs(&self) -> Vec<String> {
        self.state.lock().unwrap().job_ids.clone()
    }

    pub fn closes(&self) -> usize {
        self.state.lock().unwrap().closes
    }

    pub fn terminal_marks(&self) -> usize {
        self.state.lock().unwrap().terminal_marks
    }
}

/// Transport whose events are pushed by the test through its probe.
pub struct ScriptedTransport {
    probe: TransportProbe,
    open: bool,
}

impl ScriptedTransport {
    pub fn new() -> (Self, TransportProbe) {
        let probe = TransportProbe::default();
        (
            Self {
                probe: probe.clone(),
                open: false,
            },
            probe,
        )
    }
}

impl Transport for ScriptedTransport {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn open(
        &mut self,
        job_id: &str,
        sink: mpsc::Sender<TransportEvent>,
    ) -> Result<(), TransportError> {
        let mut state = self.probe.state.lock().unwrap();
        state.sink = Some(sink);
        state.job_ids.push(job_id.to_string());
        self.open = true;
        Ok(())
    }

    fn mark_terminal(&mut self) {
        self.probe.state.lock().unwrap().terminal_marks += 1;
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            let mut state = self.probe.state.lock().unwrap();
            state.closes += 1;
            state.sink = None;
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
