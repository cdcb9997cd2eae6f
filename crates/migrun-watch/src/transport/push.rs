use super::{emit, emit_record, spawn_feed, Transport, TransportError, TransportEvent};
use crate::config::{ReconnectPolicy, SessionConfig};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use migrun_core::wire::{decode_message, encode_text, ClientFrame, WireFrame};
use migrun_core::{EventRecord, JobStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

type PushStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Decides whether a dropped push connection is retried, and after how long.
///
/// The terminal flag is shared with the owning [`PushSession`] so a status
/// learned outside this connection also stops reconnects.
#[derive(Debug, Clone)]
pub struct ReconnectGate {
    policy: ReconnectPolicy,
    auto_reconnect: bool,
    attempts: u32,
    terminal: Arc<AtomicBool>,
}

impl ReconnectGate {
    pub fn new(policy: ReconnectPolicy, auto_reconnect: bool) -> Self {
        Self {
            policy,
            auto_reconnect,
            attempts: 0,
            terminal: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn terminal_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.terminal)
    }

    /// Terminal statuses stick; later non-terminal values are ignored.
    pub fn observe(&mut self, status: &JobStatus) {
        if status.is_terminal() {
            self.terminal.store(true, Ordering::Release);
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal.load(Ordering::Acquire)
    }

    pub fn connected(&mut self) {
        self.attempts = 0;
    }

    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.auto_reconnect || self.is_terminal() {
            return None;
        }
        let delay = self.policy.delay(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        Some(delay)
    }
}

#[derive(Debug, Clone)]
struct PushSettings {
    heartbeat_interval: Duration,
    max_frame_bytes: usize,
}

/// Websocket feed subscribed to `<ws_url>/<job_id>`.
pub struct PushSession {
    ws_url: Url,
    settings: PushSettings,
    reconnect: ReconnectPolicy,
    auto_reconnect: bool,
    task: Option<JoinHandle<()>>,
    terminal: Option<Arc<AtomicBool>>,
}

impl PushSession {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            ws_url: config.ws_url.clone(),
            settings: PushSettings {
                heartbeat_interval: config.heartbeat_interval,
                max_frame_bytes: config.max_frame_bytes,
            },
            reconnect: config.reconnect.clone(),
            auto_reconnect: config.auto_reconnect,
            task: None,
            terminal: None,
        }
    }

    pub fn endpoint(&self, job_id: &str) -> Result<Url, TransportError> {
        let mut url = self.ws_url.clone();
        url.path_segments_mut()
            .map_err(|_| TransportError::InvalidEndpoint(self.ws_url.to_string()))?
            .pop_if_empty()
            .push(job_id);
        Ok(url)
    }
}

impl Transport for PushSession {
    fn name(&self) -> &'static str {
        "push"
    }

    fn open(
        &mut self,
        job_id: &str,
        sink: mpsc::Sender<TransportEvent>,
    ) -> Result<(), TransportError> {
        self.close();
        let url = self.endpoint(job_id)?;
        let gate = ReconnectGate::new(self.reconnect.clone(), self.auto_reconnect);
        self.terminal = Some(gate.terminal_flag());
        let task = spawn_feed(push_loop(
            job_id.to_string(),
            url,
            self.settings.clone(),
            gate,
            sink,
        ))?;
        self.task = Some(task);
        Ok(())
    }

    fn mark_terminal(&mut self) {
        if let Some(terminal) = &self.terminal {
            terminal.store(true, Ordering::Release);
        }
    }

    fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.terminal = None;
    }

    fn is_open(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for PushSession {
    fn drop(&mut self) {
        self.close();
    }
}

enum ConnectionEnd {
    Closed,
    Failed(TransportError),
    SinkClosed,
}

async fn push_loop(
    job_id: String,
    url: Url,
    settings: PushSettings,
    mut gate: ReconnectGate,
    sink: mpsc::Sender<TransportEvent>,
) {
    loop {
        let end = match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                gate.connected();
                info!("push_connected: {url}");
                if !emit(&sink, TransportEvent::Connected).await {
                    return;
                }
                run_connection(ws, &job_id, &settings, &mut gate, &sink).await
            }
            Err(err) => {
                warn!("push_connect_error: {err}");
                ConnectionEnd::Failed(TransportError::Connect(err.to_string()))
            }
        };
        match end {
            ConnectionEnd::SinkClosed => return,
            ConnectionEnd::Failed(err) => {
                if !emit(&sink, TransportEvent::Error(err)).await {
                    return;
                }
            }
            ConnectionEnd::Closed => {}
        }

        let delay = gate.next_delay();
        let will_retry = delay.is_some();
        if !emit(&sink, TransportEvent::Disconnected { will_retry }).await {
            return;
        }
        let Some(delay) = delay else {
            info!("push_finished: job={job_id}");
            let _ = emit(&sink, TransportEvent::Finished).await;
            return;
        };
        debug!("push_reconnect_scheduled: {}ms", delay.as_millis());
        tokio::time::sleep(delay).await;
    }
}

async fn run_connection(
    mut ws: PushStream,
    job_id: &str,
    settings: &PushSettings,
    gate: &mut ReconnectGate,
    sink: &mpsc::Sender<TransportEvent>,
) -> ConnectionEnd {
    let subscribe = ClientFrame::Subscribe {
        job_id: job_id.to_string(),
    };
    let subscribe = match encode_text(&subscribe, settings.max_frame_bytes) {
        Ok(text) => text,
        Err(err) => return ConnectionEnd::Failed(err.into()),
    };
    if let Err(err) = ws.send(Message::Text(subscribe)).await {
        warn!("push_subscribe_error: {err}");
        let _ = ws.close(None).await;
        return ConnectionEnd::Failed(TransportError::Send(err.to_string()));
    }

    // Heartbeat lives and dies with this connection.
    let period = settings.heartbeat_interval;
    let mut heartbeat = interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let end = loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                let ping = ClientFrame::Ping { timestamp: Utc::now().to_rfc3339() };
                match encode_text(&ping, settings.max_frame_bytes) {
                    Ok(text) => {
                        if let Err(err) = ws.send(Message::Text(text)).await {
                            warn!("push_heartbeat_error: {err}");
                            break ConnectionEnd::Failed(TransportError::Send(err.to_string()));
                        }
                    }
                    Err(err) => warn!("push_heartbeat_encode_error: {err}"),
                }
            }
            message = ws.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        if !forward_message(text.as_bytes(), job_id, settings, gate, sink).await {
                            break ConnectionEnd::SinkClosed;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        if !forward_message(&bytes, job_id, settings, gate, sink).await {
                            break ConnectionEnd::SinkClosed;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!("push_closed_by_peer: {frame:?}");
                        break ConnectionEnd::Closed;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!("push_receive_error: {err}");
                        break ConnectionEnd::Failed(TransportError::Receive(err.to_string()));
                    }
                    None => break ConnectionEnd::Closed,
                }
            }
        }
    };
    let _ = ws.close(None).await;
    end
}

async fn forward_message(
    message: &[u8],
    job_id: &str,
    settings: &PushSettings,
    gate: &mut ReconnectGate,
    sink: &mpsc::Sender<TransportEvent>,
) -> bool {
    for record in decode_push_message(message, job_id, settings.max_frame_bytes) {
        if let Some(status) = record.job_status() {
            gate.observe(&status);
        }
        if !emit_record(sink, record).await {
            return false;
        }
    }
    true
}

/// Records carried by one push message. Malformed, internal and foreign
/// frames are logged and dropped; the rest of the message still decodes.
pub fn decode_push_message(
    message: &[u8],
    job_id: &str,
    max_frame_bytes: usize,
) -> Vec<EventRecord> {
    let report = decode_message::<WireFrame>(message, max_frame_bytes);
    for err in &report.errors {
        warn!("push_frame_dropped: {err}");
    }
    report
        .frames
        .into_iter()
        .filter_map(|frame| {
            if frame.is_internal() {
                return None;
            }
            if !frame.belongs_to(job_id) {
                debug!(
                    "push_foreign_frame: {}",
                    frame.job_id.as_deref().unwrap_or_default()
                );
                return None;
            }
            match frame.into_record() {
                Ok(record) => Some(record),
                Err(err) => {
                    warn!("push_frame_dropped: {err}");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use migrun_core::wire::DEFAULT_MAX_FRAME_BYTES;
    use migrun_core::EventKind;

    fn fixed_gate() -> ReconnectGate {
        ReconnectGate::new(ReconnectPolicy::default(), true)
    }

    #[test]
    fn running_jobs_retry_on_fixed_delay() {
        let mut gate = fixed_gate();
        gate.observe(&JobStatus::Running);
        assert_eq!(gate.next_delay(), Some(Duration::from_millis(3_000)));
        assert_eq!(gate.next_delay(), Some(Duration::from_millis(3_000)));
    }

    #[test]
    fn terminal_status_stops_reconnects() {
        let mut gate = fixed_gate();
        gate.observe(&JobStatus::Completed);
        assert_eq!(gate.next_delay(), None);

        gate.observe(&JobStatus::Running);
        assert!(gate.is_terminal());
        assert_eq!(gate.next_delay(), None);

        let mut failed = fixed_gate();
        failed.observe(&JobStatus::Failed);
        assert_eq!(failed.next_delay(), None);
    }

    #[test]
    fn status_learned_elsewhere_stops_reconnects() {
        let mut gate = fixed_gate();
        gate.observe(&JobStatus::Running);
        gate.terminal_flag().store(true, Ordering::Release);
        assert!(gate.is_terminal());
        assert_eq!(gate.next_delay(), None);
    }

    #[test]
    fn disabled_auto_reconnect_never_retries() {
        let mut gate = ReconnectGate::new(ReconnectPolicy::default(), false);
        assert_eq!(gate.next_delay(), None);
    }

    #[test]
    fn exponential_attempts_reset_after_connect() {
        let mut gate = ReconnectGate::new(
            ReconnectPolicy::Exponential {
                initial: Duration::from_millis(100),
                max: Duration::from_secs(1),
            },
            true,
        );
        assert_eq!(gate.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(gate.next_delay(), Some(Duration::from_millis(200)));
        gate.connected();
        assert_eq!(gate.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn push_messages_drop_noise_and_keep_the_rest() {
        let message = concat!(
            "{\"type\":\"pong\"}\n",
            "{\"type\":\"terminal_output\",\"job_id\":\"other\",\"payload\":{\"output\":\"x\"}}\n",
            "{not json}\n",
            "{\"type\":\"mystery\"}\n",
            "{\"type\":\"status_changed\",\"job_id\":\"job-1\",\"status\":\"RUNNING\"}\n",
            "{\"type\":\"terminal_output\",\"payload\":{\"output\":\"hello\"}}"
        );
        let records = decode_push_message(message.as_bytes(), "job-1", DEFAULT_MAX_FRAME_BYTES);
        let kinds: Vec<_> = records.iter().map(|record| record.kind()).collect();
        assert_eq!(kinds, vec![EventKind::StatusChanged, EventKind::TerminalOutput]);
        assert_eq!(records[0].job_status(), Some(JobStatus::Running));
    }

    #[test]
    fn endpoint_appends_job_segment() {
        let mut config = SessionConfig::default();
        config.ws_url = Url::parse("wss://svc.local/ws/jobs/").unwrap();
        let session = PushSession::new(&config);
        assert_eq!(
            session.endpoint("job-9").unwrap().as_str(),
            "wss://svc.local/ws/jobs/job-9"
        );
    }

    #[test]
    fn open_requires_a_runtime() {
        let (tx, _rx) = mpsc::channel(1);
        let mut session = PushSession::new(&SessionConfig::default());
        assert_eq!(session.open("job-1", tx), Err(TransportError::NoRuntime));
        assert!(!session.is_open());
    }

    #[tokio::test]
    async fn secure_endpoints_reach_the_network() {
        let mut config = SessionConfig::default();
        config.ws_url = Url::parse("wss://127.0.0.1:9/ws").unwrap();
        config.auto_reconnect = false;
        let (tx, mut rx) = mpsc::channel(8);
        let mut session = PushSession::new(&config);
        session.open("job-1", tx).unwrap();

        let Some(TransportEvent::Error(TransportError::Connect(message))) = rx.recv().await else {
            panic!("expected a connect error");
        };
        assert!(!message.contains("TLS support"), "{message}");
        assert_eq!(rx.recv().await, Some(TransportEvent::Disconnected { will_retry: false }));
        assert_eq!(rx.recv().await, Some(TransportEvent::Finished));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let mut config = SessionConfig::default();
        config.ws_url = Url::parse("ws://127.0.0.1:9/ws").unwrap();
        let (tx, _rx) = mpsc::channel(8);
        let mut session = PushSession::new(&config);
        session.open("job-1", tx).unwrap();
        assert!(session.is_open());
        session.close();
        session.close();
        assert!(!session.is_open());
    }
}
