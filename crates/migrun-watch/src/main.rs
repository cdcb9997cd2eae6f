use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use migrun_core::plan::PlanDocument;
use migrun_core::projection::activity::ACTIVITY_TICK;
use migrun_core::projection::{AuditPhase, FileNode, NodeKind};
use migrun_core::{EventKind, JobStatus};
use migrun_watch::{ConfigLayer, JobSession, JobSnapshot, SessionConfig, SessionUpdate};
use std::{env, fs, io, path::PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "migrun-watch", about = "Follow a migration job's live event feed")]
struct Args {
    /// Job to follow.
    job_id: String,
    #[arg(long, env = "MIGRUN_WS_URL")]
    ws_url: Option<String>,
    #[arg(long, env = "MIGRUN_API_URL")]
    api_url: Option<String>,
    /// TOML file with session settings.
    #[arg(long, env = "MIGRUN_CONFIG_PATH")]
    config: Option<PathBuf>,
    #[arg(long)]
    heartbeat_secs: Option<u64>,
    #[arg(long)]
    reconnect_delay_ms: Option<u64>,
    /// Switches to capped exponential backoff.
    #[arg(long)]
    reconnect_max_ms: Option<u64>,
    #[arg(long)]
    no_reconnect: bool,
    #[arg(long)]
    poll_interval_ms: Option<u64>,
    /// Start an audit once the job completes and wait for the report.
    #[arg(long)]
    audit: bool,
    /// Plan document (JSON or markdown) shown before the feed.
    #[arg(long)]
    plan: Option<PathBuf>,
    /// Print the file tree when the watch ends.
    #[arg(long)]
    tree: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let args = Args::parse();
    let config = resolve_config(&args)?;

    let mut session =
        JobSession::open(&args.job_id, config).context("failed to open job session")?;
    if let Some(path) = &args.plan {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read plan {}", path.display()))?;
        let plan = PlanDocument::from_raw(&raw)?;
        if let Some(summary) = plan.summary() {
            println!("plan: {summary} ({} phases)", plan.phase_count());
        }
        session.attach_plan(plan);
    }

    let mut printed = 0usize;
    let mut last_activity: Option<String> = None;
    let mut ticker = tokio::time::interval(ACTIVITY_TICK);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            update = session.next_update() => {
                let Some(update) = update else {
                    break;
                };
                let snapshot = session.snapshot();
                match update {
                    SessionUpdate::Appended { kind, .. } => {
                        print_record_effect(kind, &snapshot, &mut printed, &mut last_activity);
                    }
                    SessionUpdate::Status(status) => {
                        println!("status: {status}");
                        if status == JobStatus::Completed && args.audit {
                            if let Err(err) = session.start_audit().await {
                                eprintln!("audit start failed: {err}");
                                break;
                            }
                            eprintln!("[auditing]");
                        } else if status.is_terminal() {
                            break;
                        }
                    }
                    SessionUpdate::Connection(state) => eprintln!("[{}]", state.as_str()),
                    SessionUpdate::Audit(AuditPhase::Complete) => {
                        print_audit(&snapshot);
                        if args.audit {
                            break;
                        }
                    }
                    SessionUpdate::Audit(AuditPhase::Idle) => {
                        if let Some(error) = &snapshot.audit.error {
                            eprintln!("audit failed: {error}");
                        }
                        if args.audit {
                            break;
                        }
                    }
                    SessionUpdate::FeedFinished => {
                        if !snapshot.audit.is_auditing() {
                            break;
                        }
                    }
                    SessionUpdate::Audit(AuditPhase::Auditing)
                    | SessionUpdate::Duplicate { .. }
                    | SessionUpdate::Error(_) => {}
                }
            }
            _ = ticker.tick() => {
                session.tick();
            }
            _ = &mut ctrl_c => {
                info!("watch_interrupted: job={}", session.job_id());
                break;
            }
        }
    }

    let snapshot = session.snapshot();
    session.close();
    if args.tree {
        print_tree(&snapshot);
    }
    let failed = snapshot.status == Some(JobStatus::Failed)
        || (args.audit && snapshot.audit.error.is_some());
    if failed {
        std::process::exit(1);
    }
    Ok(())
}

fn init_logging() {
    let level = env::var("MIGRUN_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn resolve_config(args: &Args) -> anyhow::Result<SessionConfig> {
    let file = match &args.config {
        Some(path) => ConfigLayer::load(path)?,
        None => ConfigLayer::default(),
    };
    let flags = ConfigLayer {
        ws_url: args.ws_url.clone(),
        api_url: args.api_url.clone(),
        heartbeat_secs: args.heartbeat_secs,
        reconnect_delay_ms: args.reconnect_delay_ms,
        reconnect_max_ms: args.reconnect_max_ms,
        auto_reconnect: args.no_reconnect.then_some(false),
        poll_interval_ms: args.poll_interval_ms,
        max_frame_bytes: None,
    };
    Ok(flags.over(file).resolve()?)
}

fn print_record_effect(
    kind: EventKind,
    snapshot: &JobSnapshot,
    printed: &mut usize,
    last_activity: &mut Option<String>,
) {
    match kind {
        EventKind::TerminalOutput => {
            for line in snapshot.transcript.since(*printed) {
                println!("{}", line.text);
            }
            *printed = snapshot.transcript.len();
        }
        EventKind::ActivityUpdate => {
            let activity = snapshot
                .activity
                .current
                .as_ref()
                .map(|current| current.activity.clone());
            if activity != *last_activity {
                if let Some(activity) = &activity {
                    eprintln!("activity: {activity}");
                }
                *last_activity = activity;
            }
        }
        EventKind::StuckWarning => {
            let Some(stuck) = &snapshot.activity.stuck else {
                return;
            };
            let running = snapshot
                .activity
                .elapsed(Utc::now())
                .map(|elapsed| elapsed.num_seconds())
                .unwrap_or_default();
            warn!(
                "agent_stuck: activity={} duration={:.0}s running={running}s",
                stuck.activity, stuck.duration_seconds
            );
            eprintln!("stuck: {} for {:.0}s", stuck.activity, stuck.duration_seconds);
            if let Some(cause) = &stuck.likely_cause {
                eprintln!("  likely cause: {cause}");
            }
            if let Some(suggestion) = &stuck.suggestion {
                eprintln!("  suggestion: {suggestion}");
            }
        }
        EventKind::PhaseStarted | EventKind::PhaseCompleted | EventKind::PhaseError => {
            for phase in &snapshot.phases.phases {
                if phase.status.is_finished() {
                    continue;
                }
                let name = phase.name.as_deref().unwrap_or(&phase.key);
                eprintln!("phase: {name}");
            }
        }
        _ => {}
    }
}

fn print_audit(snapshot: &JobSnapshot) {
    let Some(report) = &snapshot.audit.report else {
        return;
    };
    match snapshot.audit.parity {
        Some(parity) => println!("audit complete: parity {parity}"),
        None => println!("audit complete"),
    }
    println!(
        "  modules: {}  verification entries: {}",
        report.modules.len(),
        report.verification_log.len()
    );
}

fn print_tree(snapshot: &JobSnapshot) {
    println!(
        "files: {} ({} completed)",
        snapshot.file_tree.file_count(),
        snapshot
            .file_tree
            .count_with_status(migrun_core::projection::FileStatus::Completed)
    );
    for node in &snapshot.file_tree.roots {
        print_node(node, 0);
    }
}

fn print_node(node: &FileNode, depth: usize) {
    let indent = "  ".repeat(depth);
    match node.kind {
        NodeKind::Folder => println!("{indent}{}/", node.name),
        NodeKind::File => {
            let status = node.status.map(|status| status.as_str()).unwrap_or("-");
            println!("{indent}{} [{status}]", node.name);
        }
    }
    for child in &node.children {
        print_node(child, depth + 1);
    }
}
