//! `agentdeck`
//!
//! Command-line host for the orchestrator: runs agent sessions in a working
//! directory, streams their events and inspects recorded diffs.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing::{info, warn};

use agentdeck_core::config::{self, Config};
use agentdeck_daemon::orchestrator::{CreateSessionRequest, Orchestrator};
use agentdeck_daemon::reaper::ProcessReaper;
use agentdeck_daemon::storage::{CommitPolicy, Database, PermissionMode, Session};
use agentdeck_daemon::supervisor::{OutputKind, SessionEvent};

const SETTLE_TIMEOUT: Duration = Duration::from_secs(60);
const SETTLE_POLL: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(name = "agentdeck")]
#[command(version, about = "agentdeck - supervised coding-agent sessions")]
struct Args {
    /// Project directory whose `.agentdeck/settings.json` is layered on top
    /// of the global settings.
    #[arg(long, global = true, env = "AGENTDECK_PROJECT_DIR")]
    project: Option<PathBuf>,

    /// Database file path
    #[arg(long, global = true, env = "AGENTDECK_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Agent executable name or path
    #[arg(long, global = true, env = "AGENTDECK_AGENT_BIN")]
    agent_bin: Option<String>,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, global = true, env = "AGENTDECK_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON.
    #[arg(long, global = true, env = "AGENTDECK_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a new session and stream it until the agent exits.
    Run {
        /// Working directory for the agent
        #[arg(long, short = 'C', default_value = ".")]
        dir: PathBuf,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        permission_mode: Option<PermissionMode>,
        #[arg(long, default_value = "checkpoint")]
        commit_policy: CommitPolicy,
        prompt: String,
    },
    /// Run a follow-up round in an existing session.
    Continue { session_id: String, prompt: String },
    /// List recent sessions.
    Sessions {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Show the diffs recorded for a session.
    Diffs {
        session_id: String,
        /// Print the full patch of this round.
        #[arg(long)]
        sequence: Option<i64>,
    },
    /// Kill a process tree and report survivors.
    Reap { pid: u32 },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = config::load_config(args.project.as_deref())?;
    if let Some(bin) = args.agent_bin.clone() {
        config.agent.binary = bin;
    }
    if let Some(level) = args.log_level.clone() {
        config.daemon.log_level = level;
    }
    let log_filter = format!("agentdeck_daemon={}", config.daemon.log_level);
    agentdeck_core::tracing_init::init_tracing(&log_filter, args.log_json || config.daemon.log_json)?;

    let mut out = std::io::stdout().lock();
    match args.command {
        Command::Reap { pid } => {
            let report = ProcessReaper::from_config(&config.reaper).kill(pid).await;
            writeln!(out, "pid {pid}: {} descendant(s) found", report.discovered.len())?;
            for failure in &report.failures {
                writeln!(out, "  failure: {failure}")?;
            }
            if report.success() {
                writeln!(out, "  all processes terminated")?;
            } else if report.zombies.is_empty() {
                writeln!(out, "  survivors could not be verified")?;
            } else {
                writeln!(out, "  {}", report.zombie_message())?;
            }
            Ok(())
        }
        command => {
            let db = open_database(args.db_path.as_deref(), &config).await?;
            run_command(command, config, db, &mut out).await
        }
    }
}

async fn open_database(db_path: Option<&Path>, config: &Config) -> anyhow::Result<Database> {
    let path = db_path
        .map(Path::to_path_buf)
        .or_else(|| config.daemon.database_path.clone())
        .or_else(config::database_path)
        .context("Cannot determine database location")?;
    info!(path = %path.display(), "Opening database");
    Ok(Database::open(&path).await?)
}

async fn run_command(
    command: Command,
    config: Config,
    db: Database,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    match command {
        Command::Sessions { limit } => {
            let sessions = db.list_sessions(limit).await?;
            if sessions.is_empty() {
                writeln!(out, "No sessions found.")?;
                return Ok(());
            }
            writeln!(out, "{:<36}  {:<18}  {:<10}  DIRECTORY", "ID", "STATUS", "POLICY")?;
            for s in &sessions {
                writeln!(
                    out,
                    "{:<36}  {:<18}  {:<10}  {}",
                    s.id, s.status, s.commit_policy, s.working_directory
                )?;
            }
            Ok(())
        }
        Command::Diffs {
            session_id,
            sequence,
        } => {
            if let Some(seq) = sequence {
                let diff = db.get_execution_diff(&session_id, seq).await?;
                out.write_all(&diff.patch)?;
                return Ok(());
            }
            for d in db.list_execution_diffs(&session_id).await? {
                writeln!(
                    out,
                    "#{:<4} {}..{}  {} file(s), +{} -{}{}",
                    d.sequence,
                    short(&d.baseline_commit),
                    short_or_dash(d.final_commit.as_deref()),
                    d.files_changed,
                    d.insertions,
                    d.deletions,
                    if d.commit_created { "  (checkpoint)" } else { "" }
                )?;
            }
            Ok(())
        }
        Command::Run {
            dir,
            model,
            permission_mode,
            commit_policy,
            prompt,
        } => {
            let working_directory = dir
                .canonicalize()
                .with_context(|| format!("Invalid working directory {}", dir.display()))?;
            let orchestrator = Orchestrator::new(config, db);
            let events = orchestrator.subscribe_all();
            let (session, _job) = orchestrator
                .enqueue_create_session(CreateSessionRequest {
                    working_directory,
                    prompt,
                    permission_mode,
                    model,
                    commit_policy,
                    prompt_marker: None,
                })
                .await?;
            writeln!(out, "session {}", session.id)?;
            follow(&orchestrator, &session.id, events, out).await
        }
        Command::Continue { session_id, prompt } => {
            let orchestrator = Orchestrator::new(config, db);
            let events = orchestrator.subscribe_all();
            orchestrator
                .enqueue_continue_session(&session_id, &prompt, None)
                .await?;
            follow(&orchestrator, &session_id, events, out).await
        }
        Command::Reap { .. } => Ok(()),
    }
}

/// Print the session's events until its round is closed, stopping it on
/// Ctrl+C.
async fn follow(
    orchestrator: &Orchestrator,
    session_id: &str,
    mut events: broadcast::Receiver<SessionEvent>,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    loop {
        let event = tokio::select! {
            received = events.recv() => match received {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event stream lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!(session_id, "Received Ctrl+C, stopping session");
                orchestrator.stop_session(session_id).await?;
                break;
            }
        };
        if event.session_id() != session_id {
            continue;
        }
        render(&event, out)?;
        match event {
            SessionEvent::Exit { .. } => break,
            SessionEvent::Error { .. } if !orchestrator.supervisor().is_running(session_id).await => {
                break;
            }
            _ => {}
        }
    }

    let session = settle(orchestrator, session_id).await?;
    orchestrator.shutdown().await;
    writeln!(out, "session {} is {}", session.id, session.status())?;
    for d in orchestrator.database().list_execution_diffs(session_id).await? {
        writeln!(
            out,
            "  round #{}: {} file(s), +{} -{}",
            d.sequence, d.files_changed, d.insertions, d.deletions
        )?;
    }
    Ok(())
}

/// Wait (bounded) for the lifecycle listener to record the final status.
async fn settle(orchestrator: &Orchestrator, session_id: &str) -> anyhow::Result<Session> {
    let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
    loop {
        let session = orchestrator.session(session_id).await?;
        let open_round = orchestrator.ledger().open_context(session_id).await.is_some();
        if (!session.status().is_active() && !open_round)
            || tokio::time::Instant::now() >= deadline
        {
            return Ok(session);
        }
        tokio::time::sleep(SETTLE_POLL).await;
    }
}

fn render(event: &SessionEvent, out: &mut impl Write) -> std::io::Result<()> {
    match event {
        SessionEvent::Spawned { pid, .. } => writeln!(out, "[spawned] pid {pid}"),
        SessionEvent::Output { kind, data, .. } => match kind {
            OutputKind::Stdout => writeln!(out, "{data}"),
            OutputKind::Stderr => writeln!(out, "[stderr] {data}"),
        },
        SessionEvent::Message { message, .. } => writeln!(out, "[{}]", message.kind()),
        SessionEvent::Diagnostic { kind, detail, .. } => {
            writeln!(out, "[diagnostic] {kind:?}: {detail}")
        }
        SessionEvent::Exit { code, signal, .. } => match (code, signal) {
            (_, Some(signal)) => writeln!(out, "[exit] signal {signal}"),
            (Some(code), None) => writeln!(out, "[exit] code {code}"),
            (None, None) => writeln!(out, "[exit]"),
        },
        SessionEvent::Error { message, .. } => writeln!(out, "[error] {message}"),
        SessionEvent::ZombieProcessesDetected { message, .. } => {
            writeln!(out, "[zombies] {message}")
        }
        SessionEvent::ExecutionStarted { sequence, .. } => {
            writeln!(out, "[round #{sequence}] started")
        }
        SessionEvent::ExecutionCompleted { sequence, .. } => {
            writeln!(out, "[round #{sequence}] diff recorded")
        }
        SessionEvent::ExecutionCancelled { sequence, .. } => {
            writeln!(out, "[round #{sequence}] cancelled")
        }
    }
}

fn short(commit: &str) -> &str {
    commit.get(..10).unwrap_or(commit)
}

/// Rounds closed without a commit have no final commit to show.
fn short_or_dash(commit: Option<&str>) -> &str {
    commit.map_or("-", short)
}
