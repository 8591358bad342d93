//! Host-facing façade.
//!
//! [`Orchestrator`] wires the admission queues, the process supervisor, the
//! execution ledger and the session store together:
//!
//! - session creation and continuation go through their own
//!   [`AdmissionQueue`]s so PTY and descriptor ceilings are respected;
//! - terminal input goes through a single-lane queue, preserving order;
//! - stopping is a direct call, never queued;
//! - a lifecycle listener follows every session's events and keeps the
//!   stored status and the ledger in step with the processes.

mod args;
mod jobs;
mod lifecycle;

pub use args::{AgentInvocation, STRUCTURED_COMMIT_INSTRUCTIONS};
pub use jobs::{ContinueSessionPayload, CreateSessionPayload, DeliverInputPayload};

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle as TaskHandle;
use tracing::{info, warn};

use agentdeck_core::config::Config;

use crate::ledger::{
    ExecutionContext, ExecutionLedger, ExecutionOutcome, GitDiff, LedgerError, LedgerSettings,
};
use crate::queue::{AdmissionQueue, JobHandle, JobKind, QueueError, QueueStats};
use crate::reaper::ReapReport;
use crate::storage::{
    CommitPolicy, Database, DatabaseError, NewSession, PermissionMode, Session, SessionStatus,
};
use crate::supervisor::{EventHub, ProcessSupervisor, SessionEvent, SupervisorError};

use jobs::SessionJobHandler;

/// All-sessions channel depth; the lifecycle listener must not fall behind
/// chatty agents.
const EVENT_CAPACITY: usize = 4096;

const SHUTDOWN_POLL: Duration = Duration::from_millis(20);

/// Errors from orchestrator operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Admission failed: {0}")]
    Admission(#[from] QueueError),

    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Invalid payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Parameters for a new session.
#[derive(Debug, Clone)]
pub struct CreateSessionRequest {
    pub working_directory: PathBuf,
    pub prompt: String,
    /// Falls back to the configured default.
    pub permission_mode: Option<PermissionMode>,
    /// Falls back to the configured default.
    pub model: Option<String>,
    pub commit_policy: CommitPolicy,
    pub prompt_marker: Option<String>,
}

/// Where a session's process is in its lifecycle, as seen by the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// A job is starting a new process; exits seen now are stale.
    Launching,
    Live { pid: u32, startup_failed: bool },
}

struct Shared {
    config: Config,
    db: Database,
    supervisor: ProcessSupervisor,
    ledger: ExecutionLedger,
    events: Arc<EventHub>,
    phases: Mutex<HashMap<String, Phase>>,
    /// Sessions whose next exit was requested by `stop_session`.
    stopping: Mutex<HashSet<String>>,
    /// Held while a round is being opened or closed for the session.
    rounds: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Shared {
    async fn round_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut rounds = self.rounds.lock().await;
        Arc::clone(rounds.entry(session_id.to_string()).or_default())
    }

    /// Drop the round lock of a session with no process and nobody holding
    /// the lock.
    async fn release_idle(&self, session_id: &str) {
        if self.phases.lock().await.contains_key(session_id) {
            return;
        }
        let mut rounds = self.rounds.lock().await;
        if rounds.get(session_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            rounds.remove(session_id);
        }
    }
}

/// Host façade over queues, supervisor, ledger and store.
pub struct Orchestrator {
    shared: Arc<Shared>,
    create_queue: AdmissionQueue,
    continue_queue: AdmissionQueue,
    input_queue: AdmissionQueue,
    shutdown_tx: watch::Sender<bool>,
    listener: Mutex<Option<TaskHandle<()>>>,
}

impl Orchestrator {
    /// Build every component from configuration. Must be called inside a
    /// Tokio runtime.
    pub fn new(config: Config, db: Database) -> Self {
        let events = Arc::new(EventHub::new(EVENT_CAPACITY));
        let supervisor = ProcessSupervisor::from_config(&config, Arc::clone(&events));
        let ledger = ExecutionLedger::new(
            db.clone(),
            GitDiff::default(),
            Arc::clone(&events),
            LedgerSettings::from_config(&config.ledger),
        );
        Self::with_components(config, db, supervisor, ledger, events)
    }

    /// Build around pre-configured components sharing one event hub.
    pub fn with_components(
        config: Config,
        db: Database,
        supervisor: ProcessSupervisor,
        ledger: ExecutionLedger,
        events: Arc<EventHub>,
    ) -> Self {
        let queues = config.queues;
        let shared = Arc::new(Shared {
            config,
            db,
            supervisor,
            ledger,
            events,
            phases: Mutex::new(HashMap::new()),
            stopping: Mutex::new(HashSet::new()),
            rounds: Mutex::new(HashMap::new()),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = tokio::spawn(lifecycle::run(
            Arc::clone(&shared),
            shared.events.subscribe_all(),
            shutdown_rx,
        ));

        let handler = Arc::new(SessionJobHandler {
            shared: Arc::clone(&shared),
        });
        let create_queue =
            AdmissionQueue::new("create", queues.create_concurrency, Arc::clone(&handler));
        let continue_queue =
            AdmissionQueue::new("continue", queues.continue_concurrency, Arc::clone(&handler));
        let input_queue = AdmissionQueue::new("input", queues.input_concurrency, handler);

        Self {
            shared,
            create_queue,
            continue_queue,
            input_queue,
            shutdown_tx,
            listener: Mutex::new(Some(listener)),
        }
    }

    /// Record a new session and queue its first round.
    pub async fn enqueue_create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<(Session, JobHandle), OrchestratorError> {
        if !request.working_directory.is_dir() {
            return Err(OrchestratorError::InvalidRequest(format!(
                "working directory {} does not exist",
                request.working_directory.display()
            )));
        }
        if request.prompt.trim().is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "prompt must not be empty".to_string(),
            ));
        }

        let agent = &self.shared.config.agent;
        let permission_mode = request
            .permission_mode
            .unwrap_or_else(|| agent.default_permission_mode.parse().unwrap_or_default());
        let model = request.model.as_deref().or(agent.default_model.as_deref());
        let id = uuid::Uuid::new_v4().to_string();
        let working_directory = request.working_directory.to_string_lossy();

        let session = self
            .shared
            .db
            .create_session(&NewSession {
                id: &id,
                working_directory: &working_directory,
                permission_mode,
                model,
                commit_policy: request.commit_policy,
            })
            .await?;

        let payload = serde_json::to_value(CreateSessionPayload {
            session_id: id.clone(),
            prompt: request.prompt,
            prompt_marker: request.prompt_marker,
        })?;
        match self.create_queue.enqueue(JobKind::CreateSession, payload).await {
            Ok(handle) => {
                info!(session_id = %id, job_id = %handle.id, "Session creation queued");
                Ok((session, handle))
            }
            Err(e) => {
                self.shared
                    .db
                    .update_session_status(&id, SessionStatus::Error)
                    .await?;
                Err(e.into())
            }
        }
    }

    /// Queue a follow-up round for an existing session.
    pub async fn enqueue_continue_session(
        &self,
        session_id: &str,
        prompt: &str,
        prompt_marker: Option<&str>,
    ) -> Result<JobHandle, OrchestratorError> {
        self.shared.db.get_session(session_id).await?;
        let payload = serde_json::to_value(ContinueSessionPayload {
            session_id: session_id.to_string(),
            prompt: prompt.to_string(),
            prompt_marker: prompt_marker.map(String::from),
        })?;
        let handle = self
            .continue_queue
            .enqueue(JobKind::ContinueSession, payload)
            .await?;
        info!(session_id, job_id = %handle.id, "Session continuation queued");
        Ok(handle)
    }

    /// Queue terminal input. Inputs are delivered one at a time in the
    /// order they were queued.
    pub async fn send_input(
        &self,
        session_id: &str,
        data: &str,
    ) -> Result<JobHandle, OrchestratorError> {
        let payload = serde_json::to_value(DeliverInputPayload {
            session_id: session_id.to_string(),
            data: data.to_string(),
        })?;
        Ok(self.input_queue.enqueue(JobKind::DeliverInput, payload).await?)
    }

    /// Stop the session's process tree. Idempotent; the report is `None`
    /// when nothing was running.
    pub async fn stop_session(
        &self,
        session_id: &str,
    ) -> Result<Option<ReapReport>, OrchestratorError> {
        self.shared.db.get_session(session_id).await?;
        self.shared
            .stopping
            .lock()
            .await
            .insert(session_id.to_string());

        let report = self.shared.supervisor.kill(session_id).await;
        if report.is_none() {
            self.shared.stopping.lock().await.remove(session_id);
        }
        self.shared
            .db
            .update_session_status(session_id, SessionStatus::Stopped)
            .await?;
        info!(session_id, was_running = report.is_some(), "Session stopped");
        Ok(report)
    }

    /// Stop the session if it runs, then remove it with its recorded diffs
    /// and every piece of in-memory state kept for it. Returns whether a
    /// stored session was removed.
    pub async fn delete_session(&self, session_id: &str) -> Result<bool, OrchestratorError> {
        let round = self.shared.round_lock(session_id).await;
        let guard = round.lock().await;
        self.shared.phases.lock().await.remove(session_id);
        self.shared.stopping.lock().await.remove(session_id);
        self.shared.ledger.forget(session_id).await;
        self.shared.supervisor.forget(session_id).await;
        let deleted = self.shared.db.delete_session(session_id).await?;
        drop(guard);
        self.shared.rounds.lock().await.remove(session_id);
        info!(session_id, deleted, "Session deleted");
        Ok(deleted)
    }

    /// Open an execution round by hand, in the session's working directory.
    pub async fn start_execution(
        &self,
        session_id: &str,
        prompt_marker: Option<&str>,
    ) -> Result<ExecutionContext, OrchestratorError> {
        let session = self.shared.db.get_session(session_id).await?;
        let dir = PathBuf::from(&session.working_directory);
        Ok(self
            .shared
            .ledger
            .start_execution(session_id, &dir, prompt_marker)
            .await?)
    }

    pub async fn end_execution(
        &self,
        session_id: &str,
    ) -> Result<Option<ExecutionOutcome>, OrchestratorError> {
        Ok(self.shared.ledger.end_execution(session_id).await?)
    }

    pub async fn subscribe(&self, session_id: &str) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe(session_id).await
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe_all()
    }

    pub async fn session(&self, session_id: &str) -> Result<Session, OrchestratorError> {
        Ok(self.shared.db.get_session(session_id).await?)
    }

    pub fn database(&self) -> &Database {
        &self.shared.db
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.shared.supervisor
    }

    pub fn ledger(&self) -> &ExecutionLedger {
        &self.shared.ledger
    }

    pub async fn queue_stats(&self) -> Vec<(JobKind, QueueStats)> {
        vec![
            (JobKind::CreateSession, self.create_queue.stats().await),
            (JobKind::ContinueSession, self.continue_queue.stats().await),
            (JobKind::DeliverInput, self.input_queue.stats().await),
        ]
    }

    /// Failed job for manual retry, looked up across all queues.
    pub async fn requeue(&self, job_id: &str) -> Result<JobHandle, OrchestratorError> {
        for queue in [&self.create_queue, &self.continue_queue, &self.input_queue] {
            match queue.requeue(job_id).await {
                Err(QueueError::JobNotFound { .. }) => {}
                other => return Ok(other?),
            }
        }
        Err(QueueError::JobNotFound {
            id: job_id.to_string(),
        }
        .into())
    }

    /// Stop admitting work, stop every session and wait (bounded) for the
    /// listener to record their exits.
    pub async fn shutdown(&self) {
        for queue in [&self.create_queue, &self.continue_queue, &self.input_queue] {
            queue.shutdown().await;
        }

        {
            let running = self.shared.supervisor.running_sessions().await;
            let mut stopping = self.shared.stopping.lock().await;
            stopping.extend(running);
        }
        let reports = self.shared.supervisor.shutdown_all().await;
        let zombies: usize = reports.iter().map(|r| r.zombies.len()).sum();
        if zombies > 0 {
            warn!(zombies, "Processes survived shutdown");
        }

        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(self.shared.config.reaper.stop_confirm_timeout_ms);
        while tokio::time::Instant::now() < deadline
            && self
                .shared
                .phases
                .lock()
                .await
                .values()
                .any(|p| matches!(p, Phase::Live { .. }))
        {
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }

        self.shutdown_tx.send_replace(true);
        if let Some(listener) = self.listener.lock().await.take()
            && let Err(e) = listener.await
        {
            warn!(error = %e, "Lifecycle listener ended abnormally");
        }
        info!(stopped = reports.len(), "Orchestrator shut down");
    }
}
