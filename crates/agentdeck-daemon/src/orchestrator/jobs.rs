//! Queue job payloads and the handler that runs them.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::ledger::LedgerError;
use crate::queue::{Job, JobError, JobHandler, JobKind};
use crate::storage::SessionStatus;
use crate::supervisor::{OutputKind, SessionEvent, SpawnRequest};

use super::args::AgentInvocation;
use super::{OrchestratorError, Phase, Shared};

/// Start the first round of a new session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionPayload {
    pub session_id: String,
    pub prompt: String,
    #[serde(default)]
    pub prompt_marker: Option<String>,
}

/// Start a follow-up round, resuming the agent's conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinueSessionPayload {
    pub session_id: String,
    pub prompt: String,
    #[serde(default)]
    pub prompt_marker: Option<String>,
}

/// Raw terminal input for a running session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliverInputPayload {
    pub session_id: String,
    pub data: String,
}

/// Runs every job kind against the shared orchestrator state.
pub(super) struct SessionJobHandler {
    pub(super) shared: Arc<Shared>,
}

impl JobHandler for SessionJobHandler {
    async fn handle(&self, job: Job) -> Result<(), JobError> {
        debug!(job_id = %job.id, kind = %job.kind, attempts = job.attempts, "Handling job");
        match job.kind {
            JobKind::CreateSession => {
                let payload: CreateSessionPayload = serde_json::from_value(job.payload)?;
                self.run_round(&payload.session_id, &payload.prompt, payload.prompt_marker.as_deref(), false)
                    .await?;
            }
            JobKind::ContinueSession => {
                let payload: ContinueSessionPayload = serde_json::from_value(job.payload)?;
                self.run_round(&payload.session_id, &payload.prompt, payload.prompt_marker.as_deref(), true)
                    .await?;
            }
            JobKind::DeliverInput => {
                let payload: DeliverInputPayload = serde_json::from_value(job.payload)?;
                self.shared
                    .supervisor
                    .send_input(&payload.session_id, payload.data.as_bytes())
                    .await?;
            }
        }
        Ok(())
    }
}

impl SessionJobHandler {
    /// Open a ledger round and start the agent for it. The job is done once
    /// the process is running; its exit is handled by the lifecycle listener.
    ///
    /// A process still running from the previous round is stopped first and
    /// that round is closed with its partial work recorded, so nothing it
    /// writes lands in the new round.
    async fn run_round(
        &self,
        session_id: &str,
        prompt: &str,
        prompt_marker: Option<&str>,
        resume: bool,
    ) -> Result<(), OrchestratorError> {
        let shared = &self.shared;
        let session = shared.db.get_session(session_id).await?;
        let working_dir = PathBuf::from(&session.working_directory);

        let round = shared.round_lock(session_id).await;
        let _round = round.lock().await;

        shared.phases.lock().await.insert(session_id.to_string(), Phase::Launching);
        shared.stopping.lock().await.remove(session_id);

        if shared.supervisor.is_running(session_id).await {
            info!(session_id, "Stopping previous process before the next round");
            shared.supervisor.kill(session_id).await;
        }
        match shared.ledger.end_execution(session_id).await {
            Ok(Some(outcome)) => {
                info!(session_id, sequence = outcome.context.sequence, "Previous round closed early");
            }
            Ok(None) => {}
            Err(e) => warn!(session_id, error = %e, "Failed to close previous round"),
        }

        shared
            .db
            .update_session_status(session_id, SessionStatus::Initializing)
            .await?;

        match shared
            .ledger
            .start_execution(session_id, &working_dir, prompt_marker)
            .await
        {
            Ok(_) => {}
            Err(LedgerError::GitBaselineReadFailure { dir, source }) => {
                shared
                    .events
                    .emit(SessionEvent::Output {
                        session_id: session_id.to_string(),
                        kind: OutputKind::Stderr,
                        data: format!(
                            "Changes in {} will not be checkpointed: {source}",
                            dir.display()
                        ),
                    })
                    .await;
            }
            Err(e) => {
                shared.phases.lock().await.remove(session_id);
                return Err(e.into());
            }
        }

        let invocation = AgentInvocation::for_session(
            &session,
            prompt,
            resume,
            shared.config.agent.default_model.as_deref(),
        );
        let request = SpawnRequest {
            session_id: session_id.to_string(),
            working_dir,
            args: invocation.to_args(),
            env: Vec::new(),
        };

        match shared.supervisor.spawn(request).await {
            Ok(handle) => {
                info!(session_id, pid = handle.pid, resume, "Session round started");
                Ok(())
            }
            Err(e) => {
                warn!(session_id, error = %e, "Session round failed to start");
                shared.phases.lock().await.remove(session_id);
                shared.ledger.cancel_execution(session_id).await;
                shared
                    .db
                    .update_session_status(session_id, SessionStatus::Error)
                    .await?;
                shared
                    .events
                    .emit(SessionEvent::Error {
                        session_id: session_id.to_string(),
                        message: e.to_string(),
                    })
                    .await;
                Err(e.into())
            }
        }
    }
}
