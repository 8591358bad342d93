//! Execution ledger: binds each round of agent work to a git checkpoint.
//!
//! A round opens with [`ExecutionLedger::start_execution`], which records the
//! baseline `HEAD`, and closes with [`ExecutionLedger::end_execution`], which
//! applies the session's commit policy and persists the diff between the
//! baseline and the round's end state.

mod git;

pub use git::{DiffSummary, GitDiff, GitError};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use agentdeck_core::config::LedgerConfig;

use crate::storage::{CommitPolicy, Database, DatabaseError, ExecutionDiff, NewExecutionDiff};
use crate::supervisor::{EventHub, OutputKind, SessionEvent};

/// Errors from ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// `HEAD` could not be read; the round is not tracked.
    #[error("Cannot read baseline commit in {dir}: {source}")]
    GitBaselineReadFailure { dir: PathBuf, source: GitError },

    #[error("Git error: {0}")]
    Git(#[from] GitError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// An open round of agent work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    pub session_id: String,
    /// Monotonic per session.
    pub sequence: i64,
    pub baseline_commit: String,
    /// Set when the round is closed.
    pub final_commit: Option<String>,
    /// Reference to the prompt that started the round.
    pub prompt_marker: Option<String>,
    pub working_dir: PathBuf,
    pub started_at: SystemTime,
}

/// Result of closing a round.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub context: ExecutionContext,
    pub diff: ExecutionDiff,
    /// Non-fatal problems, such as a commit rejected by a hook.
    pub warnings: Vec<String>,
}

/// Ledger timings and commit message format.
#[derive(Debug, Clone)]
pub struct LedgerSettings {
    pub structured_commit_timeout: Duration,
    pub structured_commit_poll: Duration,
    pub checkpoint_message_prefix: String,
}

impl LedgerSettings {
    pub fn from_config(config: &LedgerConfig) -> Self {
        Self {
            structured_commit_timeout: Duration::from_secs(config.structured_commit_timeout_secs),
            structured_commit_poll: Duration::from_millis(config.structured_commit_poll_ms.max(1)),
            checkpoint_message_prefix: config.checkpoint_message_prefix.clone(),
        }
    }
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self::from_config(&LedgerConfig::default())
    }
}

/// Tracks open execution contexts and closes them into persisted diffs.
pub struct ExecutionLedger {
    db: Database,
    git: GitDiff,
    events: Arc<EventHub>,
    settings: LedgerSettings,
    contexts: Mutex<HashMap<String, ExecutionContext>>,
    /// Last sequence handed out per session, including cancelled rounds.
    sequences: Mutex<HashMap<String, i64>>,
}

impl ExecutionLedger {
    pub fn new(db: Database, git: GitDiff, events: Arc<EventHub>, settings: LedgerSettings) -> Self {
        Self {
            db,
            git,
            events,
            settings,
            contexts: Mutex::new(HashMap::new()),
            sequences: Mutex::new(HashMap::new()),
        }
    }

    pub const fn git(&self) -> &GitDiff {
        &self.git
    }

    /// Open a round for `session_id`. A context still open from an earlier
    /// round is cancelled first.
    pub async fn start_execution(
        &self,
        session_id: &str,
        working_dir: &Path,
        prompt_marker: Option<&str>,
    ) -> Result<ExecutionContext, LedgerError> {
        self.cancel_execution(session_id).await;

        let baseline_commit = self.git.head_commit(working_dir).await.map_err(|source| {
            warn!(session_id, dir = %working_dir.display(), error = %source, "Round not tracked: no baseline");
            LedgerError::GitBaselineReadFailure {
                dir: working_dir.to_path_buf(),
                source,
            }
        })?;
        let sequence = self.next_sequence(session_id).await?;

        let context = ExecutionContext {
            session_id: session_id.to_string(),
            sequence,
            baseline_commit,
            final_commit: None,
            prompt_marker: prompt_marker.map(String::from),
            working_dir: working_dir.to_path_buf(),
            started_at: SystemTime::now(),
        };

        let replaced = self
            .contexts
            .lock()
            .await
            .insert(session_id.to_string(), context.clone());
        if let Some(stale) = replaced {
            self.emit_cancelled(&stale).await;
        }

        info!(
            session_id,
            sequence,
            baseline = %context.baseline_commit,
            "Execution started"
        );
        self.events
            .emit(SessionEvent::ExecutionStarted {
                session_id: session_id.to_string(),
                sequence,
            })
            .await;
        Ok(context)
    }

    /// Close the open round. `Ok(None)` when nothing was open.
    pub async fn end_execution(
        &self,
        session_id: &str,
    ) -> Result<Option<ExecutionOutcome>, LedgerError> {
        let Some(mut context) = self.contexts.lock().await.remove(session_id) else {
            debug!(session_id, "end_execution with no open context");
            return Ok(None);
        };

        let dir = context.working_dir.clone();
        let policy = self.db.get_session(session_id).await?.commit_policy();
        let mut warnings = Vec::new();

        let final_commit = match policy {
            CommitPolicy::Disabled => None,
            CommitPolicy::Checkpoint => {
                self.checkpoint(&context, &mut warnings).await?
            }
            CommitPolicy::Structured => {
                let head = self.wait_for_commit(&dir, &context.baseline_commit).await?;
                if head.is_none() {
                    let secs = self.settings.structured_commit_timeout.as_secs();
                    warn!(session_id, sequence = context.sequence, "Agent produced no commit");
                    warnings.push(format!("No commit produced by the agent within {secs}s"));
                }
                head
            }
        };

        let end_tree = match &final_commit {
            Some(commit) if !self.git.is_dirty(&dir).await? => commit.clone(),
            _ => self.git.snapshot_tree(&dir).await?,
        };
        let summary = self
            .git
            .diff(&dir, &context.baseline_commit, &end_tree)
            .await?;

        context.final_commit.clone_from(&final_commit);
        let diff = self
            .db
            .insert_execution_diff(&NewExecutionDiff {
                session_id,
                sequence: context.sequence,
                baseline_commit: &context.baseline_commit,
                final_commit: final_commit.as_deref(),
                commit_created: final_commit.is_some(),
                files_changed: summary.files_changed,
                insertions: summary.insertions,
                deletions: summary.deletions,
                patch: &summary.patch,
                prompt_marker: context.prompt_marker.as_deref(),
            })
            .await?;

        info!(
            session_id,
            sequence = context.sequence,
            %policy,
            final_commit = ?final_commit,
            files_changed = summary.files_changed,
            insertions = summary.insertions,
            deletions = summary.deletions,
            "Execution completed"
        );
        self.events
            .emit(SessionEvent::ExecutionCompleted {
                session_id: session_id.to_string(),
                sequence: context.sequence,
            })
            .await;

        Ok(Some(ExecutionOutcome {
            context,
            diff,
            warnings,
        }))
    }

    /// Drop the open round without committing or recording a diff.
    pub async fn cancel_execution(&self, session_id: &str) -> Option<ExecutionContext> {
        let context = self.contexts.lock().await.remove(session_id)?;
        self.emit_cancelled(&context).await;
        Some(context)
    }

    /// Cancel any open round and drop the session's sequence counter.
    pub async fn forget(&self, session_id: &str) {
        self.cancel_execution(session_id).await;
        self.sequences.lock().await.remove(session_id);
    }

    pub async fn open_context(&self, session_id: &str) -> Option<ExecutionContext> {
        self.contexts.lock().await.get(session_id).cloned()
    }

    async fn emit_cancelled(&self, context: &ExecutionContext) {
        info!(
            session_id = %context.session_id,
            sequence = context.sequence,
            "Execution cancelled"
        );
        self.events
            .emit(SessionEvent::ExecutionCancelled {
                session_id: context.session_id.clone(),
                sequence: context.sequence,
            })
            .await;
    }

    async fn next_sequence(&self, session_id: &str) -> Result<i64, LedgerError> {
        let persisted = self.db.max_execution_sequence(session_id).await?;
        let mut sequences = self.sequences.lock().await;
        let last = sequences.entry(session_id.to_string()).or_insert(0);
        *last = (*last).max(persisted) + 1;
        Ok(*last)
    }

    /// Commit a dirty tree under the checkpoint policy. A rejected commit
    /// becomes a warning; the round still closes.
    async fn checkpoint(
        &self,
        context: &ExecutionContext,
        warnings: &mut Vec<String>,
    ) -> Result<Option<String>, LedgerError> {
        let dir = &context.working_dir;
        if !self.git.is_dirty(dir).await? {
            // The agent may have committed on its own.
            let head = self.git.head_commit(dir).await?;
            return Ok((head != context.baseline_commit).then_some(head));
        }

        let message = format!(
            "{} {} #{}",
            self.settings.checkpoint_message_prefix, context.session_id, context.sequence
        );
        match self.git.commit_all(dir, &message).await {
            Ok(hash) => {
                debug!(session_id = %context.session_id, commit = %hash, "Checkpoint committed");
                Ok(Some(hash))
            }
            Err(e) => {
                warn!(session_id = %context.session_id, error = %e, "Checkpoint commit failed");
                let warning = format!("Checkpoint commit failed: {e}");
                self.events
                    .emit(SessionEvent::Output {
                        session_id: context.session_id.clone(),
                        kind: OutputKind::Stderr,
                        data: warning.clone(),
                    })
                    .await;
                warnings.push(warning);
                Ok(None)
            }
        }
    }

    /// Poll `HEAD` until it leaves `baseline` or the timeout passes.
    async fn wait_for_commit(
        &self,
        dir: &Path,
        baseline: &str,
    ) -> Result<Option<String>, LedgerError> {
        let deadline = tokio::time::Instant::now() + self.settings.structured_commit_timeout;
        loop {
            let head = self.git.head_commit(dir).await?;
            if head != baseline {
                return Ok(Some(head));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.settings.structured_commit_poll).await;
        }
    }
}
