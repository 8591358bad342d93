//! Job and queue types.

use std::future::Future;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Category of session work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    CreateSession,
    ContinueSession,
    DeliverInput,
}

impl JobKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CreateSession => "create_session",
            Self::ContinueSession => "continue_session",
            Self::DeliverInput => "deliver_input",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of queued work.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub payload: serde_json::Value,
    pub enqueued_at: SystemTime,
    /// Number of times a handler has been started for this job.
    pub attempts: u32,
}

impl Job {
    pub(crate) fn new(kind: JobKind, payload: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            payload,
            enqueued_at: SystemTime::now(),
            attempts: 0,
        }
    }
}

/// Lifecycle state of a job still known to its queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Failed { error: String },
}

/// Final result delivered to a [`super::JobHandle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed(String),
}

/// Error type handlers report failures with.
pub type JobError = Box<dyn std::error::Error + Send + Sync>;

/// Runs dequeued jobs.
///
/// A handler may await long external operations (spawning, git); the queue
/// only guarantees that no more than its ceiling run at the same time.
pub trait JobHandler: Send + Sync + 'static {
    fn handle(&self, job: Job) -> impl Future<Output = Result<(), JobError>> + Send;
}

/// Point-in-time queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub queued: usize,
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
    /// Highest number of handlers ever observed running at once.
    pub peak_running: usize,
}

/// Errors from queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue '{queue}' is unavailable")]
    Unavailable { queue: String },

    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    #[error("Job {id} has not failed and cannot be requeued")]
    NotFailed { id: String },
}
