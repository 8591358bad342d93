//! Session event fan-out.
//!
//! Every lifecycle, output and bookkeeping notification is a [`SessionEvent`].
//! The [`EventHub`] keeps one broadcast channel per session plus one channel
//! that sees every session, so a UI pane can follow a single session while the
//! lifecycle listener follows all of them.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::{RwLock, broadcast};
use tracing::debug;

use agentdeck_core::stream::AgentMessage;

/// Which console stream a line is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Stdout,
    Stderr,
}

/// Distinguished diagnostics raised by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// The OS refused to start the process.
    SpawnRefused,
    /// A direct launch failed and the script is being retried through its
    /// interpreter.
    InterpreterFallback,
    /// The process exited without writing a single byte.
    NoOutputStartupFailure,
}

/// Notification emitted for a session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Spawned {
        session_id: String,
        pid: u32,
    },
    Output {
        session_id: String,
        kind: OutputKind,
        data: String,
    },
    Message {
        session_id: String,
        message: AgentMessage,
    },
    Diagnostic {
        session_id: String,
        kind: DiagnosticKind,
        detail: String,
    },
    Exit {
        session_id: String,
        /// The process that exited; a restart's predecessor has a different
        /// pid than the live one.
        pid: u32,
        code: Option<i32>,
        signal: Option<String>,
    },
    Error {
        session_id: String,
        message: String,
    },
    ZombieProcessesDetected {
        session_id: String,
        pids: Vec<u32>,
        message: String,
    },
    ExecutionStarted {
        session_id: String,
        sequence: i64,
    },
    ExecutionCompleted {
        session_id: String,
        sequence: i64,
    },
    ExecutionCancelled {
        session_id: String,
        sequence: i64,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &str {
        match self {
            Self::Spawned { session_id, .. }
            | Self::Output { session_id, .. }
            | Self::Message { session_id, .. }
            | Self::Diagnostic { session_id, .. }
            | Self::Exit { session_id, .. }
            | Self::Error { session_id, .. }
            | Self::ZombieProcessesDetected { session_id, .. }
            | Self::ExecutionStarted { session_id, .. }
            | Self::ExecutionCompleted { session_id, .. }
            | Self::ExecutionCancelled { session_id, .. } => session_id,
        }
    }

    /// Short tag used in logs.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Spawned { .. } => "spawned",
            Self::Output { .. } => "output",
            Self::Message { .. } => "message",
            Self::Diagnostic { .. } => "diagnostic",
            Self::Exit { .. } => "exit",
            Self::Error { .. } => "error",
            Self::ZombieProcessesDetected { .. } => "zombie_processes_detected",
            Self::ExecutionStarted { .. } => "execution_started",
            Self::ExecutionCompleted { .. } => "execution_completed",
            Self::ExecutionCancelled { .. } => "execution_cancelled",
        }
    }
}

/// Default per-channel buffer.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Per-session broadcast registry plus an all-sessions channel.
pub struct EventHub {
    sessions: RwLock<HashMap<String, broadcast::Sender<SessionEvent>>>,
    all: broadcast::Sender<SessionEvent>,
    capacity: usize,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (all, _) = broadcast::channel(capacity);
        Self {
            sessions: RwLock::new(HashMap::new()),
            all,
            capacity,
        }
    }

    /// Receive events for one session. The channel is created on first use
    /// and survives process restarts of that session.
    pub async fn subscribe(&self, session_id: &str) -> broadcast::Receiver<SessionEvent> {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Receive events for every session.
    pub fn subscribe_all(&self) -> broadcast::Receiver<SessionEvent> {
        self.all.subscribe()
    }

    pub async fn emit(&self, event: SessionEvent) {
        {
            let sessions = self.sessions.read().await;
            if let Some(tx) = sessions.get(event.session_id()) {
                // No receivers is fine; nobody is watching this pane.
                let _ = tx.send(event.clone());
            }
        }
        if self.all.send(event).is_err() {
            debug!("No all-sessions receivers for event");
        }
    }

    /// Drop the per-session channel. Existing receivers see it close.
    pub async fn close(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
