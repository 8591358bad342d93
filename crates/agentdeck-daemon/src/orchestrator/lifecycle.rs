//! Lifecycle listener: turns supervisor events into session status changes
//! and closes execution rounds when their process exits.
//!
//! The listener only routes. Each session's events are handled in order by
//! that session's own worker, so one slow round close (a structured-commit
//! wait, several git commands) never holds up the others.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use agentdeck_core::stream::AgentMessage;

use crate::storage::SessionStatus;
use crate::supervisor::{DiagnosticKind, SessionEvent};

use super::{OrchestratorError, Phase, Shared};

/// A worker with nothing to do for this long winds down.
const WORKER_IDLE: Duration = Duration::from_secs(60);

pub(super) async fn run(
    shared: Arc<Shared>,
    mut events: broadcast::Receiver<SessionEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut workers: HashMap<String, mpsc::UnboundedSender<SessionEvent>> = HashMap::new();
    let mut tasks: JoinSet<String> = JoinSet::new();

    loop {
        let event = tokio::select! {
            biased;
            received = events.recv() => match received {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Lifecycle listener fell behind");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        };

        while let Some(finished) = tasks.try_join_next() {
            match finished {
                Ok(session_id) => {
                    if workers.get(&session_id).is_some_and(|tx| tx.is_closed()) {
                        workers.remove(&session_id);
                    }
                }
                Err(e) => warn!(error = %e, "Session worker ended abnormally"),
            }
        }

        let session_id = event.session_id().to_string();
        let mut event = event;
        loop {
            let tx = workers.entry(session_id.clone()).or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                tasks.spawn(session_worker(Arc::clone(&shared), session_id.clone(), rx));
                tx
            });
            match tx.send(event) {
                Ok(()) => break,
                // The worker went idle and closed; start a fresh one.
                Err(mpsc::error::SendError(returned)) => {
                    workers.remove(&session_id);
                    event = returned;
                }
            }
        }
    }

    drop(workers);
    while let Some(finished) = tasks.join_next().await {
        if let Err(e) = finished {
            warn!(error = %e, "Session worker ended abnormally");
        }
    }
    debug!("Lifecycle listener stopped");
}

/// Handle one session's events in arrival order until idle or shut down.
async fn session_worker(
    shared: Arc<Shared>,
    session_id: String,
    mut rx: mpsc::UnboundedReceiver<SessionEvent>,
) -> String {
    loop {
        match tokio::time::timeout(WORKER_IDLE, rx.recv()).await {
            Ok(Some(event)) => dispatch(&shared, event).await,
            Ok(None) => break,
            Err(_) => {
                // Refuse new sends, then finish what already arrived.
                rx.close();
                while let Ok(event) = rx.try_recv() {
                    dispatch(&shared, event).await;
                }
                shared.release_idle(&session_id).await;
                break;
            }
        }
    }
    debug!(session_id, "Session worker stopped");
    session_id
}

async fn dispatch(shared: &Shared, event: SessionEvent) {
    let session_id = event.session_id().to_string();
    let name = event.name();
    if let Err(e) = handle(shared, event).await {
        warn!(session_id, event = name, error = %e, "Lifecycle update failed");
    }
}

async fn handle(shared: &Shared, event: SessionEvent) -> Result<(), OrchestratorError> {
    match event {
        SessionEvent::Spawned { session_id, pid } => {
            shared.phases.lock().await.insert(
                session_id.clone(),
                Phase::Live {
                    pid,
                    startup_failed: false,
                },
            );
            shared
                .db
                .update_session_status(&session_id, SessionStatus::Running)
                .await?;
        }
        SessionEvent::Message {
            session_id,
            message,
        } => match message {
            AgentMessage::SystemInit(init) if !init.session_id.is_empty() => {
                debug!(session_id, agent_session_id = %init.session_id, "Agent session identified");
                shared
                    .db
                    .set_agent_session_id(&session_id, &init.session_id)
                    .await?;
            }
            AgentMessage::Result(_) => {
                shared
                    .db
                    .update_session_status(&session_id, SessionStatus::Waiting)
                    .await?;
            }
            _ => {}
        },
        SessionEvent::Diagnostic {
            session_id,
            kind: DiagnosticKind::NoOutputStartupFailure,
            ..
        } => {
            if let Some(Phase::Live { startup_failed, .. }) =
                shared.phases.lock().await.get_mut(&session_id)
            {
                *startup_failed = true;
            }
        }
        SessionEvent::Exit {
            session_id,
            pid,
            code,
            ..
        } => {
            let round = shared.round_lock(&session_id).await;
            let _round = round.lock().await;
            let startup_failed = {
                let mut phases = shared.phases.lock().await;
                match phases.get(&session_id).copied() {
                    Some(Phase::Live {
                        pid: live,
                        startup_failed,
                    }) if live == pid => {
                        phases.remove(&session_id);
                        Some(startup_failed)
                    }
                    // A restart is under way or has already replaced this
                    // process; its round is no longer this exit's to close.
                    Some(_) => {
                        debug!(session_id, pid, "Exit of superseded process ignored");
                        None
                    }
                    None => {
                        debug!(session_id, pid, "Exit for untracked session");
                        None
                    }
                }
            };
            if let Some(startup_failed) = startup_failed {
                on_exit(shared, &session_id, pid, code, startup_failed).await?;
            }
        }
        _ => {}
    }
    Ok(())
}

async fn on_exit(
    shared: &Shared,
    session_id: &str,
    pid: u32,
    code: Option<i32>,
    startup_failed: bool,
) -> Result<(), OrchestratorError> {
    let stopped = shared.stopping.lock().await.remove(session_id);

    let status = if startup_failed {
        shared.ledger.cancel_execution(session_id).await;
        if stopped {
            SessionStatus::Stopped
        } else {
            SessionStatus::Error
        }
    } else {
        match shared.ledger.end_execution(session_id).await {
            Ok(Some(outcome)) => {
                for warning in &outcome.warnings {
                    warn!(session_id, sequence = outcome.context.sequence, %warning, "Round closed with warning");
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(session_id, error = %e, "Failed to close execution round");
                shared
                    .events
                    .emit(SessionEvent::Error {
                        session_id: session_id.to_string(),
                        message: format!("Failed to record execution diff: {e}"),
                    })
                    .await;
            }
        }
        if stopped {
            SessionStatus::Stopped
        } else if code == Some(0) {
            SessionStatus::CompletedUnviewed
        } else {
            SessionStatus::Error
        }
    };

    info!(session_id, pid, ?code, %status, "Session process finished");
    shared.db.update_session_status(session_id, status).await?;
    Ok(())
}
