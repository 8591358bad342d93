//! Semaphore-backed FIFO job executor.
//!
//! A single dispatcher task pulls jobs off an unbounded channel in enqueue
//! order and only hands a job to a worker task once it holds a semaphore
//! permit. Admission is therefore FIFO; completion order is not once the
//! ceiling is above one.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::types::{Job, JobHandler, JobKind, JobOutcome, JobState, QueueError, QueueStats};

/// Default ceiling used when a queue is configured with zero.
const DEFAULT_CONCURRENCY: usize = 1;

struct Admission {
    job: Job,
    done: oneshot::Sender<JobOutcome>,
}

struct JobRecord {
    job: Job,
    state: JobState,
}

#[derive(Default)]
struct QueueState {
    /// Queued, running and failed jobs. Completed jobs are removed.
    jobs: HashMap<String, JobRecord>,
    stats: QueueStats,
}

/// Handle returned by [`AdmissionQueue::enqueue`].
#[derive(Debug)]
pub struct JobHandle {
    pub id: String,
    pub kind: JobKind,
    queue: String,
    done: oneshot::Receiver<JobOutcome>,
}

impl JobHandle {
    /// Wait for the job's handler to finish.
    pub async fn wait(self) -> Result<JobOutcome, QueueError> {
        self.done.await.map_err(|_| QueueError::Unavailable { queue: self.queue })
    }
}

/// Bounded-concurrency job executor for one category of session work.
pub struct AdmissionQueue {
    name: String,
    concurrency: usize,
    tx: Mutex<Option<mpsc::UnboundedSender<Admission>>>,
    state: Arc<Mutex<QueueState>>,
    idle: Arc<Notify>,
}

impl AdmissionQueue {
    /// Create a queue and start its dispatcher on the current Tokio runtime.
    pub fn new<H: JobHandler>(name: impl Into<String>, concurrency: usize, handler: Arc<H>) -> Self {
        let name = name.into();
        let concurrency = if concurrency == 0 {
            DEFAULT_CONCURRENCY
        } else {
            concurrency
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(QueueState::default()));
        let idle = Arc::new(Notify::new());

        tokio::spawn(dispatch(
            name.clone(),
            rx,
            Arc::new(Semaphore::new(concurrency)),
            Arc::clone(&state),
            Arc::clone(&idle),
            handler,
        ));

        info!(queue = %name, concurrency, "Admission queue started");

        Self {
            name,
            concurrency,
            tx: Mutex::new(Some(tx)),
            state,
            idle,
        }
    }

    /// Queue a job. Returns as soon as the job is recorded; the handler runs
    /// later on the dispatcher's schedule.
    pub async fn enqueue(
        &self,
        kind: JobKind,
        payload: serde_json::Value,
    ) -> Result<JobHandle, QueueError> {
        self.admit(Job::new(kind, payload)).await
    }

    /// Put a failed job back at the tail of the queue.
    pub async fn requeue(&self, job_id: &str) -> Result<JobHandle, QueueError> {
        let job = {
            let mut state = self.state.lock().await;
            let record = state
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| QueueError::JobNotFound { id: job_id.to_string() })?;
            if !matches!(record.state, JobState::Failed { .. }) {
                return Err(QueueError::NotFailed { id: job_id.to_string() });
            }
            let job = record.job.clone();
            state.jobs.remove(job_id);
            state.stats.failed = state.stats.failed.saturating_sub(1);
            job
        };
        info!(queue = %self.name, job_id, attempts = job.attempts, "Requeueing failed job");
        self.admit(job).await
    }

    async fn admit(&self, job: Job) -> Result<JobHandle, QueueError> {
        let tx_guard = self.tx.lock().await;
        let Some(tx) = tx_guard.as_ref() else {
            return Err(self.unavailable());
        };

        let (done_tx, done_rx) = oneshot::channel();
        let handle = JobHandle {
            id: job.id.clone(),
            kind: job.kind,
            queue: self.name.clone(),
            done: done_rx,
        };

        {
            let mut state = self.state.lock().await;
            state.jobs.insert(
                job.id.clone(),
                JobRecord {
                    job: job.clone(),
                    state: JobState::Queued,
                },
            );
            state.stats.queued += 1;
        }

        let job_id = job.id.clone();
        if tx.send(Admission { job, done: done_tx }).is_err() {
            drop(tx_guard);
            let mut state = self.state.lock().await;
            state.jobs.remove(&job_id);
            state.stats.queued = state.stats.queued.saturating_sub(1);
            warn!(queue = %self.name, "Dispatcher gone, rejecting job");
            return Err(self.unavailable());
        }

        debug!(queue = %self.name, job_id = %handle.id, kind = %handle.kind, "Job enqueued");
        Ok(handle)
    }

    fn unavailable(&self) -> QueueError {
        QueueError::Unavailable {
            queue: self.name.clone(),
        }
    }

    /// Stop admitting new jobs. Jobs already queued still run.
    pub async fn shutdown(&self) {
        if self.tx.lock().await.take().is_some() {
            info!(queue = %self.name, "Admission queue closed");
        }
    }

    /// Wait until nothing is queued or running.
    pub async fn drain(&self) {
        loop {
            let notified = self.idle.notified();
            {
                let state = self.state.lock().await;
                if state.stats.queued == 0 && state.stats.running == 0 {
                    return;
                }
            }
            notified.await;
        }
    }

    /// State of a job the queue still tracks. Completed jobs return `None`.
    pub async fn job_state(&self, job_id: &str) -> Option<JobState> {
        self.state
            .lock()
            .await
            .jobs
            .get(job_id)
            .map(|r| r.state.clone())
    }

    /// Failed jobs retained for inspection, oldest first.
    pub async fn failed_jobs(&self) -> Vec<(Job, String)> {
        let state = self.state.lock().await;
        let mut failed: Vec<(Job, String)> = state
            .jobs
            .values()
            .filter_map(|r| match &r.state {
                JobState::Failed { error } => Some((r.job.clone(), error.clone())),
                _ => None,
            })
            .collect();
        drop(state);
        failed.sort_by_key(|(job, _)| job.enqueued_at);
        failed
    }

    pub async fn stats(&self) -> QueueStats {
        self.state.lock().await.stats
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn concurrency(&self) -> usize {
        self.concurrency
    }
}

async fn dispatch<H: JobHandler>(
    name: String,
    mut rx: mpsc::UnboundedReceiver<Admission>,
    semaphore: Arc<Semaphore>,
    state: Arc<Mutex<QueueState>>,
    idle: Arc<Notify>,
    handler: Arc<H>,
) {
    while let Some(Admission { mut job, done }) = rx.recv().await {
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };

        job.attempts += 1;
        {
            let mut state = state.lock().await;
            if let Some(record) = state.jobs.get_mut(&job.id) {
                record.state = JobState::Running;
                record.job.attempts = job.attempts;
            }
            state.stats.queued = state.stats.queued.saturating_sub(1);
            state.stats.running += 1;
            state.stats.peak_running = state.stats.peak_running.max(state.stats.running);
        }

        let waited_ms = job.enqueued_at.elapsed().unwrap_or_default().as_millis();
        debug!(queue = %name, job_id = %job.id, kind = %job.kind, waited_ms, "Job admitted");

        tokio::spawn(run_job(
            name.clone(),
            job,
            done,
            permit,
            Arc::clone(&state),
            Arc::clone(&idle),
            Arc::clone(&handler),
        ));
    }
    debug!(queue = %name, "Dispatcher stopped");
}

async fn run_job<H: JobHandler>(
    name: String,
    job: Job,
    done: oneshot::Sender<JobOutcome>,
    permit: OwnedSemaphorePermit,
    state: Arc<Mutex<QueueState>>,
    idle: Arc<Notify>,
    handler: Arc<H>,
) {
    let job_id = job.id.clone();
    let kind = job.kind;

    // Run the handler in its own task so a panic fails the job instead of
    // leaking the permit bookkeeping.
    let result = tokio::spawn(async move { handler.handle(job).await.map_err(|e| e.to_string()) })
        .await
        .unwrap_or_else(|e| Err(format!("job handler panicked: {e}")));

    let outcome = {
        let mut state = state.lock().await;
        state.stats.running = state.stats.running.saturating_sub(1);
        match result {
            Ok(()) => {
                state.jobs.remove(&job_id);
                state.stats.completed += 1;
                JobOutcome::Completed
            }
            Err(error) => {
                if let Some(record) = state.jobs.get_mut(&job_id) {
                    record.state = JobState::Failed {
                        error: error.clone(),
                    };
                }
                state.stats.failed += 1;
                JobOutcome::Failed(error)
            }
        }
    };
    // Release the slot only after the running counter dropped.
    drop(permit);

    match &outcome {
        JobOutcome::Completed => debug!(queue = %name, job_id = %job_id, %kind, "Job completed"),
        JobOutcome::Failed(error) => {
            warn!(queue = %name, job_id = %job_id, %kind, error = %error, "Job failed");
        }
    }

    let _ = done.send(outcome);
    idle.notify_waiters();
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::queue::JobError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Handler that tracks concurrency and fails jobs whose payload says so.
    #[derive(Default)]
    struct Recorder {
        current: AtomicUsize,
        max_seen: AtomicUsize,
        started: Mutex<Vec<u64>>,
    }

    impl JobHandler for Recorder {
        async fn handle(&self, job: Job) -> Result<(), JobError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            self.started
                .lock()
                .await
                .push(job.payload["n"].as_u64().unwrap_or_default());
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            if job.payload["fail"].as_bool() == Some(true) {
                return Err("boom".into());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn zero_concurrency_uses_default() {
        let queue = AdmissionQueue::new("q", 0, Arc::new(Recorder::default()));
        assert_eq!(queue.concurrency(), DEFAULT_CONCURRENCY);
    }

    #[tokio::test]
    async fn ceiling_holds_under_burst() {
        let recorder = Arc::new(Recorder::default());
        let queue = AdmissionQueue::new("burst", 3, Arc::clone(&recorder));

        let mut handles = Vec::new();
        for n in 0..30 {
            handles.push(
                queue
                    .enqueue(JobKind::CreateSession, serde_json::json!({ "n": n }))
                    .await
                    .unwrap(),
            );
        }
        for h in handles {
            assert_eq!(h.wait().await.unwrap(), JobOutcome::Completed);
        }

        assert!(recorder.max_seen.load(Ordering::SeqCst) <= 3);
        let stats = queue.stats().await;
        assert!(stats.peak_running <= 3);
        assert_eq!(stats.completed, 30);
        assert_eq!(stats.running, 0);
        assert_eq!(stats.queued, 0);
    }

    #[tokio::test]
    async fn failure_is_retained_and_does_not_block_followers() {
        let recorder = Arc::new(Recorder::default());
        let queue = AdmissionQueue::new("fail", 1, recorder);

        let bad = queue
            .enqueue(JobKind::ContinueSession, serde_json::json!({ "fail": true }))
            .await
            .unwrap();
        let good = queue
            .enqueue(JobKind::ContinueSession, serde_json::json!({}))
            .await
            .unwrap();
        let bad_id = bad.id.clone();
        let good_id = good.id.clone();

        assert_eq!(bad.wait().await.unwrap(), JobOutcome::Failed("boom".into()));
        assert_eq!(good.wait().await.unwrap(), JobOutcome::Completed);

        assert!(matches!(
            queue.job_state(&bad_id).await,
            Some(JobState::Failed { .. })
        ));
        assert!(queue.job_state(&good_id).await.is_none());
        let failed = queue.failed_jobs().await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0.attempts, 1);
    }

    #[tokio::test]
    async fn requeue_runs_failed_job_again() {
        let queue = AdmissionQueue::new("retry", 1, Arc::new(Recorder::default()));
        let handle = queue
            .enqueue(JobKind::DeliverInput, serde_json::json!({ "fail": true }))
            .await
            .unwrap();
        let id = handle.id.clone();
        handle.wait().await.unwrap();

        let again = queue.requeue(&id).await.unwrap();
        assert_eq!(again.id, id);
        assert!(matches!(again.wait().await.unwrap(), JobOutcome::Failed(_)));
        let failed = queue.failed_jobs().await;
        assert_eq!(failed[0].0.attempts, 2);
        assert_eq!(queue.stats().await.failed, 1);
    }

    #[tokio::test]
    async fn requeue_rejects_unknown_and_live_jobs() {
        let queue = AdmissionQueue::new("retry", 1, Arc::new(Recorder::default()));
        assert!(matches!(
            queue.requeue("missing").await,
            Err(QueueError::JobNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn enqueue_after_shutdown_fails_fast() {
        let queue = AdmissionQueue::new("closed", 2, Arc::new(Recorder::default()));
        let queued = queue
            .enqueue(JobKind::CreateSession, serde_json::json!({}))
            .await
            .unwrap();
        queue.shutdown().await;

        let err = queue
            .enqueue(JobKind::CreateSession, serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Unavailable { .. }));
        // Already-admitted work drains.
        assert_eq!(queued.wait().await.unwrap(), JobOutcome::Completed);
    }

    #[tokio::test]
    async fn drain_returns_once_idle() {
        let queue = AdmissionQueue::new("drain", 2, Arc::new(Recorder::default()));
        for n in 0..5 {
            queue
                .enqueue(JobKind::CreateSession, serde_json::json!({ "n": n }))
                .await
                .unwrap();
        }
        tokio::time::timeout(Duration::from_secs(5), queue.drain())
            .await
            .expect("queue should drain");
        assert_eq!(queue.stats().await.completed, 5);
    }

    struct Panicky;

    impl JobHandler for Panicky {
        #[allow(clippy::panic)]
        async fn handle(&self, _job: Job) -> Result<(), JobError> {
            panic!("handler exploded");
        }
    }

    #[tokio::test]
    async fn panicking_handler_fails_job_and_frees_slot() {
        let queue = AdmissionQueue::new("panic", 1, Arc::new(Panicky));
        let first = queue
            .enqueue(JobKind::CreateSession, serde_json::json!({}))
            .await
            .unwrap();
        let second = queue
            .enqueue(JobKind::CreateSession, serde_json::json!({}))
            .await
            .unwrap();
        assert!(matches!(first.wait().await.unwrap(), JobOutcome::Failed(_)));
        assert!(matches!(second.wait().await.unwrap(), JobOutcome::Failed(_)));
        assert_eq!(queue.stats().await.running, 0);
    }
}
