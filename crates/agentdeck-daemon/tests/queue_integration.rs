#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Admission ordering under a single-slot queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use agentdeck_daemon::queue::{AdmissionQueue, Job, JobError, JobHandler, JobKind, JobOutcome};

/// Records when each job starts and finishes.
#[derive(Default)]
struct Recorder {
    log: Mutex<Vec<(String, u64)>>,
}

impl JobHandler for Recorder {
    async fn handle(&self, job: Job) -> Result<(), JobError> {
        let n = job.payload["n"].as_u64().unwrap_or_default();
        self.log.lock().await.push(("start".to_string(), n));
        // Later jobs are shorter, so any overlap would reorder the finishes.
        tokio::time::sleep(Duration::from_millis(20 - n)).await;
        self.log.lock().await.push(("end".to_string(), n));
        Ok(())
    }
}

#[tokio::test]
async fn single_slot_queue_runs_creates_one_at_a_time_in_order() {
    let recorder = Arc::new(Recorder::default());
    let queue = AdmissionQueue::new("create", 1, Arc::clone(&recorder));

    let mut handles = Vec::new();
    for n in 0..10u64 {
        handles.push(
            queue
                .enqueue(
                    JobKind::CreateSession,
                    serde_json::json!({ "session_id": format!("s{n}"), "n": n }),
                )
                .await
                .unwrap(),
        );
    }
    for handle in handles {
        assert_eq!(handle.wait().await.unwrap(), JobOutcome::Completed);
    }

    let log = recorder.log.lock().await.clone();
    let expected: Vec<(String, u64)> = (0..10u64)
        .flat_map(|n| [("start".to_string(), n), ("end".to_string(), n)])
        .collect();
    assert_eq!(log, expected);

    let stats = queue.stats().await;
    assert_eq!(stats.peak_running, 1);
    assert_eq!(stats.completed, 10);
}

#[tokio::test]
async fn shutdown_lets_queued_jobs_finish() {
    let recorder = Arc::new(Recorder::default());
    let queue = AdmissionQueue::new("continue", 2, Arc::clone(&recorder));

    let mut handles = Vec::new();
    for n in 0..4u64 {
        handles.push(
            queue
                .enqueue(JobKind::ContinueSession, serde_json::json!({ "n": n }))
                .await
                .unwrap(),
        );
    }
    queue.shutdown().await;
    assert!(
        queue
            .enqueue(JobKind::ContinueSession, serde_json::json!({}))
            .await
            .is_err()
    );
    for handle in handles {
        assert_eq!(handle.wait().await.unwrap(), JobOutcome::Completed);
    }
    assert_eq!(recorder.log.lock().await.len(), 8);
}
