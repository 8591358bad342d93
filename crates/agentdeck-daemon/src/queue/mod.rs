//! Admission control for session work.
//!
//! An [`AdmissionQueue`] admits jobs strictly in enqueue order and runs at most
//! `concurrency` handlers at a time, so bursts of session creation never open
//! more pseudo-terminals or descriptors than the platform tolerates. A spawned
//! agent process keeps running after its creation job completes; only the
//! handler itself counts against the ceiling.

mod admission;
mod types;

pub use admission::{AdmissionQueue, JobHandle};
pub use types::{
    Job, JobError, JobHandler, JobKind, JobOutcome, JobState, QueueError, QueueStats,
};
