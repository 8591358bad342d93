//! agentdeck daemon library
//!
//! Runs coding-agent sessions as supervised PTY processes:
//! - Admission queues that bound concurrent session work
//! - Process supervision with executable resolution and event fan-out
//! - Process-tree reaping with zombie verification
//! - A git-backed ledger of per-round diffs
//! - `SQLite` storage for sessions and execution diffs
//! - An orchestrator façade tying the pieces together

pub mod ledger;
pub mod orchestrator;
pub mod queue;
pub mod reaper;
pub mod storage;
pub mod supervisor;
