//! `SQLite` storage for the agentdeck daemon.
//!
//! Persists sessions and the diff captured for every execution round.

mod db;
mod models;
mod queries;

pub use db::{Database, DatabaseError};
pub use models::*;
