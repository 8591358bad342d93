//! agentdeck Core Library
//!
//! Shared functionality for agentdeck components:
//! - Parsing of the agent's stream-json output lines
//! - Configuration resolution and hierarchy
//! - `SQLite` pool helpers shared by storage layers
//! - Common error types

pub mod config;
pub mod db;
pub mod error;
pub mod stream;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
