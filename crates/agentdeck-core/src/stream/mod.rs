//! Parser for the agent's stream-json output.
//!
//! Every complete line read from an agent's pseudo-terminal is offered to
//! [`parse_line`]. Lines that are not JSON objects carrying a `type` field are
//! rejected so the caller can treat them as plain terminal text.

mod parser;
mod types;

pub use parser::{parse_line, parse_value};
pub use types::*;
