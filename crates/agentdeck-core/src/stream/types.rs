//! Message types for the agent stream-json protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// Structured message emitted by an agent process.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentMessage {
    SystemInit(SystemInit),
    Assistant(AssistantTurn),
    User(ToolResults),
    Result(RoundResult),
    Unknown { msg_type: String, payload: Value },
}

impl AgentMessage {
    /// The protocol `type` tag this message was parsed from.
    pub fn kind(&self) -> &str {
        match self {
            Self::SystemInit(_) => "system",
            Self::Assistant(_) => "assistant",
            Self::User(_) => "user",
            Self::Result(_) => "result",
            Self::Unknown { msg_type, .. } => msg_type,
        }
    }

    /// Agent-side session identifier, when the message carries one.
    pub fn agent_session_id(&self) -> Option<&str> {
        let id = match self {
            Self::SystemInit(init) => init.session_id.as_str(),
            Self::Result(result) => result.session_id.as_str(),
            _ => return None,
        };
        (!id.is_empty()).then_some(id)
    }
}

/// First message of a run: the agent's own session identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInit {
    pub session_id: String,
    pub model: String,
    pub cwd: PathBuf,
    #[serde(default)]
    pub permission_mode: Option<String>,
}

/// Assistant turn, reduced to what the orchestrator needs to surface.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AssistantTurn {
    pub text: Vec<String>,
    pub tool_uses: Vec<ToolUse>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
}

/// Tool results echoed back through a `user` message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ToolResults {
    pub tool_use_ids: Vec<String>,
    pub errors: usize,
}

/// End-of-round summary. The agent is idle and waiting after this.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundResult {
    pub subtype: ResultSubtype,
    pub session_id: String,
    pub is_error: bool,
    pub duration_ms: u64,
    pub num_turns: u32,
    pub cost_usd: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ResultSubtype {
    #[default]
    Success,
    ErrorMaxTurns,
    ErrorDuringExecution,
    Unknown(String),
}
