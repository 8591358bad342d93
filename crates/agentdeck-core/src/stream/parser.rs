//! Tolerant reader for stream-json lines: unknown fields are ignored and
//! unknown `type` tags become [`AgentMessage::Unknown`].

use serde_json::Value;

use super::types::{
    AgentMessage, AssistantTurn, ResultSubtype, RoundResult, SystemInit, ToolResults, ToolUse,
};
use crate::error::{Error, Result};

/// Parse one line of agent output.
///
/// Only JSON objects with a string `type` field qualify; everything else is
/// an error so the caller falls back to treating the line as text.
pub fn parse_line(line: &str) -> Result<AgentMessage> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return Err(Error::StreamParse("not a JSON object".into()));
    }
    let raw: Value = serde_json::from_str(trimmed)?;
    parse_value(&raw)
}

/// Parse an already-decoded JSON value into an [`AgentMessage`].
pub fn parse_value(raw: &Value) -> Result<AgentMessage> {
    let msg_type = raw
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::StreamParse("Missing 'type' field".into()))?;

    Ok(match msg_type {
        "system" if raw.get("subtype").and_then(Value::as_str).unwrap_or("init") == "init" => {
            AgentMessage::SystemInit(parse_system(raw))
        }
        "assistant" => AgentMessage::Assistant(parse_assistant(raw)),
        "user" => AgentMessage::User(parse_user(raw)),
        "result" => AgentMessage::Result(parse_result(raw)),
        _ => AgentMessage::Unknown {
            msg_type: msg_type.to_string(),
            payload: raw.clone(),
        },
    })
}

fn str_field(raw: &Value, key: &str) -> String {
    raw.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn parse_system(raw: &Value) -> SystemInit {
    SystemInit {
        session_id: str_field(raw, "session_id"),
        model: str_field(raw, "model"),
        cwd: raw
            .get("cwd")
            .and_then(Value::as_str)
            .map(std::path::PathBuf::from)
            .unwrap_or_default(),
        permission_mode: raw
            .get("permissionMode")
            .and_then(Value::as_str)
            .map(String::from),
    }
}

fn content_blocks(raw: &Value) -> &[Value] {
    raw.get("message")
        .unwrap_or(raw)
        .get("content")
        .and_then(Value::as_array)
        .map_or(&[][..], Vec::as_slice)
}

fn parse_assistant(raw: &Value) -> AssistantTurn {
    let mut turn = AssistantTurn::default();
    for block in content_blocks(raw) {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    turn.text.push(text.to_string());
                }
            }
            Some("tool_use") => turn.tool_uses.push(ToolUse {
                id: str_field(block, "id"),
                name: str_field(block, "name"),
            }),
            _ => {}
        }
    }
    turn
}

fn parse_user(raw: &Value) -> ToolResults {
    let mut results = ToolResults::default();
    for block in content_blocks(raw) {
        if block.get("type").and_then(Value::as_str) != Some("tool_result") {
            continue;
        }
        results.tool_use_ids.push(str_field(block, "tool_use_id"));
        if block.get("is_error").and_then(Value::as_bool) == Some(true) {
            results.errors += 1;
        }
    }
    results
}

fn parse_result(raw: &Value) -> RoundResult {
    let subtype = match raw.get("subtype").and_then(Value::as_str) {
        Some("success") | None => ResultSubtype::Success,
        Some("error_max_turns") => ResultSubtype::ErrorMaxTurns,
        Some("error_during_execution") => ResultSubtype::ErrorDuringExecution,
        Some(other) => ResultSubtype::Unknown(other.to_string()),
    };

    RoundResult {
        subtype,
        session_id: str_field(raw, "session_id"),
        is_error: raw.get("is_error").and_then(Value::as_bool).unwrap_or(false),
        duration_ms: raw.get("duration_ms").and_then(Value::as_u64).unwrap_or(0),
        num_turns: raw
            .get("num_turns")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0),
        cost_usd: raw.get("total_cost_usd").and_then(Value::as_f64),
    }
}
