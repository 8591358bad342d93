//! Configuration resolution for agentdeck.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`<config dir>/agentdeck/settings.json`)
//! 3. Project config (`.agentdeck/settings.json`)
//! 4. Environment variables (`AGENTDECK_*`)
//! 5. CLI arguments (highest priority, applied by the binary)
//!
//! Files are merged as JSON objects before deserialisation, so a project file
//! that only sets `queues.create_concurrency` leaves every other value alone.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete agentdeck configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    pub queues: QueueConfig,
    pub reaper: ReaperConfig,
    pub ledger: LedgerConfig,
    pub daemon: DaemonConfig,
}

/// How the agent executable is located and launched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Executable name or absolute path.
    pub binary: String,
    /// Directories searched after the child's `PATH` and before the
    /// platform fallback install locations.
    pub extra_search_dirs: Vec<PathBuf>,
    pub default_model: Option<String>,
    pub default_permission_mode: String,
    /// Pseudo-terminal geometry for new sessions.
    pub pty_rows: u16,
    pub pty_cols: u16,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            extra_search_dirs: Vec::new(),
            default_model: None,
            default_permission_mode: "default".to_string(),
            pty_rows: 40,
            pty_cols: 120,
        }
    }
}

/// Concurrency ceilings for the admission queues.
///
/// macOS hands out far fewer pseudo-terminals and descriptors per user than
/// Linux or Windows, so its defaults are lower.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueueConfig {
    pub create_concurrency: usize,
    pub continue_concurrency: usize,
    pub input_concurrency: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        if cfg!(target_os = "macos") {
            Self {
                create_concurrency: 2,
                continue_concurrency: 3,
                input_concurrency: 1,
            }
        } else {
            Self {
                create_concurrency: 4,
                continue_concurrency: 6,
                input_concurrency: 1,
            }
        }
    }
}

/// Process-tree termination timings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReaperConfig {
    /// Wait between the graceful and the forceful signal.
    pub grace_period_ms: u64,
    /// Wait after the forceful signal before checking for survivors.
    pub settle_ms: u64,
    /// How long a restart waits for the previous instance to confirm exit.
    pub stop_confirm_timeout_ms: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 500,
            settle_ms: 250,
            stop_confirm_timeout_ms: 5_000,
        }
    }
}

/// Checkpoint bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LedgerConfig {
    /// Upper bound on waiting for the agent's own commit under the
    /// structured commit policy.
    pub structured_commit_timeout_secs: u64,
    pub structured_commit_poll_ms: u64,
    pub checkpoint_message_prefix: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            structured_commit_timeout_secs: 30,
            structured_commit_poll_ms: 500,
            checkpoint_message_prefix: "agentdeck: checkpoint".to_string(),
        }
    }
}

/// Daemon-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DaemonConfig {
    pub database_path: Option<PathBuf>,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;

    if let Some(global_path) = global_config_path().filter(|p| p.exists()) {
        merge_json(&mut merged, load_config_file(&global_path)?);
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".agentdeck").join("settings.json");
        if project_path.exists() {
            merge_json(&mut merged, load_config_file(&project_path)?);
        }
    }

    let mut config: Config = serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("agentdeck").join("settings.json"))
}

/// Default database location for the daemon.
pub fn database_path() -> Option<PathBuf> {
    dirs::data_local_dir().map(|p| p.join("agentdeck").join("agentdeck.db"))
}

fn load_config_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    let value: Value = serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })?;
    if !value.is_object() {
        return Err(Error::Config(format!(
            "Config file {} must contain a JSON object",
            path.display()
        )));
    }
    Ok(value)
}

/// Recursively overlay `overlay` onto `base`. Objects merge key by key;
/// everything else replaces.
fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(slot) => merge_json(slot, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("AGENTDECK_AGENT_BIN") {
        config.agent.binary = val;
    }
    if let Some(val) = lookup("AGENTDECK_DEFAULT_MODEL") {
        config.agent.default_model = Some(val);
    }
    if let Some(n) = lookup("AGENTDECK_CREATE_CONCURRENCY").and_then(|v| v.parse().ok()) {
        config.queues.create_concurrency = n;
    }
    if let Some(n) = lookup("AGENTDECK_CONTINUE_CONCURRENCY").and_then(|v| v.parse().ok()) {
        config.queues.continue_concurrency = n;
    }
    if let Some(val) = lookup("AGENTDECK_DB_PATH") {
        config.daemon.database_path = Some(PathBuf::from(val));
    }
    if let Some(val) = lookup("AGENTDECK_LOG_LEVEL") {
        config.daemon.log_level = val;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.agent.binary, "claude");
        assert!(config.queues.create_concurrency >= 1);
        assert_eq!(config.queues.input_concurrency, 1);
        assert!(config.reaper.grace_period_ms > 0);
    }

    #[test]
    fn partial_project_file_keeps_other_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join(".agentdeck");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("settings.json"),
            r#"{"queues":{"create_concurrency":1},"ledger":{"structured_commit_timeout_secs":5}}"#,
        )
        .unwrap();

        let config = load_config(Some(tmp.path())).unwrap();
        assert_eq!(config.queues.create_concurrency, 1);
        assert_eq!(
            config.queues.continue_concurrency,
            QueueConfig::default().continue_concurrency
        );
        assert_eq!(config.ledger.structured_commit_timeout_secs, 5);
        assert_eq!(config.ledger.checkpoint_message_prefix, "agentdeck: checkpoint");
    }

    #[test]
    fn non_object_config_file_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join(".agentdeck");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("settings.json"), "[1, 2]").unwrap();
        assert!(matches!(load_config(Some(tmp.path())), Err(Error::Config(_))));
    }

    #[test]
    fn env_overrides_apply_and_ignore_garbage() {
        let env: HashMap<&str, &str> = [
            ("AGENTDECK_AGENT_BIN", "/opt/agent/bin/claude"),
            ("AGENTDECK_CREATE_CONCURRENCY", "not-a-number"),
            ("AGENTDECK_CONTINUE_CONCURRENCY", "9"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| env.get(k).map(ToString::to_string));

        assert_eq!(config.agent.binary, "/opt/agent/bin/claude");
        assert_eq!(
            config.queues.create_concurrency,
            QueueConfig::default().create_concurrency
        );
        assert_eq!(config.queues.continue_concurrency, 9);
    }

    #[test]
    fn merge_json_replaces_scalars_and_merges_objects() {
        let mut base = serde_json::json!({"a": {"x": 1, "y": 2}, "b": [1]});
        merge_json(&mut base, serde_json::json!({"a": {"y": 3}, "b": [2, 3]}));
        assert_eq!(base, serde_json::json!({"a": {"x": 1, "y": 3}, "b": [2, 3]}));
    }
}
