//! Database models for the agentdeck daemon.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Session record from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Session {
    pub id: String,
    pub status: String,
    pub working_directory: String,
    pub permission_mode: String,
    pub model: Option<String>,
    pub commit_policy: String,
    /// Identifier the agent assigned to its own conversation; used to
    /// resume it.
    pub agent_session_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Session {
    /// Parsed status; unknown values read as [`SessionStatus::Error`].
    pub fn status(&self) -> SessionStatus {
        self.status.parse().unwrap_or(SessionStatus::Error)
    }

    pub fn permission_mode(&self) -> PermissionMode {
        self.permission_mode.parse().unwrap_or_default()
    }

    pub fn commit_policy(&self) -> CommitPolicy {
        self.commit_policy.parse().unwrap_or_default()
    }
}

/// Fields needed to create a session.
#[derive(Debug, Clone)]
pub struct NewSession<'a> {
    pub id: &'a str,
    pub working_directory: &'a str,
    pub permission_mode: PermissionMode,
    pub model: Option<&'a str>,
    pub commit_policy: CommitPolicy,
}

/// Diff captured for one execution round.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ExecutionDiff {
    pub id: i64,
    pub session_id: String,
    pub sequence: i64,
    pub baseline_commit: String,
    pub final_commit: Option<String>,
    pub commit_created: bool,
    pub files_changed: i64,
    pub insertions: i64,
    pub deletions: i64,
    /// Unified patch from the baseline to the round's end state, stored as
    /// raw bytes so non-UTF-8 text survives.
    pub patch: Vec<u8>,
    pub prompt_marker: Option<String>,
    pub created_at: i64,
}

/// Fields needed to record an execution diff.
#[derive(Debug, Clone)]
pub struct NewExecutionDiff<'a> {
    pub session_id: &'a str,
    pub sequence: i64,
    pub baseline_commit: &'a str,
    pub final_commit: Option<&'a str>,
    pub commit_created: bool,
    pub files_changed: i64,
    pub insertions: i64,
    pub deletions: i64,
    pub patch: &'a [u8],
    pub prompt_marker: Option<&'a str>,
}

/// Error for a string that names no variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown {kind}: {value}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

string_enum!(
    /// Session lifecycle status.
    SessionStatus, "session status" {
        Initializing => "initializing",
        Running => "running",
        Waiting => "waiting",
        Stopped => "stopped",
        CompletedUnviewed => "completed_unviewed",
        Error => "error",
    }
);

string_enum!(
    /// How the agent is allowed to act without asking.
    PermissionMode, "permission mode" {
        Default => "default",
        AcceptEdits => "acceptEdits",
        BypassPermissions => "bypassPermissions",
        Plan => "plan",
    }
);

string_enum!(
    /// Whether and how each execution round ends in a commit.
    CommitPolicy, "commit policy" {
        Disabled => "disabled",
        Checkpoint => "checkpoint",
        Structured => "structured",
    }
);

impl Default for PermissionMode {
    fn default() -> Self {
        Self::Default
    }
}

impl Default for CommitPolicy {
    fn default() -> Self {
        Self::Checkpoint
    }
}

impl SessionStatus {
    /// Whether the agent process is expected to be alive.
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Initializing | Self::Running | Self::Waiting)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn enums_round_trip_through_strings() {
        for status in [
            SessionStatus::Initializing,
            SessionStatus::CompletedUnviewed,
            SessionStatus::Stopped,
        ] {
            assert_eq!(status.as_str().parse::<SessionStatus>().unwrap(), status);
        }
        assert_eq!(
            "bypassPermissions".parse::<PermissionMode>().unwrap(),
            PermissionMode::BypassPermissions
        );
    }

    #[test]
    fn unknown_values_are_errors() {
        let err = "sometimes".parse::<CommitPolicy>().unwrap_err();
        assert_eq!(err.to_string(), "Unknown commit policy: sometimes");
    }

    #[test]
    fn session_accessors_fall_back() {
        let session = Session {
            id: "s".into(),
            status: "bogus".into(),
            working_directory: "/tmp".into(),
            permission_mode: "plan".into(),
            model: None,
            commit_policy: "bogus".into(),
            agent_session_id: None,
            created_at: 0,
            updated_at: 0,
        };
        assert_eq!(session.status(), SessionStatus::Error);
        assert_eq!(session.permission_mode(), PermissionMode::Plan);
        assert_eq!(session.commit_policy(), CommitPolicy::Checkpoint);
    }
}
