//! Agent command-line construction.

use crate::storage::{CommitPolicy, PermissionMode, Session};

/// Appended to the system prompt when the agent is expected to commit its
/// own work.
pub const STRUCTURED_COMMIT_INSTRUCTIONS: &str = "When you finish a task, stage every change \
and create exactly one git commit whose message summarises what you did. Do not leave \
uncommitted changes behind.";

/// Everything that shapes one agent invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInvocation {
    pub prompt: String,
    /// Agent-side session to resume.
    pub resume: Option<String>,
    pub model: Option<String>,
    pub permission_mode: PermissionMode,
    pub commit_policy: CommitPolicy,
}

impl AgentInvocation {
    /// Invocation for a round of `session`. `resume` continues the agent's
    /// own conversation when it is known.
    pub fn for_session(
        session: &Session,
        prompt: &str,
        resume: bool,
        default_model: Option<&str>,
    ) -> Self {
        Self {
            prompt: prompt.to_string(),
            resume: if resume {
                session.agent_session_id.clone()
            } else {
                None
            },
            model: session
                .model
                .clone()
                .or_else(|| default_model.map(String::from)),
            permission_mode: session.permission_mode(),
            commit_policy: session.commit_policy(),
        }
    }

    pub fn to_args(&self) -> Vec<String> {
        let mut args: Vec<String> = ["--output-format", "stream-json", "--verbose"]
            .into_iter()
            .map(String::from)
            .collect();

        args.push("--permission-mode".to_string());
        args.push(self.permission_mode.as_str().to_string());

        if let Some(ref model) = self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        if let Some(ref session) = self.resume {
            args.push("--resume".to_string());
            args.push(session.clone());
        }

        if self.commit_policy == CommitPolicy::Structured {
            args.push("--append-system-prompt".to_string());
            args.push(STRUCTURED_COMMIT_INSTRUCTIONS.to_string());
        }

        args.push("-p".to_string());
        args.push(self.prompt.clone());
        args
    }
}
