//! Database queries for the agentdeck daemon.

use agentdeck_core::db::unix_timestamp;

use super::db::{Database, DatabaseError};
use super::models::{ExecutionDiff, NewExecutionDiff, NewSession, Session, SessionStatus};

impl Database {
    // =========================================================================
    // Session queries
    // =========================================================================

    /// Create a new session in the `initializing` state.
    pub async fn create_session(&self, new: &NewSession<'_>) -> Result<Session, DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            r"
            INSERT INTO sessions
                (id, status, working_directory, permission_mode, model, commit_policy,
                 created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(new.id)
        .bind(SessionStatus::Initializing.as_str())
        .bind(new.working_directory)
        .bind(new.permission_mode.as_str())
        .bind(new.model)
        .bind(new.commit_policy.as_str())
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_session(new.id).await
    }

    /// Get a session by ID.
    pub async fn get_session(&self, id: &str) -> Result<Session, DatabaseError> {
        sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Session {id}")))
    }

    /// Most recently updated sessions first.
    pub async fn list_sessions(&self, limit: u32) -> Result<Vec<Session>, DatabaseError> {
        let sessions = sqlx::query_as::<_, Session>(
            "SELECT * FROM sessions ORDER BY updated_at DESC, id LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        Ok(sessions)
    }

    /// Update session status.
    pub async fn update_session_status(
        &self,
        id: &str,
        status: SessionStatus,
    ) -> Result<(), DatabaseError> {
        let now = unix_timestamp();

        let result = sqlx::query("UPDATE sessions SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now)
            .bind(id)
            .execute(self.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Session {id}")));
        }
        Ok(())
    }

    /// Record the agent's own session id (from its init message).
    pub async fn set_agent_session_id(
        &self,
        id: &str,
        agent_session_id: &str,
    ) -> Result<(), DatabaseError> {
        let now = unix_timestamp();

        sqlx::query("UPDATE sessions SET agent_session_id = ?, updated_at = ? WHERE id = ?")
            .bind(agent_session_id)
            .bind(now)
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    /// Delete a session and its diffs. Returns whether it existed.
    pub async fn delete_session(&self, id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Execution diff queries
    // =========================================================================

    /// Persist the diff for one execution round.
    pub async fn insert_execution_diff(
        &self,
        diff: &NewExecutionDiff<'_>,
    ) -> Result<ExecutionDiff, DatabaseError> {
        let now = unix_timestamp();

        let id: i64 = sqlx::query_scalar(
            r"
            INSERT INTO execution_diffs
                (session_id, sequence, baseline_commit, final_commit, commit_created,
                 files_changed, insertions, deletions, patch, prompt_marker, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            ",
        )
        .bind(diff.session_id)
        .bind(diff.sequence)
        .bind(diff.baseline_commit)
        .bind(diff.final_commit)
        .bind(diff.commit_created)
        .bind(diff.files_changed)
        .bind(diff.insertions)
        .bind(diff.deletions)
        .bind(diff.patch)
        .bind(diff.prompt_marker)
        .bind(now)
        .fetch_one(self.pool())
        .await?;

        sqlx::query_as::<_, ExecutionDiff>("SELECT * FROM execution_diffs WHERE id = ?")
            .bind(id)
            .fetch_one(self.pool())
            .await
            .map_err(Into::into)
    }

    /// Highest persisted sequence for a session, 0 when none.
    pub async fn max_execution_sequence(&self, session_id: &str) -> Result<i64, DatabaseError> {
        let max: Option<i64> =
            sqlx::query_scalar("SELECT MAX(sequence) FROM execution_diffs WHERE session_id = ?")
                .bind(session_id)
                .fetch_one(self.pool())
                .await?;
        Ok(max.unwrap_or(0))
    }

    /// All diffs for a session in sequence order.
    pub async fn list_execution_diffs(
        &self,
        session_id: &str,
    ) -> Result<Vec<ExecutionDiff>, DatabaseError> {
        let diffs = sqlx::query_as::<_, ExecutionDiff>(
            "SELECT * FROM execution_diffs WHERE session_id = ? ORDER BY sequence",
        )
        .bind(session_id)
        .fetch_all(self.pool())
        .await?;

        Ok(diffs)
    }

    pub async fn get_execution_diff(
        &self,
        session_id: &str,
        sequence: i64,
    ) -> Result<ExecutionDiff, DatabaseError> {
        sqlx::query_as::<_, ExecutionDiff>(
            "SELECT * FROM execution_diffs WHERE session_id = ? AND sequence = ?",
        )
        .bind(session_id)
        .bind(sequence)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("Execution {session_id}#{sequence}")))
    }
}
