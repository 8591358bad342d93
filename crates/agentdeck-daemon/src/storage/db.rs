//! Database connection and initialization.

pub use agentdeck_core::db::DatabaseError;

agentdeck_core::define_database!(Database, "Session store migrations complete");

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_in_memory_works() {
        let db = Database::open_in_memory().await;
        assert!(db.is_ok());
    }

    #[tokio::test]
    #[allow(clippy::unwrap_used)]
    async fn open_on_disk_creates_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("agentdeck.db");
        let _db = Database::open(&path).await.unwrap();
        assert!(path.exists());
    }
}
