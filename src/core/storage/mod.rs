//! SQLite-backed persistence for job records, user sessions, and the durable
//! task queue. One connection behind an async mutex; every write that has to
//! be atomic is a single guarded UPDATE, so no explicit transactions are
//! needed on the hot paths.

mod jobs;
mod sessions;

use std::path::Path;
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::info;

use crate::core::error::Result;

pub struct Storage {
    db: Arc<Mutex<Connection>>,
}

impl Storage {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        let storage = Self::from_connection(conn)?;
        info!(path = %path.as_ref().display(), "storage opened");
        Ok(storage)
    }

    /// Private-page database for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(db: Connection) -> Result<Self> {
        db.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS job_records (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                input TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                result TEXT,
                error TEXT,
                error_kind TEXT,
                usage_metrics TEXT,
                env_context TEXT NOT NULL DEFAULT '{}',
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                completed_at DATETIME
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS user_sessions (
                owner_id TEXT PRIMARY KEY,
                credential_data TEXT NOT NULL DEFAULT '{}',
                requested_scopes TEXT NOT NULL DEFAULT '[]',
                granted_scopes TEXT NOT NULL DEFAULT '[]',
                authenticated INTEGER NOT NULL DEFAULT 0,
                profile TEXT NOT NULL DEFAULT '{}',
                token_version INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS queue_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue TEXT NOT NULL,
                payload TEXT NOT NULL,
                delivery_count INTEGER NOT NULL DEFAULT 0,
                available_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                leased_until DATETIME,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_job_records_owner_created
             ON job_records(owner_id, created_at)",
            [],
        )?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_job_records_status_updated
             ON job_records(status, updated_at)",
            [],
        )?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_queue_messages_queue
             ON queue_messages(queue, available_at)",
            [],
        )?;

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    pub fn get_db(&self) -> Arc<Mutex<Connection>> {
        self.db.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[tokio::test]
    async fn reopening_the_database_keeps_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agentq.db");

        let job_id = {
            let storage = Storage::open(&path).await.unwrap();
            storage
                .create_job("alice", "hello", &HashMap::new())
                .await
                .unwrap()
                .id
        };

        let storage = Storage::open(&path).await.unwrap();
        let job = storage.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.input, "hello");
    }
}
