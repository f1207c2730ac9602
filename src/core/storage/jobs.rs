use std::collections::HashMap;

use rusqlite::{Row, params, types::Type};

use super::Storage;
use crate::core::error::Result;
use crate::core::jobs::{ErrorKind, JobStatus};
use crate::core::types::{JobRecord, UsageMetrics};

const JOB_COLUMNS: &str = "id, owner_id, input, status, result, error, error_kind, \
     usage_metrics, env_context, created_at, updated_at, completed_at";

fn conversion_err(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<JobRecord> {
    let status_raw: String = row.get(3)?;
    let status = JobStatus::from_status(&status_raw).ok_or_else(|| {
        conversion_err(
            3,
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown job status: {status_raw}"),
            ),
        )
    })?;
    let error_kind: Option<String> = row.get(6)?;
    let usage_raw: Option<String> = row.get(7)?;
    let usage_metrics: Option<UsageMetrics> = match usage_raw {
        Some(json) => Some(serde_json::from_str(&json).map_err(|e| conversion_err(7, e))?),
        None => None,
    };
    let env_raw: String = row.get(8)?;
    let env_context: HashMap<String, String> =
        serde_json::from_str(&env_raw).map_err(|e| conversion_err(8, e))?;

    Ok(JobRecord {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        input: row.get(2)?,
        status,
        result: row.get(4)?,
        error: row.get(5)?,
        error_kind: error_kind.as_deref().and_then(ErrorKind::from_status),
        usage_metrics,
        env_context,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
        completed_at: row.get(11)?,
    })
}

impl Storage {
    pub async fn create_job(
        &self,
        owner_id: &str,
        input: &str,
        env_context: &HashMap<String, String>,
    ) -> Result<JobRecord> {
        let id = uuid::Uuid::new_v4().to_string();
        let env_json = serde_json::to_string(env_context)?;
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO job_records (id, owner_id, input, status, env_context)
             VALUES (?1, ?2, ?3, 'pending', ?4)",
            params![id, owner_id, input, env_json],
        )?;
        let rec = db.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM job_records WHERE id = ?1"),
            params![id],
            job_from_row,
        )?;
        Ok(rec)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM job_records WHERE id = ?1 LIMIT 1"
        ))?;
        let mut rows = stmt.query(params![job_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(job_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Owner-scoped read: a job owned by someone else is indistinguishable
    /// from a job that does not exist.
    pub async fn get_job_for_owner(
        &self,
        job_id: &str,
        owner_id: &str,
    ) -> Result<Option<JobRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM job_records WHERE id = ?1 AND owner_id = ?2 LIMIT 1"
        ))?;
        let mut rows = stmt.query(params![job_id, owner_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(job_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub async fn list_jobs_for_owner(&self, owner_id: &str) -> Result<Vec<JobRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM job_records WHERE owner_id = ?1
             ORDER BY created_at DESC, rowid DESC"
        ))?;
        let rows = stmt.query_map(params![owner_id], job_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// The `pending → running` claim. Guarded by current status, so of N
    /// workers racing on redelivered copies of the same message exactly one
    /// wins; the rest see `false` and must discard without side effects.
    pub async fn claim_job(&self, job_id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE job_records
             SET status = 'running', updated_at = CURRENT_TIMESTAMP
             WHERE id = ?1 AND status = 'pending'",
            params![job_id],
        )?;
        Ok(rows > 0)
    }

    /// Terminal transition `running → completed`. A `false` return means the
    /// job was not running anymore (lost claim or already terminal) and the
    /// result was discarded.
    pub async fn complete_job(
        &self,
        job_id: &str,
        result: &str,
        usage: &UsageMetrics,
    ) -> Result<bool> {
        let usage_json = serde_json::to_string(usage)?;
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE job_records
             SET status = 'completed', result = ?1, usage_metrics = ?2,
                 completed_at = CURRENT_TIMESTAMP, updated_at = CURRENT_TIMESTAMP
             WHERE id = ?3 AND status = 'running'",
            params![result, usage_json, job_id],
        )?;
        Ok(rows > 0)
    }

    /// Terminal transition `running → failed`.
    pub async fn fail_job(&self, job_id: &str, error: &str, kind: ErrorKind) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE job_records
             SET status = 'failed', error = ?1, error_kind = ?2,
                 completed_at = CURRENT_TIMESTAMP, updated_at = CURRENT_TIMESTAMP
             WHERE id = ?3 AND status = 'running'",
            params![error, kind.as_str(), job_id],
        )?;
        Ok(rows > 0)
    }

    /// Liveness guard, not a state-machine edge: a `running` job untouched
    /// beyond the staleness timeout has lost its worker (crash between claim
    /// and terminal write). Reclaim it to `pending` so it can be re-published
    /// and claimed again. Returns the reclaimed records.
    pub async fn reclaim_stale_jobs(&self, staleness_secs: u64) -> Result<Vec<JobRecord>> {
        let cutoff = format!("-{staleness_secs} seconds");
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM job_records
             WHERE status = 'running' AND updated_at <= datetime('now', ?1)"
        ))?;
        let rows = stmt.query_map(params![cutoff], job_from_row)?;
        let mut stale = Vec::new();
        for row in rows {
            stale.push(row?);
        }
        drop(stmt);
        for job in &stale {
            db.execute(
                "UPDATE job_records
                 SET status = 'pending', updated_at = CURRENT_TIMESTAMP
                 WHERE id = ?1 AND status = 'running'",
                params![job.id],
            )?;
        }
        Ok(stale)
    }

    /// Pending jobs older than `min_age_secs` with no message waiting in the
    /// queue. These are the orphans a failed publish leaves behind; the
    /// maintenance pass re-publishes them.
    pub async fn list_orphaned_pending(&self, min_age_secs: u64) -> Result<Vec<JobRecord>> {
        let cutoff = format!("-{min_age_secs} seconds");
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM job_records j
             WHERE j.status = 'pending' AND j.created_at <= datetime('now', ?1)
               AND NOT EXISTS (
                   SELECT 1 FROM queue_messages q
                   WHERE q.payload LIKE '%' || j.id || '%'
               )"
        ))?;
        let rows = stmt.query_map(params![cutoff], job_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Retention sweep: delete terminal records older than the cutoff.
    pub async fn purge_terminal_jobs(&self, older_than_secs: u64) -> Result<usize> {
        let cutoff = format!("-{older_than_secs} seconds");
        let db = self.db.lock().await;
        let rows = db.execute(
            "DELETE FROM job_records
             WHERE status IN ('completed', 'failed')
               AND created_at <= datetime('now', ?1)",
            params![cutoff],
        )?;
        Ok(rows)
    }
}
