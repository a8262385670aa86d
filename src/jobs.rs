//! Persistent job queue backed by the `jobs` table.
//!
//! Jobs with the same strand run one at a time in submission order. Claims
//! are a single `UPDATE ... RETURNING` so two workers never take the same row.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};

use crate::db;
use crate::error::JobError;
use crate::setup::SisImportSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    ProcessBatch,
    RestoreBatch,
    PurgeRollbackData,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobKind::ProcessBatch => "process_batch",
            JobKind::RestoreBatch => "restore_batch",
            JobKind::PurgeRollbackData => "purge_rollback_data",
        };
        f.write_str(s)
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "process_batch" => Ok(JobKind::ProcessBatch),
            "restore_batch" => Ok(JobKind::RestoreBatch),
            "purge_rollback_data" => Ok(JobKind::PurgeRollbackData),
            other => Err(format!("unknown job kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: i64,
    pub kind: JobKind,
    pub payload: Value,
    pub strand: Option<String>,
    pub attempts: i64,
    pub max_attempts: i64,
}

const COLUMNS: &str = "id, kind, payload, strand, attempts, max_attempts";

fn row_to_job(r: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, String, String, Option<String>, i64, i64)> {
    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?))
}

pub fn batch_strand(account_id: i64) -> String {
    format!("sis_batch:account:{}", account_id)
}

pub fn enqueue(
    conn: &Connection,
    kind: JobKind,
    payload: &Value,
    strand: Option<&str>,
    max_attempts: i64,
) -> rusqlite::Result<i64> {
    let now = db::now_ts();
    conn.execute(
        "INSERT INTO jobs(kind, payload, strand, status, run_at, attempts, max_attempts, created_at, updated_at)
         VALUES(?, ?, ?, 'queued', ?, 0, ?, ?, ?)",
        params![kind.to_string(), payload.to_string(), strand, now, max_attempts, now, now],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Claims the next runnable job. A stranded job is runnable only when no
/// other job of its strand is running and no earlier job of its strand is
/// still queued.
pub fn claim_next(conn: &Connection, worker_id: &str) -> rusqlite::Result<Option<Job>> {
    let now = db::now_ts();
    let sql = format!(
        "UPDATE jobs
         SET status = 'running', attempts = attempts + 1, locked_by = ?1, locked_at = ?2, updated_at = ?2
         WHERE id = (
             SELECT j.id FROM jobs j
             WHERE j.status = 'queued' AND j.run_at <= ?2
               AND (j.strand IS NULL OR (
                   NOT EXISTS (SELECT 1 FROM jobs r WHERE r.strand = j.strand AND r.status = 'running')
                   AND NOT EXISTS (SELECT 1 FROM jobs e WHERE e.strand = j.strand AND e.status = 'queued' AND e.id < j.id)
               ))
             ORDER BY j.run_at, j.id
             LIMIT 1
         )
         RETURNING {COLUMNS}"
    );
    let row = conn.query_row(&sql, params![worker_id, now], row_to_job).optional()?;
    let Some((id, kind, payload, strand, attempts, max_attempts)) = row else {
        return Ok(None);
    };
    let kind = match kind.parse::<JobKind>() {
        Ok(k) => k,
        Err(msg) => {
            mark_failed(conn, id, &msg)?;
            return Ok(None);
        }
    };
    let payload = serde_json::from_str(&payload).unwrap_or(Value::Null);
    Ok(Some(Job {
        id,
        kind,
        payload,
        strand,
        attempts,
        max_attempts,
    }))
}

pub fn complete(conn: &Connection, job_id: i64) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE jobs SET status = 'completed', locked_by = NULL, updated_at = ? WHERE id = ?",
        params![db::now_ts(), job_id],
    )?;
    Ok(())
}

fn mark_failed(conn: &Connection, job_id: i64, message: &str) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE jobs SET status = 'failed', last_error = ?, locked_by = NULL, updated_at = ? WHERE id = ?",
        params![message, db::now_ts(), job_id],
    )?;
    Ok(())
}

/// Puts a claimed job back for `run_at` without counting the claim as an
/// attempt.
pub fn reschedule(conn: &Connection, job_id: i64, run_at: &str) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE jobs
         SET status = 'queued', run_at = ?, attempts = MAX(attempts - 1, 0), locked_by = NULL, updated_at = ?
         WHERE id = ?",
        params![run_at, db::now_ts(), job_id],
    )?;
    Ok(())
}

/// Backoff between attempts of a retriable job.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    pub fn from_settings(s: &SisImportSettings) -> Self {
        Self {
            base_delay: Duration::from_millis(s.job_backoff_base_ms as u64),
            max_delay: Duration::from_millis(s.job_backoff_max_ms as u64),
            backoff_multiplier: 2.0,
        }
    }

    /// Delay after the given (1-based) failed attempt.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.base_delay.as_millis() as f64 * self.backoff_multiplier.powi(exp);
        Duration::from_millis(millis.min(self.max_delay.as_millis() as f64) as u64)
    }
}

/// Records a failed attempt. Retriable errors are re-queued with backoff
/// until the job runs out of attempts. Returns true when the job is done
/// for good.
pub fn fail(conn: &Connection, job: &Job, error: &JobError, policy: &RetryPolicy) -> rusqlite::Result<bool> {
    match error {
        JobError::Retriable(msg) if job.attempts < job.max_attempts => {
            let delay = policy.calculate_delay(job.attempts.max(1) as u32);
            let run_at = db::ts(Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64));
            conn.execute(
                "UPDATE jobs SET status = 'queued', run_at = ?, last_error = ?, locked_by = NULL, updated_at = ?
                 WHERE id = ?",
                params![run_at, msg, db::now_ts(), job.id],
            )?;
            tracing::warn!(
                job_id = job.id,
                kind = %job.kind,
                attempt = job.attempts,
                delay_ms = delay.as_millis() as u64,
                error = %msg,
                "job failed, retrying"
            );
            Ok(false)
        }
        other => {
            mark_failed(conn, job.id, &other.to_string())?;
            tracing::error!(
                job_id = job.id,
                kind = %job.kind,
                attempts = job.attempts,
                error = %other,
                "job failed permanently"
            );
            Ok(true)
        }
    }
}

pub fn has_pending(conn: &Connection, kind: JobKind) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM jobs WHERE kind = ? AND status IN ('queued', 'running'))",
        [kind.to_string()],
        |r| r.get::<_, i64>(0),
    )
    .map(|n| n != 0)
}

pub fn list(conn: &Connection, status: Option<JobStatus>, limit: i64) -> rusqlite::Result<Vec<Value>> {
    let mut stmt = conn.prepare(
        "SELECT id, kind, payload, strand, status, run_at, attempts, max_attempts, last_error, created_at, updated_at
         FROM jobs
         WHERE (?1 IS NULL OR status = ?1)
         ORDER BY id DESC
         LIMIT ?2",
    )?;
    let status = status.map(|s| s.to_string());
    let rows = stmt.query_map(params![status, limit], |r| {
        let payload: String = r.get(2)?;
        Ok(json!({
            "id": r.get::<_, i64>(0)?,
            "kind": r.get::<_, String>(1)?,
            "payload": serde_json::from_str::<Value>(&payload).unwrap_or(Value::Null),
            "strand": r.get::<_, Option<String>>(3)?,
            "status": r.get::<_, String>(4)?,
            "runAt": r.get::<_, String>(5)?,
            "attempts": r.get::<_, i64>(6)?,
            "maxAttempts": r.get::<_, i64>(7)?,
            "lastError": r.get::<_, Option<String>>(8)?,
            "createdAt": r.get::<_, String>(9)?,
            "updatedAt": r.get::<_, String>(10)?,
        }))
    })?;
    rows.collect()
}
