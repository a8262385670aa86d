//! Background worker threads. Each owns a SQLite connection, claims jobs
//! from the `jobs` table and runs them to completion.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use rusqlite::Connection;
use serde_json::json;

use crate::db;
use crate::error::JobError;
use crate::jobs::{self, Job, JobKind, RetryPolicy};
use crate::ledger;
use crate::pipeline::{self, Outcome};
use crate::restore;
use crate::setup::SisImportSettings;

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn start(workspace: &Path, settings: &SisImportSettings) -> anyhow::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(settings.worker_count);
        for index in 0..settings.worker_count {
            // Open up front so a broken workspace fails the select, not a thread.
            let conn = db::connect(workspace)?;
            let worker = Worker {
                id: format!("worker-{}-{}", index, uuid::Uuid::new_v4()),
                conn,
                workspace: workspace.to_path_buf(),
                schedules_purge: index == 0,
                stop: stop.clone(),
            };
            let handle = thread::Builder::new()
                .name(format!("sisbatchd-worker-{}", index))
                .spawn(move || worker.run())?;
            handles.push(handle);
        }
        tracing::info!(workers = handles.len(), workspace = %workspace.display(), "worker pool started");
        Ok(Self { handles, stop })
    }

    /// Signals every worker and waits for in-flight jobs to finish.
    pub fn shutdown(self) {
        self.stop.store(true, Ordering::SeqCst);
        for h in self.handles {
            let _ = h.join();
        }
        tracing::info!("worker pool stopped");
    }
}

struct Worker {
    id: String,
    conn: Connection,
    workspace: PathBuf,
    schedules_purge: bool,
    stop: Arc<AtomicBool>,
}

impl Worker {
    fn settings(&self) -> SisImportSettings {
        match SisImportSettings::load(&self.conn) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(worker = %self.id, error = %e, "failed to load settings, using defaults");
                SisImportSettings::default()
            }
        }
    }

    fn run(self) {
        tracing::debug!(worker = %self.id, workspace = %self.workspace.display(), "worker running");
        let mut last_purge_check: Option<Instant> = None;
        while !self.stop.load(Ordering::SeqCst) {
            let settings = self.settings();
            if self.schedules_purge {
                let due = last_purge_check
                    .map(|t| t.elapsed() >= Duration::from_secs(settings.purge_interval_seconds as u64))
                    .unwrap_or(true);
                if due {
                    last_purge_check = Some(Instant::now());
                    self.schedule_purge(&settings);
                }
            }

            match jobs::claim_next(&self.conn, &self.id) {
                Ok(Some(job)) => self.execute(job, &settings),
                Ok(None) => thread::sleep(Duration::from_millis(settings.poll_interval_ms)),
                Err(e) => {
                    tracing::warn!(worker = %self.id, error = %e, "failed to claim job");
                    thread::sleep(Duration::from_millis(settings.poll_interval_ms));
                }
            }
        }
        tracing::debug!(worker = %self.id, "worker exiting");
    }

    fn schedule_purge(&self, settings: &SisImportSettings) {
        let res = jobs::has_pending(&self.conn, JobKind::PurgeRollbackData).and_then(|pending| {
            if pending {
                Ok(())
            } else {
                jobs::enqueue(&self.conn, JobKind::PurgeRollbackData, &json!({}), None, settings.job_max_attempts)
                    .map(|_| ())
            }
        });
        if let Err(e) = res {
            tracing::warn!(worker = %self.id, error = %e, "failed to schedule rollback purge");
        }
    }

    fn execute(&self, job: Job, settings: &SisImportSettings) {
        let span = tracing::info_span!("job", job_id = job.id, kind = %job.kind, attempt = job.attempts);
        let _enter = span.enter();
        let final_attempt = job.attempts >= job.max_attempts;

        let result = match job.kind {
            JobKind::ProcessBatch => match job.payload.get("batchId").and_then(|v| v.as_i64()) {
                Some(batch_id) => pipeline::process(&self.conn, settings, batch_id, final_attempt),
                None => Err(JobError::Permanent("process job without batchId".into())),
            },
            JobKind::RestoreBatch => {
                restore::run(&self.conn, settings, &job.payload, final_attempt).map(|()| Outcome::Done)
            }
            JobKind::PurgeRollbackData => run_purge(&self.conn, settings).map(|_| Outcome::Done),
        };

        let recorded = match result {
            Ok(Outcome::Done) => jobs::complete(&self.conn, job.id),
            Ok(Outcome::Deferred(run_at)) => jobs::reschedule(&self.conn, job.id, &run_at),
            Err(e) => jobs::fail(&self.conn, &job, &e, &RetryPolicy::from_settings(settings)).map(|_| ()),
        };
        if let Err(e) = recorded {
            tracing::error!(error = %e, "failed to record job outcome");
        }
    }
}

/// Deletes rollback entries older than the retention window.
pub fn run_purge(conn: &Connection, settings: &SisImportSettings) -> Result<usize, JobError> {
    let cutoff = ledger::retention_cutoff(Utc::now(), settings.rollback_retention_days);
    Ok(ledger::purge_expired(conn, &cutoff, settings.purge_chunk_size)?)
}
