//! Restoring a batch: replays its rollback entries kind by kind in restore
//! order, writing back the state each target had before the import.

use chrono::Utc;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::batch::{self, BatchState};
use crate::db;
use crate::entities::{EntityKind, RESTORE_ORDER};
use crate::error::{is_transient, JobError, RestoreError};
use crate::jobs::{self, JobKind};
use crate::ledger::{self, RestoreValue, RollBackEntry};
use crate::progress;
use crate::setup::SisImportSettings;

pub const PROGRESS_TAG: &str = "sis_batch_state_restore";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RestoreOptions {
    /// Only entries written by batch-mode cleanup.
    pub batch_mode: bool,
    /// Only entries that deleted something.
    pub undelete_only: bool,
    /// Only enrollment conclusions.
    pub unconclude_only: bool,
}

impl RestoreOptions {
    pub fn selects(&self, entry: &RollBackEntry) -> bool {
        if self.batch_mode && !entry.batch_mode_delete {
            return false;
        }
        if self.undelete_only && !matches!(entry.updated_state.as_str(), "deleted" | "retired") {
            return false;
        }
        if self.unconclude_only
            && !(entry.target.kind == EntityKind::Enrollment && entry.updated_state == "completed")
        {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestorePayload {
    batch_id: i64,
    progress_id: i64,
    #[serde(flatten)]
    options: RestoreOptions,
}

/// Validates a restore request and queues the job. Returns the progress id
/// the caller polls. Nothing is queued when the request is rejected.
pub fn request(
    conn: &Connection,
    settings: &SisImportSettings,
    account_id: i64,
    batch_id: i64,
    options: RestoreOptions,
) -> Result<i64, RestoreError> {
    let Some(batch) = batch::load_for_account(conn, account_id, batch_id)? else {
        return Err(RestoreError::NotFound("sis batch".into()));
    };
    let cutoff = ledger::retention_cutoff(Utc::now(), settings.rollback_retention_days);
    if !ledger::has_unexpired(conn, batch.id, &cutoff)? {
        return Err(RestoreError::DataUnavailable);
    }
    if options.undelete_only && options.unconclude_only {
        return Err(RestoreError::ConflictingFilters);
    }
    if !batch.state.is_restorable() {
        return Err(RestoreError::InvalidState(format!(
            "cannot restore a batch in state {}",
            batch.state
        )));
    }

    let tx = conn.unchecked_transaction()?;
    if let Err(found) = batch::transition(&tx, batch.id, BatchState::Restoring)? {
        return Err(RestoreError::InvalidState(format!(
            "cannot restore a batch in state {}",
            found
        )));
    }
    let progress_id = progress::create(&tx, "SisBatch", batch.id, PROGRESS_TAG)?;
    let payload = RestorePayload {
        batch_id: batch.id,
        progress_id,
        options,
    };
    jobs::enqueue(
        &tx,
        JobKind::RestoreBatch,
        &serde_json::to_value(&payload).unwrap_or(Value::Null),
        Some(&jobs::batch_strand(account_id)),
        settings.job_max_attempts,
    )?;
    tx.commit()?;

    tracing::info!(batch_id, account_id, progress_id, ?options, "restore queued");
    Ok(progress_id)
}

fn apply(conn: &Connection, entry: &RollBackEntry, value: &RestoreValue) -> rusqlite::Result<()> {
    let now = db::now_ts();
    match value {
        RestoreValue::State(state) => {
            let sql = format!(
                "UPDATE {} SET workflow_state = ?, updated_at = ? WHERE id = ?",
                entry.target.kind.table()
            );
            conn.execute(&sql, params![state, now, entry.target.id])?;
        }
        RestoreValue::DeletedAt(at) => {
            conn.execute(
                "UPDATE group_categories SET deleted_at = ?, updated_at = ? WHERE id = ?",
                params![at.map(db::ts), now, entry.target.id],
            )?;
        }
    }
    Ok(())
}

/// Result of a finished restore, stored on the progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSummary {
    pub restored: usize,
    pub skipped: usize,
    pub remaining: i64,
    pub workflow_state: String,
}

fn restore_entries(
    conn: &Connection,
    settings: &SisImportSettings,
    batch_id: i64,
    progress_id: i64,
    options: RestoreOptions,
) -> Result<RestoreSummary, RestoreError> {
    let now = Utc::now();
    let cutoff = ledger::retention_cutoff(now, settings.rollback_retention_days);
    let mut summary = RestoreSummary::default();

    for (i, kind) in RESTORE_ORDER.iter().enumerate() {
        if batch::current_state(conn, batch_id)? == Some(BatchState::Aborted) {
            return Err(RestoreError::InvalidState("restore aborted".into()));
        }
        let entries = ledger::active_entries(conn, batch_id, *kind, &cutoff)?;
        let (selected, skipped): (Vec<_>, Vec<_>) = entries.into_iter().partition(|e| options.selects(e));
        summary.skipped += skipped.len();
        if !selected.is_empty() {
            let tx = conn.unchecked_transaction()?;
            let mut ids = Vec::with_capacity(selected.len());
            for entry in &selected {
                apply(&tx, entry, &entry.restore_value(now))?;
                ids.extend(entry.id);
            }
            ledger::mark_restored(&tx, &ids)?;
            tx.commit()?;
            summary.restored += selected.len();
            tracing::debug!(batch_id, kind = %kind, entries = selected.len(), "restored entries");
        }
        progress::update_completion(conn, progress_id, (i + 1) as f64 * 100.0 / RESTORE_ORDER.len() as f64)?;
    }

    summary.remaining = ledger::count_active(conn, batch_id, &cutoff)?;
    let target = if summary.remaining > 0 {
        BatchState::PartiallyRestored
    } else {
        BatchState::Restored
    };
    if let Err(found) = batch::transition(conn, batch_id, target)? {
        return Err(RestoreError::InvalidState(format!(
            "batch moved to {} during restore",
            found
        )));
    }
    summary.workflow_state = target.as_str().to_string();
    Ok(summary)
}

/// Job entry point for a queued restore.
pub fn run(conn: &Connection, settings: &SisImportSettings, payload: &Value, final_attempt: bool) -> Result<(), JobError> {
    let p: RestorePayload = serde_json::from_value(payload.clone())?;
    if let Err(found) = batch::transition(conn, p.batch_id, BatchState::Restoring)? {
        progress::fail(conn, p.progress_id, &format!("cannot restore a batch in state {}", found))?;
        return Err(JobError::Permanent(format!(
            "sis batch {} is {}, not restorable",
            p.batch_id, found
        )));
    }
    progress::start(conn, p.progress_id)?;

    match restore_entries(conn, settings, p.batch_id, p.progress_id, p.options) {
        Ok(summary) => {
            progress::complete(conn, p.progress_id, &json!(summary))?;
            tracing::info!(
                batch_id = p.batch_id,
                restored = summary.restored,
                skipped = summary.skipped,
                state = %summary.workflow_state,
                "restore finished"
            );
            Ok(())
        }
        Err(RestoreError::Db(e)) if is_transient(&e) && !final_attempt => Err(JobError::Retriable(e.to_string())),
        Err(e) => {
            progress::fail(conn, p.progress_id, &e.to_string())?;
            if let Err(found) = batch::transition(conn, p.batch_id, BatchState::PartiallyRestored)? {
                tracing::warn!(batch_id = p.batch_id, state = %found, "could not mark failed restore");
            }
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::EntityRef;
    use crate::ledger::{RollbackLedger, NON_EXISTENT};

    struct Fixture {
        conn: Connection,
        account_id: i64,
        batch_id: i64,
    }

    fn fixture() -> Fixture {
        let conn = db::open_memory();
        let now = db::now_ts();
        conn.execute(
            "INSERT INTO accounts(name, workflow_state, created_at, updated_at) VALUES('Root', 'active', ?1, ?1)",
            [&now],
        )
        .expect("account");
        let account_id = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO sis_batches(account_id, import_type, workflow_state, created_at, updated_at)
             VALUES(?1, 'instructure_csv', 'imported', ?2, ?2)",
            params![account_id, now],
        )
        .expect("batch");
        let batch_id = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO courses(id, root_account_id, account_id, course_code, name, workflow_state, created_at, updated_at)
             VALUES(1, ?1, ?1, 'C1', 'Course', 'available', ?2, ?2)",
            params![account_id, now],
        )
        .expect("course");
        Fixture {
            conn,
            account_id,
            batch_id,
        }
    }

    fn user(conn: &Connection) -> i64 {
        let now = db::now_ts();
        conn.execute(
            "INSERT INTO users(name, sortable_name, workflow_state, created_at, updated_at) VALUES('u', 'u', 'registered', ?1, ?1)",
            [&now],
        )
        .expect("user");
        conn.last_insert_rowid()
    }

    fn enrollment(conn: &Connection, state: &str) -> i64 {
        let now = db::now_ts();
        let user_id = user(conn);
        conn.execute(
            "INSERT INTO enrollments(root_account_id, course_id, user_id, role, workflow_state, created_at, updated_at)
             VALUES(1, 1, ?1, 'student', ?2, ?3, ?3)",
            params![user_id, state, now],
        )
        .expect("enrollment");
        conn.last_insert_rowid()
    }

    fn enrollment_state(conn: &Connection, id: i64) -> String {
        conn.query_row("SELECT workflow_state FROM enrollments WHERE id = ?", [id], |r| r.get(0))
            .expect("state")
    }

    fn run_queued(f: &Fixture) {
        let settings = SisImportSettings::default();
        let job = jobs::claim_next(&f.conn, "test").expect("claim").expect("job");
        run(&f.conn, &settings, &job.payload, false).expect("restore");
        jobs::complete(&f.conn, job.id).expect("complete");
    }

    #[test]
    fn full_restore_returns_prior_states() {
        let f = fixture();
        let created = enrollment(&f.conn, "active");
        let concluded = enrollment(&f.conn, "completed");
        let mut ledger = RollbackLedger::new(f.batch_id, 1000);
        ledger.record(&f.conn, EntityRef::new(EntityKind::Enrollment, created), None, "active", false);
        ledger.record(&f.conn, EntityRef::new(EntityKind::Enrollment, concluded), Some("active"), "completed", false);
        ledger.flush(&f.conn);

        let settings = SisImportSettings::default();
        let progress_id = request(&f.conn, &settings, f.account_id, f.batch_id, RestoreOptions::default())
            .expect("request");
        run_queued(&f);

        assert_eq!(enrollment_state(&f.conn, created), "deleted");
        assert_eq!(enrollment_state(&f.conn, concluded), "active");
        assert_eq!(
            batch::current_state(&f.conn, f.batch_id).expect("state"),
            Some(BatchState::Restored)
        );
        let p = progress::show(&f.conn, progress_id).expect("show").expect("progress");
        assert_eq!(p["workflowState"], json!("completed"));
        assert_eq!(p["results"]["restored"], json!(2));
    }

    #[test]
    fn second_restore_is_a_no_op() {
        let f = fixture();
        let e = enrollment(&f.conn, "deleted");
        let mut ledger = RollbackLedger::new(f.batch_id, 1000);
        ledger.record(&f.conn, EntityRef::new(EntityKind::Enrollment, e), Some("active"), "deleted", false);
        ledger.flush(&f.conn);
        let settings = SisImportSettings::default();

        request(&f.conn, &settings, f.account_id, f.batch_id, RestoreOptions::default()).expect("first");
        run_queued(&f);
        assert_eq!(enrollment_state(&f.conn, e), "active");

        f.conn
            .execute("UPDATE enrollments SET workflow_state = 'completed' WHERE id = ?", [e])
            .expect("later change");
        let progress_id =
            request(&f.conn, &settings, f.account_id, f.batch_id, RestoreOptions::default()).expect("second");
        run_queued(&f);
        assert_eq!(enrollment_state(&f.conn, e), "completed");
        let p = progress::show(&f.conn, progress_id).expect("show").expect("progress");
        assert_eq!(p["results"]["restored"], json!(0));
    }

    #[test]
    fn filtered_restore_is_partial() {
        let f = fixture();
        let dropped = enrollment(&f.conn, "deleted");
        let concluded = enrollment(&f.conn, "completed");
        let mut ledger = RollbackLedger::new(f.batch_id, 1000);
        ledger.record(&f.conn, EntityRef::new(EntityKind::Enrollment, dropped), Some("active"), "deleted", true);
        ledger.record(&f.conn, EntityRef::new(EntityKind::Enrollment, concluded), Some("active"), "completed", false);
        ledger.flush(&f.conn);

        let settings = SisImportSettings::default();
        request(
            &f.conn,
            &settings,
            f.account_id,
            f.batch_id,
            RestoreOptions {
                undelete_only: true,
                ..Default::default()
            },
        )
        .expect("request");
        run_queued(&f);
        assert_eq!(enrollment_state(&f.conn, dropped), "active");
        assert_eq!(enrollment_state(&f.conn, concluded), "completed");
        assert_eq!(
            batch::current_state(&f.conn, f.batch_id).expect("state"),
            Some(BatchState::PartiallyRestored)
        );
    }

    #[test]
    fn rejects_conflicting_filters_and_expired_data() {
        let f = fixture();
        let settings = SisImportSettings::default();
        let err = request(&f.conn, &settings, f.account_id, f.batch_id, RestoreOptions::default())
            .expect_err("no data");
        assert!(matches!(err, RestoreError::DataUnavailable));

        let e = enrollment(&f.conn, "deleted");
        let mut ledger = RollbackLedger::new(f.batch_id, 1000);
        ledger.record(&f.conn, EntityRef::new(EntityKind::Enrollment, e), Some("active"), "deleted", false);
        ledger.flush(&f.conn);
        let both = RestoreOptions {
            undelete_only: true,
            unconclude_only: true,
            ..Default::default()
        };
        let err = request(&f.conn, &settings, f.account_id, f.batch_id, both).expect_err("conflict");
        assert!(matches!(err, RestoreError::ConflictingFilters));

        let old = db::ts(Utc::now() - chrono::Duration::days(31));
        f.conn
            .execute("UPDATE sis_batch_roll_back_data SET created_at = ?", [&old])
            .expect("backdate");
        let err = request(&f.conn, &settings, f.account_id, f.batch_id, RestoreOptions::default())
            .expect_err("expired");
        assert!(matches!(err, RestoreError::DataUnavailable));
        let queued: i64 = f
            .conn
            .query_row("SELECT COUNT(*) FROM jobs", [], |r| r.get(0))
            .expect("jobs");
        assert_eq!(queued, 0);
    }

    #[test]
    fn new_channels_restore_to_retired() {
        let f = fixture();
        let user_id = user(&f.conn);
        let now = db::now_ts();
        f.conn
            .execute(
                "INSERT INTO communication_channels(user_id, path, workflow_state, created_at, updated_at)
                 VALUES(?1, 'a@example.com', 'unconfirmed', ?2, ?2)",
                params![user_id, now],
            )
            .expect("channel");
        let cc = f.conn.last_insert_rowid();
        let mut ledger = RollbackLedger::new(f.batch_id, 1000);
        ledger.record(&f.conn, EntityRef::new(EntityKind::CommunicationChannel, cc), None, "unconfirmed", false);
        ledger.flush(&f.conn);

        let settings = SisImportSettings::default();
        request(&f.conn, &settings, f.account_id, f.batch_id, RestoreOptions::default()).expect("request");
        run_queued(&f);
        let state: String = f
            .conn
            .query_row("SELECT workflow_state FROM communication_channels WHERE id = ?", [cc], |r| r.get(0))
            .expect("state");
        assert_eq!(state, "retired");
        assert_eq!(NON_EXISTENT, "non-existent");
    }
}
