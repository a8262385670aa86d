//! Processing of one batch: payload, optional diffing, the importers and
//! batch-mode cleanup, ending in a terminal batch state.

use chrono::Utc;
use rusqlite::{params, Connection};
use serde_json::{json, Value};

use crate::batch::{self, Batch, BatchMessage, BatchOptions, BatchState};
use crate::cleanup;
use crate::db;
use crate::diff::{self, DiffOptions};
use crate::error::{is_transient, ImportError, JobError};
use crate::importers::{self, ImportContext};
use crate::ledger::{self, RollbackLedger};
use crate::payload::{self, Dataset, PayloadFormat};
use crate::setup::SisImportSettings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Done,
    /// The account is cooling down after an abort; run again at this time.
    Deferred(String),
}

/// Runs a queued batch to a terminal state. `final_attempt` tells whether a
/// transient database error may still be retried by the scheduler; on the
/// last attempt such errors fail the batch instead.
pub fn process(
    conn: &Connection,
    settings: &SisImportSettings,
    batch_id: i64,
    final_attempt: bool,
) -> Result<Outcome, JobError> {
    let Some(batch) = batch::load(conn, batch_id)? else {
        return Err(JobError::Permanent(format!("sis batch {} not found", batch_id)));
    };
    match batch.state {
        BatchState::Created | BatchState::Importing => {}
        BatchState::CleanupBatch => return resume_cleanup(conn, settings, &batch, final_attempt),
        BatchState::Initializing => {
            tracing::warn!(batch_id, "batch never left initializing, skipping");
            return Ok(Outcome::Done);
        }
        other => {
            tracing::info!(batch_id, state = %other, "batch no longer runnable, skipping");
            return Ok(Outcome::Done);
        }
    }

    if let Some(account) = batch::load_account(conn, batch.account_id)? {
        if let Some(until) = account.sis_batch_cooldown_until.as_deref() {
            if db::parse_ts(until).map(|t| t > Utc::now()).unwrap_or(false) {
                tracing::info!(batch_id, account_id = batch.account_id, until, "account cooling down after abort");
                return Ok(Outcome::Deferred(until.to_string()));
            }
        }
    }

    match batch::transition(conn, batch_id, BatchState::Importing)? {
        Ok(_) => {}
        Err(found) => {
            tracing::info!(batch_id, state = %found, "batch moved before processing started");
            return Ok(Outcome::Done);
        }
    }
    tracing::info!(batch_id, account_id = batch.account_id, "processing sis batch");

    let options = batch.options.clone();
    let mut ctx = ImportContext::new(
        conn,
        batch.id,
        batch.account_id,
        &options,
        RollbackLedger::new(batch.id, settings.ledger_insert_chunk_size),
        settings.row_batch_size,
    );
    let result = run_stages(&mut ctx, &batch);
    settle(conn, &batch, ctx, result, final_attempt)
}

/// Re-runs batch-mode cleanup for a batch whose import stage already
/// committed. The term scope and import counts come from the checkpoint
/// written when the batch entered `cleanup_batch`.
fn resume_cleanup(
    conn: &Connection,
    settings: &SisImportSettings,
    batch: &Batch,
    final_attempt: bool,
) -> Result<Outcome, JobError> {
    tracing::info!(batch_id = batch.id, "resuming batch mode cleanup");
    let options = batch.options.clone();
    let mut ctx = ImportContext::new(
        conn,
        batch.id,
        batch.account_id,
        &options,
        RollbackLedger::new(batch.id, settings.ledger_insert_chunk_size),
        settings.row_batch_size,
    );
    if let Some(Value::Object(counts)) = batch.data.get("counts") {
        for (key, n) in counts {
            if key == "error_count" || key == "warning_count" {
                continue;
            }
            if let Some(n) = n.as_i64() {
                ctx.bump(key, n);
            }
        }
    }
    let terms: Vec<i64> = match batch.data.get("cleanupTermIds").and_then(Value::as_array) {
        Some(ids) => ids.iter().filter_map(Value::as_i64).collect(),
        None => options.batch_mode_term_id.into_iter().collect(),
    };
    let result = cleanup::run(&mut ctx, &terms, options.change_threshold).map(|_| ());
    settle(conn, batch, ctx, result, final_attempt)
}

/// Flushes the ledger and moves the batch to the state `result` calls for.
fn settle(
    conn: &Connection,
    batch: &Batch,
    mut ctx: ImportContext<'_>,
    result: Result<(), ImportError>,
    final_attempt: bool,
) -> Result<Outcome, JobError> {
    let batch_id = batch.id;
    ctx.ledger.flush(conn);
    tracing::debug!(batch_id, entries = ctx.ledger.written(), "rollback entries written");
    if ctx.ledger.dropped() > 0 {
        tracing::warn!(batch_id, dropped = ctx.ledger.dropped(), "rollback entries were not persisted");
    }

    match result {
        Ok(()) => finish(conn, batch, ctx.messages, &ctx.counts)?,
        Err(ImportError::Aborted) => {
            batch::save_messages(conn, batch_id, &ctx.messages)?;
            tracing::info!(batch_id, "batch aborted during processing, stopping");
        }
        Err(ImportError::Db(e)) if is_transient(&e) && !final_attempt => {
            return Err(JobError::Retriable(e.to_string()));
        }
        Err(e) => fail(conn, batch, ctx.messages, &e)?,
    }
    Ok(Outcome::Done)
}

fn run_stages(ctx: &mut ImportContext<'_>, batch: &Batch) -> Result<(), ImportError> {
    let dataset = load_dataset(ctx.conn, batch.id)?;
    let dataset = maybe_diff(ctx, batch, dataset)?;

    importers::run(ctx, &dataset)?;

    let opts: &BatchOptions = ctx.options;
    if opts.batch_mode && !opts.skip_deletes {
        if let Err(found) = batch::transition(ctx.conn, batch.id, BatchState::CleanupBatch)? {
            return match found {
                BatchState::Aborted => Err(ImportError::Aborted),
                other => Err(ImportError::InvalidState(format!("cannot clean up a batch in state {}", other))),
            };
        }
        batch::set_progress(ctx.conn, batch.id, 0)?;
        let terms: Vec<i64> = match opts.batch_mode_term_id {
            Some(t) => vec![t],
            None => ctx.imported_term_ids.clone(),
        };
        checkpoint_cleanup(ctx, batch, &terms)?;
        let threshold = opts.change_threshold;
        cleanup::run(ctx, &terms, threshold)?;
    }
    Ok(())
}

/// Persists what a retried cleanup needs once the import stage is
/// committed: the term scope, the import counts and the messages so far.
fn checkpoint_cleanup(ctx: &mut ImportContext<'_>, batch: &Batch, terms: &[i64]) -> Result<(), ImportError> {
    batch::save_messages(ctx.conn, batch.id, &ctx.messages)?;
    let mut data = batch.data.clone();
    data["counts"] = counts_value(&ctx.counts, &ctx.messages);
    data["cleanupTermIds"] = json!(terms);
    batch::update_data(ctx.conn, batch.id, &data)?;
    ctx.messages.clear();
    Ok(())
}

fn load_dataset(conn: &Connection, batch_id: i64) -> Result<Dataset, ImportError> {
    let stored = payload::load_attachment(conn, batch_id)
        .map_err(|e| ImportError::Unrecoverable(format!("failed to read attachment: {:#}", e)))?
        .ok_or_else(|| ImportError::Unrecoverable("import has no attached payload".into()))?;
    if stored.format == PayloadFormat::Xml {
        return Err(ImportError::Unrecoverable("unsupported import format: xml".into()));
    }
    stored
        .dataset()
        .map_err(|e| ImportError::Unrecoverable(format!("corrupt import payload: {:#}", e)))
}

/// Reduces the data set against the previous import sharing its data set
/// identifier. Any problem with the baseline falls back to the full set.
fn maybe_diff(ctx: &mut ImportContext<'_>, batch: &Batch, dataset: Dataset) -> Result<Dataset, ImportError> {
    let opts = ctx.options;
    if !opts.diffing_enabled() {
        return Ok(dataset);
    }
    let Some(identifier) = opts.diffing_data_set_identifier.as_deref() else {
        return Ok(dataset);
    };
    if opts.diffing_remaster_data_set {
        tracing::info!(batch_id = batch.id, identifier, "remastering diffing baseline");
        return Ok(dataset);
    }
    let Some(previous_id) = diff::find_previous_batch(ctx.conn, batch.account_id, identifier, batch.id)? else {
        tracing::info!(batch_id = batch.id, identifier, "no previous import to diff against");
        return Ok(dataset);
    };
    let previous = match payload::load_attachment(ctx.conn, previous_id) {
        Ok(Some(p)) => p.dataset(),
        Ok(None) => Err(anyhow::anyhow!("previous import has no payload")),
        Err(e) => Err(e),
    };
    let previous = match previous {
        Ok(ds) => ds,
        Err(e) => {
            tracing::warn!(batch_id = batch.id, previous_id, error = %format!("{:#}", e), "diff baseline unreadable");
            return Ok(dataset);
        }
    };

    let result = diff::diff(
        &dataset,
        &previous,
        &DiffOptions {
            drop_status: opts.diffing_drop_status.clone().unwrap_or_else(|| "deleted".into()),
            user_remove_status: opts
                .diffing_user_remove_status
                .clone()
                .unwrap_or_else(|| "deleted".into()),
            change_threshold: opts.change_threshold,
            row_count_threshold: opts.diff_row_count_threshold.map(|n| n as usize),
        },
    );
    for (file, message) in &result.warnings {
        let file = (!file.is_empty()).then_some(file.as_str());
        ctx.messages.push(BatchMessage::warning(file, message.clone()));
    }
    if result.threshold_exceeded {
        ctx.conn.execute(
            "UPDATE sis_batches SET diffing_threshold_exceeded = 1 WHERE id = ?",
            [batch.id],
        )?;
    }
    if result.reduced {
        ctx.conn.execute(
            "UPDATE sis_batches SET diffed_against_sis_batch_id = ? WHERE id = ?",
            params![previous_id, batch.id],
        )?;
        tracing::info!(
            batch_id = batch.id,
            previous_id,
            rows = result.dataset.row_count(),
            full_rows = dataset.row_count(),
            "diffed against previous import"
        );
    }
    Ok(result.dataset)
}

fn counts_value(counts: &std::collections::BTreeMap<String, i64>, messages: &[BatchMessage]) -> Value {
    let mut out = serde_json::Map::new();
    for (k, v) in counts {
        out.insert(k.clone(), json!(v));
    }
    let errors = messages.iter().filter(|m| m.failure).count();
    out.insert("error_count".into(), json!(errors));
    out.insert("warning_count".into(), json!(messages.len() - errors));
    Value::Object(out)
}

fn finish(
    conn: &Connection,
    batch: &Batch,
    messages: Vec<BatchMessage>,
    counts: &std::collections::BTreeMap<String, i64>,
) -> Result<(), JobError> {
    batch::save_messages(conn, batch.id, &messages)?;
    let messages = batch::messages(conn, batch.id)?;
    let mut data = batch.data.clone();
    data["counts"] = counts_value(counts, &messages);
    data["statistics"] = ledger::statistics(conn, batch.id)?;
    if let Some(obj) = data.as_object_mut() {
        obj.remove("cleanupTermIds");
    }
    batch::update_data(conn, batch.id, &data)?;
    batch::set_progress(conn, batch.id, 100)?;

    let target = if messages.is_empty() {
        BatchState::Imported
    } else {
        BatchState::ImportedWithMessages
    };
    match batch::transition(conn, batch.id, target)? {
        Ok(_) => tracing::info!(batch_id = batch.id, state = %target, messages = messages.len(), "sis batch imported"),
        Err(found) => tracing::warn!(batch_id = batch.id, state = %found, "batch changed state before it could finish"),
    }
    Ok(())
}

fn fail(conn: &Connection, batch: &Batch, messages: Vec<BatchMessage>, error: &ImportError) -> Result<(), JobError> {
    batch::save_messages(conn, batch.id, &messages)?;
    let messages = batch::messages(conn, batch.id)?;
    let mut data = batch.data.clone();
    data["errorMessage"] = json!(error.to_string());
    data["counts"] = counts_value(&Default::default(), &messages);
    batch::update_data(conn, batch.id, &data)?;

    let target = if messages.is_empty() {
        BatchState::Failed
    } else {
        BatchState::FailedWithMessages
    };
    tracing::error!(batch_id = batch.id, state = %target, error = %error, "sis batch failed");
    if let Err(found) = batch::transition(conn, batch.id, target)? {
        tracing::warn!(batch_id = batch.id, state = %found, "batch changed state before it could fail");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::NewBatch;

    fn root(conn: &Connection) -> i64 {
        let now = db::now_ts();
        conn.execute(
            "INSERT INTO accounts(name, workflow_state, allow_sis_import, created_at, updated_at)
             VALUES('Root', 'active', 1, ?1, ?1)",
            [&now],
        )
        .expect("account");
        conn.last_insert_rowid()
    }

    fn submit(conn: &Connection, account_id: i64, name: &str, csv: &str, params: Value) -> i64 {
        let settings = SisImportSettings::default();
        batch::create(
            conn,
            &settings,
            NewBatch {
                account_id,
                import_type: None,
                interactive: false,
                user_id: None,
                file_name: name.to_string(),
                extension: None,
                bytes: csv.as_bytes().to_vec(),
                params,
            },
        )
        .expect("create")
        .id
    }

    fn state(conn: &Connection, id: i64) -> BatchState {
        batch::current_state(conn, id).expect("state").expect("batch")
    }

    #[test]
    fn imports_csv_and_records_creations() {
        let conn = db::open_memory();
        let account = root(&conn);
        let id = submit(
            &conn,
            account,
            "users.csv",
            "user_id,login_id,first_name,last_name,email,status\nu1,ada,Ada,L,ada@example.com,active\n",
            json!({}),
        );
        let out = process(&conn, &SisImportSettings::default(), id, false).expect("process");
        assert_eq!(out, Outcome::Done);
        assert_eq!(state(&conn, id), BatchState::Imported);

        let entries: i64 = conn
            .query_row("SELECT COUNT(*) FROM sis_batch_roll_back_data WHERE sis_batch_id = ?", [id], |r| r.get(0))
            .expect("ledger");
        // pseudonym and communication channel
        assert_eq!(entries, 2);
    }

    #[test]
    fn unknown_rows_finish_with_messages() {
        let conn = db::open_memory();
        let account = root(&conn);
        let id = submit(
            &conn,
            account,
            "enrollments.csv",
            "course_id,user_id,role,status\nnope,nobody,student,active\n",
            json!({}),
        );
        process(&conn, &SisImportSettings::default(), id, false).expect("process");
        assert_eq!(state(&conn, id), BatchState::ImportedWithMessages);
        let msgs = batch::messages(&conn, id).expect("messages");
        assert!(msgs[0].message.contains("non-existent course"));
    }

    #[test]
    fn xml_payload_fails_without_messages() {
        let conn = db::open_memory();
        let account = root(&conn);
        let id = submit(&conn, account, "feed.xml", "<enterprise/>", json!({}));
        process(&conn, &SisImportSettings::default(), id, false).expect("process");
        assert_eq!(state(&conn, id), BatchState::Failed);
        let b = batch::load(&conn, id).expect("load").expect("batch");
        assert_eq!(b.data["errorMessage"], json!("unsupported import format: xml"));
    }

    #[test]
    fn cooldown_defers_processing() {
        let conn = db::open_memory();
        let account = root(&conn);
        let id = submit(&conn, account, "users.csv", "user_id,login_id,status\nu1,a,active\n", json!({}));
        let until = db::ts(Utc::now() + chrono::Duration::minutes(5));
        conn.execute(
            "UPDATE accounts SET sis_batch_cooldown_until = ? WHERE id = ?",
            params![until, account],
        )
        .expect("cooldown");
        let out = process(&conn, &SisImportSettings::default(), id, false).expect("process");
        assert_eq!(out, Outcome::Deferred(until));
        assert_eq!(state(&conn, id), BatchState::Created);
    }

    #[test]
    fn aborted_batch_is_not_processed() {
        let conn = db::open_memory();
        let account = root(&conn);
        let id = submit(&conn, account, "users.csv", "user_id,login_id,status\nu1,a,active\n", json!({}));
        batch::abort(&conn, &SisImportSettings::default(), account, id).expect("abort");
        conn.execute("UPDATE accounts SET sis_batch_cooldown_until = NULL", [])
            .expect("clear cooldown");
        process(&conn, &SisImportSettings::default(), id, false).expect("process");
        assert_eq!(state(&conn, id), BatchState::Aborted);
        let users: i64 = conn
            .query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))
            .expect("users");
        assert_eq!(users, 0);
    }

    fn term_with_courses(conn: &Connection, account: i64, courses: &[&str]) -> i64 {
        let now = db::now_ts();
        conn.execute(
            "INSERT INTO enrollment_terms(root_account_id, sis_source_id, name, workflow_state, created_at, updated_at)
             VALUES(?1, 'T1', 'Term 1', 'active', ?2, ?2)",
            params![account, now],
        )
        .expect("term");
        let term = conn.last_insert_rowid();
        for code in courses {
            conn.execute(
                "INSERT INTO courses(root_account_id, account_id, enrollment_term_id, sis_source_id,
                     course_code, name, workflow_state, sis_batch_id, created_at, updated_at)
                 VALUES(?1, ?1, ?2, ?3, ?3, ?3, 'available', 0, ?4, ?4)",
                params![account, term, code, now],
            )
            .expect("course");
        }
        term
    }

    fn live_courses(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM courses WHERE workflow_state != 'deleted'", [], |r| r.get(0))
            .expect("courses")
    }

    /// Leaves the batch where a transient failure during cleanup leaves it.
    fn strand_in_cleanup(conn: &Connection, id: i64) {
        for to in [BatchState::Importing, BatchState::CleanupBatch] {
            batch::transition(conn, id, to).expect("transition").expect("allowed");
        }
    }

    #[test]
    fn retried_cleanup_finishes_the_batch() {
        let conn = db::open_memory();
        let account = root(&conn);
        let term = term_with_courses(&conn, account, &["C1", "C2"]);
        let id = submit(
            &conn,
            account,
            "users.csv",
            "user_id,login_id,status\nu1,a,active\n",
            json!({"batchMode": true, "batchModeTermId": term.to_string()}),
        );
        strand_in_cleanup(&conn, id);

        let out = process(&conn, &SisImportSettings::default(), id, false).expect("process");
        assert_eq!(out, Outcome::Done);
        assert_eq!(state(&conn, id), BatchState::Imported);
        assert_eq!(live_courses(&conn), 0);
        let b = batch::load(&conn, id).expect("load").expect("batch");
        assert_eq!(b.data["counts"]["batch_courses_deleted"], json!(2));
    }

    #[test]
    fn retried_cleanup_uses_the_checkpoint() {
        let conn = db::open_memory();
        let account = root(&conn);
        let term = term_with_courses(&conn, account, &["C1"]);
        let id = submit(
            &conn,
            account,
            "users.csv",
            "user_id,login_id,status\nu1,a,active\n",
            json!({"batchMode": true, "batchModeTermId": term.to_string()}),
        );
        strand_in_cleanup(&conn, id);
        batch::save_messages(&conn, id, &[BatchMessage::warning(Some("users.csv"), "earlier warning")])
            .expect("messages");
        let mut data = batch::load(&conn, id).expect("load").expect("batch").data;
        data["counts"] = json!({"users": 1, "warning_count": 1});
        data["cleanupTermIds"] = json!([term]);
        batch::update_data(&conn, id, &data).expect("checkpoint");

        process(&conn, &SisImportSettings::default(), id, false).expect("process");
        assert_eq!(state(&conn, id), BatchState::ImportedWithMessages);
        assert_eq!(live_courses(&conn), 0);
        let b = batch::load(&conn, id).expect("load").expect("batch");
        assert_eq!(b.data["counts"]["users"], json!(1));
        assert_eq!(b.data["counts"]["batch_courses_deleted"], json!(1));
        assert_eq!(b.data["counts"]["warning_count"], json!(1));
        assert!(b.data.get("cleanupTermIds").is_none());
        assert_eq!(batch::messages(&conn, id).expect("messages").len(), 1);
    }

    #[test]
    fn statistics_survive_ledger_purge() {
        let conn = db::open_memory();
        let account = root(&conn);
        let id = submit(
            &conn,
            account,
            "users.csv",
            "user_id,login_id,first_name,last_name,email,status\nu1,ada,Ada,L,ada@example.com,active\n",
            json!({}),
        );
        process(&conn, &SisImportSettings::default(), id, false).expect("process");

        let cutoff = db::ts(Utc::now() + chrono::Duration::days(1));
        let purged = ledger::purge_expired(&conn, &cutoff, 100).expect("purge");
        assert_eq!(purged, 2);

        let b = batch::load(&conn, id).expect("load").expect("batch");
        let view = batch::to_json(&conn, &b).expect("json");
        assert_eq!(view["statistics"]["totalStateChanges"], json!(2));
        assert_eq!(view["statistics"]["Pseudonym"]["created"], json!(1));
        assert_eq!(ledger::statistics(&conn, id).expect("live")["totalStateChanges"], json!(0));
    }
}
