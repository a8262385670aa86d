//! SIS batch records: lifecycle states, import options, creation, abort and
//! the JSON shape returned to callers.

use std::fmt;

use chrono::{Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::db;
use crate::error::ImportError;
use crate::jobs::{self, JobKind};
use crate::ledger;
use crate::payload::{self, PayloadFormat};
use crate::setup::SisImportSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Initializing,
    Created,
    Importing,
    CleanupBatch,
    Imported,
    ImportedWithMessages,
    Aborted,
    Failed,
    FailedWithMessages,
    Restoring,
    PartiallyRestored,
    Restored,
}

pub const ALL_STATES: [BatchState; 12] = [
    BatchState::Initializing,
    BatchState::Created,
    BatchState::Importing,
    BatchState::CleanupBatch,
    BatchState::Imported,
    BatchState::ImportedWithMessages,
    BatchState::Aborted,
    BatchState::Failed,
    BatchState::FailedWithMessages,
    BatchState::Restoring,
    BatchState::PartiallyRestored,
    BatchState::Restored,
];

impl BatchState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Created => "created",
            Self::Importing => "importing",
            Self::CleanupBatch => "cleanup_batch",
            Self::Imported => "imported",
            Self::ImportedWithMessages => "imported_with_messages",
            Self::Aborted => "aborted",
            Self::Failed => "failed",
            Self::FailedWithMessages => "failed_with_messages",
            Self::Restoring => "restoring",
            Self::PartiallyRestored => "partially_restored",
            Self::Restored => "restored",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        ALL_STATES.iter().copied().find(|st| st.as_str() == s)
    }

    /// States an operator may still abort.
    pub fn is_abortable(self) -> bool {
        matches!(
            self,
            Self::Initializing | Self::Created | Self::Importing | Self::CleanupBatch | Self::Restoring
        )
    }

    /// States a restore may start from. Restored batches are accepted again
    /// so that a repeated restore is a no-op rather than an error.
    pub fn is_restorable(self) -> bool {
        matches!(
            self,
            Self::Imported
                | Self::ImportedWithMessages
                | Self::FailedWithMessages
                | Self::PartiallyRestored
                | Self::Restored
        )
    }

    pub fn can_transition_to(self, to: BatchState) -> bool {
        use BatchState::*;
        if to == Aborted {
            return self.is_abortable();
        }
        match self {
            Initializing => matches!(to, Created | Failed),
            Created => matches!(to, Importing | Failed | FailedWithMessages),
            Importing => matches!(
                to,
                CleanupBatch | Imported | ImportedWithMessages | Failed | FailedWithMessages
            ),
            CleanupBatch => matches!(
                to,
                Imported | ImportedWithMessages | Failed | FailedWithMessages
            ),
            Imported | ImportedWithMessages | FailedWithMessages | PartiallyRestored | Restored => {
                to == Restoring
            }
            Restoring => matches!(to, Restored | PartiallyRestored),
            Aborted | Failed => false,
        }
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const ENROLLMENT_DROP_STATUSES: [&str; 3] = ["deleted", "completed", "inactive"];
pub const USER_REMOVE_STATUSES: [&str; 2] = ["deleted", "suspended"];
pub const DEFAULT_IMPORT_TYPE: &str = "instructure_csv";

/// Options recorded on a batch. Stored as JSON and echoed back to callers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchOptions {
    pub batch_mode: bool,
    pub batch_mode_term_id: Option<i64>,
    pub multi_term_batch_mode: bool,
    pub skip_deletes: bool,
    pub override_sis_stickiness: bool,
    pub add_sis_stickiness: bool,
    pub clear_sis_stickiness: bool,
    pub update_sis_id_if_login_claimed: bool,
    pub diffing_data_set_identifier: Option<String>,
    pub diffing_remaster_data_set: bool,
    pub diffing_drop_status: Option<String>,
    pub diffing_user_remove_status: Option<String>,
    pub batch_mode_enrollment_drop_status: Option<String>,
    pub change_threshold: Option<u32>,
    pub diff_row_count_threshold: Option<u64>,
}

/// Loose boolean reading: `true`, `1`, `"true"`, `"1"`, `"yes"`, `"on"`.
pub fn value_to_bool(v: Option<&Value>) -> bool {
    match v {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().map(|x| x != 0).unwrap_or(false),
        Some(Value::String(s)) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "true" | "1" | "yes" | "on"
        ),
        _ => false,
    }
}

fn present_str(v: Option<&Value>) -> Option<String> {
    match v {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_int(v: Option<&Value>, key: &str) -> Result<Option<i64>, ImportError> {
    match v {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| ImportError::Validation(format!("{} must be an integer", key))),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| ImportError::Validation(format!("{} must be an integer", key))),
        Some(_) => Err(ImportError::Validation(format!("{} must be an integer", key))),
    }
}

fn pick_status(
    v: Option<&Value>,
    allowed: &[&str],
    key: &str,
) -> Result<Option<String>, ImportError> {
    // Arrays are accepted; the first allowed entry wins.
    let candidates: Vec<String> = match v {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|x| x.as_str().map(str::to_string))
            .collect(),
        Some(Value::String(s)) if s.trim().is_empty() => return Ok(None),
        Some(Value::String(s)) => vec![s.trim().to_string()],
        Some(_) => Vec::new(),
    };
    candidates
        .into_iter()
        .find(|c| allowed.contains(&c.as_str()))
        .map(Some)
        .ok_or_else(|| ImportError::Validation(format!("Invalid {}", key)))
}

impl BatchOptions {
    /// Validates caller options. `find_term` resolves a term reference
    /// (numeric id or `sis_term_id:<id>`) to an active term of the account.
    pub fn from_params<F>(params: &Value, mut find_term: F) -> Result<Self, ImportError>
    where
        F: FnMut(&str) -> Result<Option<i64>, ImportError>,
    {
        let mut opts = BatchOptions::default();

        let change_threshold = parse_int(params.get("changeThreshold"), "change_threshold")?;
        if let Some(t) = change_threshold {
            if !(0..=100).contains(&t) {
                return Err(ImportError::Validation(
                    "change_threshold must be between 0 and 100".into(),
                ));
            }
        }
        opts.change_threshold = change_threshold.map(|t| t as u32);

        let mut batch_mode_term = None;
        let multi_term = value_to_bool(params.get("multiTermBatchMode"));
        if value_to_bool(params.get("batchMode")) {
            if let Some(raw) = present_str(params.get("batchModeTermId")) {
                batch_mode_term = find_term(&raw)?;
            }
            if batch_mode_term.is_none() && !multi_term {
                return Err(ImportError::Validation(
                    "Batch mode specified, but the given batch_mode_term_id cannot be found."
                        .into(),
                ));
            }
        }

        if let Some(n) = parse_int(params.get("diffRowCountThreshold"), "diff_row_count_threshold")? {
            if n > 0 {
                opts.diff_row_count_threshold = Some(n as u64);
            }
        }

        if let Some(term_id) = batch_mode_term {
            opts.batch_mode = true;
            opts.batch_mode_term_id = Some(term_id);
        } else if multi_term {
            opts.batch_mode = true;
            opts.multi_term_batch_mode = true;
            if opts.change_threshold.is_none() {
                return Err(ImportError::Validation(
                    "change_threshold is required to use multi term_batch mode.".into(),
                ));
            }
        } else if let Some(identifier) = present_str(params.get("diffingDataSetIdentifier")) {
            opts.diffing_data_set_identifier = Some(identifier);
            opts.diffing_remaster_data_set = value_to_bool(params.get("diffingRemasterDataSet"));
        }

        opts.skip_deletes = value_to_bool(params.get("skipDeletes"));
        opts.update_sis_id_if_login_claimed =
            value_to_bool(params.get("updateSisIdIfLoginClaimed"));

        if value_to_bool(params.get("overrideSisStickiness")) {
            opts.override_sis_stickiness = true;
            opts.clear_sis_stickiness = value_to_bool(params.get("clearSisStickiness"));
            opts.add_sis_stickiness =
                !opts.clear_sis_stickiness && value_to_bool(params.get("addSisStickiness"));
        }

        opts.diffing_drop_status = pick_status(
            params.get("diffingDropStatus"),
            &ENROLLMENT_DROP_STATUSES,
            "diffing_drop_status",
        )?;
        opts.diffing_user_remove_status = pick_status(
            params.get("diffingUserRemoveStatus"),
            &USER_REMOVE_STATUSES,
            "diffing_user_remove_status",
        )?;
        opts.batch_mode_enrollment_drop_status = pick_status(
            params.get("batchModeEnrollmentDropStatus"),
            &ENROLLMENT_DROP_STATUSES,
            "batch_mode_enrollment_drop_status",
        )?;

        Ok(opts)
    }

    pub fn diffing_enabled(&self) -> bool {
        !self.batch_mode && self.diffing_data_set_identifier.is_some()
    }

    pub fn enrollment_drop_status(&self) -> &str {
        self.batch_mode_enrollment_drop_status
            .as_deref()
            .unwrap_or("deleted")
    }
}

/// A row-level message attached to a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchMessage {
    pub file: Option<String>,
    pub message: String,
    pub failure: bool,
}

impl BatchMessage {
    pub fn warning(file: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            file: file.map(str::to_string),
            message: message.into(),
            failure: false,
        }
    }

    pub fn error(file: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            file: file.map(str::to_string),
            message: message.into(),
            failure: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Batch {
    pub id: i64,
    pub account_id: i64,
    pub user_id: Option<String>,
    pub import_type: String,
    pub state: BatchState,
    pub progress: i64,
    pub options: BatchOptions,
    pub diffed_against_sis_batch_id: Option<i64>,
    pub diffing_threshold_exceeded: bool,
    pub data: Value,
    pub created_at: String,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub updated_at: String,
}

const COLUMNS: &str = "id, account_id, user_id, import_type, workflow_state, progress, options, \
                       diffed_against_sis_batch_id, diffing_threshold_exceeded, data, created_at, \
                       started_at, ended_at, updated_at";

fn row_to_batch(r: &rusqlite::Row<'_>) -> rusqlite::Result<Batch> {
    let state: String = r.get(4)?;
    let options: String = r.get(6)?;
    let data: String = r.get(9)?;
    Ok(Batch {
        id: r.get(0)?,
        account_id: r.get(1)?,
        user_id: r.get(2)?,
        import_type: r.get(3)?,
        state: BatchState::parse(&state).unwrap_or(BatchState::Failed),
        progress: r.get(5)?,
        options: serde_json::from_str(&options).unwrap_or_default(),
        diffed_against_sis_batch_id: r.get(7)?,
        diffing_threshold_exceeded: r.get::<_, i64>(8)? != 0,
        data: serde_json::from_str(&data).unwrap_or_else(|_| json!({})),
        created_at: r.get(10)?,
        started_at: r.get(11)?,
        ended_at: r.get(12)?,
        updated_at: r.get(13)?,
    })
}

pub fn load(conn: &Connection, id: i64) -> rusqlite::Result<Option<Batch>> {
    let sql = format!("SELECT {COLUMNS} FROM sis_batches WHERE id = ?");
    conn.query_row(&sql, [id], row_to_batch).optional()
}

pub fn load_for_account(conn: &Connection, account_id: i64, id: i64) -> rusqlite::Result<Option<Batch>> {
    let sql = format!("SELECT {COLUMNS} FROM sis_batches WHERE id = ? AND account_id = ?");
    conn.query_row(&sql, params![id, account_id], row_to_batch)
        .optional()
}

#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub created_since: Option<String>,
    pub created_before: Option<String>,
    pub states: Vec<BatchState>,
}

pub fn list(conn: &Connection, account_id: i64, filter: &ListFilter) -> rusqlite::Result<Vec<Batch>> {
    let sql = format!(
        "SELECT {COLUMNS} FROM sis_batches
         WHERE account_id = ?1
           AND (?2 IS NULL OR created_at >= ?2)
           AND (?3 IS NULL OR created_at < ?3)
         ORDER BY created_at DESC, id DESC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        params![account_id, filter.created_since, filter.created_before],
        row_to_batch,
    )?;
    let mut out = Vec::new();
    for r in rows {
        let b = r?;
        if filter.states.is_empty() || filter.states.contains(&b.state) {
            out.push(b);
        }
    }
    Ok(out)
}

pub fn importing(conn: &Connection, account_id: i64) -> rusqlite::Result<Vec<Batch>> {
    list(
        conn,
        account_id,
        &ListFilter {
            states: vec![BatchState::Importing],
            ..ListFilter::default()
        },
    )
}

/// Moves the batch to `to` if its stored state allows it. Returns the state
/// that was found, so callers can tell a lost race from success.
pub fn transition(conn: &Connection, id: i64, to: BatchState) -> rusqlite::Result<Result<BatchState, BatchState>> {
    let current: Option<String> = conn
        .query_row(
            "SELECT workflow_state FROM sis_batches WHERE id = ?",
            [id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(current) = current.and_then(|s| BatchState::parse(&s)) else {
        return Ok(Err(BatchState::Failed));
    };
    if !current.can_transition_to(to) && current != to {
        return Ok(Err(current));
    }
    let now = db::now_ts();
    let stamp = match to {
        BatchState::Importing | BatchState::Restoring => "started_at = COALESCE(started_at, ?1),",
        BatchState::Imported
        | BatchState::ImportedWithMessages
        | BatchState::Failed
        | BatchState::FailedWithMessages
        | BatchState::Aborted
        | BatchState::Restored
        | BatchState::PartiallyRestored => "ended_at = ?1,",
        _ => "",
    };
    let sql = format!(
        "UPDATE sis_batches SET {stamp} workflow_state = ?2, updated_at = ?1 WHERE id = ?3 AND workflow_state = ?4"
    );
    let n = conn.execute(&sql, params![now, to.as_str(), id, current.as_str()])?;
    if n == 0 {
        // Someone else moved it in between; report what is there now.
        let now_state: String = conn.query_row(
            "SELECT workflow_state FROM sis_batches WHERE id = ?",
            [id],
            |r| r.get(0),
        )?;
        return Ok(Err(BatchState::parse(&now_state).unwrap_or(BatchState::Failed)));
    }
    Ok(Ok(current))
}

pub fn current_state(conn: &Connection, id: i64) -> rusqlite::Result<Option<BatchState>> {
    let s: Option<String> = conn
        .query_row(
            "SELECT workflow_state FROM sis_batches WHERE id = ?",
            [id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(s.and_then(|s| BatchState::parse(&s)))
}

pub fn set_progress(conn: &Connection, id: i64, progress: i64) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE sis_batches SET progress = ?, updated_at = ? WHERE id = ?",
        params![progress.clamp(0, 100), db::now_ts(), id],
    )?;
    Ok(())
}

pub fn update_data(conn: &Connection, id: i64, data: &Value) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE sis_batches SET data = ?, updated_at = ? WHERE id = ?",
        params![data.to_string(), db::now_ts(), id],
    )?;
    Ok(())
}

pub fn save_messages(conn: &Connection, id: i64, messages: &[BatchMessage]) -> rusqlite::Result<()> {
    let now = db::now_ts();
    let mut stmt = conn.prepare_cached(
        "INSERT INTO sis_batch_errors(sis_batch_id, file, message, failure, created_at) VALUES(?, ?, ?, ?, ?)",
    )?;
    for m in messages {
        stmt.execute(params![id, m.file, m.message, m.failure as i64, now])?;
    }
    Ok(())
}

pub fn messages(conn: &Connection, id: i64) -> rusqlite::Result<Vec<BatchMessage>> {
    let mut stmt = conn.prepare(
        "SELECT file, message, failure FROM sis_batch_errors WHERE sis_batch_id = ? ORDER BY id",
    )?;
    let rows = stmt.query_map([id], |r| {
        Ok(BatchMessage {
            file: r.get(0)?,
            message: r.get(1)?,
            failure: r.get::<_, i64>(2)? != 0,
        })
    })?;
    rows.collect()
}

pub struct AccountRow {
    pub id: i64,
    pub root_account_id: Option<i64>,
    pub allow_sis_import: bool,
    pub current_sis_batch_id: Option<i64>,
    pub sis_batch_cooldown_until: Option<String>,
}

pub fn load_account(conn: &Connection, id: i64) -> rusqlite::Result<Option<AccountRow>> {
    conn.query_row(
        "SELECT id, root_account_id, allow_sis_import, current_sis_batch_id, sis_batch_cooldown_until
         FROM accounts WHERE id = ? AND workflow_state != 'deleted'",
        [id],
        |r| {
            Ok(AccountRow {
                id: r.get(0)?,
                root_account_id: r.get(1)?,
                allow_sis_import: r.get::<_, i64>(2)? != 0,
                current_sis_batch_id: r.get(3)?,
                sis_batch_cooldown_until: r.get(4)?,
            })
        },
    )
    .optional()
}

/// Resolves `123` or `sis_term_id:FALL` to an active term of the account.
pub fn find_active_term(conn: &Connection, account_id: i64, raw: &str) -> rusqlite::Result<Option<i64>> {
    if let Some(sis) = raw.strip_prefix("sis_term_id:") {
        return conn
            .query_row(
                "SELECT id FROM enrollment_terms
                 WHERE root_account_id = ? AND sis_source_id = ? AND workflow_state = 'active'",
                params![account_id, sis],
                |r| r.get(0),
            )
            .optional();
    }
    let Ok(id) = raw.parse::<i64>() else {
        return Ok(None);
    };
    conn.query_row(
        "SELECT id FROM enrollment_terms WHERE id = ? AND root_account_id = ? AND workflow_state = 'active'",
        params![id, account_id],
        |r| r.get(0),
    )
    .optional()
}

pub struct NewBatch {
    pub account_id: i64,
    pub import_type: Option<String>,
    pub interactive: bool,
    pub user_id: Option<String>,
    pub file_name: String,
    pub extension: Option<String>,
    pub bytes: Vec<u8>,
    pub params: Value,
}

pub fn create(conn: &Connection, settings: &SisImportSettings, req: NewBatch) -> Result<Batch, ImportError> {
    let import_type = req
        .import_type
        .clone()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_IMPORT_TYPE.to_string());
    if !settings.allows_import_type(&import_type) {
        return Err(ImportError::Validation("invalid import type parameter".into()));
    }

    let Some(account) = load_account(conn, req.account_id)? else {
        return Err(ImportError::NotFound("account".into()));
    };
    if account.root_account_id.is_some() {
        return Err(ImportError::Validation(
            "SIS imports can only be run on a root account".into(),
        ));
    }
    if !account.allow_sis_import {
        return Err(ImportError::Validation(
            "SIS imports are not enabled for this account".into(),
        ));
    }

    if req.interactive {
        if let Some(current) = account.current_sis_batch_id {
            if current_state(conn, current)? == Some(BatchState::Importing) {
                return Err(ImportError::InProgress);
            }
        }
    }

    let options = BatchOptions::from_params(&req.params, |raw| {
        Ok(find_active_term(conn, account.id, raw)?)
    })?;

    let extension = req
        .extension
        .clone()
        .or_else(|| {
            std::path::Path::new(&req.file_name)
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_string)
        })
        .unwrap_or_default();
    let Some(format) = payload::detect_format(&req.bytes, &extension) else {
        return Err(ImportError::Payload(format!(
            "unrecognized payload format: {}",
            if extension.is_empty() { "(none)" } else { &extension }
        )));
    };
    let supplied: Vec<&'static str> = match format {
        PayloadFormat::Xml => Vec::new(),
        _ => {
            let ds = payload::read_dataset(&req.bytes, format, &req.file_name)
                .map_err(|e| ImportError::Payload(format!("{:#}", e)))?;
            let mut kinds: Vec<_> = ds.files.iter().filter_map(|f| f.kind).collect();
            kinds.sort();
            kinds.dedup();
            kinds.into_iter().map(|k| k.name()).collect()
        }
    };

    let data = json!({
        "importType": import_type,
        "suppliedBatches": supplied,
        "counts": {},
    });

    let tx = conn.unchecked_transaction()?;
    let now = db::now_ts();
    tx.execute(
        "INSERT INTO sis_batches(
            account_id, user_id, import_type, workflow_state, progress, options, batch_mode,
            batch_mode_term_id, change_threshold, diffing_data_set_identifier, diffing_remaster,
            data, created_at, updated_at)
         VALUES(?, ?, ?, 'initializing', 0, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            account.id,
            req.user_id,
            import_type,
            serde_json::to_string(&options).unwrap_or_else(|_| "{}".into()),
            options.batch_mode as i64,
            options.batch_mode_term_id,
            options.change_threshold,
            options.diffing_data_set_identifier,
            options.diffing_remaster_data_set as i64,
            data.to_string(),
            now,
            now,
        ],
    )?;
    let id = tx.last_insert_rowid();
    payload::store_attachment(&tx, id, &req.file_name, format, &req.bytes)
        .map_err(|e| ImportError::Unrecoverable(format!("failed to attach payload: {}", e)))?;
    if let Err(found) = transition(&tx, id, BatchState::Created)? {
        return Err(ImportError::InvalidState(format!(
            "batch {} left initializing unexpectedly ({})",
            id, found
        )));
    }
    jobs::enqueue(
        &tx,
        JobKind::ProcessBatch,
        &json!({ "batchId": id }),
        Some(&jobs::batch_strand(account.id)),
        settings.job_max_attempts,
    )?;
    if req.interactive {
        // Advisory pointer; last writer wins.
        tx.execute(
            "UPDATE accounts SET current_sis_batch_id = ?, updated_at = ? WHERE id = ?",
            params![id, now, account.id],
        )?;
    }
    tx.commit()?;

    tracing::info!(batch_id = id, account_id = account.id, %import_type, "sis batch created");
    load(conn, id)?.ok_or_else(|| ImportError::NotFound("sis batch".into()))
}

/// Aborts a batch that has not reached a terminal state. The write lock is
/// taken before the state is read so a worker cannot advance the batch in
/// between.
pub fn abort(
    conn: &Connection,
    settings: &SisImportSettings,
    account_id: i64,
    id: i64,
) -> Result<Batch, ImportError> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let state: Option<String> = tx
        .query_row(
            "SELECT workflow_state FROM sis_batches WHERE id = ? AND account_id = ?",
            params![id, account_id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(state) = state.and_then(|s| BatchState::parse(&s)) else {
        return Err(ImportError::NotFound("sis batch".into()));
    };
    if !state.is_abortable() {
        return Err(ImportError::InvalidState(format!(
            "cannot abort a batch in state {}",
            state
        )));
    }
    let now = Utc::now();
    tx.execute(
        "UPDATE sis_batches SET workflow_state = 'aborted', ended_at = ?1, updated_at = ?1 WHERE id = ?2",
        params![db::ts(now), id],
    )?;
    let cooldown = db::ts(now + Duration::seconds(settings.abort_cooldown_seconds));
    tx.execute(
        "UPDATE accounts SET sis_batch_cooldown_until = ?, updated_at = ? WHERE id = ?",
        params![cooldown, db::ts(now), account_id],
    )?;
    tx.commit()?;

    tracing::info!(batch_id = id, account_id, from = %state, cooldown_until = %cooldown, "sis batch aborted");
    load(conn, id)?.ok_or_else(|| ImportError::NotFound("sis batch".into()))
}

/// Aborts every batch of the account that has not started processing.
pub fn abort_all_pending(conn: &Connection, account_id: i64) -> rusqlite::Result<usize> {
    let now = db::now_ts();
    let n = conn.execute(
        "UPDATE sis_batches SET workflow_state = 'aborted', ended_at = ?1, updated_at = ?1
         WHERE account_id = ?2 AND workflow_state IN ('initializing', 'created')",
        params![now, account_id],
    )?;
    if n > 0 {
        tracing::info!(account_id, batches = n, "aborted pending sis batches");
    }
    Ok(n)
}

pub fn to_json(conn: &Connection, batch: &Batch) -> rusqlite::Result<Value> {
    let msgs = messages(conn, batch.id)?;
    let pairs = |failure: bool| -> Vec<Value> {
        msgs.iter()
            .filter(|m| m.failure == failure)
            .map(|m| json!([m.file.clone().unwrap_or_default(), m.message]))
            .collect()
    };
    // Ledger rows are purged after the retention window; the copy taken at
    // finish outlives them.
    let statistics = match batch.data.get("statistics") {
        Some(stored @ Value::Object(_)) => stored.clone(),
        _ => ledger::statistics(conn, batch.id)?,
    };

    let mut out = Map::new();
    out.insert("id".into(), json!(batch.id));
    out.insert("accountId".into(), json!(batch.account_id));
    out.insert("userId".into(), json!(batch.user_id));
    out.insert("createdAt".into(), json!(batch.created_at));
    out.insert("startedAt".into(), json!(batch.started_at));
    out.insert("endedAt".into(), json!(batch.ended_at));
    out.insert("updatedAt".into(), json!(batch.updated_at));
    out.insert("workflowState".into(), json!(batch.state.as_str()));
    out.insert("progress".into(), json!(batch.progress.to_string()));
    out.insert("data".into(), batch.data.clone());
    out.insert("statistics".into(), statistics);
    out.insert("processingWarnings".into(), json!(pairs(false)));
    out.insert("processingErrors".into(), json!(pairs(true)));
    out.insert(
        "errorMessage".into(),
        batch.data.get("errorMessage").cloned().unwrap_or(Value::Null),
    );
    out.insert(
        "diffedAgainstImportId".into(),
        json!(batch.diffed_against_sis_batch_id),
    );
    out.insert(
        "diffingThresholdExceeded".into(),
        json!(batch.diffing_threshold_exceeded),
    );
    if let Value::Object(opts) = serde_json::to_value(&batch.options).unwrap_or_default() {
        for (k, v) in opts {
            out.insert(k, v);
        }
    }
    Ok(Value::Object(out))
}
