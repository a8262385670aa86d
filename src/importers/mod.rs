//! CSV importers. Each file kind upserts its rows, stamps them with the
//! batch and reports every workflow-state change to the rollback ledger.

mod enrollments;
mod groups;
mod people;
mod structure;

pub use enrollments::delete_enrollment_dependents;
pub(crate) use structure::{join_stuck, parse_stuck};

use std::collections::BTreeMap;

use rusqlite::{params, Connection, OptionalExtension};

use crate::batch::{self, BatchMessage, BatchOptions, BatchState};
use crate::db;
use crate::entities::{EntityKind, EntityRef};
use crate::error::ImportError;
use crate::ledger::RollbackLedger;
use crate::payload::{CsvFile, CsvKind, Dataset};

/// Shared state for one batch run: connection, options, ledger, messages
/// and progress bookkeeping.
pub struct ImportContext<'a> {
    pub conn: &'a Connection,
    pub batch_id: i64,
    pub root_account_id: i64,
    pub options: &'a BatchOptions,
    pub ledger: RollbackLedger,
    pub messages: Vec<BatchMessage>,
    pub counts: BTreeMap<String, i64>,
    /// Every term row of this run's term file, for multi-term cleanup.
    pub imported_term_ids: Vec<i64>,
    pub now: String,
    row_batch_size: usize,
    stage_total: usize,
    stage_done: usize,
}

impl<'a> ImportContext<'a> {
    pub fn new(
        conn: &'a Connection,
        batch_id: i64,
        root_account_id: i64,
        options: &'a BatchOptions,
        ledger: RollbackLedger,
        row_batch_size: usize,
    ) -> Self {
        Self {
            conn,
            batch_id,
            root_account_id,
            options,
            ledger,
            messages: Vec::new(),
            counts: BTreeMap::new(),
            imported_term_ids: Vec::new(),
            now: db::now_ts(),
            row_batch_size: row_batch_size.max(1),
            stage_total: 0,
            stage_done: 0,
        }
    }

    pub fn warn(&mut self, file: &str, message: impl Into<String>) {
        self.messages.push(BatchMessage::warning(Some(file), message));
    }

    pub fn error(&mut self, file: &str, message: impl Into<String>) {
        self.messages.push(BatchMessage::error(Some(file), message));
    }

    pub fn bump(&mut self, key: &str, by: i64) {
        *self.counts.entry(key.to_string()).or_insert(0) += by;
    }

    /// Starts a new progress range covering `total` units of work.
    pub fn begin_stage(&mut self, total: usize) {
        self.stage_total = total;
        self.stage_done = 0;
    }

    /// Fails with `Aborted` when an operator aborted the batch.
    pub fn check_aborted(&self) -> Result<(), ImportError> {
        match batch::current_state(self.conn, self.batch_id)? {
            Some(BatchState::Aborted) => Err(ImportError::Aborted),
            _ => Ok(()),
        }
    }

    /// Runs `f` over `items` in transactions of `row_batch_size`. The abort
    /// flag is checked between chunks, never in the middle of one.
    pub fn in_chunks<T, F>(&mut self, items: &[T], mut f: F) -> Result<(), ImportError>
    where
        F: FnMut(&mut Self, usize, &T) -> Result<(), ImportError>,
    {
        let mut offset = 0usize;
        for chunk in items.chunks(self.row_batch_size) {
            self.check_aborted()?;
            self.conn.execute_batch("BEGIN IMMEDIATE")?;
            let mut res = Ok(());
            for (i, item) in chunk.iter().enumerate() {
                if let Err(e) = f(self, offset + i, item) {
                    res = Err(e);
                    break;
                }
            }
            if let Err(e) = res {
                let _ = self.conn.execute_batch("ROLLBACK");
                self.ledger.discard();
                return Err(e);
            }
            self.ledger.flush(self.conn);
            self.stage_done += chunk.len();
            if self.stage_total > 0 {
                let pct = (self.stage_done * 100 / self.stage_total).min(99) as i64;
                batch::set_progress(self.conn, self.batch_id, pct)?;
            }
            self.conn.execute_batch("COMMIT")?;
            offset += chunk.len();
        }
        Ok(())
    }

    pub fn record(&mut self, target: EntityRef, before: Option<&str>, after: &str) {
        self.ledger.record(self.conn, target, before, after, false);
    }
}

/// Imports every recognised file of the data set in dependency order.
pub fn run(ctx: &mut ImportContext<'_>, dataset: &Dataset) -> Result<(), ImportError> {
    for name in &dataset.skipped {
        ctx.warn(name, format!("Skipping unknown file type: {}", name));
    }

    ctx.begin_stage(dataset.row_count());
    for file in dataset.in_processing_order() {
        let Some(kind) = file.kind else {
            ctx.error(
                &file.name,
                format!("Couldn't find SIS CSV import headers for {}", file.name),
            );
            continue;
        };
        tracing::debug!(batch_id = ctx.batch_id, file = %file.name, rows = file.rows.len(), "importing file");
        ctx.bump(kind.name(), file.rows.len() as i64);
        import_file(ctx, kind, file)?;
    }
    Ok(())
}

fn import_file(ctx: &mut ImportContext<'_>, kind: CsvKind, file: &CsvFile) -> Result<(), ImportError> {
    ctx.in_chunks(&file.rows, |ctx, idx, row| {
        let line = idx + 2;
        let status = file.field(row, "status").map(|s| s.to_ascii_lowercase());
        if ctx.options.skip_deletes && status.as_deref() == Some("deleted") {
            return Ok(());
        }
        let r = Row {
            file,
            row,
            line,
            status: status.as_deref(),
        };
        match kind {
            CsvKind::Accounts => structure::account(ctx, &r),
            CsvKind::Terms => structure::term(ctx, &r),
            CsvKind::AbstractCourses => structure::abstract_course(ctx, &r),
            CsvKind::Courses => structure::course(ctx, &r),
            CsvKind::Sections => structure::section(ctx, &r),
            CsvKind::Users => people::user(ctx, &r),
            CsvKind::Enrollments => enrollments::enrollment(ctx, &r),
            CsvKind::Admins => people::admin(ctx, &r),
            CsvKind::GroupCategories => groups::group_category(ctx, &r),
            CsvKind::Groups => groups::group(ctx, &r),
            CsvKind::GroupMemberships => groups::group_membership(ctx, &r),
            CsvKind::UserObservers => people::user_observer(ctx, &r),
        }
    })
}

/// One CSV row with its file, for field access and messages.
pub(crate) struct Row<'r> {
    pub file: &'r CsvFile,
    pub row: &'r [String],
    pub line: usize,
    pub status: Option<&'r str>,
}

impl<'r> Row<'r> {
    pub fn get(&self, header: &str) -> Option<&'r str> {
        self.file.field(self.row, header)
    }

    pub fn file_name(&self) -> &'r str {
        &self.file.name
    }

    /// Validates the status column against `allowed`; records a warning
    /// and returns `None` when it is missing or unknown.
    pub fn status_in(&self, ctx: &mut ImportContext<'_>, what: &str, id: &str, allowed: &[&str]) -> Option<&'r str> {
        match self.status {
            Some(s) if allowed.contains(&s) => Some(s),
            Some(s) => {
                ctx.warn(
                    self.file_name(),
                    format!("Improper status \"{}\" for {} {}, skipping", s, what, id),
                );
                None
            }
            None => {
                ctx.warn(
                    self.file_name(),
                    format!("No status given for {} {}", what, id),
                );
                None
            }
        }
    }

    pub fn require(&self, ctx: &mut ImportContext<'_>, header: &str) -> Option<&'r str> {
        let v = self.get(header);
        if v.is_none() {
            ctx.warn(
                self.file_name(),
                format!("No {} given (line {})", header, self.line),
            );
        }
        v
    }
}

/// Looks up `(id, workflow_state)` by SIS id within the root account.
pub(crate) fn find_by_sis(
    conn: &Connection,
    kind: EntityKind,
    root_account_id: i64,
    sis_id: &str,
) -> rusqlite::Result<Option<(i64, String)>> {
    let state_expr = if kind.has_workflow_state() {
        "workflow_state"
    } else {
        "CASE WHEN deleted_at IS NULL THEN 'active' ELSE 'deleted' END"
    };
    let sql = format!(
        "SELECT id, {state_expr} FROM {} WHERE root_account_id = ? AND sis_source_id = ? ORDER BY id LIMIT 1",
        kind.table()
    );
    conn.query_row(&sql, params![root_account_id, sis_id], |r| {
        Ok((r.get(0)?, r.get(1)?))
    })
    .optional()
}

/// User id behind a pseudonym's SIS id.
pub(crate) fn find_user_by_sis(
    conn: &Connection,
    root_account_id: i64,
    sis_user_id: &str,
) -> rusqlite::Result<Option<i64>> {
    conn.query_row(
        "SELECT user_id FROM pseudonyms
         WHERE root_account_id = ? AND sis_source_id = ? AND workflow_state != 'deleted'
         ORDER BY id LIMIT 1",
        params![root_account_id, sis_user_id],
        |r| r.get(0),
    )
    .optional()
}

/// Account by SIS id, or the root account when `sis_id` is blank.
pub(crate) fn resolve_account(
    ctx: &ImportContext<'_>,
    sis_id: Option<&str>,
) -> rusqlite::Result<Option<i64>> {
    match sis_id {
        None => Ok(Some(ctx.root_account_id)),
        Some(s) => Ok(find_by_sis(ctx.conn, EntityKind::Account, ctx.root_account_id, s)?.map(|(id, _)| id)),
    }
}

/// Sets `workflow_state` on one row and stamps the batch.
pub(crate) fn set_state(
    ctx: &ImportContext<'_>,
    kind: EntityKind,
    id: i64,
    state: &str,
) -> rusqlite::Result<()> {
    let sql = format!(
        "UPDATE {} SET workflow_state = ?, sis_batch_id = ?, updated_at = ? WHERE id = ?",
        kind.table()
    );
    ctx.conn.execute(&sql, params![state, ctx.batch_id, ctx.now, id])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::NewBatch;
    use crate::setup::SisImportSettings;
    use serde_json::json;

    fn importing_batch(conn: &Connection) -> batch::Batch {
        let now = db::now_ts();
        conn.execute(
            "INSERT INTO accounts(name, workflow_state, allow_sis_import, created_at, updated_at)
             VALUES('Root', 'active', 1, ?1, ?1)",
            [&now],
        )
        .expect("account");
        let account_id = conn.last_insert_rowid();
        let b = batch::create(
            conn,
            &SisImportSettings::default(),
            NewBatch {
                account_id,
                import_type: None,
                interactive: false,
                user_id: None,
                file_name: "users.csv".into(),
                extension: None,
                bytes: b"user_id,login_id,status\nu1,a,active\n".to_vec(),
                params: json!({}),
            },
        )
        .expect("create");
        batch::transition(conn, b.id, BatchState::Importing)
            .expect("transition")
            .expect("importing");
        b
    }

    #[test]
    fn abort_stops_between_chunks() {
        let conn = db::open_memory();
        let b = importing_batch(&conn);
        let mut ctx = ImportContext::new(
            &conn,
            b.id,
            b.account_id,
            &b.options,
            RollbackLedger::new(b.id, 100),
            1,
        );
        let names = ["first", "second", "third"];
        ctx.begin_stage(names.len());
        let res = ctx.in_chunks(&names, |ctx, i, name| {
            ctx.conn.execute(
                "INSERT INTO users(name, sortable_name, workflow_state, created_at, updated_at)
                 VALUES(?1, ?1, 'registered', ?2, ?2)",
                params![name, ctx.now],
            )?;
            if i == 0 {
                // an operator abort landing while the first chunk is open
                ctx.conn.execute(
                    "UPDATE sis_batches SET workflow_state = 'aborted' WHERE id = ?",
                    [ctx.batch_id],
                )?;
            }
            Ok(())
        });
        assert!(matches!(res, Err(ImportError::Aborted)), "got {:?}", res.err());

        let mut stmt = conn.prepare("SELECT name FROM users ORDER BY id").expect("prepare");
        let written: Vec<String> = stmt
            .query_map([], |r| r.get(0))
            .expect("query")
            .collect::<Result<_, _>>()
            .expect("rows");
        assert_eq!(written, vec!["first".to_string()]);
        assert_eq!(
            batch::current_state(&conn, b.id).expect("state"),
            Some(BatchState::Aborted)
        );
        assert!(conn.is_autocommit());
    }
}
