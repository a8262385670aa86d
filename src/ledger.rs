//! Rollback ledger: one row per workflow-state transition an import caused.
//!
//! Entries are buffered per batch and written in chunks. A restore reads
//! them back grouped by entity kind; anything older than the retention
//! window is purged regardless of whether it was restored.

use crate::db;
use crate::entities::{EntityKind, EntityRef, RESTORE_ORDER};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use serde_json::{json, Map, Value};

/// Previous state recorded for rows that the import created.
pub const NON_EXISTENT: &str = "non-existent";

const COLUMNS: &str = "id, sis_batch_id, context_type, context_id, previous_workflow_state, \
                       updated_workflow_state, batch_mode_delete, workflow_state, created_at";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollBackEntry {
    pub id: Option<i64>,
    pub sis_batch_id: i64,
    pub target: EntityRef,
    pub previous_state: String,
    pub updated_state: String,
    pub batch_mode_delete: bool,
    pub restored: bool,
}

impl RollBackEntry {
    pub fn restore_value(&self, now: DateTime<Utc>) -> RestoreValue {
        restore_to_state(self.target.kind, &self.previous_state, now)
    }
}

/// What a restore writes back onto the target row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreValue {
    State(String),
    /// Group categories: `None` clears `deleted_at`.
    DeletedAt(Option<DateTime<Utc>>),
}

pub fn restore_to_state(kind: EntityKind, previous: &str, now: DateTime<Utc>) -> RestoreValue {
    match kind {
        EntityKind::CommunicationChannel => {
            if previous == NON_EXISTENT {
                RestoreValue::State("retired".to_string())
            } else {
                RestoreValue::State(previous.to_string())
            }
        }
        // Anything but "active" stamps a fresh deletion time, including a
        // category that was created by the batch.
        EntityKind::GroupCategory => {
            if previous == "active" {
                RestoreValue::DeletedAt(None)
            } else {
                RestoreValue::DeletedAt(Some(now))
            }
        }
        _ => {
            if previous == NON_EXISTENT {
                RestoreValue::State("deleted".to_string())
            } else {
                RestoreValue::State(previous.to_string())
            }
        }
    }
}

/// Buffered writer for one batch's entries.
pub struct RollbackLedger {
    sis_batch_id: i64,
    chunk_size: usize,
    pending: Vec<RollBackEntry>,
    written: usize,
    dropped: usize,
}

impl RollbackLedger {
    pub fn new(sis_batch_id: i64, chunk_size: usize) -> Self {
        Self {
            sis_batch_id,
            chunk_size: chunk_size.max(1),
            pending: Vec::new(),
            written: 0,
            dropped: 0,
        }
    }

    /// Records the transition of `target` from `before` (`None` when the row
    /// was just created) to `after`. Unchanged rows produce no entry.
    pub fn record(
        &mut self,
        conn: &Connection,
        target: EntityRef,
        before: Option<&str>,
        after: &str,
        batch_mode_delete: bool,
    ) -> Option<RollBackEntry> {
        let previous = match before {
            None => NON_EXISTENT,
            Some(b) if b == after => return None,
            Some(b) => b,
        };
        let entry = RollBackEntry {
            id: None,
            sis_batch_id: self.sis_batch_id,
            target,
            previous_state: previous.to_string(),
            updated_state: after.to_string(),
            batch_mode_delete,
            restored: false,
        };
        self.push(conn, entry.clone());
        Some(entry)
    }

    /// Cascade variant: each target is recorded with its own current state as
    /// the previous state and `resulting_state` as the new one. Targets
    /// already in `resulting_state` are skipped.
    pub fn record_dependents(
        &mut self,
        conn: &Connection,
        targets: &[(EntityRef, String)],
        resulting_state: &str,
        batch_mode_delete: bool,
    ) -> Vec<RollBackEntry> {
        let mut out = Vec::with_capacity(targets.len());
        for (target, current) in targets {
            if current == resulting_state {
                continue;
            }
            let entry = RollBackEntry {
                id: None,
                sis_batch_id: self.sis_batch_id,
                target: *target,
                previous_state: current.clone(),
                updated_state: resulting_state.to_string(),
                batch_mode_delete,
                restored: false,
            };
            self.push(conn, entry.clone());
            out.push(entry);
        }
        out
    }

    fn push(&mut self, conn: &Connection, entry: RollBackEntry) {
        self.pending.push(entry);
        if self.pending.len() >= self.chunk_size {
            self.flush(conn);
        }
    }

    /// Writes buffered entries. A failed chunk is logged and dropped; the
    /// import that produced it carries on.
    pub fn flush(&mut self, conn: &Connection) {
        if self.pending.is_empty() {
            return;
        }
        let batch: Vec<RollBackEntry> = std::mem::take(&mut self.pending);
        for chunk in batch.chunks(self.chunk_size) {
            match insert_chunk(conn, chunk) {
                Ok(()) => self.written += chunk.len(),
                Err(e) => {
                    self.dropped += chunk.len();
                    tracing::warn!(
                        batch_id = self.sis_batch_id,
                        entries = chunk.len(),
                        error = %e,
                        "failed to write rollback data"
                    );
                }
            }
        }
    }

    /// Drops buffered entries whose rows were rolled back.
    pub fn discard(&mut self) {
        self.pending.clear();
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

fn insert_chunk(conn: &Connection, chunk: &[RollBackEntry]) -> rusqlite::Result<()> {
    let own_tx = conn.is_autocommit();
    if own_tx {
        conn.execute_batch("BEGIN IMMEDIATE")?;
    }
    let res: rusqlite::Result<()> = (|| {
        let now = db::now_ts();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO sis_batch_roll_back_data(
                sis_batch_id, context_type, context_id, previous_workflow_state,
                updated_workflow_state, batch_mode_delete, workflow_state, created_at, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, 'active', ?, ?)",
        )?;
        for e in chunk {
            stmt.execute(params![
                e.sis_batch_id,
                e.target.kind.context_type(),
                e.target.id,
                e.previous_state,
                e.updated_state,
                e.batch_mode_delete as i64,
                now,
                now,
            ])?;
        }
        Ok(())
    })();
    if own_tx {
        if res.is_ok() {
            conn.execute_batch("COMMIT")?;
        } else {
            let _ = conn.execute_batch("ROLLBACK");
        }
    }
    res
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<Option<RollBackEntry>> {
    let context_type: String = row.get(2)?;
    let Some(kind) = EntityKind::from_context_type(&context_type) else {
        return Ok(None);
    };
    let state: String = row.get(7)?;
    Ok(Some(RollBackEntry {
        id: Some(row.get(0)?),
        sis_batch_id: row.get(1)?,
        target: EntityRef::new(kind, row.get(3)?),
        previous_state: row.get(4)?,
        updated_state: row.get(5)?,
        batch_mode_delete: row.get::<_, i64>(6)? != 0,
        restored: state == "restored",
    }))
}

pub fn retention_cutoff(now: DateTime<Utc>, retention_days: i64) -> String {
    db::ts(now - Duration::days(retention_days))
}

/// True when the batch has at least one entry inside the retention window,
/// restored or not.
pub fn has_unexpired(conn: &Connection, sis_batch_id: i64, cutoff: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(
            SELECT 1 FROM sis_batch_roll_back_data
            WHERE sis_batch_id = ? AND created_at >= ?)",
        params![sis_batch_id, cutoff],
        |r| r.get::<_, i64>(0),
    )
    .map(|n| n != 0)
}

/// Active, unexpired entries of one kind, in recording order.
pub fn active_entries(
    conn: &Connection,
    sis_batch_id: i64,
    kind: EntityKind,
    cutoff: &str,
) -> rusqlite::Result<Vec<RollBackEntry>> {
    let sql = format!(
        "SELECT {COLUMNS} FROM sis_batch_roll_back_data
         WHERE sis_batch_id = ? AND context_type = ? AND workflow_state = 'active' AND created_at >= ?
         ORDER BY id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        params![sis_batch_id, kind.context_type(), cutoff],
        row_to_entry,
    )?;
    let mut out = Vec::new();
    for r in rows {
        if let Some(e) = r? {
            out.push(e);
        }
    }
    Ok(out)
}

pub fn count_active(conn: &Connection, sis_batch_id: i64, cutoff: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM sis_batch_roll_back_data
         WHERE sis_batch_id = ? AND workflow_state = 'active' AND created_at >= ?",
        params![sis_batch_id, cutoff],
        |r| r.get(0),
    )
}

pub fn mark_restored(conn: &Connection, ids: &[i64]) -> rusqlite::Result<()> {
    let now = db::now_ts();
    let mut stmt = conn.prepare_cached(
        "UPDATE sis_batch_roll_back_data SET workflow_state = 'restored', updated_at = ? WHERE id = ?",
    )?;
    for id in ids {
        stmt.execute(params![now, id])?;
    }
    Ok(())
}

/// Deletes entries created before `cutoff` in chunks of `chunk_size`.
/// Returns the number of rows removed.
pub fn purge_expired(conn: &Connection, cutoff: &str, chunk_size: usize) -> rusqlite::Result<usize> {
    let mut total = 0usize;
    loop {
        let n = conn.execute(
            "DELETE FROM sis_batch_roll_back_data WHERE id IN (
                SELECT id FROM sis_batch_roll_back_data WHERE created_at < ? LIMIT ?)",
            params![cutoff, chunk_size as i64],
        )?;
        total += n;
        if n < chunk_size {
            break;
        }
    }
    if total > 0 {
        tracing::info!(rows = total, cutoff, "purged expired rollback data");
    }
    Ok(total)
}

fn is_inactive_state(s: &str) -> bool {
    matches!(
        s,
        "deleted" | "completed" | "inactive" | "retired" | "suspended" | "rejected"
    )
}

/// Per-kind counters derived from a batch's ledger entries.
pub fn statistics(conn: &Connection, sis_batch_id: i64) -> rusqlite::Result<Value> {
    let mut stmt = conn.prepare(
        "SELECT context_type, previous_workflow_state, updated_workflow_state, COUNT(*)
         FROM sis_batch_roll_back_data
         WHERE sis_batch_id = ?
         GROUP BY context_type, previous_workflow_state, updated_workflow_state",
    )?;
    let rows = stmt.query_map([sis_batch_id], |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, String>(1)?,
            r.get::<_, String>(2)?,
            r.get::<_, i64>(3)?,
        ))
    })?;

    let mut per_kind: Vec<[i64; 5]> = vec![[0; 5]; RESTORE_ORDER.len()];
    let mut total = 0i64;
    for r in rows {
        let (context_type, previous, updated, n) = r?;
        total += n;
        let Some(kind) = EntityKind::from_context_type(&context_type) else {
            continue;
        };
        let slot = &mut per_kind[kind as usize];
        if previous == NON_EXISTENT {
            slot[0] += n;
        } else if is_inactive_state(&previous) && !is_inactive_state(&updated) {
            slot[3] += n;
        }
        match updated.as_str() {
            "completed" => slot[1] += n,
            "inactive" => slot[2] += n,
            "deleted" => slot[4] += n,
            _ => {}
        }
    }

    let mut out = Map::new();
    out.insert("totalStateChanges".into(), json!(total));
    for kind in RESTORE_ORDER {
        let c = per_kind[kind as usize];
        out.insert(
            kind.context_type().to_string(),
            json!({
                "created": c[0],
                "concluded": c[1],
                "deactivated": c[2],
                "restored": c[3],
                "deleted": c[4],
            }),
        );
    }
    Ok(Value::Object(out))
}
