use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};

use crate::db;

pub fn create(conn: &Connection, context_type: &str, context_id: i64, tag: &str) -> rusqlite::Result<i64> {
    let now = db::now_ts();
    conn.execute(
        "INSERT INTO progresses(context_type, context_id, tag, workflow_state, completion, created_at, updated_at)
         VALUES(?, ?, ?, 'queued', 0, ?, ?)",
        params![context_type, context_id, tag, now, now],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn start(conn: &Connection, id: i64) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE progresses SET workflow_state = 'running', updated_at = ? WHERE id = ?",
        params![db::now_ts(), id],
    )?;
    Ok(())
}

pub fn update_completion(conn: &Connection, id: i64, completion: f64) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE progresses SET completion = ?, updated_at = ? WHERE id = ?",
        params![completion.clamp(0.0, 100.0), db::now_ts(), id],
    )?;
    Ok(())
}

pub fn complete(conn: &Connection, id: i64, results: &Value) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE progresses SET workflow_state = 'completed', completion = 100, results = ?, updated_at = ?
         WHERE id = ?",
        params![results.to_string(), db::now_ts(), id],
    )?;
    Ok(())
}

pub fn fail(conn: &Connection, id: i64, message: &str) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE progresses SET workflow_state = 'failed', message = ?, updated_at = ? WHERE id = ?",
        params![message, db::now_ts(), id],
    )?;
    Ok(())
}

pub fn show(conn: &Connection, id: i64) -> rusqlite::Result<Option<Value>> {
    conn.query_row(
        "SELECT id, context_type, context_id, tag, workflow_state, completion, message, results, created_at, updated_at
         FROM progresses WHERE id = ?",
        [id],
        |r| {
            let results: Option<String> = r.get(7)?;
            Ok(json!({
                "id": r.get::<_, i64>(0)?,
                "contextType": r.get::<_, String>(1)?,
                "contextId": r.get::<_, i64>(2)?,
                "tag": r.get::<_, String>(3)?,
                "workflowState": r.get::<_, String>(4)?,
                "completion": r.get::<_, f64>(5)?,
                "message": r.get::<_, Option<String>>(6)?,
                "results": results.and_then(|s| serde_json::from_str::<Value>(&s).ok()),
                "createdAt": r.get::<_, String>(8)?,
                "updatedAt": r.get::<_, String>(9)?,
            }))
        },
    )
    .optional()
}
