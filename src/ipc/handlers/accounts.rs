use crate::batch::value_to_bool;
use crate::db;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::get_required_str;
use crate::ipc::types::{AppState, Request};
use rusqlite::{params, Connection};
use serde_json::json;

fn create_root(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(&req.params, "name")?;
    let name = name.trim();
    if name.is_empty() {
        return Err(HandlerErr::new("bad_params", "name must not be empty"));
    }
    let allow = match req.params.get("allowSisImport") {
        None => true,
        v => value_to_bool(v),
    };
    let now = db::now_ts();
    conn.execute(
        "INSERT INTO accounts(name, workflow_state, allow_sis_import, created_at, updated_at)
         VALUES(?, 'active', ?, ?, ?)",
        params![name, allow as i64, now, now],
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    let id = conn.last_insert_rowid();
    tracing::info!(account_id = id, "root account created");
    Ok(json!({ "accountId": id, "name": name, "allowSisImport": allow }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "accounts.createRoot" => {
            let Some(conn) = state.db.as_ref() else {
                return Some(err(&req.id, "no_workspace", "select a workspace first", None));
            };
            Some(match create_root(conn, req) {
                Ok(v) => ok(&req.id, v),
                Err(e) => e.response(&req.id),
            })
        }
        _ => None,
    }
}
