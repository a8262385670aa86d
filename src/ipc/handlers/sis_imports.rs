use crate::batch::{self, value_to_bool, BatchState, ListFilter, NewBatch};
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{get_optional_str, get_required_i64, get_required_str};
use crate::ipc::types::{AppState, Request};
use crate::progress;
use crate::restore::{self, RestoreOptions};
use crate::setup::SisImportSettings;
use rusqlite::Connection;
use serde_json::{json, Value};
use std::path::Path;

fn settings(conn: &Connection) -> Result<SisImportSettings, HandlerErr> {
    SisImportSettings::load(conn).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn batch_json(conn: &Connection, b: &batch::Batch) -> Result<Value, HandlerErr> {
    Ok(batch::to_json(conn, b)?)
}

fn create(conn: &Connection, req: &Request) -> Result<Value, HandlerErr> {
    let account_id = get_required_i64(&req.params, "accountId")?;
    let in_path = get_required_str(&req.params, "inPath")?;
    let bytes = std::fs::read(&in_path)
        .map_err(|e| HandlerErr::new("payload_failed", format!("failed to read {}: {}", in_path, e)))?;
    let file_name = Path::new(&in_path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("attachment")
        .to_string();

    let settings = settings(conn)?;
    let created = batch::create(
        conn,
        &settings,
        NewBatch {
            account_id,
            import_type: get_optional_str(&req.params, "importType"),
            interactive: value_to_bool(req.params.get("interactive")),
            user_id: get_optional_str(&req.params, "userId"),
            file_name,
            extension: get_optional_str(&req.params, "extension"),
            bytes,
            params: req.params.clone(),
        },
    )?;
    batch_json(conn, &created)
}

fn list(conn: &Connection, req: &Request) -> Result<Value, HandlerErr> {
    let account_id = get_required_i64(&req.params, "accountId")?;
    let mut states = Vec::new();
    match req.params.get("workflowState") {
        None | Some(Value::Null) => {}
        Some(Value::String(s)) => states.push(parse_state(s)?),
        Some(Value::Array(items)) => {
            for item in items {
                let s = item
                    .as_str()
                    .ok_or_else(|| HandlerErr::new("bad_params", "workflowState must be strings"))?;
                states.push(parse_state(s)?);
            }
        }
        Some(_) => return Err(HandlerErr::new("bad_params", "workflowState must be strings")),
    }
    let filter = ListFilter {
        created_since: get_optional_str(&req.params, "createdSince"),
        created_before: get_optional_str(&req.params, "createdBefore"),
        states,
    };
    let rows = batch::list(conn, account_id, &filter)?;
    let items = rows
        .iter()
        .map(|b| batch_json(conn, b))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "sisImports": items }))
}

fn parse_state(raw: &str) -> Result<BatchState, HandlerErr> {
    BatchState::parse(raw)
        .ok_or_else(|| HandlerErr::new("bad_params", format!("unknown workflow state: {}", raw)))
}

fn importing(conn: &Connection, req: &Request) -> Result<Value, HandlerErr> {
    let account_id = get_required_i64(&req.params, "accountId")?;
    let rows = batch::importing(conn, account_id)?;
    let items = rows
        .iter()
        .map(|b| batch_json(conn, b))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "sisImports": items }))
}

fn show(conn: &Connection, req: &Request) -> Result<Value, HandlerErr> {
    let account_id = get_required_i64(&req.params, "accountId")?;
    let id = get_required_i64(&req.params, "id")?;
    let Some(b) = batch::load_for_account(conn, account_id, id)? else {
        return Err(HandlerErr::new("not_found", "sis batch not found"));
    };
    batch_json(conn, &b)
}

fn abort(conn: &Connection, req: &Request) -> Result<Value, HandlerErr> {
    let account_id = get_required_i64(&req.params, "accountId")?;
    let id = get_required_i64(&req.params, "id")?;
    let settings = settings(conn)?;
    let b = batch::abort(conn, &settings, account_id, id)?;
    batch_json(conn, &b)
}

fn abort_all_pending(conn: &Connection, req: &Request) -> Result<Value, HandlerErr> {
    let account_id = get_required_i64(&req.params, "accountId")?;
    let n = batch::abort_all_pending(conn, account_id)
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(json!({ "aborted": n }))
}

fn restore_states(conn: &Connection, req: &Request) -> Result<Value, HandlerErr> {
    let account_id = get_required_i64(&req.params, "accountId")?;
    let id = get_required_i64(&req.params, "id")?;
    let options = RestoreOptions {
        batch_mode: value_to_bool(req.params.get("batchMode")),
        undelete_only: value_to_bool(req.params.get("undeleteOnly")),
        unconclude_only: value_to_bool(req.params.get("unconcludeOnly")),
    };
    let settings = settings(conn)?;
    let progress_id = restore::request(conn, &settings, account_id, id, options)?;
    match progress::show(conn, progress_id)? {
        Some(p) => Ok(p),
        None => Err(HandlerErr::new("not_found", "progress not found")),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handler: fn(&Connection, &Request) -> Result<Value, HandlerErr> = match req.method.as_str() {
        "sisImports.create" => create,
        "sisImports.list" => list,
        "sisImports.importing" => importing,
        "sisImports.show" => show,
        "sisImports.abort" => abort,
        "sisImports.abortAllPending" => abort_all_pending,
        "sisImports.restoreStates" => restore_states,
        _ => return None,
    };
    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    Some(match handler(conn, req) {
        Ok(v) => ok(&req.id, v),
        Err(e) => {
            tracing::debug!(method = %req.method, code = e.code, message = %e.message, "request rejected");
            e.response(&req.id)
        }
    })
}
