use crate::db;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::get_required_str;
use crate::ipc::types::{AppState, Request};
use crate::setup::{load_section, merge_section_patch, SetupSection, ALL_SECTIONS};
use rusqlite::Connection;
use serde_json::{json, Map, Value};

fn parse_section(raw: &str) -> Result<SetupSection, HandlerErr> {
    SetupSection::parse(raw).ok_or_else(|| HandlerErr::new("bad_params", format!("unknown section: {}", raw)))
}

fn load(conn: &Connection, section: SetupSection) -> Result<Value, HandlerErr> {
    load_section(conn, section).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

/// Without `section` every section is returned, keyed by name.
fn setup_get(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let sections = match params.get("section").and_then(|v| v.as_str()) {
        Some(raw) => vec![parse_section(raw)?],
        None => ALL_SECTIONS.to_vec(),
    };
    let mut out = Map::new();
    for section in sections {
        out.insert(section.name().to_string(), load(conn, section)?);
    }
    Ok(Value::Object(out))
}

fn setup_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let section = parse_section(&get_required_str(params, "section")?)?;
    let patch = params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::new("bad_params", "patch must be an object"))?;

    let mut current = load(conn, section)?;
    merge_section_patch(section, &mut current, patch).map_err(|msg| HandlerErr::new("bad_params", msg))?;
    db::settings_set_json(conn, section.key(), &current)
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    tracing::info!(section = section.name(), keys = patch.len(), "settings updated");
    Ok(json!({ "section": section.name(), "values": current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handler: fn(&Connection, &Value) -> Result<Value, HandlerErr> = match req.method.as_str() {
        "setup.get" => setup_get,
        "setup.update" => setup_update,
        _ => return None,
    };
    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    Some(match handler(conn, &req.params) {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
