use crate::db;
use crate::entities::EntityKind;
use crate::importers::{join_stuck, parse_stuck};
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{get_optional_str, get_required_i64, get_required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Map, Value};

fn column_json(v: ValueRef<'_>) -> Value {
    match v {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(n) => json!(n),
        ValueRef::Real(f) => json!(f),
        ValueRef::Text(t) => json!(String::from_utf8_lossy(t)),
        ValueRef::Blob(b) => json!(b.len()),
    }
}

fn list_entities(conn: &Connection, account_id: i64, kind: EntityKind) -> Result<Vec<Value>, HandlerErr> {
    // Root accounts have no root_account_id of their own.
    let scope = if kind == EntityKind::Account {
        "id = ?1 OR root_account_id = ?1"
    } else {
        "root_account_id = ?1"
    };
    let sql = format!("SELECT * FROM {} WHERE {} ORDER BY id", kind.table(), scope);
    let mut stmt = conn.prepare(&sql)?;
    let names: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
    let mut rows = stmt.query([account_id])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut obj = Map::new();
        for (i, name) in names.iter().enumerate() {
            obj.insert(name.clone(), column_json(row.get_ref(i)?));
        }
        out.push(Value::Object(obj));
    }
    Ok(out)
}

fn handle_entities_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let run = || -> Result<Value, HandlerErr> {
        let account_id = get_required_i64(&req.params, "accountId")?;
        let raw = get_required_str(&req.params, "kind")?;
        let kind = EntityKind::parse(&raw)
            .ok_or_else(|| HandlerErr::new("bad_params", format!("unknown kind: {}", raw)))?;
        let rows = list_entities(conn, account_id, kind)?;
        Ok(json!({ "kind": kind.context_type(), "rows": rows }))
    };
    match run() {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

/// Manual course edit. Changed fields become sticky so later imports leave
/// them alone unless told to override.
fn update_course(conn: &Connection, req: &Request) -> Result<Value, HandlerErr> {
    let account_id = get_required_i64(&req.params, "accountId")?;
    let course_id = get_required_i64(&req.params, "courseId")?;
    let name = get_optional_str(&req.params, "name");
    let code = get_optional_str(&req.params, "courseCode");

    let Some((cur_name, cur_code, stuck_raw)) = conn
        .query_row(
            "SELECT name, course_code, stuck_sis_fields FROM courses WHERE id = ? AND root_account_id = ?",
            params![course_id, account_id],
            |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?)),
        )
        .optional()?
    else {
        return Err(HandlerErr::new("not_found", "course not found"));
    };

    let mut stuck = parse_stuck(&stuck_raw);
    if name.as_deref().is_some_and(|n| n != cur_name) {
        stuck.insert("name".to_string());
    }
    if code.as_deref().is_some_and(|c| c != cur_code) {
        stuck.insert("course_code".to_string());
    }
    conn.execute(
        "UPDATE courses SET name = COALESCE(?1, name), course_code = COALESCE(?2, course_code),
             stuck_sis_fields = ?3, updated_at = ?4
         WHERE id = ?5",
        params![name, code, join_stuck(&stuck), db::now_ts(), course_id],
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    let (name, code): (String, String) = conn.query_row(
        "SELECT name, course_code FROM courses WHERE id = ?",
        [course_id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    Ok(json!({
        "courseId": course_id,
        "name": name,
        "courseCode": code,
        "stuckSisFields": stuck.into_iter().collect::<Vec<_>>(),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "entities.list" => Some(handle_entities_list(state, req)),
        "courses.updateFromUi" => {
            let Some(conn) = state.db.as_ref() else {
                return Some(err(&req.id, "no_workspace", "select a workspace first", None));
            };
            Some(match update_course(conn, req) {
                Ok(v) => ok(&req.id, v),
                Err(e) => e.response(&req.id),
            })
        }
        _ => None,
    }
}
