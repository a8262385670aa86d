use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::get_required_i64;
use crate::ipc::types::{AppState, Request};
use crate::progress;

fn handle_progress_show(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let id = match get_required_i64(&req.params, "id") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match progress::show(conn, id) {
        Ok(Some(v)) => ok(&req.id, v),
        Ok(None) => HandlerErr::new("not_found", "progress not found").response(&req.id),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "progress.show" => Some(handle_progress_show(state, req)),
        _ => None,
    }
}
