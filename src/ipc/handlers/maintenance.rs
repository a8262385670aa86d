use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::get_optional_str;
use crate::ipc::types::{AppState, Request};
use crate::jobs::{self, JobStatus};
use crate::setup::SisImportSettings;
use crate::worker;
use serde_json::json;

const JOB_LIST_LIMIT: i64 = 500;

fn handle_jobs_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let status = match get_optional_str(&req.params, "status") {
        None => None,
        Some(s) => match s.parse::<JobStatus>() {
            Ok(v) => Some(v),
            Err(e) => return HandlerErr::new("bad_params", e).response(&req.id),
        },
    };
    match jobs::list(conn, status, JOB_LIST_LIMIT) {
        Ok(rows) => ok(&req.id, json!({ "jobs": rows })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_purge(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let settings = match SisImportSettings::load(conn) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    match worker::run_purge(conn, &settings) {
        Ok(removed) => ok(&req.id, json!({ "removed": removed })),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "jobs.list" => Some(handle_jobs_list(state, req)),
        "maintenance.purgeExpiredRollbackData" => Some(handle_purge(state, req)),
        _ => None,
    }
}
