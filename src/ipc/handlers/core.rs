use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::setup::SisImportSettings;
use crate::worker::WorkerPool;
use serde_json::json;
use std::path::PathBuf;

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "workers": state.workers.is_some(),
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    // Workers of the previous workspace must not outlive its connection.
    if let Some(pool) = state.workers.take() {
        pool.shutdown();
    }

    let conn = match db::open_db(&path) {
        Ok(conn) => conn,
        Err(e) => return err(&req.id, "db_open_failed", format!("{e:?}"), None),
    };
    let settings = match SisImportSettings::load(&conn) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_open_failed", format!("{e:?}"), None),
    };
    let pool = match WorkerPool::start(&path, &settings) {
        Ok(pool) => pool,
        Err(e) => return err(&req.id, "db_open_failed", format!("{e:?}"), None),
    };

    tracing::info!(workspace = %path.display(), workers = settings.worker_count, "workspace selected");
    state.workspace = Some(path.clone());
    state.db = Some(conn);
    state.workers = Some(pool);
    ok(&req.id, json!({ "workspacePath": path.to_string_lossy() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        _ => None,
    }
}
