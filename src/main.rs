mod batch;
mod cleanup;
mod db;
mod diff;
mod entities;
mod error;
mod importers;
mod ipc;
mod jobs;
mod ledger;
mod payload;
mod pipeline;
mod progress;
mod restore;
mod setup;
mod threshold;
mod worker;

use std::io::{self, BufRead, Write};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    // stdout carries the protocol, so logs always go to stderr.
    let filter = EnvFilter::try_from_env("SISBATCHD_LOG")
        .unwrap_or_else(|_| EnvFilter::new("sisbatchd=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn main() {
    init_tracing();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "sisbatchd starting");

    let mut state = ipc::AppState {
        workspace: None,
        db: None,
        workers: None,
    };

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // Can't reply without id; ignore.
                let _ = writeln!(
                    stdout,
                    "{}",
                    serde_json::json!({
                        "ok": false,
                        "error": { "code": "bad_json", "message": e.to_string() }
                    })
                );
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }

    if let Some(pool) = state.workers.take() {
        pool.shutdown();
    }
    tracing::info!("stdin closed, sisbatchd exiting");
}
