#![allow(dead_code)]

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

static POLL_SEQ: AtomicUsize = AtomicUsize::new(0);

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_sisbatchd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn sisbatchd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

pub fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: Value,
) -> Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

pub fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: Value,
) -> Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or(Value::Null)
}

/// Error code of a failed response, panicking on success.
pub fn error_code(value: &Value) -> String {
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false), "expected failure: {}", value);
    value
        .pointer("/error/code")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

pub fn error_message(value: &Value) -> String {
    value
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

/// Selects a fresh workspace and creates a root account that allows SIS
/// imports. Returns the account id.
pub fn open_workspace(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &Path,
) -> i64 {
    let _ = request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let account = request_ok(stdin, reader, "acct", "accounts.createRoot", json!({ "name": "Root" }));
    account.get("accountId").and_then(|v| v.as_i64()).expect("accountId")
}

pub fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let p = dir.join(name);
    std::fs::write(&p, contents).expect("write payload");
    p
}

/// Packs several CSV files into one ZIP payload.
pub fn write_zip(dir: &Path, name: &str, files: &[(&str, String)]) -> PathBuf {
    let p = dir.join(name);
    let f = std::fs::File::create(&p).expect("create zip");
    let mut zip = zip::ZipWriter::new(f);
    let options = zip::write::FileOptions::default();
    for (file_name, contents) in files {
        zip.start_file(*file_name, options).expect("zip entry");
        zip.write_all(contents.as_bytes()).expect("zip write");
    }
    zip.finish().expect("finish zip");
    p
}

/// Creates an import and waits until it leaves the processing states.
pub fn import(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    account_id: i64,
    path: &Path,
    options: Value,
) -> Value {
    let mut params = json!({
        "accountId": account_id,
        "inPath": path.to_string_lossy(),
    });
    if let (Some(p), Some(o)) = (params.as_object_mut(), options.as_object()) {
        for (k, v) in o {
            p.insert(k.clone(), v.clone());
        }
    }
    let seq = POLL_SEQ.fetch_add(1, Ordering::SeqCst);
    let created = request_ok(stdin, reader, &format!("create-{}", seq), "sisImports.create", params);
    let id = created.get("id").and_then(|v| v.as_i64()).expect("batch id");
    wait_for_state(
        stdin,
        reader,
        account_id,
        id,
        &["imported", "imported_with_messages", "failed", "failed_with_messages", "aborted"],
    )
}

pub fn wait_for_state(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    account_id: i64,
    batch_id: i64,
    states: &[&str],
) -> Value {
    let deadline = Instant::now() + Duration::from_secs(60);
    loop {
        let seq = POLL_SEQ.fetch_add(1, Ordering::SeqCst);
        let batch = request_ok(
            stdin,
            reader,
            &format!("poll-{}", seq),
            "sisImports.show",
            json!({ "accountId": account_id, "id": batch_id }),
        );
        let state = batch.get("workflowState").and_then(|v| v.as_str()).unwrap_or("");
        if states.contains(&state) {
            return batch;
        }
        assert!(
            Instant::now() < deadline,
            "batch {} stuck in {} waiting for {:?}",
            batch_id,
            state,
            states
        );
        std::thread::sleep(Duration::from_millis(25));
    }
}

pub fn wait_for_progress(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    progress_id: i64,
) -> Value {
    let deadline = Instant::now() + Duration::from_secs(60);
    loop {
        let seq = POLL_SEQ.fetch_add(1, Ordering::SeqCst);
        let p = request_ok(
            stdin,
            reader,
            &format!("progress-{}", seq),
            "progress.show",
            json!({ "id": progress_id }),
        );
        let state = p.get("workflowState").and_then(|v| v.as_str()).unwrap_or("");
        if state == "completed" || state == "failed" {
            return p;
        }
        assert!(Instant::now() < deadline, "progress {} stuck in {}", progress_id, state);
        std::thread::sleep(Duration::from_millis(25));
    }
}

pub fn entities(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    account_id: i64,
    kind: &str,
) -> Vec<Value> {
    let seq = POLL_SEQ.fetch_add(1, Ordering::SeqCst);
    let res = request_ok(
        stdin,
        reader,
        &format!("entities-{}", seq),
        "entities.list",
        json!({ "accountId": account_id, "kind": kind }),
    );
    res.get("rows").and_then(|v| v.as_array()).cloned().unwrap_or_default()
}

/// Direct connection for assertions and back-dating.
pub fn open_db(workspace: &Path) -> rusqlite::Connection {
    let conn = rusqlite::Connection::open(workspace.join("sisbatch.sqlite3")).expect("open workspace db");
    conn.busy_timeout(Duration::from_secs(5)).expect("busy timeout");
    conn
}

pub fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn count_states(rows: &[Value], state: &str) -> usize {
    rows.iter()
        .filter(|r| r.get("workflow_state").and_then(|v| v.as_str()) == Some(state))
        .count()
}

pub fn warnings(batch: &Value) -> Vec<String> {
    batch
        .get("processingWarnings")
        .and_then(|v| v.as_array())
        .map(|rows| {
            rows.iter()
                .filter_map(|pair| pair.get(1).and_then(|m| m.as_str()).map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}
