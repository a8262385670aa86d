use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DB_FILE: &str = "sisbatch.sqlite3";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub fn db_path(workspace: &Path) -> PathBuf {
    workspace.join(DB_FILE)
}

/// Opens a connection to an already bootstrapped workspace. Worker threads
/// use this; the request thread goes through `open_db`.
pub fn connect(workspace: &Path) -> anyhow::Result<Connection> {
    let conn = Connection::open(db_path(workspace))?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let conn = Connection::open(db_path(workspace))?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    // WAL lets worker connections read while the request thread writes.
    let _: String = conn.query_row("PRAGMA journal_mode = WAL", [], |r| r.get(0))?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    create_schema(&conn)?;
    Ok(conn)
}

pub fn create_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS accounts(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            root_account_id INTEGER,
            parent_account_id INTEGER,
            sis_source_id TEXT,
            name TEXT NOT NULL,
            workflow_state TEXT NOT NULL,
            allow_sis_import INTEGER NOT NULL DEFAULT 1,
            current_sis_batch_id INTEGER,
            sis_batch_cooldown_until TEXT,
            sis_batch_id INTEGER,
            stuck_sis_fields TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_accounts_sis ON accounts(root_account_id, sis_source_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollment_terms(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            root_account_id INTEGER NOT NULL,
            sis_source_id TEXT,
            name TEXT NOT NULL,
            start_at TEXT,
            end_at TEXT,
            workflow_state TEXT NOT NULL,
            sis_batch_id INTEGER,
            stuck_sis_fields TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(root_account_id) REFERENCES accounts(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollment_terms_sis ON enrollment_terms(root_account_id, sis_source_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS abstract_courses(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            root_account_id INTEGER NOT NULL,
            account_id INTEGER NOT NULL,
            enrollment_term_id INTEGER,
            sis_source_id TEXT,
            short_name TEXT NOT NULL,
            name TEXT NOT NULL,
            workflow_state TEXT NOT NULL,
            sis_batch_id INTEGER,
            stuck_sis_fields TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(account_id) REFERENCES accounts(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            root_account_id INTEGER NOT NULL,
            account_id INTEGER NOT NULL,
            enrollment_term_id INTEGER,
            abstract_course_id INTEGER,
            sis_source_id TEXT,
            course_code TEXT NOT NULL,
            name TEXT NOT NULL,
            workflow_state TEXT NOT NULL,
            sis_batch_id INTEGER,
            stuck_sis_fields TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(account_id) REFERENCES accounts(id),
            FOREIGN KEY(enrollment_term_id) REFERENCES enrollment_terms(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_courses_sis ON courses(root_account_id, sis_source_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_courses_term ON courses(enrollment_term_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS course_sections(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            root_account_id INTEGER NOT NULL,
            course_id INTEGER NOT NULL,
            sis_source_id TEXT,
            name TEXT NOT NULL,
            workflow_state TEXT NOT NULL,
            sis_batch_id INTEGER,
            stuck_sis_fields TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_course_sections_course ON course_sections(course_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS group_categories(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            root_account_id INTEGER NOT NULL,
            account_id INTEGER NOT NULL,
            sis_source_id TEXT,
            name TEXT NOT NULL,
            deleted_at TEXT,
            sis_batch_id INTEGER,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(account_id) REFERENCES accounts(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS groups(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            root_account_id INTEGER NOT NULL,
            account_id INTEGER NOT NULL,
            course_id INTEGER,
            group_category_id INTEGER,
            sis_source_id TEXT,
            name TEXT NOT NULL,
            workflow_state TEXT NOT NULL,
            sis_batch_id INTEGER,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(group_category_id) REFERENCES group_categories(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_groups_course ON groups(course_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            sortable_name TEXT NOT NULL,
            workflow_state TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS pseudonyms(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            root_account_id INTEGER NOT NULL,
            user_id INTEGER NOT NULL,
            unique_id TEXT NOT NULL,
            sis_source_id TEXT,
            workflow_state TEXT NOT NULL,
            sis_batch_id INTEGER,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_pseudonyms_sis ON pseudonyms(root_account_id, sis_source_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_pseudonyms_login ON pseudonyms(root_account_id, unique_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS communication_channels(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            root_account_id INTEGER,
            user_id INTEGER NOT NULL,
            path TEXT NOT NULL,
            path_type TEXT NOT NULL DEFAULT 'email',
            sis_source_id TEXT,
            workflow_state TEXT NOT NULL,
            sis_batch_id INTEGER,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            root_account_id INTEGER NOT NULL,
            course_id INTEGER NOT NULL,
            course_section_id INTEGER,
            user_id INTEGER NOT NULL,
            role TEXT NOT NULL,
            sis_source_id TEXT,
            workflow_state TEXT NOT NULL,
            sis_batch_id INTEGER,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_course ON enrollments(course_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_user ON enrollments(user_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS group_memberships(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            root_account_id INTEGER NOT NULL,
            group_id INTEGER NOT NULL,
            user_id INTEGER NOT NULL,
            sis_source_id TEXT,
            workflow_state TEXT NOT NULL,
            sis_batch_id INTEGER,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(group_id) REFERENCES groups(id),
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS user_observers(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            root_account_id INTEGER NOT NULL,
            user_id INTEGER NOT NULL,
            observer_id INTEGER NOT NULL,
            sis_source_id TEXT,
            workflow_state TEXT NOT NULL,
            sis_batch_id INTEGER,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(user_id) REFERENCES users(id),
            FOREIGN KEY(observer_id) REFERENCES users(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS account_users(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            root_account_id INTEGER NOT NULL,
            account_id INTEGER NOT NULL,
            user_id INTEGER NOT NULL,
            role TEXT NOT NULL,
            sis_source_id TEXT,
            workflow_state TEXT NOT NULL,
            sis_batch_id INTEGER,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(account_id) REFERENCES accounts(id),
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assignment_override_students(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            root_account_id INTEGER NOT NULL,
            course_id INTEGER NOT NULL,
            user_id INTEGER NOT NULL,
            assignment_override_id INTEGER,
            sis_source_id TEXT,
            workflow_state TEXT NOT NULL,
            sis_batch_id INTEGER,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sis_batches(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id INTEGER NOT NULL,
            user_id TEXT,
            import_type TEXT NOT NULL,
            workflow_state TEXT NOT NULL,
            progress INTEGER NOT NULL DEFAULT 0,
            options TEXT NOT NULL DEFAULT '{}',
            batch_mode INTEGER NOT NULL DEFAULT 0,
            batch_mode_term_id INTEGER,
            change_threshold INTEGER,
            diffing_data_set_identifier TEXT,
            diffing_remaster INTEGER NOT NULL DEFAULT 0,
            diffed_against_sis_batch_id INTEGER,
            diffing_threshold_exceeded INTEGER NOT NULL DEFAULT 0,
            data TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            started_at TEXT,
            ended_at TEXT,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(account_id) REFERENCES accounts(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sis_batches_account ON sis_batches(account_id, created_at)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sis_batches_data_set ON sis_batches(account_id, diffing_data_set_identifier)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sis_batch_attachments(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sis_batch_id INTEGER NOT NULL UNIQUE,
            file_name TEXT NOT NULL,
            content_type TEXT NOT NULL,
            sha256 TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            bytes BLOB NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(sis_batch_id) REFERENCES sis_batches(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sis_batch_errors(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sis_batch_id INTEGER NOT NULL,
            file TEXT,
            message TEXT NOT NULL,
            failure INTEGER NOT NULL DEFAULT 0,
            row INTEGER,
            created_at TEXT NOT NULL,
            FOREIGN KEY(sis_batch_id) REFERENCES sis_batches(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sis_batch_errors_batch ON sis_batch_errors(sis_batch_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sis_batch_roll_back_data(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sis_batch_id INTEGER NOT NULL,
            context_type TEXT NOT NULL,
            context_id INTEGER NOT NULL,
            previous_workflow_state TEXT NOT NULL,
            updated_workflow_state TEXT NOT NULL,
            batch_mode_delete INTEGER NOT NULL DEFAULT 0,
            workflow_state TEXT NOT NULL DEFAULT 'active',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(sis_batch_id) REFERENCES sis_batches(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_roll_back_batch ON sis_batch_roll_back_data(sis_batch_id, workflow_state)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_roll_back_created ON sis_batch_roll_back_data(created_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS progresses(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            context_type TEXT NOT NULL,
            context_id INTEGER NOT NULL,
            tag TEXT NOT NULL,
            workflow_state TEXT NOT NULL,
            completion REAL NOT NULL DEFAULT 0,
            message TEXT,
            results TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS jobs(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            payload TEXT NOT NULL,
            strand TEXT,
            status TEXT NOT NULL,
            run_at TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL,
            last_error TEXT,
            locked_by TEXT,
            locked_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_jobs_status_run_at ON jobs(status, run_at)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_jobs_strand ON jobs(strand, status)",
        [],
    )?;

    // Jobs left running by a previous process never finish; hand them back.
    conn.execute(
        "UPDATE jobs SET status = 'queued', locked_by = NULL, locked_at = NULL WHERE status = 'running'",
        [],
    )?;

    Ok(())
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

/// Timestamps are stored as fixed-width RFC 3339 UTC strings so that plain
/// string comparison in SQL orders them correctly.
pub fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn now_ts() -> String {
    ts(Utc::now())
}

pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

#[cfg(test)]
pub fn open_memory() -> Connection {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    conn.pragma_update(None, "foreign_keys", "ON")
        .expect("enable foreign keys");
    create_schema(&conn).expect("create schema");
    conn
}
