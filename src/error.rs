use rusqlite::ErrorCode;

/// Errors raised while validating or processing an import batch.
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    /// An interactive import is already running for the account.
    #[error("An SIS import is already in process.")]
    InProgress,

    #[error("payload error: {0}")]
    Payload(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Storage unavailable, corrupt archive, unsupported format. The batch
    /// goes to `failed`.
    #[error("{0}")]
    Unrecoverable(String),

    /// The batch was aborted by an operator while it was being processed.
    #[error("batch aborted")]
    Aborted,

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
}

/// Outcome classification for background jobs. The scheduler retries
/// `Retriable` with backoff and gives up on `Permanent`.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("retriable: {0}")]
    Retriable(String),

    #[error("permanent: {0}")]
    Permanent(String),
}

impl From<rusqlite::Error> for JobError {
    fn from(e: rusqlite::Error) -> Self {
        if is_transient(&e) {
            JobError::Retriable(e.to_string())
        } else {
            JobError::Permanent(e.to_string())
        }
    }
}

impl From<ImportError> for JobError {
    fn from(e: ImportError) -> Self {
        match e {
            ImportError::Db(db) => db.into(),
            other => JobError::Permanent(other.to_string()),
        }
    }
}

impl From<RestoreError> for JobError {
    fn from(e: RestoreError) -> Self {
        match e {
            RestoreError::Db(db) => db.into(),
            other => JobError::Permanent(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for JobError {
    fn from(e: serde_json::Error) -> Self {
        JobError::Permanent(format!("bad job payload: {}", e))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RestoreError {
    #[error("restore data unavailable")]
    DataUnavailable,

    #[error("cannot set both undelete_only and unconclude_only")]
    ConflictingFilters,

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
}

/// SQLite reports contention between connections as BUSY or LOCKED; those
/// clear up on their own and are worth retrying.
pub fn is_transient(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
    )
}
