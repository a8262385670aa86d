//! Response envelopes and the mapping from domain errors to the stable
//! error codes clients switch on.

use serde_json::{json, Value};

use crate::error::{ImportError, RestoreError};

pub fn ok(id: &str, result: Value) -> Value {
    json!({ "id": id, "ok": true, "result": result })
}

pub fn err(id: &str, code: &str, message: impl Into<String>, details: Option<Value>) -> Value {
    let mut error = json!({ "code": code, "message": message.into() });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({ "id": id, "ok": false, "error": error })
}

/// Handler failure carrying the protocol error code.
#[derive(Debug)]
pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn response(self, id: &str) -> Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<rusqlite::Error> for HandlerErr {
    fn from(e: rusqlite::Error) -> Self {
        HandlerErr::new("db_query_failed", e.to_string())
    }
}

impl From<ImportError> for HandlerErr {
    fn from(e: ImportError) -> Self {
        let code = match &e {
            ImportError::Validation(_) => "bad_params",
            ImportError::NotFound(_) => "not_found",
            ImportError::InProgress => "batch_in_progress",
            ImportError::Payload(_) | ImportError::Unrecoverable(_) => "payload_failed",
            ImportError::InvalidState(_) | ImportError::Aborted => "invalid_state",
            ImportError::Db(_) => "db_update_failed",
        };
        let message = match e {
            ImportError::Validation(m) => m,
            other => other.to_string(),
        };
        HandlerErr::new(code, message)
    }
}

impl From<RestoreError> for HandlerErr {
    fn from(e: RestoreError) -> Self {
        let code = match &e {
            RestoreError::DataUnavailable => "restore_data_unavailable",
            RestoreError::ConflictingFilters => "bad_params",
            RestoreError::NotFound(_) => "not_found",
            RestoreError::InvalidState(_) => "invalid_state",
            RestoreError::Db(_) => "db_update_failed",
        };
        let mut he = HandlerErr::new(code, e.to_string());
        if code == "restore_data_unavailable" {
            he.details = Some(json!({ "retriable": false }));
        }
        he
    }
}
