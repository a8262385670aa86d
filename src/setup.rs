use crate::db;
use rusqlite::Connection;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetupSection {
    SisImports,
}

impl SetupSection {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sisImports" => Some(Self::SisImports),
            _ => None,
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            Self::SisImports => "setup.sisImports",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::SisImports => "sisImports",
        }
    }
}

pub const ALL_SECTIONS: [SetupSection; 1] = [SetupSection::SisImports];

pub fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::SisImports => json!({
            "workerCount": 2,
            "pollIntervalMs": 50,
            "abortCooldownSeconds": 300,
            "rollbackRetentionDays": 30,
            "ledgerInsertChunkSize": 1000,
            "purgeChunkSize": 10000,
            "purgeIntervalSeconds": 3600,
            "rowBatchSize": 100,
            "jobMaxAttempts": 5,
            "jobBackoffBaseMs": 1000,
            "jobBackoffMaxMs": 60000,
            "importTypes": ["instructure_csv"]
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_list(v: &Value, key: &str, max_len: usize) -> Result<Vec<String>, String> {
    let arr = v
        .as_array()
        .ok_or_else(|| format!("{} must be an array of strings", key))?;
    let mut out = Vec::with_capacity(arr.len());
    for item in arr {
        let s = item
            .as_str()
            .ok_or_else(|| format!("{} must be an array of strings", key))?
            .trim();
        if s.is_empty() || s.len() > max_len {
            return Err(format!("{} entries must be 1..={} chars", key, max_len));
        }
        out.push(s.to_string());
    }
    if out.is_empty() {
        return Err(format!("{} must not be empty", key));
    }
    Ok(out)
}

pub fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::SisImports => match k.as_str() {
                "workerCount" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 32)?));
                }
                "pollIntervalMs" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 5, 10_000)?));
                }
                "abortCooldownSeconds" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 86_400)?));
                }
                "rollbackRetentionDays" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 365)?));
                }
                "ledgerInsertChunkSize" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 10_000)?));
                }
                "purgeChunkSize" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 100_000)?));
                }
                "purgeIntervalSeconds" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 604_800)?));
                }
                "rowBatchSize" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 100_000)?));
                }
                "jobMaxAttempts" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 100)?));
                }
                "jobBackoffBaseMs" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 3_600_000)?));
                }
                "jobBackoffMaxMs" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 86_400_000)?));
                }
                "importTypes" => {
                    obj.insert(k.clone(), json!(parse_string_list(v, k, 64)?));
                }
                _ => return Err(format!("unknown sisImports field: {}", k)),
            },
        }
    }
    Ok(())
}

pub fn load_section(conn: &Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Best-effort apply: a malformed stored value falls back to defaults.
            let _ = merge_section_patch(section, &mut current, saved_obj);
        }
    }
    Ok(current)
}

/// Typed view of `setup.sisImports` used by the engine and the workers.
#[derive(Debug, Clone, PartialEq)]
pub struct SisImportSettings {
    pub worker_count: usize,
    pub poll_interval_ms: u64,
    pub abort_cooldown_seconds: i64,
    pub rollback_retention_days: i64,
    pub ledger_insert_chunk_size: usize,
    pub purge_chunk_size: usize,
    pub purge_interval_seconds: i64,
    pub row_batch_size: usize,
    pub job_max_attempts: i64,
    pub job_backoff_base_ms: i64,
    pub job_backoff_max_ms: i64,
    pub import_types: Vec<String>,
}

impl Default for SisImportSettings {
    fn default() -> Self {
        Self::from_value(&default_section(SetupSection::SisImports))
    }
}

impl SisImportSettings {
    pub fn load(conn: &Connection) -> anyhow::Result<Self> {
        Ok(Self::from_value(&load_section(conn, SetupSection::SisImports)?))
    }

    fn from_value(v: &Value) -> Self {
        let int = |k: &str, d: i64| v.get(k).and_then(|x| x.as_i64()).unwrap_or(d);
        let import_types = v
            .get("importTypes")
            .and_then(|x| x.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|s| s.as_str().map(str::to_string))
                    .collect::<Vec<_>>()
            })
            .filter(|list| !list.is_empty())
            .unwrap_or_else(|| vec!["instructure_csv".to_string()]);
        Self {
            worker_count: int("workerCount", 2).max(1) as usize,
            poll_interval_ms: int("pollIntervalMs", 50).max(1) as u64,
            abort_cooldown_seconds: int("abortCooldownSeconds", 300).max(0),
            rollback_retention_days: int("rollbackRetentionDays", 30).max(1),
            ledger_insert_chunk_size: int("ledgerInsertChunkSize", 1000).max(1) as usize,
            purge_chunk_size: int("purgeChunkSize", 10_000).max(1) as usize,
            purge_interval_seconds: int("purgeIntervalSeconds", 3600).max(1),
            row_batch_size: int("rowBatchSize", 100).max(1) as usize,
            job_max_attempts: int("jobMaxAttempts", 5).max(1),
            job_backoff_base_ms: int("jobBackoffBaseMs", 1000).max(1),
            job_backoff_max_ms: int("jobBackoffMaxMs", 60_000).max(1),
            import_types,
        }
    }

    pub fn allows_import_type(&self, import_type: &str) -> bool {
        self.import_types.iter().any(|t| t == import_type)
    }
}
