//! Row-level diffing of a data set against the previous import that shared
//! its data set identifier.

use std::collections::{BTreeMap, HashMap, HashSet};

use rusqlite::{params, Connection, OptionalExtension};

use crate::payload::{CsvFile, CsvKind, Dataset};
use crate::threshold;

#[derive(Debug, Clone)]
pub struct DiffOptions {
    /// Status written into synthesized enrollment removals.
    pub drop_status: String,
    /// Status written into synthesized user removals.
    pub user_remove_status: String,
    /// Per-file size change limit, in percent.
    pub change_threshold: Option<u32>,
    /// Upper bound on rows in the reduced set.
    pub row_count_threshold: Option<usize>,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            drop_status: "deleted".to_string(),
            user_remove_status: "deleted".to_string(),
            change_threshold: None,
            row_count_threshold: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiffResult {
    pub dataset: Dataset,
    /// False when diffing was abandoned and `dataset` is the full input.
    pub reduced: bool,
    pub threshold_exceeded: bool,
    pub warnings: Vec<(String, String)>,
}

/// Previous import for the same account and data set identifier that
/// finished successfully.
pub fn find_previous_batch(
    conn: &Connection,
    account_id: i64,
    identifier: &str,
    before_batch_id: i64,
) -> rusqlite::Result<Option<i64>> {
    conn.query_row(
        "SELECT id FROM sis_batches
         WHERE account_id = ? AND diffing_data_set_identifier = ? AND id < ?
           AND workflow_state IN ('imported', 'imported_with_messages')
         ORDER BY created_at DESC, id DESC
         LIMIT 1",
        params![account_id, identifier, before_batch_id],
        |r| r.get(0),
    )
    .optional()
}

pub fn diff(current: &Dataset, previous: &Dataset, opts: &DiffOptions) -> DiffResult {
    let mut warnings = Vec::new();
    let mut threshold_exceeded = false;
    let mut files = Vec::with_capacity(current.files.len());

    for file in &current.files {
        let Some(prev) = matching_file(file, previous) else {
            files.push(file.clone());
            continue;
        };
        if let Some(limit) = opts.change_threshold {
            if threshold::file_size_change_exceeds(file.size, prev.size, limit) {
                tracing::warn!(
                    file = %file.name,
                    current = file.size,
                    previous = prev.size,
                    limit,
                    "file size change exceeds threshold, not diffing"
                );
                warnings.push((
                    file.name.clone(),
                    format!(
                        "Diffing not performed because file size difference exceeded threshold: {}",
                        file.name
                    ),
                ));
                threshold_exceeded = true;
                files.push(file.clone());
                continue;
            }
        }
        if file.sha256 == prev.sha256 {
            files.push(file.with_rows(Vec::new()));
            continue;
        }
        files.push(diff_file(file, prev, opts));
    }

    let reduced = Dataset {
        files,
        skipped: current.skipped.clone(),
    };
    if let Some(limit) = opts.row_count_threshold {
        let rows = reduced.row_count();
        if rows > limit {
            tracing::warn!(rows, limit, "diff row count exceeds threshold, importing full data set");
            warnings.push((
                String::new(),
                format!(
                    "Diffing not performed because difference row count exceeded threshold ({} > {})",
                    rows, limit
                ),
            ));
            return DiffResult {
                dataset: current.clone(),
                reduced: false,
                threshold_exceeded: true,
                warnings,
            };
        }
    }

    DiffResult {
        dataset: reduced,
        reduced: true,
        threshold_exceeded,
        warnings,
    }
}

fn matching_file<'a>(file: &CsvFile, previous: &'a Dataset) -> Option<&'a CsvFile> {
    if let Some(f) = previous.files.iter().find(|p| p.name == file.name) {
        return (f.kind == file.kind).then_some(f);
    }
    let kind = file.kind?;
    let mut same_kind = previous.files.iter().filter(|p| p.kind == Some(kind));
    let first = same_kind.next()?;
    // Ambiguous when the previous set had several files of this kind.
    same_kind.next().is_none().then_some(first)
}

fn row_map<'a>(file: &'a CsvFile, row: &'a [String]) -> BTreeMap<&'a str, &'a str> {
    file.headers
        .iter()
        .zip(row.iter())
        .filter(|(_, v)| !v.is_empty())
        .map(|(h, v)| (h.as_str(), v.as_str()))
        .collect()
}

fn removal_status(kind: Option<CsvKind>, opts: &DiffOptions) -> &str {
    match kind {
        Some(CsvKind::Enrollments) => &opts.drop_status,
        Some(CsvKind::Users) => &opts.user_remove_status,
        _ => "deleted",
    }
}

fn diff_file(current: &CsvFile, previous: &CsvFile, opts: &DiffOptions) -> CsvFile {
    let mut prev_by_key: HashMap<String, &Vec<String>> = HashMap::with_capacity(previous.rows.len());
    for row in &previous.rows {
        if let Some(k) = previous.natural_key(row) {
            prev_by_key.insert(k, row);
        }
    }

    let mut headers = current.headers.clone();
    let status_idx = match current.col("status") {
        Some(i) => i,
        None => {
            headers.push("status".to_string());
            headers.len() - 1
        }
    };
    let width = headers.len();

    let mut seen: HashSet<String> = HashSet::with_capacity(current.rows.len());
    let mut rows = Vec::new();
    for row in &current.rows {
        let Some(key) = current.natural_key(row) else {
            rows.push(padded(row, width));
            continue;
        };
        let unchanged = prev_by_key
            .get(&key)
            .map(|p| row_map(previous, p) == row_map(current, row))
            .unwrap_or(false);
        seen.insert(key);
        if !unchanged {
            rows.push(padded(row, width));
        }
    }

    let status = removal_status(current.kind, opts);
    for row in &previous.rows {
        let Some(key) = previous.natural_key(row) else {
            continue;
        };
        if seen.contains(&key) {
            continue;
        }
        let values = row_map(previous, row);
        let mut synthesized: Vec<String> = headers
            .iter()
            .map(|h| values.get(h.as_str()).copied().unwrap_or("").to_string())
            .collect();
        synthesized[status_idx] = status.to_string();
        rows.push(synthesized);
        seen.insert(key);
    }

    CsvFile {
        name: current.name.clone(),
        kind: current.kind,
        headers,
        rows,
        size: current.size,
        sha256: current.sha256.clone(),
    }
}

fn padded(row: &[String], width: usize) -> Vec<String> {
    let mut out = row.to_vec();
    if out.len() < width {
        out.resize(width, String::new());
    }
    out
}
