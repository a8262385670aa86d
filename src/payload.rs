use anyhow::{anyhow, Context};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::io::{Cursor, Read};
use std::path::Path;
use zip::ZipArchive;

use crate::db;

const ZIP_SIGNATURE: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    Zip,
    Csv,
    Xml,
}

impl PayloadFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Zip => "application/zip",
            Self::Csv => "text/csv",
            Self::Xml => "text/xml",
        }
    }
}

/// Picks the payload format from the zip signature first, then from the
/// declared extension.
pub fn detect_format(bytes: &[u8], extension: &str) -> Option<PayloadFormat> {
    if bytes.len() >= 4 && bytes[..4] == ZIP_SIGNATURE {
        return Some(PayloadFormat::Zip);
    }
    match extension.trim_start_matches('.').to_ascii_lowercase().as_str() {
        "zip" => Some(PayloadFormat::Zip),
        "csv" => Some(PayloadFormat::Csv),
        "xml" => Some(PayloadFormat::Xml),
        _ => None,
    }
}

/// The CSV file types the importers understand, in processing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CsvKind {
    Accounts,
    Terms,
    AbstractCourses,
    Courses,
    Sections,
    Users,
    Enrollments,
    Admins,
    GroupCategories,
    Groups,
    GroupMemberships,
    UserObservers,
}

pub const PROCESSING_ORDER: [CsvKind; 12] = [
    CsvKind::Accounts,
    CsvKind::Terms,
    CsvKind::AbstractCourses,
    CsvKind::Courses,
    CsvKind::Sections,
    CsvKind::Users,
    CsvKind::Enrollments,
    CsvKind::Admins,
    CsvKind::GroupCategories,
    CsvKind::Groups,
    CsvKind::GroupMemberships,
    CsvKind::UserObservers,
];

impl CsvKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Accounts => "account",
            Self::Terms => "term",
            Self::AbstractCourses => "abstract_course",
            Self::Courses => "course",
            Self::Sections => "section",
            Self::Users => "user",
            Self::Enrollments => "enrollment",
            Self::Admins => "admin",
            Self::GroupCategories => "group_category",
            Self::Groups => "group",
            Self::GroupMemberships => "group_membership",
            Self::UserObservers => "user_observer",
        }
    }

    pub fn key_columns(self) -> &'static [&'static str] {
        match self {
            Self::Accounts => &["account_id"],
            Self::Terms => &["term_id"],
            Self::AbstractCourses => &["abstract_course_id"],
            Self::Courses => &["course_id"],
            Self::Sections => &["section_id"],
            Self::Users => &["user_id"],
            Self::Enrollments => &["course_id", "section_id", "user_id", "role"],
            Self::Admins => &["user_id", "account_id", "role"],
            Self::GroupCategories => &["group_category_id"],
            Self::Groups => &["group_id"],
            Self::GroupMemberships => &["group_id", "user_id"],
            Self::UserObservers => &["observer_id", "student_id"],
        }
    }

    /// Classifies a file by its header row.
    pub fn classify(headers: &[String]) -> Option<Self> {
        let has = |h: &str| headers.iter().any(|x| x == h);
        if has("user_id") && has("role") && (has("course_id") || has("section_id")) {
            Some(Self::Enrollments)
        } else if has("user_id") && has("account_id") && has("role") {
            Some(Self::Admins)
        } else if has("user_id") && has("login_id") {
            Some(Self::Users)
        } else if has("section_id") && has("course_id") {
            Some(Self::Sections)
        } else if has("course_id") && has("short_name") {
            Some(Self::Courses)
        } else if has("abstract_course_id") && has("short_name") {
            Some(Self::AbstractCourses)
        } else if has("term_id") && has("name") && !has("course_id") {
            Some(Self::Terms)
        } else if has("account_id") && has("parent_account_id") {
            Some(Self::Accounts)
        } else if has("group_id") && has("user_id") {
            Some(Self::GroupMemberships)
        } else if has("group_id") && has("name") {
            Some(Self::Groups)
        } else if has("group_category_id") && has("category_name") {
            Some(Self::GroupCategories)
        } else if has("observer_id") && has("student_id") {
            Some(Self::UserObservers)
        } else {
            None
        }
    }
}

/// One parsed CSV file. Rows are padded to the header width.
#[derive(Debug, Clone, PartialEq)]
pub struct CsvFile {
    pub name: String,
    pub kind: Option<CsvKind>,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub size: u64,
    pub sha256: String,
}

impl CsvFile {
    pub fn parse(name: &str, bytes: &[u8]) -> anyhow::Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(bytes);
        let headers: Vec<String> = reader
            .headers()
            .with_context(|| format!("{}: unreadable header row", name))?
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').trim().to_ascii_lowercase())
            .collect();
        let width = headers.len();
        let mut rows = Vec::new();
        for (i, record) in reader.records().enumerate() {
            let record = record.with_context(|| format!("{}: invalid CSV at row {}", name, i + 2))?;
            if record.iter().all(|f| f.is_empty()) {
                continue;
            }
            let mut row: Vec<String> = record.iter().map(|f| f.to_string()).collect();
            if row.len() < width {
                row.resize(width, String::new());
            }
            rows.push(row);
        }
        Ok(Self {
            name: name.to_string(),
            kind: CsvKind::classify(&headers),
            headers,
            rows,
            size: bytes.len() as u64,
            sha256: sha256_hex(bytes),
        })
    }

    pub fn col(&self, header: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == header)
    }

    /// Trimmed, non-empty field value.
    pub fn field<'a>(&self, row: &'a [String], header: &str) -> Option<&'a str> {
        let idx = self.col(header)?;
        row.get(idx).map(|s| s.as_str()).filter(|s| !s.is_empty())
    }

    pub fn natural_key(&self, row: &[String]) -> Option<String> {
        let kind = self.kind?;
        let mut parts = Vec::with_capacity(kind.key_columns().len());
        for c in kind.key_columns() {
            parts.push(self.field(row, c).unwrap_or(""));
        }
        if parts.iter().all(|p| p.is_empty()) {
            return None;
        }
        Some(parts.join("\u{1f}"))
    }

    /// Same file with a different set of rows.
    pub fn with_rows(&self, rows: Vec<Vec<String>>) -> Self {
        Self {
            name: self.name.clone(),
            kind: self.kind,
            headers: self.headers.clone(),
            rows,
            size: self.size,
            sha256: self.sha256.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    pub files: Vec<CsvFile>,
    /// Archive entries that were not CSV files.
    pub skipped: Vec<String>,
}

impl Dataset {
    pub fn row_count(&self) -> usize {
        self.files.iter().map(|f| f.rows.len()).sum()
    }

    /// Files ordered for import; unclassified files come last.
    pub fn in_processing_order(&self) -> Vec<&CsvFile> {
        let mut files: Vec<&CsvFile> = self.files.iter().collect();
        files.sort_by_key(|f| f.kind.map(|k| k as usize).unwrap_or(usize::MAX));
        files
    }
}

pub fn read_dataset(bytes: &[u8], format: PayloadFormat, file_name: &str) -> anyhow::Result<Dataset> {
    match format {
        PayloadFormat::Csv => Ok(Dataset {
            files: vec![CsvFile::parse(file_name, bytes)?],
            skipped: Vec::new(),
        }),
        PayloadFormat::Zip => {
            let mut archive = ZipArchive::new(Cursor::new(bytes)).context("invalid zip archive")?;
            let mut out = Dataset::default();
            for i in 0..archive.len() {
                let mut entry = archive
                    .by_index(i)
                    .with_context(|| format!("failed to read zip entry {}", i))?;
                if entry.is_dir() {
                    continue;
                }
                let name = entry.name().to_string();
                let base = Path::new(&name)
                    .file_name()
                    .and_then(|s| s.to_str())
                    .unwrap_or(&name)
                    .to_string();
                if base.starts_with('.') || !base.to_ascii_lowercase().ends_with(".csv") {
                    out.skipped.push(name);
                    continue;
                }
                let mut buf = Vec::with_capacity(entry.size() as usize);
                entry
                    .read_to_end(&mut buf)
                    .with_context(|| format!("failed to extract {}", name))?;
                out.files.push(CsvFile::parse(&base, &buf)?);
            }
            Ok(out)
        }
        PayloadFormat::Xml => Err(anyhow!("unsupported import format: xml")),
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[derive(Debug, Clone)]
pub struct StoredPayload {
    pub file_name: String,
    pub format: PayloadFormat,
    pub sha256: String,
    pub bytes: Vec<u8>,
}

impl StoredPayload {
    pub fn dataset(&self) -> anyhow::Result<Dataset> {
        read_dataset(&self.bytes, self.format, &self.file_name)
    }
}

pub fn store_attachment(
    conn: &Connection,
    sis_batch_id: i64,
    file_name: &str,
    format: PayloadFormat,
    bytes: &[u8],
) -> anyhow::Result<String> {
    let digest = sha256_hex(bytes);
    conn.execute(
        "INSERT INTO sis_batch_attachments(sis_batch_id, file_name, content_type, sha256, size_bytes, bytes, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        params![
            sis_batch_id,
            file_name,
            format.content_type(),
            digest,
            bytes.len() as i64,
            bytes,
            db::now_ts()
        ],
    )?;
    Ok(digest)
}

pub fn load_attachment(conn: &Connection, sis_batch_id: i64) -> anyhow::Result<Option<StoredPayload>> {
    let row = conn
        .query_row(
            "SELECT file_name, content_type, sha256, bytes FROM sis_batch_attachments WHERE sis_batch_id = ?",
            [sis_batch_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, Vec<u8>>(3)?,
                ))
            },
        )
        .optional()?;
    let Some((file_name, content_type, sha256, bytes)) = row else {
        return Ok(None);
    };
    let format = match content_type.as_str() {
        "application/zip" => PayloadFormat::Zip,
        "text/xml" => PayloadFormat::Xml,
        _ => PayloadFormat::Csv,
    };
    Ok(Some(StoredPayload {
        file_name,
        format,
        sha256,
        bytes,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn classifies_by_headers() {
        let h = |s: &str| s.split(',').map(|x| x.to_string()).collect::<Vec<_>>();
        assert_eq!(CsvKind::classify(&h("course_id,user_id,role,section_id,status")), Some(CsvKind::Enrollments));
        assert_eq!(CsvKind::classify(&h("user_id,account_id,role,status")), Some(CsvKind::Admins));
        assert_eq!(CsvKind::classify(&h("user_id,login_id,full_name,status")), Some(CsvKind::Users));
        assert_eq!(CsvKind::classify(&h("section_id,course_id,name,status")), Some(CsvKind::Sections));
        assert_eq!(CsvKind::classify(&h("course_id,short_name,long_name,term_id,status")), Some(CsvKind::Courses));
        assert_eq!(CsvKind::classify(&h("term_id,name,status")), Some(CsvKind::Terms));
        assert_eq!(CsvKind::classify(&h("group_id,user_id,status")), Some(CsvKind::GroupMemberships));
        assert_eq!(CsvKind::classify(&h("observer_id,student_id,status")), Some(CsvKind::UserObservers));
        assert_eq!(CsvKind::classify(&h("foo,bar")), None);
    }

    #[test]
    fn parses_csv_with_bom_and_short_rows() {
        let text = "\u{feff}Term_ID,name,status\nT1,Fall,active\nT2,Spring\n\n";
        let f = CsvFile::parse("terms.csv", text.as_bytes()).expect("parse");
        assert_eq!(f.kind, Some(CsvKind::Terms));
        assert_eq!(f.rows.len(), 2);
        assert_eq!(f.field(&f.rows[1], "status"), None);
        assert_eq!(f.natural_key(&f.rows[0]).as_deref(), Some("T1"));
    }

    #[test]
    fn detects_zip_by_signature_and_reads_entries() {
        let mut buf = Vec::new();
        {
            let mut w = zip::ZipWriter::new(Cursor::new(&mut buf));
            let opts = zip::write::FileOptions::default();
            w.start_file("sis/users.csv", opts).expect("start");
            w.write_all(b"user_id,login_id,status\nu1,alice,active\n").expect("write");
            w.start_file("readme.txt", opts).expect("start");
            w.write_all(b"hello").expect("write");
            w.finish().expect("finish");
        }
        assert_eq!(detect_format(&buf, "bin"), Some(PayloadFormat::Zip));
        assert_eq!(detect_format(b"a,b", ".CSV"), Some(PayloadFormat::Csv));
        assert_eq!(detect_format(b"<x/>", "xml"), Some(PayloadFormat::Xml));
        assert_eq!(detect_format(b"??", "pdf"), None);

        let ds = read_dataset(&buf, PayloadFormat::Zip, "upload.zip").expect("read");
        assert_eq!(ds.files.len(), 1);
        assert_eq!(ds.files[0].name, "users.csv");
        assert_eq!(ds.files[0].kind, Some(CsvKind::Users));
        assert_eq!(ds.skipped, vec!["readme.txt".to_string()]);
    }
}
