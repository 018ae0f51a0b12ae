//! Core data models shared by the catalog, converter, orchestrator and
//! exporter.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::FileError;

/// Coarse column type. Conflicts between files widen to `Textual`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Textual,
    Numeric,
    Temporal,
    Unknown,
}

impl ColumnType {
    /// Combine two observations of the same column. `Unknown` carries no
    /// information and yields to the other side.
    pub fn unify(self, other: ColumnType) -> ColumnType {
        match (self, other) {
            (a, b) if a == b => a,
            (ColumnType::Unknown, b) => b,
            (a, ColumnType::Unknown) => a,
            _ => ColumnType::Textual,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Textual => "textual",
            ColumnType::Numeric => "numeric",
            ColumnType::Temporal => "temporal",
            ColumnType::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub column_type: ColumnType,
}

/// One CSV file found by a scan.
#[derive(Debug, Clone, Serialize)]
pub struct SourceFile {
    /// Canonical path.
    pub path: PathBuf,
    pub file_id: String,
    pub file_name: String,
    pub size: u64,
    /// Modification time in nanoseconds since the epoch.
    pub modified: i64,
    /// Known once the file has been converted.
    pub row_count: Option<u64>,
    pub columns: Vec<ColumnInfo>,
}

impl SourceFile {
    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c.name == column)
    }
}

/// A file containing a given column, tagged with the column's type there.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogEntry {
    pub file_id: String,
    pub path: PathBuf,
    pub file_name: String,
    pub column_type: ColumnType,
}

/// Global column-to-files mapping for one scan of the source directory.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ColumnCatalog {
    /// Readable files, sorted by path.
    pub files: Vec<SourceFile>,
    pub columns: BTreeMap<String, Vec<CatalogEntry>>,
    pub failures: Vec<FileError>,
    /// Hash of the directory listing (paths, sizes, mtimes).
    pub signature: String,
}

impl ColumnCatalog {
    pub fn entries(&self, column: &str) -> &[CatalogEntry] {
        self.columns.get(column).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    pub fn file(&self, file_id: &str) -> Option<&SourceFile> {
        self.files.iter().find(|f| f.file_id == file_id)
    }

    /// The type used for comparisons: per-file types unified, so any
    /// disagreement makes the column textual.
    pub fn effective_type(&self, column: &str) -> Option<ColumnType> {
        let entries = self.columns.get(column)?;
        Some(
            entries
                .iter()
                .fold(ColumnType::Unknown, |acc, e| acc.unify(e.column_type)),
        )
    }
}

/// Metadata of a file's persisted table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConvertedTable {
    pub table_id: String,
    pub source_path: PathBuf,
    pub file_name: String,
    pub columns: Vec<ColumnInfo>,
    pub row_count: u64,
    pub indexed_columns: Vec<String>,
    pub skipped_rows: u64,
    pub coercion_failures: u64,
    pub source_size: u64,
    pub source_modified: i64,
    /// Unix seconds.
    pub converted_at: i64,
}

impl ConvertedTable {
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SearchMode {
    Contains,
    Exact,
    StartsWith,
    EndsWith,
    #[serde(alias = "regex", alias = "pattern-match")]
    Pattern,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Contains => "contains",
            SearchMode::Exact => "exact",
            SearchMode::StartsWith => "starts-with",
            SearchMode::EndsWith => "ends-with",
            SearchMode::Pattern => "pattern",
        }
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "contains" => Ok(SearchMode::Contains),
            "exact" => Ok(SearchMode::Exact),
            "starts-with" | "startswith" | "prefix" => Ok(SearchMode::StartsWith),
            "ends-with" | "endswith" | "suffix" => Ok(SearchMode::EndsWith),
            "pattern" | "pattern-match" | "regex" => Ok(SearchMode::Pattern),
            other => Err(format!(
                "Unknown search mode: {}. Use contains, exact, starts-with, ends-with, or pattern",
                other
            )),
        }
    }
}

/// A search over one column. Built once, then only read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub column: String,
    pub term: String,
    #[serde(default = "default_mode")]
    pub mode: SearchMode,
    /// File ids or file names. Empty means every file with the column.
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub per_file_limit: Option<usize>,
    #[serde(default)]
    pub global_limit: Option<usize>,
    #[serde(default)]
    pub case_sensitive: bool,
    /// Skip the cache lookup. The fresh outcome is still cached.
    #[serde(default)]
    pub fresh: bool,
    #[serde(default)]
    pub user: Option<String>,
}

fn default_mode() -> SearchMode {
    SearchMode::Contains
}

impl SearchRequest {
    pub fn new(column: impl Into<String>, term: impl Into<String>, mode: SearchMode) -> Self {
        Self {
            column: column.into(),
            term: term.into(),
            mode,
            files: Vec::new(),
            per_file_limit: None,
            global_limit: None,
            case_sensitive: false,
            fresh: false,
            user: None,
        }
    }

    pub fn files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn per_file_limit(mut self, limit: usize) -> Self {
        self.per_file_limit = Some(limit);
        self
    }

    pub fn global_limit(mut self, limit: usize) -> Self {
        self.global_limit = Some(limit);
        self
    }

    pub fn case_sensitive(mut self, yes: bool) -> Self {
        self.case_sensitive = yes;
        self
    }

    pub fn fresh(mut self, yes: bool) -> Self {
        self.fresh = yes;
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }
}

/// A typed cell as read back from a converted table.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl CellValue {
    /// Rendering used by text exports. NULL is the empty string.
    pub fn to_text(&self) -> String {
        match self {
            CellValue::Null => String::new(),
            CellValue::Integer(i) => i.to_string(),
            CellValue::Real(f) => f.to_string(),
            CellValue::Text(s) => s.clone(),
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

/// One row, cells in the table's column order.
pub type Record = Vec<CellValue>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileSearchResult {
    pub file_id: String,
    pub path: PathBuf,
    pub file_name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Record>,
    /// May exceed `rows.len()` when the file was truncated.
    pub match_count: u64,
    /// False when truncated and the exact count was not computed; the
    /// count is then a lower bound.
    pub count_exact: bool,
    pub truncated: bool,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedFile {
    pub file_id: String,
    pub file_name: String,
    pub reason: String,
}

/// Aggregated result of one search.
#[derive(Debug, Clone, Serialize)]
pub struct SearchOutcome {
    pub request: SearchRequest,
    pub fingerprint: String,
    /// Completion order.
    pub results: Vec<FileSearchResult>,
    pub errors: Vec<FileError>,
    pub skipped: Vec<SkippedFile>,
    pub total_rows: usize,
    /// Rows were dropped to honor the global cap.
    pub truncated: bool,
    pub cached: bool,
    pub elapsed_ms: u64,
}

impl SearchOutcome {
    pub fn files_searched(&self) -> usize {
        self.results.len() + self.errors.len()
    }

    pub fn result_for(&self, file_name_or_id: &str) -> Option<&FileSearchResult> {
        self.results
            .iter()
            .find(|r| r.file_id == file_name_or_id || r.file_name == file_name_or_id)
    }
}

/// Incremental delivery of a running search. `Completed` is always last.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SearchEvent {
    /// A chunk of at most `search.chunk_size` rows from one file.
    Rows {
        file_id: String,
        file_name: String,
        columns: Arc<Vec<String>>,
        rows: Vec<Record>,
        cached: bool,
    },
    FileFinished {
        file_id: String,
        file_name: String,
        match_count: u64,
        count_exact: bool,
        truncated: bool,
        elapsed_ms: u64,
    },
    FileFailed(FileError),
    Completed(Arc<SearchOutcome>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicting_types_widen_to_textual() {
        assert_eq!(ColumnType::Numeric.unify(ColumnType::Temporal), ColumnType::Textual);
        assert_eq!(ColumnType::Unknown.unify(ColumnType::Numeric), ColumnType::Numeric);
        assert_eq!(ColumnType::Numeric.unify(ColumnType::Numeric), ColumnType::Numeric);
    }

    #[test]
    fn search_mode_parses_aliases() {
        assert_eq!("starts_with".parse::<SearchMode>().unwrap(), SearchMode::StartsWith);
        assert_eq!("Regex".parse::<SearchMode>().unwrap(), SearchMode::Pattern);
        assert!("fuzzy".parse::<SearchMode>().is_err());
    }

    #[test]
    fn request_deserializes_with_defaults() {
        let req: SearchRequest =
            serde_json::from_str(r#"{"column":"name","term":"apple","mode":"ends-with"}"#).unwrap();
        assert_eq!(req.mode, SearchMode::EndsWith);
        assert!(!req.case_sensitive);
        assert!(req.files.is_empty());
        assert_eq!(req.per_file_limit, None);
    }

    #[test]
    fn cells_serialize_untagged() {
        let row = vec![
            CellValue::Null,
            CellValue::Integer(3),
            CellValue::Text("x".to_string()),
        ];
        assert_eq!(serde_json::to_string(&row).unwrap(), r#"[null,3,"x"]"#);
    }
}
