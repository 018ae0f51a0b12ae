//! Error taxonomy.
//!
//! File-scoped failures ([`DiscoveryError`], [`ConversionError`],
//! [`QueryError`]) are reported per file through [`FileError`] and never
//! abort sibling work. Only [`EngineError`] is fatal to a whole operation.

use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("file has no header row")]
    Empty,
}

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("file has no header row")]
    Empty,

    #[error("{skipped} malformed rows exceed the tolerance of {limit}")]
    TooManyMalformedRows { skipped: u64, limit: u64 },

    #[error("previous conversion failed and the file has not changed since: {0}")]
    PreviouslyFailed(String),

    #[error("conversion worker stopped: {0}")]
    Worker(String),
}

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("no converted table for this file")]
    TableMissing,

    #[error("column '{0}' does not exist in this file")]
    ColumnMissing(String),

    #[error("invalid pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("query timed out after {0}s")]
    Timeout(u64),

    #[error("resource limit reached: {0}")]
    ResourceExhausted(String),

    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("conversion failed: {0}")]
    Conversion(#[from] ConversionError),

    #[error("search abandoned by caller")]
    Abandoned,
}

impl From<sqlx::Error> for QueryError {
    fn from(err: sqlx::Error) -> Self {
        if is_resource_exhaustion(&err) {
            QueryError::ResourceExhausted(err.to_string())
        } else {
            QueryError::Database(err)
        }
    }
}

/// SQLITE_NOMEM (7) and SQLITE_FULL (13), including their extended codes.
fn is_resource_exhaustion(err: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db) = err else {
        return false;
    };
    db.code()
        .and_then(|code| code.parse::<i32>().ok())
        .map(|code| matches!(code & 0xff, 7 | 13))
        .unwrap_or(false)
}

/// Failures that stop a whole operation.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("source directory does not exist: {0}")]
    SourceRootMissing(PathBuf),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid glob: {0}")]
    Glob(#[from] globset::Error),

    #[error("background task failed: {0}")]
    Task(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("{0} rows do not fit in a single worksheet")]
    TooManyRows(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileErrorKind {
    Discovery,
    Conversion,
    TableMissing,
    ColumnMissing,
    InvalidPattern,
    Timeout,
    ResourceExhausted,
    Query,
}

/// A per-file failure with enough context for a UI to render it.
#[derive(Debug, Clone, Serialize)]
pub struct FileError {
    pub file_id: Option<String>,
    pub path: PathBuf,
    pub kind: FileErrorKind,
    pub message: String,
    pub hint: Option<String>,
}

impl FileError {
    pub fn from_discovery(path: &Path, err: &DiscoveryError) -> Self {
        Self {
            file_id: None,
            path: path.to_path_buf(),
            kind: FileErrorKind::Discovery,
            message: err.to_string(),
            hint: None,
        }
    }

    pub fn from_query(file_id: &str, path: &Path, err: &QueryError) -> Self {
        let (kind, hint) = match err {
            QueryError::TableMissing => (
                FileErrorKind::TableMissing,
                Some("convert the file before searching it".to_string()),
            ),
            QueryError::ColumnMissing(_) => (FileErrorKind::ColumnMissing, None),
            QueryError::InvalidPattern(_) => (FileErrorKind::InvalidPattern, None),
            QueryError::Timeout(_) => (
                FileErrorKind::Timeout,
                Some("use a more specific term or a cheaper search mode".to_string()),
            ),
            QueryError::ResourceExhausted(_) => (
                FileErrorKind::ResourceExhausted,
                Some("narrow the search: lower the result limit or use a more specific term".to_string()),
            ),
            QueryError::Conversion(_) => (
                FileErrorKind::Conversion,
                Some("fix the source file; it is retried once it changes".to_string()),
            ),
            QueryError::Database(_) | QueryError::Abandoned => (FileErrorKind::Query, None),
        };
        Self {
            file_id: Some(file_id.to_string()),
            path: path.to_path_buf(),
            kind,
            message: err.to_string(),
            hint,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_errors_carry_a_hint() {
        let err = QueryError::ResourceExhausted("out of memory".to_string());
        let fe = FileError::from_query("csv_a_1234", Path::new("/data/a.csv"), &err);
        assert_eq!(fe.kind, FileErrorKind::ResourceExhausted);
        assert!(fe.hint.unwrap().contains("narrow"));
        assert_eq!(fe.file_id.as_deref(), Some("csv_a_1234"));
    }

    #[test]
    fn file_error_serializes_kind_as_snake_case() {
        let err = QueryError::ColumnMissing("email".to_string());
        let fe = FileError::from_query("t", Path::new("a.csv"), &err);
        let json = serde_json::to_value(&fe).unwrap();
        assert_eq!(json["kind"], "column_missing");
        assert!(json["message"].as_str().unwrap().contains("email"));
    }
}
