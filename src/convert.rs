//! CSV to table conversion.
//!
//! Each source file becomes one table named after its file id. A blocking
//! reader thread parses and coerces rows in batches and hands them over a
//! bounded channel, so peak memory follows `conversion.batch_rows` rather
//! than file size. Batches land in a staging table that replaces the live
//! table in a single transaction, together with its indexes and metadata.
//!
//! Conversion is idempotent: a file whose size and mtime match the recorded
//! conversion is not touched again.

use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;

use crate::catalog::{self, ListedFile};
use crate::coerce;
use crate::config::{ConversionConfig, MalformedRows, SourcesConfig};
use crate::db::quote_ident;
use crate::error::ConversionError;
use crate::models::{CellValue, ColumnInfo, ColumnType, ConvertedTable, Record};
use crate::progress::{ConversionEvent, ConversionProgressReporter, NoProgress};

/// Stay under SQLite's default limit of 32766 host parameters.
const MAX_BIND_PARAMS: usize = 30_000;

enum ReadMessage {
    Header(Vec<String>),
    Batch(Vec<Record>),
}

#[derive(Debug, Default, Clone, Copy)]
struct ReadStats {
    skipped_rows: u64,
    coercion_failures: u64,
}

/// A conversion that failed for a file that has not changed since.
#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub source_path: PathBuf,
    pub error: String,
    pub skipped_rows: u64,
    pub failed_at: i64,
}

/// Outcome of a `convert_all` run.
#[derive(Debug, Default)]
pub struct ConvertReport {
    pub converted: Vec<ConvertedTable>,
    pub up_to_date: Vec<ConvertedTable>,
    pub failed: Vec<(PathBuf, String)>,
}

pub struct Converter {
    pool: SqlitePool,
    sources: SourcesConfig,
    conversion: ConversionConfig,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    conversions: AtomicU64,
}

impl Converter {
    pub fn new(pool: SqlitePool, sources: SourcesConfig, conversion: ConversionConfig) -> Self {
        Self {
            pool,
            sources,
            conversion,
            locks: Mutex::new(HashMap::new()),
            conversions: AtomicU64::new(0),
        }
    }

    /// Number of conversions that actually rewrote a table.
    pub fn conversions_performed(&self) -> u64 {
        self.conversions.load(Ordering::Relaxed)
    }

    pub fn convert_on_search(&self) -> bool {
        self.conversion.convert_on_search
    }

    fn table_lock(&self, table_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(table_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Return the file's table, converting it first when it is missing or
    /// stale. Concurrent callers for the same file wait for one conversion.
    pub async fn ensure_converted(&self, path: &Path) -> Result<ConvertedTable, ConversionError> {
        let listed = ListedFile::stat(path)?;
        self.ensure(&listed, false, &NoProgress)
            .await
            .map(|(table, _)| table)
    }

    /// Convert every listed file that needs it, smallest first.
    pub async fn convert_all(
        &self,
        files: &[ListedFile],
        force: bool,
        reporter: &dyn ConversionProgressReporter,
    ) -> ConvertReport {
        let mut ordered: Vec<&ListedFile> = files.iter().collect();
        ordered.sort_by(|a, b| a.size.cmp(&b.size).then_with(|| a.path.cmp(&b.path)));

        let total = ordered.len();
        let mut report = ConvertReport::default();
        for (i, listed) in ordered.into_iter().enumerate() {
            reporter.report(ConversionEvent::Started {
                file: listed.path.clone(),
                index: i + 1,
                total,
                bytes: listed.size,
            });
            match self.ensure(listed, force, reporter).await {
                Ok((table, true)) => report.converted.push(table),
                Ok((table, false)) => {
                    reporter.report(ConversionEvent::UpToDate {
                        file: listed.path.clone(),
                    });
                    report.up_to_date.push(table);
                }
                Err(e) => {
                    reporter.report(ConversionEvent::Failed {
                        file: listed.path.clone(),
                        error: e.to_string(),
                    });
                    report.failed.push((listed.path.clone(), e.to_string()));
                }
            }
        }
        report
    }

    /// The bool is true when this call performed the conversion.
    async fn ensure(
        &self,
        listed: &ListedFile,
        force: bool,
        reporter: &dyn ConversionProgressReporter,
    ) -> Result<(ConvertedTable, bool), ConversionError> {
        if !force {
            if let Some(table) = self.check_fresh(listed).await? {
                return Ok((table, false));
            }
        }

        let table_id = catalog::file_id(&listed.path);
        let lock = self.table_lock(&table_id);
        let _guard = lock.lock().await;

        // Another caller may have finished the same conversion meanwhile.
        if !force {
            if let Some(table) = self.check_fresh(listed).await? {
                return Ok((table, false));
            }
        }

        let table = self.convert(listed, &table_id, reporter).await?;
        Ok((table, true))
    }

    /// Recorded table when it matches the file on disk. A recorded failure
    /// for the same size and mtime is returned as an error.
    async fn check_fresh(&self, listed: &ListedFile) -> Result<Option<ConvertedTable>, ConversionError> {
        if let Some(table) = self.lookup(&listed.path).await? {
            if table.source_size == listed.size
                && table.source_modified == listed.modified
                && self.table_exists(&table.table_id).await?
            {
                return Ok(Some(table));
            }
        }

        let failure = sqlx::query(
            "SELECT error FROM conversion_failures WHERE source_path = ? AND source_size = ? AND source_modified = ?",
        )
        .bind(path_key(&listed.path))
        .bind(listed.size as i64)
        .bind(listed.modified)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = failure {
            let error: String = row.try_get("error")?;
            return Err(ConversionError::PreviouslyFailed(error));
        }

        Ok(None)
    }

    async fn table_exists(&self, table_id: &str) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(table_id)
            .fetch_one(&self.pool)
            .await
    }

    pub async fn lookup(&self, path: &Path) -> Result<Option<ConvertedTable>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM converted_tables WHERE source_path = ?")
            .bind(path_key(path))
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(table_from_row).transpose()
    }

    /// Every recorded table, by file name.
    pub async fn tables(&self) -> Result<Vec<ConvertedTable>, sqlx::Error> {
        let rows = sqlx::query("SELECT * FROM converted_tables ORDER BY file_name, source_path")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(table_from_row).collect()
    }

    pub async fn failures(&self) -> Result<Vec<FailureRecord>, sqlx::Error> {
        let rows = sqlx::query("SELECT * FROM conversion_failures ORDER BY failed_at DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(FailureRecord {
                    source_path: PathBuf::from(row.try_get::<String, _>("source_path")?),
                    error: row.try_get("error")?,
                    skipped_rows: row.try_get::<i64, _>("skipped_rows")? as u64,
                    failed_at: row.try_get("failed_at")?,
                })
            })
            .collect()
    }

    async fn convert(
        &self,
        listed: &ListedFile,
        table_id: &str,
        reporter: &dyn ConversionProgressReporter,
    ) -> Result<ConvertedTable, ConversionError> {
        let staging = format!("{}__staging", table_id);
        match self.convert_inner(listed, table_id, &staging, reporter).await {
            Ok(table) => {
                self.conversions.fetch_add(1, Ordering::Relaxed);
                Ok(table)
            }
            Err(e) => {
                let _ = sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_ident(&staging)))
                    .execute(&self.pool)
                    .await;
                if is_file_fault(&e) {
                    self.record_failure(listed, &e).await;
                }
                tracing::warn!(path = %listed.path.display(), error = %e, "conversion failed");
                Err(e)
            }
        }
    }

    async fn convert_inner(
        &self,
        listed: &ListedFile,
        table_id: &str,
        staging: &str,
        reporter: &dyn ConversionProgressReporter,
    ) -> Result<ConvertedTable, ConversionError> {
        let started = Instant::now();
        tracing::info!(path = %listed.path.display(), bytes = listed.size, "converting");

        let (tx, mut rx) = mpsc::channel::<ReadMessage>(2);
        let path = listed.path.clone();
        let sources = self.sources.clone();
        let conversion = self.conversion.clone();
        let reader = tokio::task::spawn_blocking(move || read_batches(&path, &sources, &conversion, tx));

        let written = self.write_staging(staging, &mut rx, &listed.path, reporter).await;
        // Unblocks the reader if writing stopped early.
        drop(rx);
        let read = reader
            .await
            .map_err(|e| ConversionError::Worker(e.to_string()))?;

        let (columns, row_count, stats) = match (written, read) {
            (Err(e), _) => return Err(e),
            (Ok(_), Err(e)) => return Err(e),
            (Ok(None), Ok(_)) => return Err(ConversionError::Empty),
            (Ok(Some((columns, rows))), Ok(stats)) => (columns, rows, stats),
        };

        let indexed_columns: Vec<String> = columns
            .iter()
            .filter(|c| c.column_type == ColumnType::Textual)
            .map(|c| c.name.clone())
            .collect();

        let table = ConvertedTable {
            table_id: table_id.to_string(),
            source_path: listed.path.clone(),
            file_name: listed.file_name(),
            columns,
            row_count,
            indexed_columns,
            skipped_rows: stats.skipped_rows,
            coercion_failures: stats.coercion_failures,
            source_size: listed.size,
            source_modified: listed.modified,
            converted_at: chrono::Utc::now().timestamp(),
        };

        self.swap_in(staging, &table).await?;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        reporter.report(ConversionEvent::Finished {
            file: listed.path.clone(),
            rows: row_count,
            skipped: stats.skipped_rows,
            elapsed_ms,
        });
        tracing::info!(
            table = %table.table_id,
            rows = row_count,
            skipped = stats.skipped_rows,
            coercion_failures = stats.coercion_failures,
            elapsed_ms,
            "converted"
        );
        Ok(table)
    }

    /// Drain the reader into the staging table. `None` when the reader sent
    /// no header.
    async fn write_staging(
        &self,
        staging: &str,
        rx: &mut mpsc::Receiver<ReadMessage>,
        path: &Path,
        reporter: &dyn ConversionProgressReporter,
    ) -> Result<Option<(Vec<ColumnInfo>, u64)>, ConversionError> {
        let headers = match rx.recv().await {
            Some(ReadMessage::Header(headers)) => headers,
            Some(ReadMessage::Batch(_)) => {
                return Err(ConversionError::Worker("rows arrived before the header".to_string()))
            }
            None => return Ok(None),
        };
        let columns: Vec<ColumnInfo> = headers
            .into_iter()
            .map(|name| ColumnInfo {
                column_type: coerce::coerced_type(&name),
                name,
            })
            .collect();

        let staging_ident = quote_ident(staging);
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", staging_ident))
            .execute(&self.pool)
            .await?;
        let column_defs: Vec<String> = columns
            .iter()
            .map(|c| {
                let decl = match c.column_type {
                    ColumnType::Numeric => "NUMERIC",
                    _ => "TEXT",
                };
                format!("{} {}", quote_ident(&c.name), decl)
            })
            .collect();
        sqlx::query(&format!("CREATE TABLE {} ({})", staging_ident, column_defs.join(", ")))
            .execute(&self.pool)
            .await?;

        let column_list: Vec<String> = columns.iter().map(|c| quote_ident(&c.name)).collect();
        let insert_prefix = format!("INSERT INTO {} ({}) ", staging_ident, column_list.join(", "));
        let rows_per_statement = (MAX_BIND_PARAMS / columns.len().max(1)).max(1);

        let mut rows: u64 = 0;
        while let Some(message) = rx.recv().await {
            let ReadMessage::Batch(batch) = message else {
                continue;
            };
            let mut tx = self.pool.begin().await?;
            for chunk in batch.chunks(rows_per_statement) {
                let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(&insert_prefix);
                builder.push_values(chunk, |mut b, record| {
                    for cell in record {
                        match cell {
                            CellValue::Null => b.push_bind(None::<String>),
                            CellValue::Integer(i) => b.push_bind(*i),
                            CellValue::Real(f) => b.push_bind(*f),
                            CellValue::Text(s) => b.push_bind(s.clone()),
                        };
                    }
                });
                builder.build().execute(&mut *tx).await?;
            }
            tx.commit().await?;

            rows += batch.len() as u64;
            reporter.report(ConversionEvent::Rows {
                file: path.to_path_buf(),
                rows,
            });
        }

        Ok(Some((columns, rows)))
    }

    /// Replace the live table with the staging table, index textual
    /// columns and record metadata, all in one transaction.
    async fn swap_in(&self, staging: &str, table: &ConvertedTable) -> Result<(), ConversionError> {
        let table_ident = quote_ident(&table.table_id);
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!("DROP TABLE IF EXISTS {}", table_ident))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!(
            "ALTER TABLE {} RENAME TO {}",
            quote_ident(staging),
            table_ident
        ))
        .execute(&mut *tx)
        .await?;

        for (i, column) in table
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.column_type == ColumnType::Textual)
        {
            let index_name = format!("idx_{}_{}", table.table_id, i);
            sqlx::query(&format!(
                "CREATE INDEX {} ON {} ({} COLLATE NOCASE)",
                quote_ident(&index_name),
                table_ident,
                quote_ident(&column.name)
            ))
            .execute(&mut *tx)
            .await?;
        }

        let columns_json = serde_json::to_string(&table.columns)
            .map_err(|e| ConversionError::Worker(e.to_string()))?;
        let indexed_json = serde_json::to_string(&table.indexed_columns)
            .map_err(|e| ConversionError::Worker(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO converted_tables (source_path, table_id, file_name, source_size, source_modified,
                row_count, columns_json, indexed_columns_json, skipped_rows, coercion_failures, converted_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_path) DO UPDATE SET
                table_id = excluded.table_id,
                file_name = excluded.file_name,
                source_size = excluded.source_size,
                source_modified = excluded.source_modified,
                row_count = excluded.row_count,
                columns_json = excluded.columns_json,
                indexed_columns_json = excluded.indexed_columns_json,
                skipped_rows = excluded.skipped_rows,
                coercion_failures = excluded.coercion_failures,
                converted_at = excluded.converted_at
            "#,
        )
        .bind(path_key(&table.source_path))
        .bind(&table.table_id)
        .bind(&table.file_name)
        .bind(table.source_size as i64)
        .bind(table.source_modified)
        .bind(table.row_count as i64)
        .bind(&columns_json)
        .bind(&indexed_json)
        .bind(table.skipped_rows as i64)
        .bind(table.coercion_failures as i64)
        .bind(table.converted_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM conversion_failures WHERE source_path = ?")
            .bind(path_key(&table.source_path))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn record_failure(&self, listed: &ListedFile, err: &ConversionError) {
        let skipped = match err {
            ConversionError::TooManyMalformedRows { skipped, .. } => *skipped as i64,
            _ => 0,
        };
        let result = sqlx::query(
            r#"
            INSERT INTO conversion_failures (source_path, source_size, source_modified, error, skipped_rows, failed_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_path) DO UPDATE SET
                source_size = excluded.source_size,
                source_modified = excluded.source_modified,
                error = excluded.error,
                skipped_rows = excluded.skipped_rows,
                failed_at = excluded.failed_at
            "#,
        )
        .bind(path_key(&listed.path))
        .bind(listed.size as i64)
        .bind(listed.modified)
        .bind(err.to_string())
        .bind(skipped)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "could not record conversion failure");
        }
    }

    /// Drop tables whose source file is gone, plus leftover staging tables.
    /// Returns the dropped table ids.
    pub async fn cleanup_orphans(&self) -> Result<Vec<String>, sqlx::Error> {
        let mut dropped = Vec::new();

        let rows = sqlx::query("SELECT source_path, table_id FROM converted_tables")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let source_path: String = row.try_get("source_path")?;
            let table_id: String = row.try_get("table_id")?;
            if Path::new(&source_path).exists() {
                continue;
            }
            let lock = self.table_lock(&table_id);
            let _guard = lock.lock().await;

            let mut tx = self.pool.begin().await?;
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_ident(&table_id)))
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM converted_tables WHERE source_path = ?")
                .bind(&source_path)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            tracing::info!(table = %table_id, source = %source_path, "dropped orphaned table");
            dropped.push(table_id);
        }

        let failure_paths: Vec<String> = sqlx::query_scalar("SELECT source_path FROM conversion_failures")
            .fetch_all(&self.pool)
            .await?;
        for path in failure_paths {
            if !Path::new(&path).exists() {
                sqlx::query("DELETE FROM conversion_failures WHERE source_path = ?")
                    .bind(&path)
                    .execute(&self.pool)
                    .await?;
            }
        }

        let staging: Vec<String> = sqlx::query_scalar(
            r"SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE '%\_\_staging' ESCAPE '\'",
        )
        .fetch_all(&self.pool)
        .await?;
        for name in staging {
            let live = name.trim_end_matches("__staging");
            let lock = self.table_lock(live);
            let Ok(_guard) = lock.try_lock() else {
                // A conversion is writing it right now.
                continue;
            };
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_ident(&name)))
                .execute(&self.pool)
                .await?;
            dropped.push(name);
        }

        Ok(dropped)
    }
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Failures caused by the file itself. Those are remembered until the file
/// changes; database and worker failures are retried on the next request.
fn is_file_fault(err: &ConversionError) -> bool {
    matches!(
        err,
        ConversionError::Io(_)
            | ConversionError::Csv(_)
            | ConversionError::Empty
            | ConversionError::TooManyMalformedRows { .. }
    )
}

fn table_from_row(row: &SqliteRow) -> Result<ConvertedTable, sqlx::Error> {
    let columns_json: String = row.try_get("columns_json")?;
    let indexed_json: String = row.try_get("indexed_columns_json")?;
    let columns: Vec<ColumnInfo> =
        serde_json::from_str(&columns_json).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
    let indexed_columns: Vec<String> =
        serde_json::from_str(&indexed_json).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

    Ok(ConvertedTable {
        table_id: row.try_get("table_id")?,
        source_path: PathBuf::from(row.try_get::<String, _>("source_path")?),
        file_name: row.try_get("file_name")?,
        columns,
        row_count: row.try_get::<i64, _>("row_count")? as u64,
        indexed_columns,
        skipped_rows: row.try_get::<i64, _>("skipped_rows")? as u64,
        coercion_failures: row.try_get::<i64, _>("coercion_failures")? as u64,
        source_size: row.try_get::<i64, _>("source_size")? as u64,
        source_modified: row.try_get("source_modified")?,
        converted_at: row.try_get("converted_at")?,
    })
}

fn closed_channel() -> ConversionError {
    ConversionError::Worker("writer stopped accepting rows".to_string())
}

/// Runs on a blocking thread: parse, shape and coerce rows, sending them
/// in batches of `batch_rows`.
fn read_batches(
    path: &Path,
    sources: &SourcesConfig,
    conversion: &ConversionConfig,
    tx: mpsc::Sender<ReadMessage>,
) -> Result<ReadStats, ConversionError> {
    let encoding = sources.encoding();
    let mut reader = catalog::csv_reader(path, sources)?;
    let mut record = csv::ByteRecord::new();

    if !reader.read_byte_record(&mut record)? {
        return Err(ConversionError::Empty);
    }
    let first: Vec<String> = record
        .iter()
        .map(|f| catalog::decode_field(f, encoding).0.into_owned())
        .collect();
    let (headers, first_is_data) = if sources.has_header {
        (catalog::normalize_headers(&first), false)
    } else {
        (catalog::generated_headers(first.len()), true)
    };
    if headers.is_empty() {
        return Err(ConversionError::Empty);
    }
    let types: Vec<ColumnType> = headers.iter().map(|h| coerce::coerced_type(h)).collect();
    tx.blocking_send(ReadMessage::Header(headers))
        .map_err(|_| closed_channel())?;

    let mut stats = ReadStats::default();
    let mut batch: Vec<Record> = Vec::with_capacity(conversion.batch_rows);

    let mut pending_first = first_is_data;
    loop {
        if pending_first {
            pending_first = false;
        } else if !reader.read_byte_record(&mut record)? {
            break;
        }

        if let Some(row) = shape_row(&record, &types, encoding, conversion.malformed_rows, &mut stats) {
            batch.push(row);
        } else if let Some(limit) = conversion.max_skipped_rows {
            if stats.skipped_rows > limit {
                return Err(ConversionError::TooManyMalformedRows {
                    skipped: stats.skipped_rows,
                    limit,
                });
            }
        }

        if batch.len() >= conversion.batch_rows {
            let full = std::mem::replace(&mut batch, Vec::with_capacity(conversion.batch_rows));
            tx.blocking_send(ReadMessage::Batch(full))
                .map_err(|_| closed_channel())?;
        }
    }

    if !batch.is_empty() {
        tx.blocking_send(ReadMessage::Batch(batch))
            .map_err(|_| closed_channel())?;
    }
    Ok(stats)
}

/// Apply the malformed-row policy and column coercion to one record.
/// `None` means the row was skipped.
fn shape_row(
    record: &csv::ByteRecord,
    types: &[ColumnType],
    encoding: &'static encoding_rs::Encoding,
    policy: MalformedRows,
    stats: &mut ReadStats,
) -> Option<Record> {
    if policy == MalformedRows::Skip && record.len() != types.len() {
        stats.skipped_rows += 1;
        return None;
    }

    let mut row = Vec::with_capacity(types.len());
    for (i, ty) in types.iter().enumerate() {
        let raw = record.get(i).unwrap_or(b"");
        let (text, had_errors) = catalog::decode_field(raw, encoding);
        if had_errors && policy == MalformedRows::Skip {
            stats.skipped_rows += 1;
            return None;
        }
        let coerced = coerce::coerce_value(*ty, &text);
        if coerced.failed {
            stats.coercion_failures += 1;
        }
        row.push(coerced.value);
    }
    Some(row)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(fields: &[&str]) -> csv::ByteRecord {
        csv::ByteRecord::from(fields.to_vec())
    }

    #[test]
    fn skip_policy_drops_ragged_rows() {
        let types = [ColumnType::Textual, ColumnType::Numeric];
        let mut stats = ReadStats::default();
        let row = shape_row(&record(&["a"]), &types, encoding_rs::UTF_8, MalformedRows::Skip, &mut stats);
        assert!(row.is_none());
        assert_eq!(stats.skipped_rows, 1);
    }

    #[test]
    fn coerce_policy_pads_and_truncates() {
        let types = [ColumnType::Textual, ColumnType::Numeric];
        let mut stats = ReadStats::default();
        let short = shape_row(&record(&["a"]), &types, encoding_rs::UTF_8, MalformedRows::Coerce, &mut stats).unwrap();
        assert_eq!(short, vec![CellValue::Text("a".to_string()), CellValue::Null]);
        let long = shape_row(
            &record(&["b", "7", "extra"]),
            &types,
            encoding_rs::UTF_8,
            MalformedRows::Coerce,
            &mut stats,
        )
        .unwrap();
        assert_eq!(long, vec![CellValue::Text("b".to_string()), CellValue::Integer(7)]);
        assert_eq!(stats.skipped_rows, 0);
    }

    #[test]
    fn invalid_bytes_are_skipped_or_replaced() {
        let types = [ColumnType::Textual];
        let bad = csv::ByteRecord::from(vec![&b"caf\xff"[..]]);

        let mut stats = ReadStats::default();
        assert!(shape_row(&bad, &types, encoding_rs::UTF_8, MalformedRows::Skip, &mut stats).is_none());
        assert_eq!(stats.skipped_rows, 1);

        let row = shape_row(&bad, &types, encoding_rs::UTF_8, MalformedRows::Coerce, &mut stats).unwrap();
        assert_eq!(row, vec![CellValue::Text("caf\u{fffd}".to_string())]);
    }

    #[test]
    fn latin1_decodes() {
        let types = [ColumnType::Textual];
        let rec = csv::ByteRecord::from(vec![&b"caf\xe9"[..]]);
        let mut stats = ReadStats::default();
        let row = shape_row(&rec, &types, encoding_rs::WINDOWS_1252, MalformedRows::Skip, &mut stats).unwrap();
        assert_eq!(row, vec![CellValue::Text("café".to_string())]);
    }

    #[test]
    fn coercion_failures_are_counted() {
        let types = [ColumnType::Numeric];
        let mut stats = ReadStats::default();
        let row = shape_row(&record(&["n/a"]), &types, encoding_rs::UTF_8, MalformedRows::Skip, &mut stats).unwrap();
        assert_eq!(row, vec![CellValue::Null]);
        assert_eq!(stats.coercion_failures, 1);
    }
}
