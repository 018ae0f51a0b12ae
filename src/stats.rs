//! Dataset statistics and health overview.
//!
//! A quick summary of what is converted: table counts, row totals, source
//! and store sizes, recorded failures, and the columns shared by the most
//! files. Used by `csvs stats` and `GET /stats`.

use serde::Serialize;

use crate::cache::CacheStats;
use crate::engine::Engine;
use crate::error::EngineError;

#[derive(Debug, Clone, Serialize)]
pub struct TableStats {
    pub file_name: String,
    pub table_id: String,
    pub rows: u64,
    pub skipped_rows: u64,
    pub coercion_failures: u64,
    pub source_bytes: u64,
    pub converted_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ColumnSpread {
    pub column: String,
    pub files: usize,
    pub column_type: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetStats {
    pub source_files: usize,
    pub converted_files: usize,
    pub total_rows: u64,
    pub source_bytes: u64,
    pub db_bytes: u64,
    pub failures: Vec<FailureStats>,
    pub tables: Vec<TableStats>,
    pub widest_columns: Vec<ColumnSpread>,
    pub cache: CacheStats,
    pub dispatched_queries: u64,
    pub peak_concurrent_queries: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureStats {
    pub path: String,
    pub error: String,
    pub failed_at: i64,
}

pub async fn collect(engine: &Engine) -> Result<DatasetStats, EngineError> {
    let catalog = engine.get_catalog().await?;
    let tables = engine.converter().tables().await?;
    let failures = engine.converter().failures().await?;

    let db_bytes = ["", "-wal"]
        .iter()
        .filter_map(|suffix| {
            let mut path = engine.config().db.path.clone().into_os_string();
            path.push(suffix);
            std::fs::metadata(path).ok()
        })
        .map(|m| m.len())
        .sum();

    let mut widest_columns: Vec<ColumnSpread> = catalog
        .columns
        .iter()
        .map(|(name, entries)| ColumnSpread {
            column: name.clone(),
            files: entries.len(),
            column_type: catalog
                .effective_type(name)
                .map(|t| t.as_str())
                .unwrap_or("unknown"),
        })
        .collect();
    widest_columns.sort_by(|a, b| b.files.cmp(&a.files).then_with(|| a.column.cmp(&b.column)));
    widest_columns.truncate(10);

    let mut table_stats: Vec<TableStats> = tables
        .iter()
        .map(|t| TableStats {
            file_name: t.file_name.clone(),
            table_id: t.table_id.clone(),
            rows: t.row_count,
            skipped_rows: t.skipped_rows,
            coercion_failures: t.coercion_failures,
            source_bytes: t.source_size,
            converted_at: t.converted_at,
        })
        .collect();
    table_stats.sort_by(|a, b| b.rows.cmp(&a.rows));

    Ok(DatasetStats {
        source_files: catalog.files.len(),
        converted_files: tables.len(),
        total_rows: tables.iter().map(|t| t.row_count).sum(),
        source_bytes: catalog.files.iter().map(|f| f.size).sum(),
        db_bytes,
        failures: failures
            .into_iter()
            .map(|f| FailureStats {
                path: f.source_path.display().to_string(),
                error: f.error,
                failed_at: f.failed_at,
            })
            .collect(),
        tables: table_stats,
        widest_columns,
        cache: engine.cache().stats(),
        dispatched_queries: engine.dispatched_queries(),
        peak_concurrent_queries: engine.peak_concurrent_queries(),
    })
}

pub fn print_stats(stats: &DatasetStats, db_path: &std::path::Path) {
    println!("CSV Search — Dataset Stats");
    println!("==========================");
    println!();
    println!("  Database:    {}", db_path.display());
    println!("  Size:        {}", format_bytes(stats.db_bytes));
    println!();
    println!(
        "  Files:       {} converted / {} found",
        stats.converted_files, stats.source_files
    );
    println!("  Source size: {}", format_bytes(stats.source_bytes));
    println!("  Rows:        {}", stats.total_rows);

    if !stats.tables.is_empty() {
        println!();
        println!("  By file:");
        println!(
            "  {:<32} {:>10} {:>8} {:>10}   {}",
            "FILE", "ROWS", "SKIPPED", "SIZE", "CONVERTED"
        );
        println!("  {}", "-".repeat(80));
        for t in &stats.tables {
            println!(
                "  {:<32} {:>10} {:>8} {:>10}   {}",
                t.file_name,
                t.rows,
                t.skipped_rows,
                format_bytes(t.source_bytes),
                format_ts_relative(t.converted_at)
            );
        }
    }

    if !stats.widest_columns.is_empty() {
        println!();
        println!("  Most shared columns:");
        for c in &stats.widest_columns {
            println!("  {:<32} {:>4} files   {}", c.column, c.files, c.column_type);
        }
    }

    if !stats.failures.is_empty() {
        println!();
        println!("  Failed conversions:");
        for f in &stats.failures {
            println!("  {}  ({})", f.path, format_ts_relative(f.failed_at));
            println!("      {}", f.error);
        }
    }

    println!();
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
pub fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_scaled() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn recent_timestamps_are_relative() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 7200), "2 hours ago");
    }
}
