use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::str::FromStr;
use std::time::Duration;

use crate::config::Config;
use crate::error::EngineError;

/// Open the store. Every pooled connection gets the same pragmas. The
/// page cache is sized per connection; `hard_heap_limit` caps SQLite's
/// heap for the whole process.
pub async fn connect(config: &Config) -> Result<SqlitePool, EngineError> {
    let db_path = &config.db.path;

    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let heap_limit = config.db.memory_limit_mb.saturating_mul(1024 * 1024);
    // Negative cache_size is in KiB. A quarter of the heap budget, split
    // across the pool.
    let cache_kib = (config.db.memory_limit_mb * 1024 / 4) / u64::from(config.max_connections().max(1));

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(config.db.busy_timeout_secs))
        .with_regexp()
        .pragma("cache_size", format!("-{}", cache_kib.max(2048)))
        .pragma("hard_heap_limit", heap_limit.to_string())
        .pragma("threads", config.db.threads.to_string())
        .pragma("temp_store", "FILE");

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections())
        .connect_with(options)
        .await?;

    tracing::debug!(
        path = %db_path.display(),
        connections = config.max_connections(),
        "opened store"
    );

    Ok(pool)
}

/// Quote an identifier for interpolation into SQL. Table and column names
/// come from file headers, so they are never trusted as-is.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
