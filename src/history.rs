//! Search history: one row per completed search, plus per-user recall and
//! the most popular searches of recent days.

use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::models::SearchOutcome;

#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub user: Option<String>,
    pub column: String,
    pub term: String,
    pub mode: String,
    pub files_searched: i64,
    pub results_found: i64,
    pub execution_ms: i64,
    pub cached: bool,
    /// Unix seconds.
    pub searched_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PopularSearch {
    pub column: String,
    pub term: String,
    pub search_count: i64,
    pub avg_execution_ms: f64,
    pub total_results: i64,
}

pub async fn record(pool: &SqlitePool, outcome: &SearchOutcome) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO search_history (username, column_name, term, mode, files_searched,
            results_found, execution_ms, cached, searched_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&outcome.request.user)
    .bind(&outcome.request.column)
    .bind(&outcome.request.term)
    .bind(outcome.request.mode.as_str())
    .bind(outcome.files_searched() as i64)
    .bind(outcome.total_rows as i64)
    .bind(outcome.elapsed_ms as i64)
    .bind(outcome.cached)
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(())
}

/// Most recent searches, optionally for one user only.
pub async fn history(
    pool: &SqlitePool,
    user: Option<&str>,
    limit: i64,
) -> Result<Vec<HistoryEntry>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT username, column_name, term, mode, files_searched, results_found,
               execution_ms, cached, searched_at
        FROM search_history
        WHERE (?1 IS NULL OR username = ?1)
        ORDER BY searched_at DESC, id DESC
        LIMIT ?2
        "#,
    )
    .bind(user)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            Ok(HistoryEntry {
                user: row.try_get("username")?,
                column: row.try_get("column_name")?,
                term: row.try_get("term")?,
                mode: row.try_get("mode")?,
                files_searched: row.try_get("files_searched")?,
                results_found: row.try_get("results_found")?,
                execution_ms: row.try_get("execution_ms")?,
                cached: row.try_get("cached")?,
                searched_at: row.try_get("searched_at")?,
            })
        })
        .collect()
}

/// Most frequent (term, column) pairs over the last `days` days.
pub async fn popular(pool: &SqlitePool, limit: i64, days: i64) -> Result<Vec<PopularSearch>, sqlx::Error> {
    let since = chrono::Utc::now().timestamp() - days * 86_400;
    let rows = sqlx::query(
        r#"
        SELECT term, column_name, COUNT(*) AS search_count,
               AVG(execution_ms) AS avg_ms, SUM(results_found) AS total_results
        FROM search_history
        WHERE searched_at >= ?
        GROUP BY term, column_name
        ORDER BY search_count DESC, term
        LIMIT ?
        "#,
    )
    .bind(since)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            Ok(PopularSearch {
                column: row.try_get("column_name")?,
                term: row.try_get("term")?,
                search_count: row.try_get("search_count")?,
                avg_execution_ms: row.try_get("avg_ms")?,
                total_results: row.try_get("total_results")?,
            })
        })
        .collect()
}
