use sqlx::SqlitePool;

/// Create the metadata tables. Safe to run on every start.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    // One row per converted source file
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS converted_tables (
            source_path TEXT PRIMARY KEY,
            table_id TEXT NOT NULL UNIQUE,
            file_name TEXT NOT NULL,
            source_size INTEGER NOT NULL,
            source_modified INTEGER NOT NULL,
            row_count INTEGER NOT NULL,
            columns_json TEXT NOT NULL,
            indexed_columns_json TEXT NOT NULL DEFAULT '[]',
            skipped_rows INTEGER NOT NULL DEFAULT 0,
            coercion_failures INTEGER NOT NULL DEFAULT 0,
            converted_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Files excluded until they change on disk
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversion_failures (
            source_path TEXT PRIMARY KEY,
            source_size INTEGER NOT NULL,
            source_modified INTEGER NOT NULL,
            error TEXT NOT NULL,
            skipped_rows INTEGER NOT NULL DEFAULT 0,
            failed_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS search_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT,
            column_name TEXT NOT NULL,
            term TEXT NOT NULL,
            mode TEXT NOT NULL,
            files_searched INTEGER NOT NULL,
            results_found INTEGER NOT NULL,
            execution_ms INTEGER NOT NULL,
            cached INTEGER NOT NULL DEFAULT 0,
            searched_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_search_history_searched_at ON search_history(searched_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_search_history_user ON search_history(username)")
        .execute(pool)
        .await?;

    Ok(())
}
