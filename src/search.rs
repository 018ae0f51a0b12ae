//! Federated search over converted tables.
//!
//! One query per target file runs on a task gated by a semaphore of
//! `search.max_workers` permits. Tasks stream row chunks into a merge loop,
//! which enforces the global cap, forwards events to the caller in
//! completion order, and caches the final outcome.
//!
//! # Predicates
//!
//! | Mode | Case-insensitive | Case-sensitive |
//! |------|------------------|----------------|
//! | contains | `LIKE '%t%' ESCAPE '\'` | `instr(col, t) > 0` |
//! | starts-with | `LIKE 't%' ESCAPE '\'` | `substr(col, 1, length(t)) = t` |
//! | ends-with | `LIKE '%t' ESCAPE '\'` | `substr(col, -length(t)) = t` |
//! | exact | `= t COLLATE NOCASE` | `= t` |
//! | pattern | `REGEXP '(?i)t'` | `REGEXP t` |
//!
//! The term is always bound, never spliced into SQL. Non-textual columns
//! are compared through `CAST(col AS TEXT)`.
//!
//! `LIKE` and `NOCASE` fold ASCII letters only. A case-insensitive term
//! with non-ASCII characters is matched with an escaped, anchored
//! `(?i)` regex instead, so `äpfel` finds `Äpfel` in every mode.

use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool, TypeInfo, ValueRef};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};

use crate::cache::{self, FingerprintInput, QueryCache};
use crate::config::SearchConfig;
use crate::convert::Converter;
use crate::db::quote_ident;
use crate::error::{EngineError, FileError, QueryError};
use crate::history;
use crate::models::{
    CellValue, ColumnCatalog, ColumnType, ConvertedTable, FileSearchResult, Record, SearchEvent,
    SearchMode, SearchOutcome, SearchRequest, SkippedFile,
};

const EVENT_BUFFER: usize = 32;

/// A file a search will query.
#[derive(Debug, Clone)]
pub struct SearchTarget {
    pub file_id: String,
    pub path: PathBuf,
    pub file_name: String,
}

/// Receiving end of a running search. Dropping it abandons the search:
/// running queries finish, but their rows are discarded and nothing is
/// cached.
pub struct SearchStream {
    rx: mpsc::Receiver<SearchEvent>,
}

impl SearchStream {
    /// Next event, or `None` after `Completed` has been delivered.
    pub async fn next(&mut self) -> Option<SearchEvent> {
        self.rx.recv().await
    }

    /// Drain the stream and return the final outcome.
    pub async fn collect(mut self) -> Result<Arc<SearchOutcome>, EngineError> {
        while let Some(event) = self.rx.recv().await {
            if let SearchEvent::Completed(outcome) = event {
                return Ok(outcome);
            }
        }
        Err(EngineError::Task("search ended without completing".to_string()))
    }
}

/// One page of a single file's matches, in storage order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageRequest {
    /// File id or file name.
    pub file: String,
    pub column: String,
    pub term: String,
    #[serde(default = "default_mode")]
    pub mode: SearchMode,
    #[serde(default)]
    pub case_sensitive: bool,
    /// 1-based.
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default)]
    pub page_size: Option<usize>,
}

fn default_mode() -> SearchMode {
    SearchMode::Contains
}
fn default_page() -> usize {
    1
}

#[derive(Debug, Clone, Serialize)]
pub struct Page {
    pub file_id: String,
    pub file_name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Record>,
    pub page: usize,
    pub page_size: usize,
    pub total_matches: u64,
    pub total_pages: usize,
}

enum TaskMessage {
    Rows {
        file_id: String,
        file_name: String,
        columns: Arc<Vec<String>>,
        rows: Vec<Record>,
    },
    Done {
        target: SearchTarget,
        result: Result<FileSummary, FileError>,
    },
}

struct FileSummary {
    columns: Arc<Vec<String>>,
    match_count: u64,
    count_exact: bool,
    truncated: bool,
    elapsed_ms: u64,
}

/// Everything a file task needs, shared by all tasks of one search.
struct TaskContext {
    pool: SqlitePool,
    converter: Arc<Converter>,
    column: String,
    term: String,
    mode: SearchMode,
    case_sensitive: bool,
    per_file_cap: usize,
    chunk_size: usize,
    count_matches: bool,
    timeout: Duration,
    dispatched: Arc<AtomicU64>,
    in_flight: Arc<InFlight>,
}

/// File tasks currently holding a worker permit, and the most seen at once.
#[derive(Default)]
struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlight {
    fn enter(self: &Arc<Self>) -> InFlightGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlightGuard(self.clone())
    }
}

struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Orchestrator {
    pool: SqlitePool,
    converter: Arc<Converter>,
    cache: Arc<QueryCache>,
    config: SearchConfig,
    dispatched: Arc<AtomicU64>,
    in_flight: Arc<InFlight>,
}

impl Orchestrator {
    pub fn new(
        pool: SqlitePool,
        converter: Arc<Converter>,
        cache: Arc<QueryCache>,
        config: SearchConfig,
    ) -> Self {
        Self {
            pool,
            converter,
            cache,
            config,
            dispatched: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::default(),
        }
    }

    /// File-level queries started so far. Cache hits do not count.
    pub fn dispatched_queries(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Highest number of file queries that ran at the same time.
    pub fn peak_concurrent_queries(&self) -> usize {
        self.in_flight.peak.load(Ordering::SeqCst)
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    pub fn per_file_cap(&self, request: &SearchRequest) -> usize {
        request
            .per_file_limit
            .unwrap_or(self.config.default_per_file_limit)
            .clamp(1, self.config.max_per_file_limit.max(1))
    }

    pub fn global_cap(&self, request: &SearchRequest) -> usize {
        request
            .global_limit
            .unwrap_or(self.config.default_global_limit)
            .clamp(1, self.config.max_global_limit.max(1))
    }

    fn timeout_for(&self, mode: SearchMode) -> Duration {
        match mode {
            SearchMode::Pattern => self.config.pattern_timeout(),
            _ => self.config.query_timeout(),
        }
    }

    /// Start a search. Returns once the work is scheduled; results arrive
    /// on the stream.
    pub fn search(
        &self,
        catalog: &ColumnCatalog,
        request: SearchRequest,
    ) -> Result<SearchStream, EngineError> {
        if request.column.trim().is_empty() {
            return Err(EngineError::InvalidRequest("column must not be empty".to_string()));
        }
        if request.term.is_empty() {
            return Err(EngineError::InvalidRequest("search term must not be empty".to_string()));
        }

        let (targets, skipped) = resolve_targets(catalog, &request);
        let per_file_cap = self.per_file_cap(&request);
        let global_cap = self.global_cap(&request);
        let file_ids: Vec<String> = targets.iter().map(|t| t.file_id.clone()).collect();
        let fingerprint = cache::fingerprint(&FingerprintInput {
            file_ids: &file_ids,
            catalog_signature: &catalog.signature,
            column: &request.column,
            term: &request.term,
            mode: request.mode,
            case_sensitive: request.case_sensitive,
            per_file_cap,
            global_cap,
        });

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);

        if !request.fresh {
            if let Some(hit) = self.cache.get(&fingerprint) {
                tracing::debug!(fingerprint = %fingerprint, "cache hit");
                let mut outcome = (*hit).clone();
                outcome.cached = true;
                outcome.request = request;
                let pool = self.pool.clone();
                let chunk_size = self.config.chunk_size;
                tokio::spawn(replay(pool, Arc::new(outcome), chunk_size, events_tx));
                return Ok(SearchStream { rx: events_rx });
            }
        }

        let ctx = Arc::new(TaskContext {
            pool: self.pool.clone(),
            converter: self.converter.clone(),
            column: request.column.clone(),
            term: request.term.clone(),
            mode: request.mode,
            case_sensitive: request.case_sensitive,
            per_file_cap,
            chunk_size: self.config.chunk_size,
            count_matches: self.config.count_matches,
            timeout: self.timeout_for(request.mode),
            dispatched: self.dispatched.clone(),
            in_flight: self.in_flight.clone(),
        });

        tracing::info!(
            column = %request.column,
            mode = %request.mode,
            files = targets.len(),
            skipped = skipped.len(),
            "search dispatched"
        );

        let merge = Merge {
            pool: self.pool.clone(),
            cache: self.cache.clone(),
            request,
            fingerprint,
            skipped,
            global_cap,
            max_workers: self.config.max_workers,
        };
        tokio::spawn(merge.run(ctx, targets, events_tx));

        Ok(SearchStream { rx: events_rx })
    }

    /// One page of matches from a single file.
    pub async fn fetch_page(
        &self,
        target: &SearchTarget,
        request: &PageRequest,
    ) -> Result<Page, QueryError> {
        let page_size = request
            .page_size
            .unwrap_or(self.config.page_size)
            .clamp(1, self.config.max_per_file_limit.max(1));
        let page = request.page.max(1);

        let work = async {
            let table = resolve_table(&self.converter, &target.path).await?;
            let column = table
                .column(&request.column)
                .ok_or_else(|| QueryError::ColumnMissing(request.column.clone()))?;
            let predicate = build_predicate(
                &column_expr(&column.name, column.column_type),
                request.mode,
                request.case_sensitive,
                &request.term,
            )?;
            let table_ident = quote_ident(&table.table_id);

            let total = count_matches(&self.pool, &table_ident, &predicate).await?;

            // A page past the end is empty, however far past.
            let offset = (page - 1)
                .checked_mul(page_size)
                .and_then(|o| i64::try_from(o).ok())
                .filter(|&o| o < total as i64);
            let Some(offset) = offset else {
                return Ok(Page {
                    file_id: target.file_id.clone(),
                    file_name: target.file_name.clone(),
                    columns: table.column_names(),
                    rows: Vec::new(),
                    page,
                    page_size,
                    total_matches: total,
                    total_pages: (total as usize).div_ceil(page_size),
                });
            };

            let sql = format!(
                "SELECT {} FROM {} WHERE {} ORDER BY rowid LIMIT ? OFFSET ?",
                select_list(&table),
                table_ident,
                predicate.sql
            );
            let mut query = sqlx::query(&sql);
            for bind in &predicate.binds {
                query = query.bind(bind.clone());
            }
            let rows = query
                .bind(page_size as i64)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?;
            let width = table.columns.len();
            let rows = rows
                .iter()
                .map(|row| decode_record(row, width))
                .collect::<Result<Vec<_>, _>>()?;

            Ok::<_, QueryError>(Page {
                file_id: target.file_id.clone(),
                file_name: target.file_name.clone(),
                columns: table.column_names(),
                rows,
                page,
                page_size,
                total_matches: total,
                total_pages: (total as usize).div_ceil(page_size),
            })
        };

        let timeout = self.timeout_for(request.mode);
        match tokio::time::timeout(timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(QueryError::Timeout(timeout.as_secs())),
        }
    }
}

/// Files to query, and files left out because they lack the column or
/// match no selector.
pub fn resolve_targets(
    catalog: &ColumnCatalog,
    request: &SearchRequest,
) -> (Vec<SearchTarget>, Vec<SkippedFile>) {
    let with_column = catalog.entries(&request.column);
    let mut targets = Vec::new();
    let mut skipped = Vec::new();

    if request.files.is_empty() {
        targets.extend(with_column.iter().map(|e| SearchTarget {
            file_id: e.file_id.clone(),
            path: e.path.clone(),
            file_name: e.file_name.clone(),
        }));
        for file in catalog.files.iter().filter(|f| !f.has_column(&request.column)) {
            skipped.push(SkippedFile {
                file_id: file.file_id.clone(),
                file_name: file.file_name.clone(),
                reason: format!("no column '{}'", request.column),
            });
        }
        return (targets, skipped);
    }

    for selector in &request.files {
        let file = catalog.files.iter().find(|f| {
            &f.file_id == selector
                || &f.file_name == selector
                || f.path.to_string_lossy() == selector.as_str()
        });
        match file {
            Some(file) if targets.iter().any(|t: &SearchTarget| t.file_id == file.file_id) => {}
            Some(file) if file.has_column(&request.column) => targets.push(SearchTarget {
                file_id: file.file_id.clone(),
                path: file.path.clone(),
                file_name: file.file_name.clone(),
            }),
            Some(file) => skipped.push(SkippedFile {
                file_id: file.file_id.clone(),
                file_name: file.file_name.clone(),
                reason: format!("no column '{}'", request.column),
            }),
            None => skipped.push(SkippedFile {
                file_id: selector.clone(),
                file_name: selector.clone(),
                reason: "no such file in the catalog".to_string(),
            }),
        }
    }
    (targets, skipped)
}

/// Send a cached outcome as if it had just been computed.
async fn replay(
    pool: SqlitePool,
    outcome: Arc<SearchOutcome>,
    chunk_size: usize,
    tx: mpsc::Sender<SearchEvent>,
) {
    for result in &outcome.results {
        let columns = Arc::new(result.columns.clone());
        for chunk in result.rows.chunks(chunk_size.max(1)) {
            let event = SearchEvent::Rows {
                file_id: result.file_id.clone(),
                file_name: result.file_name.clone(),
                columns: columns.clone(),
                rows: chunk.to_vec(),
                cached: true,
            };
            if tx.send(event).await.is_err() {
                return;
            }
        }
        let finished = SearchEvent::FileFinished {
            file_id: result.file_id.clone(),
            file_name: result.file_name.clone(),
            match_count: result.match_count,
            count_exact: result.count_exact,
            truncated: result.truncated,
            elapsed_ms: result.elapsed_ms,
        };
        if tx.send(finished).await.is_err() {
            return;
        }
    }
    for error in &outcome.errors {
        if tx.send(SearchEvent::FileFailed(error.clone())).await.is_err() {
            return;
        }
    }
    if let Err(e) = history::record(&pool, &outcome).await {
        tracing::warn!(error = %e, "could not record search history");
    }
    let _ = tx.send(SearchEvent::Completed(outcome)).await;
}

struct Merge {
    pool: SqlitePool,
    cache: Arc<QueryCache>,
    request: SearchRequest,
    fingerprint: String,
    skipped: Vec<SkippedFile>,
    global_cap: usize,
    max_workers: usize,
}

/// Rows gathered for one file while its query runs.
#[derive(Default)]
struct Pending {
    rows: Vec<Record>,
}

impl Merge {
    async fn run(
        self,
        ctx: Arc<TaskContext>,
        targets: Vec<SearchTarget>,
        events: mpsc::Sender<SearchEvent>,
    ) {
        let started = Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.max_workers.max(1)));
        let (task_tx, mut task_rx) = mpsc::channel::<TaskMessage>(self.max_workers.max(1) * 4);

        for target in targets {
            tokio::spawn(run_file_task(
                ctx.clone(),
                target,
                semaphore.clone(),
                task_tx.clone(),
            ));
        }
        drop(task_tx);

        let mut pending: HashMap<String, Pending> = HashMap::new();
        let mut results: Vec<FileSearchResult> = Vec::new();
        let mut errors: Vec<FileError> = Vec::new();
        let mut total_rows = 0usize;
        let mut truncated = false;

        while let Some(message) = task_rx.recv().await {
            let event = match message {
                TaskMessage::Rows {
                    file_id,
                    file_name,
                    columns,
                    mut rows,
                } => {
                    let room = self.global_cap.saturating_sub(total_rows);
                    if rows.len() > room {
                        rows.truncate(room);
                        truncated = true;
                    }
                    if rows.is_empty() {
                        continue;
                    }
                    total_rows += rows.len();
                    pending.entry(file_id.clone()).or_default().rows.extend(rows.iter().cloned());
                    SearchEvent::Rows {
                        file_id,
                        file_name,
                        columns,
                        rows,
                        cached: false,
                    }
                }
                TaskMessage::Done {
                    target,
                    result: Ok(summary),
                } => {
                    let rows = pending.remove(&target.file_id).unwrap_or_default().rows;
                    let event = SearchEvent::FileFinished {
                        file_id: target.file_id.clone(),
                        file_name: target.file_name.clone(),
                        match_count: summary.match_count,
                        count_exact: summary.count_exact,
                        truncated: summary.truncated,
                        elapsed_ms: summary.elapsed_ms,
                    };
                    results.push(FileSearchResult {
                        file_id: target.file_id,
                        path: target.path,
                        file_name: target.file_name,
                        columns: (*summary.columns).clone(),
                        rows,
                        match_count: summary.match_count,
                        count_exact: summary.count_exact,
                        truncated: summary.truncated,
                        elapsed_ms: summary.elapsed_ms,
                    });
                    event
                }
                TaskMessage::Done {
                    target,
                    result: Err(error),
                } => {
                    // Rows already streamed for a failed file are not part
                    // of the outcome.
                    if let Some(partial) = pending.remove(&target.file_id) {
                        total_rows -= partial.rows.len();
                    }
                    errors.push(error.clone());
                    SearchEvent::FileFailed(error)
                }
            };

            if events.send(event).await.is_err() {
                tracing::debug!(fingerprint = %self.fingerprint, "search abandoned by caller");
                return;
            }
        }

        let outcome = Arc::new(SearchOutcome {
            request: self.request,
            fingerprint: self.fingerprint,
            results,
            errors,
            skipped: self.skipped,
            total_rows,
            truncated,
            cached: false,
            elapsed_ms: started.elapsed().as_millis() as u64,
        });

        self.cache.put(&outcome.fingerprint, outcome.clone());
        if let Err(e) = history::record(&self.pool, &outcome).await {
            tracing::warn!(error = %e, "could not record search history");
        }
        tracing::info!(
            files = outcome.results.len(),
            errors = outcome.errors.len(),
            rows = outcome.total_rows,
            elapsed_ms = outcome.elapsed_ms,
            "search completed"
        );
        let _ = events.send(SearchEvent::Completed(outcome)).await;
    }
}

async fn run_file_task(
    ctx: Arc<TaskContext>,
    target: SearchTarget,
    semaphore: Arc<Semaphore>,
    tx: mpsc::Sender<TaskMessage>,
) {
    let Ok(_permit) = semaphore.acquire_owned().await else {
        return;
    };
    if tx.is_closed() {
        return;
    }
    let _running = ctx.in_flight.enter();

    let started = Instant::now();
    let result = query_file(&ctx, &target, &tx, started).await;
    let result = result.map_err(|e| {
        tracing::warn!(file = %target.file_name, error = %e, "file query failed");
        FileError::from_query(&target.file_id, &target.path, &e)
    });
    let _ = tx.send(TaskMessage::Done { target, result }).await;
}

async fn resolve_table(converter: &Converter, path: &Path) -> Result<ConvertedTable, QueryError> {
    if converter.convert_on_search() {
        Ok(converter.ensure_converted(path).await?)
    } else {
        converter.lookup(path).await?.ok_or(QueryError::TableMissing)
    }
}

async fn query_file(
    ctx: &TaskContext,
    target: &SearchTarget,
    tx: &mpsc::Sender<TaskMessage>,
    started: Instant,
) -> Result<FileSummary, QueryError> {
    // Conversion is not part of the query budget.
    let table = resolve_table(&ctx.converter, &target.path).await?;
    let column = table
        .column(&ctx.column)
        .ok_or_else(|| QueryError::ColumnMissing(ctx.column.clone()))?;
    let predicate = build_predicate(
        &column_expr(&column.name, column.column_type),
        ctx.mode,
        ctx.case_sensitive,
        &ctx.term,
    )?;

    ctx.dispatched.fetch_add(1, Ordering::Relaxed);
    let query_started = Instant::now();
    match tokio::time::timeout(ctx.timeout, stream_matches(ctx, target, &table, &predicate, tx)).await
    {
        Ok(Ok((returned, truncated, columns))) => {
            let (match_count, count_exact) = if !truncated {
                (returned, true)
            } else if ctx.count_matches {
                let remaining = ctx.timeout.saturating_sub(query_started.elapsed());
                let table_ident = quote_ident(&table.table_id);
                match tokio::time::timeout(remaining, count_matches(&ctx.pool, &table_ident, &predicate)).await {
                    Ok(count) => (count?, true),
                    Err(_) => return Err(QueryError::Timeout(ctx.timeout.as_secs())),
                }
            } else {
                (returned, false)
            };
            Ok(FileSummary {
                columns,
                match_count,
                count_exact,
                truncated,
                elapsed_ms: started.elapsed().as_millis() as u64,
            })
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(QueryError::Timeout(ctx.timeout.as_secs())),
    }
}

/// Read up to `cap + 1` matching rows, forwarding them in chunks. Returns
/// the rows kept, whether more existed, and the column names.
async fn stream_matches(
    ctx: &TaskContext,
    target: &SearchTarget,
    table: &ConvertedTable,
    predicate: &Predicate,
    tx: &mpsc::Sender<TaskMessage>,
) -> Result<(u64, bool, Arc<Vec<String>>), QueryError> {
    let columns = Arc::new(table.column_names());
    let width = columns.len();
    let sql = format!(
        "SELECT {} FROM {} WHERE {} LIMIT ?",
        select_list(table),
        quote_ident(&table.table_id),
        predicate.sql
    );
    let mut query = sqlx::query(&sql);
    for bind in &predicate.binds {
        query = query.bind(bind.clone());
    }
    let query = query.bind((ctx.per_file_cap + 1) as i64);

    let chunk_size = ctx.chunk_size.max(1);
    let mut chunk: Vec<Record> = Vec::with_capacity(chunk_size.min(ctx.per_file_cap));
    let mut returned: u64 = 0;
    let mut truncated = false;

    let mut stream = query.fetch(&ctx.pool);
    while let Some(row) = stream.try_next().await? {
        if returned as usize == ctx.per_file_cap {
            truncated = true;
            break;
        }
        chunk.push(decode_record(&row, width)?);
        returned += 1;
        if chunk.len() == chunk_size {
            send_rows(tx, target, &columns, std::mem::take(&mut chunk)).await?;
        }
    }
    drop(stream);
    if !chunk.is_empty() {
        send_rows(tx, target, &columns, chunk).await?;
    }
    Ok((returned, truncated, columns))
}

async fn send_rows(
    tx: &mpsc::Sender<TaskMessage>,
    target: &SearchTarget,
    columns: &Arc<Vec<String>>,
    rows: Vec<Record>,
) -> Result<(), QueryError> {
    tx.send(TaskMessage::Rows {
        file_id: target.file_id.clone(),
        file_name: target.file_name.clone(),
        columns: columns.clone(),
        rows,
    })
    .await
    .map_err(|_| QueryError::Abandoned)
}

async fn count_matches(
    pool: &SqlitePool,
    table_ident: &str,
    predicate: &Predicate,
) -> Result<u64, QueryError> {
    let sql = format!("SELECT COUNT(*) FROM {} WHERE {}", table_ident, predicate.sql);
    let mut query = sqlx::query_scalar::<_, i64>(&sql);
    for bind in &predicate.binds {
        query = query.bind(bind.clone());
    }
    Ok(query.fetch_one(pool).await? as u64)
}

fn select_list(table: &ConvertedTable) -> String {
    table
        .columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ")
}

fn column_expr(name: &str, column_type: ColumnType) -> String {
    match column_type {
        ColumnType::Textual | ColumnType::Unknown => quote_ident(name),
        ColumnType::Numeric | ColumnType::Temporal => format!("CAST({} AS TEXT)", quote_ident(name)),
    }
}

/// SQL fragment plus the values for its `?` placeholders, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub sql: String,
    pub binds: Vec<String>,
}

pub fn escape_like(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// `(?i)` regex equivalent to a literal-term mode.
fn folded_literal(mode: SearchMode, term: &str) -> String {
    let literal = regex::escape(term);
    match mode {
        SearchMode::StartsWith => format!("(?i)\\A{}", literal),
        SearchMode::EndsWith => format!("(?i){}\\z", literal),
        SearchMode::Exact => format!("(?i)\\A{}\\z", literal),
        SearchMode::Contains | SearchMode::Pattern => format!("(?i){}", literal),
    }
}

pub fn build_predicate(
    column: &str,
    mode: SearchMode,
    case_sensitive: bool,
    term: &str,
) -> Result<Predicate, QueryError> {
    if !case_sensitive && mode != SearchMode::Pattern && !term.is_ascii() {
        return Ok(Predicate {
            sql: format!("{} REGEXP ?", column),
            binds: vec![folded_literal(mode, term)],
        });
    }

    let (sql, binds) = match (mode, case_sensitive) {
        (SearchMode::Contains, false) => (
            format!("{} LIKE ? ESCAPE '\\'", column),
            vec![format!("%{}%", escape_like(term))],
        ),
        (SearchMode::StartsWith, false) => (
            format!("{} LIKE ? ESCAPE '\\'", column),
            vec![format!("{}%", escape_like(term))],
        ),
        (SearchMode::EndsWith, false) => (
            format!("{} LIKE ? ESCAPE '\\'", column),
            vec![format!("%{}", escape_like(term))],
        ),
        (SearchMode::Exact, false) => (
            format!("{} = ? COLLATE NOCASE", column),
            vec![term.to_string()],
        ),
        (SearchMode::Contains, true) => (
            format!("instr({}, ?) > 0", column),
            vec![term.to_string()],
        ),
        (SearchMode::StartsWith, true) => (
            format!("substr({}, 1, length(?)) = ?", column),
            vec![term.to_string(), term.to_string()],
        ),
        (SearchMode::EndsWith, true) => (
            format!("substr({}, -length(?)) = ?", column),
            vec![term.to_string(), term.to_string()],
        ),
        (SearchMode::Exact, true) => (format!("{} = ?", column), vec![term.to_string()]),
        (SearchMode::Pattern, case_sensitive) => {
            let pattern = if case_sensitive {
                term.to_string()
            } else {
                format!("(?i){}", term)
            };
            // Same engine SQLite's REGEXP uses; reject bad patterns early.
            regex::Regex::new(&pattern)?;
            (format!("{} REGEXP ?", column), vec![pattern])
        }
    };
    Ok(Predicate { sql, binds })
}

fn decode_record(row: &SqliteRow, width: usize) -> Result<Record, sqlx::Error> {
    (0..width).map(|i| decode_cell(row, i)).collect()
}

fn decode_cell(row: &SqliteRow, index: usize) -> Result<CellValue, sqlx::Error> {
    let type_name = {
        let raw = row.try_get_raw(index)?;
        if raw.is_null() {
            return Ok(CellValue::Null);
        }
        raw.type_info().name().to_string()
    };
    Ok(match type_name.as_str() {
        "INTEGER" => CellValue::Integer(row.try_get_unchecked::<i64, _>(index)?),
        "REAL" => CellValue::Real(row.try_get_unchecked::<f64, _>(index)?),
        "BLOB" => CellValue::Text(
            String::from_utf8_lossy(&row.try_get_unchecked::<Vec<u8>, _>(index)?).into_owned(),
        ),
        _ => CellValue::Text(row.try_get_unchecked::<String, _>(index)?),
    })
}
