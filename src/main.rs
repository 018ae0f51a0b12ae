//! # CSV Search CLI (`csvs`)
//!
//! ## Usage
//!
//! ```bash
//! csvs --config ./config/csvs.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `csvs init` | Create the SQLite store and run schema migrations |
//! | `csvs catalog` | List columns across all source files |
//! | `csvs convert` | Convert missing or stale files into tables |
//! | `csvs search <column> <term>` | Search every file that has the column |
//! | `csvs page <file> <column> <term>` | Page through one file's matches |
//! | `csvs export <column> <term>` | Write search results as CSV, XLSX or JSON |
//! | `csvs stats` | Dataset statistics |
//! | `csvs history` | Recent and popular searches |
//! | `csvs cleanup` | Drop tables whose source file is gone |
//! | `csvs serve` | Start the HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! csvs convert --progress human
//! csvs search name apple --mode exact
//! csvs search email @example.com --mode ends-with --file customers.csv
//! csvs export name apple --format xlsx --out apple.xlsx
//! ```

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use csv_search::config;
use csv_search::engine::Engine;
use csv_search::export::{self, ExportFormat, ExportScope};
use csv_search::history;
use csv_search::logging;
use csv_search::models::{SearchEvent, SearchMode, SearchRequest};
use csv_search::progress::{format_number, ProgressMode};
use csv_search::search::PageRequest;
use csv_search::server;
use csv_search::stats;

/// CSV Search CLI: federated search over directories of CSV files.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/csvs.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "csvs",
    about = "Federated search over directories of large CSV files",
    version,
    long_about = "Discovers CSV files under a directory, unifies their column schemas, \
    converts them on demand into an embedded SQLite store, and runs one search \
    across every file that has the requested column."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/csvs.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the store and its metadata tables. Idempotent.
    Init,

    /// List every column found across the source files.
    ///
    /// Shows how many files carry each column and its unified type, followed
    /// by the files that could not be read.
    Catalog {
        /// Print the catalog as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Convert source files into tables.
    ///
    /// Files already converted and unchanged are left alone unless
    /// `--force` is given. Smallest files are converted first.
    Convert {
        /// Reconvert even when the stored table is up to date.
        #[arg(long)]
        force: bool,

        /// Progress output: `off`, `human` or `json` (stderr). Defaults to
        /// `human` on a TTY.
        #[arg(long)]
        progress: Option<ProgressMode>,
    },

    /// Search one column across every file that has it.
    Search {
        column: String,
        term: String,

        /// `contains`, `exact`, `starts-with`, `ends-with` or `pattern`.
        #[arg(long, default_value = "contains")]
        mode: SearchMode,

        /// Restrict to these files (id or name). Repeatable.
        #[arg(long = "file")]
        files: Vec<String>,

        /// Maximum rows per file.
        #[arg(long)]
        limit: Option<usize>,

        /// Maximum rows across all files.
        #[arg(long)]
        global_limit: Option<usize>,

        #[arg(long)]
        case_sensitive: bool,

        /// Bypass the cache.
        #[arg(long)]
        fresh: bool,

        /// Recorded in the search history.
        #[arg(long)]
        user: Option<String>,

        /// Print the final outcome as JSON instead of streaming rows.
        #[arg(long)]
        json: bool,
    },

    /// Show one page of a single file's matches.
    Page {
        /// File id or name.
        file: String,
        column: String,
        term: String,

        #[arg(long, default_value = "contains")]
        mode: SearchMode,

        #[arg(long, default_value_t = 1)]
        page: usize,

        #[arg(long)]
        page_size: Option<usize>,

        #[arg(long)]
        case_sensitive: bool,
    },

    /// Run a search and write its results to a file.
    Export {
        column: String,
        term: String,

        #[arg(long, default_value = "contains")]
        mode: SearchMode,

        /// `csv`, `xlsx` or `json`.
        #[arg(long, default_value = "csv")]
        format: ExportFormat,

        /// Export only this file's results (id or name). Without it every
        /// file's rows are combined with a `source_file` column.
        #[arg(long)]
        file: Option<String>,

        #[arg(long)]
        case_sensitive: bool,

        /// Output path. Defaults to the generated file name in the
        /// current directory.
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Show dataset statistics.
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Show recent searches, or the most popular ones with `--popular`.
    History {
        #[arg(long)]
        user: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: i64,

        #[arg(long)]
        popular: bool,

        /// Window for `--popular`, in days.
        #[arg(long, default_value_t = 7)]
        days: i64,
    },

    /// Drop tables whose source file no longer exists.
    Cleanup,

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging);

    let engine = Engine::open(cfg)
        .await
        .context("failed to open the store")?;

    match cli.command {
        Commands::Init => {
            println!(
                "Store initialized at {}.",
                engine.config().db.path.display()
            );
        }
        Commands::Catalog { json } => {
            let catalog = engine.get_catalog().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&*catalog)?);
            } else {
                println!(
                    "{} files, {} columns",
                    catalog.files.len(),
                    catalog.columns.len()
                );
                println!();
                println!("  {:<32} {:>6}   {}", "COLUMN", "FILES", "TYPE");
                println!("  {}", "-".repeat(52));
                for (name, entries) in &catalog.columns {
                    let ty = catalog
                        .effective_type(name)
                        .map(|t| t.as_str())
                        .unwrap_or("unknown");
                    println!("  {:<32} {:>6}   {}", name, entries.len(), ty);
                }
                if !catalog.failures.is_empty() {
                    println!();
                    println!("Unreadable files:");
                    for failure in &catalog.failures {
                        println!("  {}: {}", failure.path.display(), failure.message);
                    }
                }
            }
        }
        Commands::Convert { force, progress } => {
            let reporter = progress.unwrap_or_else(ProgressMode::default_for_tty).reporter();
            let report = engine.convert_pending(force, reporter.as_ref()).await?;
            let rows: u64 = report.converted.iter().map(|t| t.row_count).sum();
            println!(
                "converted {} files ({} rows), {} up to date, {} failed",
                report.converted.len(),
                format_number(rows),
                report.up_to_date.len(),
                report.failed.len()
            );
            for (path, error) in &report.failed {
                println!("  FAILED {}: {}", path.display(), error);
            }
        }
        Commands::Search {
            column,
            term,
            mode,
            files,
            limit,
            global_limit,
            case_sensitive,
            fresh,
            user,
            json,
        } => {
            let mut request = SearchRequest::new(column, term, mode)
                .files(files)
                .case_sensitive(case_sensitive)
                .fresh(fresh);
            request.per_file_limit = limit;
            request.global_limit = global_limit;
            request.user = user;

            let mut stream = engine.search(request).await?;
            while let Some(event) = stream.next().await {
                match event {
                    SearchEvent::Rows {
                        file_name,
                        columns,
                        rows,
                        ..
                    } if !json => {
                        for row in rows {
                            let cells: Vec<String> = columns
                                .iter()
                                .zip(row.iter())
                                .map(|(c, v)| format!("{}={}", c, v))
                                .collect();
                            println!("{}  {}", file_name, cells.join("  "));
                        }
                    }
                    SearchEvent::FileFailed(error) if !json => {
                        eprintln!("{}: {}", error.path.display(), error.message);
                        if let Some(hint) = &error.hint {
                            eprintln!("  hint: {}", hint);
                        }
                    }
                    SearchEvent::Completed(outcome) => {
                        if json {
                            println!("{}", serde_json::to_string_pretty(&*outcome)?);
                        } else {
                            println!();
                            for result in &outcome.results {
                                let count = if result.count_exact {
                                    format_number(result.match_count)
                                } else {
                                    format!("{}+", format_number(result.match_count))
                                };
                                println!(
                                    "  {:<32} {:>10} matches  {:>6} ms",
                                    result.file_name, count, result.elapsed_ms
                                );
                            }
                            for skipped in &outcome.skipped {
                                println!("  {:<32} skipped: {}", skipped.file_name, skipped.reason);
                            }
                            println!(
                                "{} rows from {} files in {} ms{}{}",
                                format_number(outcome.total_rows as u64),
                                outcome.files_searched(),
                                outcome.elapsed_ms,
                                if outcome.truncated { ", truncated" } else { "" },
                                if outcome.cached { ", cached" } else { "" }
                            );
                        }
                    }
                    _ => {}
                }
            }
        }
        Commands::Page {
            file,
            column,
            term,
            mode,
            page,
            page_size,
            case_sensitive,
        } => {
            let request = PageRequest {
                file,
                column,
                term,
                mode,
                case_sensitive,
                page,
                page_size,
            };
            let page = engine.fetch_page(&request).await??;
            println!("{}", page.columns.join("\t"));
            for row in &page.rows {
                let cells: Vec<String> = row.iter().map(|v| v.to_text()).collect();
                println!("{}", cells.join("\t"));
            }
            eprintln!(
                "page {}/{} of {} ({} matches)",
                page.page, page.total_pages, page.file_name, page.total_matches
            );
        }
        Commands::Export {
            column,
            term,
            mode,
            format,
            file,
            case_sensitive,
            out,
        } => {
            let request = SearchRequest::new(column, term, mode).case_sensitive(case_sensitive);
            let outcome = engine.search_collect(request).await?;
            let scope = match file.as_deref() {
                Some(file) => match outcome.result_for(file) {
                    Some(result) => ExportScope::File(result),
                    None => bail!("no results for file: {}", file),
                },
                None => ExportScope::Combined {
                    results: &outcome.results,
                    term: &outcome.request.term,
                },
            };
            let artifact = export::export(scope, format)?;
            let path = out.unwrap_or_else(|| PathBuf::from(&artifact.filename));
            std::fs::write(&path, &artifact.bytes)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!(
                "wrote {} ({} rows) to {}",
                artifact.filename,
                format_number(outcome.total_rows as u64),
                path.display()
            );
        }
        Commands::Stats { json } => {
            let dataset = stats::collect(&engine).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&dataset)?);
            } else {
                stats::print_stats(&dataset, &engine.config().db.path);
            }
        }
        Commands::History {
            user,
            limit,
            popular,
            days,
        } => {
            if popular {
                for p in history::popular(engine.pool(), limit, days).await? {
                    println!(
                        "  {:>4}x  {}={}  ({:.0} ms avg, {} results)",
                        p.search_count, p.column, p.term, p.avg_execution_ms, p.total_results
                    );
                }
            } else {
                for h in history::history(engine.pool(), user.as_deref(), limit).await? {
                    println!(
                        "  {}  {} {} {:?}  {} results in {} files, {} ms{}",
                        stats::format_ts_relative(h.searched_at),
                        h.column,
                        h.mode,
                        h.term,
                        h.results_found,
                        h.files_searched,
                        h.execution_ms,
                        if h.cached { " (cached)" } else { "" }
                    );
                }
            }
        }
        Commands::Cleanup => {
            let dropped = engine.cleanup_orphans().await?;
            if dropped.is_empty() {
                println!("Nothing to clean up.");
            } else {
                for table in &dropped {
                    println!("dropped {}", table);
                }
            }
        }
        Commands::Serve => {
            server::run_server(Arc::new(engine)).await?;
            return Ok(());
        }
    }

    engine.close().await;
    Ok(())
}
