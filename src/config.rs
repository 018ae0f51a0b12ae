//! TOML configuration.
//!
//! Every section has defaults, so a minimal file only needs the database
//! path and the source directory:
//!
//! ```toml
//! [db]
//! path = "./data/csvs.sqlite"
//!
//! [sources]
//! root = "./data/csv"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub conversion: ConversionConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    /// Upper bound for SQLite heap usage per process, in MiB. Queries that
    /// exceed it fail with a resource error instead of swapping the host.
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u64,
    /// Auxiliary sorter threads SQLite may use per statement.
    #[serde(default = "default_db_threads")]
    pub threads: u32,
    /// Pool size. Defaults to `search.max_workers + 2` when unset.
    #[serde(default)]
    pub max_connections: Option<u32>,
    #[serde(default = "default_busy_timeout_secs")]
    pub busy_timeout_secs: u64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            memory_limit_mb: default_memory_limit_mb(),
            threads: default_db_threads(),
            max_connections: None,
            busy_timeout_secs: default_busy_timeout_secs(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/csvs.sqlite")
}
fn default_memory_limit_mb() -> u64 {
    2048
}
fn default_db_threads() -> u32 {
    4
}
fn default_busy_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourcesConfig {
    #[serde(default = "default_source_root")]
    pub root: PathBuf,
    #[serde(default)]
    pub recursive: bool,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_true")]
    pub has_header: bool,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    /// Any WHATWG encoding label (`utf-8`, `windows-1252`, `latin1`, ...).
    #[serde(default = "default_encoding")]
    pub encoding: String,
    /// Data rows read per file when inferring column types.
    #[serde(default = "default_sample_rows")]
    pub sample_rows: usize,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            root: default_source_root(),
            recursive: false,
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            has_header: true,
            delimiter: default_delimiter(),
            encoding: default_encoding(),
            sample_rows: default_sample_rows(),
        }
    }
}

impl SourcesConfig {
    pub fn delimiter_byte(&self) -> u8 {
        self.delimiter as u8
    }

    pub fn encoding(&self) -> &'static encoding_rs::Encoding {
        encoding_rs::Encoding::for_label(self.encoding.as_bytes()).unwrap_or(encoding_rs::UTF_8)
    }
}

fn default_source_root() -> PathBuf {
    PathBuf::from("./data/csv")
}
fn default_include_globs() -> Vec<String> {
    vec!["*.csv".to_string()]
}
fn default_true() -> bool {
    true
}
fn default_delimiter() -> char {
    ','
}
fn default_encoding() -> String {
    "utf-8".to_string()
}
fn default_sample_rows() -> usize {
    100
}

/// What to do with rows whose field count does not match the header, or
/// whose bytes cannot be decoded.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MalformedRows {
    /// Drop the row and count it.
    #[default]
    Skip,
    /// Pad or truncate to the header width and decode lossily.
    Coerce,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConversionConfig {
    #[serde(default = "default_batch_rows")]
    pub batch_rows: usize,
    #[serde(default)]
    pub malformed_rows: MalformedRows,
    /// Conversion fails once more rows than this were skipped. Unlimited
    /// when unset.
    #[serde(default)]
    pub max_skipped_rows: Option<u64>,
    /// Convert stale or missing tables lazily when a search touches them.
    #[serde(default = "default_true")]
    pub convert_on_search: bool,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            batch_rows: default_batch_rows(),
            malformed_rows: MalformedRows::default(),
            max_skipped_rows: None,
            convert_on_search: true,
        }
    }
}

fn default_batch_rows() -> usize {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_per_file_limit")]
    pub default_per_file_limit: usize,
    #[serde(default = "default_max_limit")]
    pub max_per_file_limit: usize,
    #[serde(default = "default_global_limit")]
    pub default_global_limit: usize,
    #[serde(default = "default_max_limit")]
    pub max_global_limit: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
    /// Pattern (regex) mode is evaluated row by row inside SQLite and gets
    /// its own, usually tighter, budget.
    #[serde(default = "default_pattern_timeout_secs")]
    pub pattern_timeout_secs: u64,
    /// Run a `COUNT(*)` for truncated files so the reported match count is
    /// exact.
    #[serde(default = "default_true")]
    pub count_matches: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            default_per_file_limit: default_per_file_limit(),
            max_per_file_limit: default_max_limit(),
            default_global_limit: default_global_limit(),
            max_global_limit: default_max_limit(),
            chunk_size: default_chunk_size(),
            page_size: default_page_size(),
            query_timeout_secs: default_query_timeout_secs(),
            pattern_timeout_secs: default_pattern_timeout_secs(),
            count_matches: true,
        }
    }
}

impl SearchConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn pattern_timeout(&self) -> Duration {
        Duration::from_secs(self.pattern_timeout_secs)
    }
}

fn default_max_workers() -> usize {
    3
}
fn default_per_file_limit() -> usize {
    1_000
}
fn default_global_limit() -> usize {
    5_000
}
fn default_max_limit() -> usize {
    50_000
}
fn default_chunk_size() -> usize {
    1_000
}
fn default_page_size() -> usize {
    500
}
fn default_query_timeout_secs() -> u64 {
    120
}
fn default_pattern_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// Maximum number of cached searches. `0` disables the cache.
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            capacity: default_cache_capacity(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

fn default_ttl_secs() -> u64 {
    3_600
}
fn default_cache_capacity() -> usize {
    256
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8501".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// `tracing-subscriber` filter directive, overridden by `RUST_LOG`.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

fn default_log_filter() -> String {
    "info,sqlx=warn".to_string()
}

impl Config {
    /// Pool size: explicit `db.max_connections`, or enough for every search
    /// worker plus a writer and a metadata reader.
    pub fn max_connections(&self) -> u32 {
        self.db
            .max_connections
            .unwrap_or(self.search.max_workers as u32 + 2)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.search.max_workers == 0 {
        bail!("search.max_workers must be >= 1");
    }
    if config.search.chunk_size == 0 {
        bail!("search.chunk_size must be >= 1");
    }
    if config.search.page_size == 0 {
        bail!("search.page_size must be >= 1");
    }
    if config.search.default_per_file_limit == 0 || config.search.default_global_limit == 0 {
        bail!("search default limits must be >= 1");
    }
    if config.search.default_per_file_limit > config.search.max_per_file_limit {
        bail!("search.default_per_file_limit must not exceed search.max_per_file_limit");
    }
    if config.search.default_global_limit > config.search.max_global_limit {
        bail!("search.default_global_limit must not exceed search.max_global_limit");
    }
    if config.search.query_timeout_secs == 0 || config.search.pattern_timeout_secs == 0 {
        bail!("search timeouts must be >= 1 second");
    }
    if config.conversion.batch_rows == 0 {
        bail!("conversion.batch_rows must be >= 1");
    }
    if !config.sources.delimiter.is_ascii() {
        bail!(
            "sources.delimiter must be a single ASCII character, got '{}'",
            config.sources.delimiter
        );
    }
    match encoding_rs::Encoding::for_label(config.sources.encoding.as_bytes()) {
        None => bail!("Unknown sources.encoding: '{}'", config.sources.encoding),
        // Fields are split on raw bytes before decoding.
        Some(enc) if !enc.is_ascii_compatible() => bail!(
            "sources.encoding '{}' is not ASCII-compatible and cannot be split into fields",
            config.sources.encoding
        ),
        Some(_) => {}
    }
    if config.sources.include_globs.is_empty() {
        bail!("sources.include_globs must not be empty");
    }
    if config.db.threads == 0 {
        bail!("db.threads must be >= 1");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [db]
            path = "/tmp/x.sqlite"

            [sources]
            root = "/tmp/csv"
            "#,
        )
        .unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.search.max_workers, 3);
        assert_eq!(cfg.cache.ttl_secs, 3600);
        assert_eq!(cfg.conversion.malformed_rows, MalformedRows::Skip);
        assert_eq!(cfg.sources.include_globs, vec!["*.csv".to_string()]);
        assert_eq!(cfg.max_connections(), 5);
    }

    #[test]
    fn rejects_default_above_max() {
        let cfg: Config = toml::from_str(
            r#"
            [search]
            default_per_file_limit = 100
            max_per_file_limit = 10
            "#,
        )
        .unwrap();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn rejects_unknown_encoding() {
        let cfg: Config = toml::from_str(
            r#"
            [sources]
            encoding = "klingon-8"
            "#,
        )
        .unwrap();
        let err = validate(&cfg).unwrap_err();
        assert!(err.to_string().contains("klingon-8"));
    }

    #[test]
    fn malformed_rows_policy_parses() {
        let cfg: Config = toml::from_str(
            r#"
            [conversion]
            malformed_rows = "coerce"
            max_skipped_rows = 5
            "#,
        )
        .unwrap();
        assert_eq!(cfg.conversion.malformed_rows, MalformedRows::Coerce);
        assert_eq!(cfg.conversion.max_skipped_rows, Some(5));
    }

    #[test]
    fn example_config_is_valid() {
        let cfg: Config = toml::from_str(include_str!("../config/csvs.example.toml")).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.server.bind, "127.0.0.1:8501");
        assert_eq!(cfg.search.pattern_timeout(), Duration::from_secs(30));
    }
}
