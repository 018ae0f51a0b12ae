//! The engine: one handle over the store, catalog, converter, cache and
//! orchestrator. This is the API the CLI and the HTTP server drive.

use sqlx::SqlitePool;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::cache::QueryCache;
use crate::catalog;
use crate::config::{validate, Config};
use crate::convert::{ConvertReport, Converter};
use crate::db;
use crate::error::{ConversionError, EngineError, QueryError};
use crate::migrate;
use crate::models::{ColumnCatalog, ConvertedTable, SearchOutcome, SearchRequest};
use crate::progress::ConversionProgressReporter;
use crate::search::{Orchestrator, Page, PageRequest, SearchStream, SearchTarget};

pub struct Engine {
    config: Config,
    pool: SqlitePool,
    converter: Arc<Converter>,
    orchestrator: Orchestrator,
    catalog: RwLock<Option<Arc<ColumnCatalog>>>,
}

impl Engine {
    /// Connect, migrate, and build a cache from `[cache]`.
    pub async fn open(config: Config) -> Result<Self, EngineError> {
        let cache = Arc::new(QueryCache::new(config.cache.ttl(), config.cache.capacity));
        Self::with_cache(config, cache).await
    }

    /// As [`Engine::open`], with a caller-supplied cache.
    pub async fn with_cache(config: Config, cache: Arc<QueryCache>) -> Result<Self, EngineError> {
        validate(&config).map_err(|e| EngineError::Config(e.to_string()))?;
        let pool = db::connect(&config).await?;
        migrate::run_migrations(&pool).await?;

        let converter = Arc::new(Converter::new(
            pool.clone(),
            config.sources.clone(),
            config.conversion.clone(),
        ));
        let orchestrator = Orchestrator::new(
            pool.clone(),
            converter.clone(),
            cache,
            config.search.clone(),
        );

        Ok(Self {
            config,
            pool,
            converter,
            orchestrator,
            catalog: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn converter(&self) -> &Converter {
        &self.converter
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        self.orchestrator.cache()
    }

    pub fn dispatched_queries(&self) -> u64 {
        self.orchestrator.dispatched_queries()
    }

    pub fn peak_concurrent_queries(&self) -> usize {
        self.orchestrator.peak_concurrent_queries()
    }

    pub fn conversions_performed(&self) -> u64 {
        self.converter.conversions_performed()
    }

    /// Current catalog. Rebuilt, and the cache cleared, whenever the
    /// directory listing changed since the last build.
    pub async fn get_catalog(&self) -> Result<Arc<ColumnCatalog>, EngineError> {
        let sources = self.config.sources.clone();
        let listed = tokio::task::spawn_blocking(move || catalog::list_files(&sources))
            .await
            .map_err(|e| EngineError::Task(e.to_string()))??;
        let signature = catalog::signature(&listed);

        if let Some(current) = self.catalog.read().await.as_ref() {
            if current.signature == signature {
                return Ok(current.clone());
            }
        }

        let mut slot = self.catalog.write().await;
        if let Some(current) = slot.as_ref() {
            if current.signature == signature {
                return Ok(current.clone());
            }
        }

        let sources = self.config.sources.clone();
        let mut fresh = tokio::task::spawn_blocking(move || catalog::discover(&sources))
            .await
            .map_err(|e| EngineError::Task(e.to_string()))??;

        let tables = self.converter.tables().await?;
        for file in &mut fresh.files {
            if let Some(table) = tables.iter().find(|t| t.source_path == file.path) {
                if table.source_size == file.size && table.source_modified == file.modified {
                    file.row_count = Some(table.row_count);
                }
            }
        }

        if slot.is_some() {
            tracing::info!("source files changed; clearing query cache");
        }
        self.cache().clear();
        let fresh = Arc::new(fresh);
        *slot = Some(fresh.clone());
        Ok(fresh)
    }

    pub async fn ensure_converted(&self, path: &Path) -> Result<ConvertedTable, ConversionError> {
        self.converter.ensure_converted(path).await
    }

    /// Convert every catalogued file that is missing or stale, smallest
    /// first.
    pub async fn convert_pending(
        &self,
        force: bool,
        reporter: &dyn ConversionProgressReporter,
    ) -> Result<ConvertReport, EngineError> {
        let sources = self.config.sources.clone();
        let listed = tokio::task::spawn_blocking(move || catalog::list_files(&sources))
            .await
            .map_err(|e| EngineError::Task(e.to_string()))??;
        let report = self.converter.convert_all(&listed, force, reporter).await;
        if !report.converted.is_empty() {
            self.cache().clear();
        }
        Ok(report)
    }

    pub async fn search(&self, request: SearchRequest) -> Result<SearchStream, EngineError> {
        let catalog = self.get_catalog().await?;
        self.orchestrator.search(&catalog, request)
    }

    /// Run a search to completion.
    pub async fn search_collect(&self, request: SearchRequest) -> Result<Arc<SearchOutcome>, EngineError> {
        self.search(request).await?.collect().await
    }

    /// A page of one file's matches. The outer error is fatal; the inner
    /// one is about that file only.
    pub async fn fetch_page(
        &self,
        request: &PageRequest,
    ) -> Result<Result<Page, QueryError>, EngineError> {
        let catalog = self.get_catalog().await?;
        let file = catalog
            .files
            .iter()
            .find(|f| f.file_id == request.file || f.file_name == request.file)
            .ok_or_else(|| EngineError::InvalidRequest(format!("no such file: {}", request.file)))?;
        let target = SearchTarget {
            file_id: file.file_id.clone(),
            path: file.path.clone(),
            file_name: file.file_name.clone(),
        };
        Ok(self.orchestrator.fetch_page(&target, request).await)
    }

    /// Drop tables of deleted files. Clears the cache when anything went.
    pub async fn cleanup_orphans(&self) -> Result<Vec<String>, EngineError> {
        let dropped = self.converter.cleanup_orphans().await?;
        if !dropped.is_empty() {
            self.cache().clear();
        }
        Ok(dropped)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
