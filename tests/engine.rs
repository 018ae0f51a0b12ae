use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use csv_search::cache::QueryCache;
use csv_search::config::Config;
use csv_search::engine::Engine;
use csv_search::error::{ConversionError, EngineError, FileErrorKind, QueryError};
use csv_search::export::{self, ExportFormat, ExportScope, PROVENANCE_COLUMN};
use csv_search::history;
use csv_search::models::{CellValue, ColumnType, SearchEvent, SearchMode, SearchRequest};
use csv_search::progress::NoProgress;
use csv_search::search::PageRequest;

struct Fixture {
    _tmp: TempDir,
    csv_dir: PathBuf,
    config: Config,
}

impl Fixture {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let csv_dir = tmp.path().join("csv");
        fs::create_dir_all(&csv_dir).unwrap();

        let mut config = Config::default();
        config.db.path = tmp.path().join("data").join("csvs.sqlite");
        config.sources.root = csv_dir.clone();
        config.search.chunk_size = 2;

        Self {
            _tmp: tmp,
            csv_dir,
            config,
        }
    }

    fn write(&self, name: &str, content: &str) -> PathBuf {
        let path = self.csv_dir.join(name);
        fs::write(&path, content).unwrap();
        path.canonicalize().unwrap()
    }

    async fn engine(&self) -> Engine {
        Engine::open(self.config.clone()).await.unwrap()
    }
}

const FRUIT: &str = "name,price\nApple,1\napple pie,2\nPineapple,3\nAPPLE,4\nBanana,5\n";

fn names(rows: &[Vec<CellValue>]) -> Vec<String> {
    let mut out: Vec<String> = rows.iter().map(|r| r[0].to_text()).collect();
    out.sort();
    out
}

#[tokio::test]
async fn catalog_maps_columns_to_files() {
    let fx = Fixture::new();
    fx.write("one.csv", "a,b\n1,2\n");
    fx.write("two.csv", "b,c\n3,4\n");
    let engine = fx.engine().await;

    let catalog = engine.get_catalog().await.unwrap();
    let files_of = |col: &str| -> Vec<String> {
        let mut f: Vec<String> = catalog.entries(col).iter().map(|e| e.file_name.clone()).collect();
        f.sort();
        f
    };
    assert_eq!(files_of("a"), vec!["one.csv"]);
    assert_eq!(files_of("b"), vec!["one.csv", "two.csv"]);
    assert_eq!(files_of("c"), vec!["two.csv"]);
    assert!(catalog.failures.is_empty());
}

#[tokio::test]
async fn catalog_is_rebuilt_when_files_change() {
    let fx = Fixture::new();
    fx.write("one.csv", "a\n1\n");
    let engine = fx.engine().await;

    let first = engine.get_catalog().await.unwrap();
    let again = engine.get_catalog().await.unwrap();
    assert!(Arc::ptr_eq(&first, &again));

    fx.write("two.csv", "z\n1\n");
    let rebuilt = engine.get_catalog().await.unwrap();
    assert_eq!(rebuilt.files.len(), 2);
    assert_eq!(rebuilt.entries("z").len(), 1);
}

#[tokio::test]
async fn conflicting_column_types_widen_to_textual() {
    let fx = Fixture::new();
    fx.write("a.csv", "user_id\n1\n2\n");
    fx.write("b.csv", "user_id\nabc\n");
    let engine = fx.engine().await;

    let catalog = engine.get_catalog().await.unwrap();
    let mut types: Vec<ColumnType> = catalog.entries("user_id").iter().map(|e| e.column_type).collect();
    types.sort_by_key(|t| t.as_str());
    assert_eq!(types, vec![ColumnType::Numeric, ColumnType::Textual]);
    assert_eq!(catalog.effective_type("user_id"), Some(ColumnType::Textual));
}

#[tokio::test]
async fn missing_source_root_is_fatal() {
    let mut fx = Fixture::new();
    fx.config.sources.root = fx.csv_dir.join("nope");
    let engine = fx.engine().await;
    assert!(engine.get_catalog().await.is_err());
}

#[tokio::test]
async fn ensure_converted_is_idempotent() {
    let fx = Fixture::new();
    let path = fx.write("fruit.csv", FRUIT);
    let engine = fx.engine().await;

    let first = engine.ensure_converted(&path).await.unwrap();
    let second = engine.ensure_converted(&path).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.row_count, 5);
    assert_eq!(first.column_names(), vec!["name", "price"]);
    assert_eq!(engine.conversions_performed(), 1);
}

#[tokio::test]
async fn changed_file_is_reconverted() {
    let fx = Fixture::new();
    let path = fx.write("fruit.csv", FRUIT);
    let engine = fx.engine().await;

    let first = engine.ensure_converted(&path).await.unwrap();
    fx.write("fruit.csv", &format!("{}Cherry,6\nDate,7\n", FRUIT));
    let second = engine.ensure_converted(&path).await.unwrap();

    assert_ne!(first, second);
    assert_eq!(second.row_count, 7);
    assert_eq!(engine.conversions_performed(), 2);
}

#[tokio::test]
async fn concurrent_callers_share_one_conversion() {
    let fx = Fixture::new();
    let path = fx.write("fruit.csv", FRUIT);
    let engine = Arc::new(fx.engine().await);

    let mut handles = Vec::new();
    for _ in 0..4 {
        let engine = engine.clone();
        let path = path.clone();
        handles.push(tokio::spawn(async move { engine.ensure_converted(&path).await }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap().row_count, 5);
    }
    assert_eq!(engine.conversions_performed(), 1);
}

#[tokio::test]
async fn failed_conversion_is_remembered_until_the_file_changes() {
    let mut fx = Fixture::new();
    fx.config.conversion.max_skipped_rows = Some(0);
    let path = fx.write("bad.csv", "name,price\nok,1\nragged\n");
    let engine = fx.engine().await;

    let err = engine.ensure_converted(&path).await.unwrap_err();
    assert!(matches!(err, ConversionError::TooManyMalformedRows { .. }));

    let err = engine.ensure_converted(&path).await.unwrap_err();
    assert!(matches!(err, ConversionError::PreviouslyFailed(_)));
    assert_eq!(engine.converter().failures().await.unwrap().len(), 1);

    fx.write("bad.csv", "name,price\nok,1\nfine,20\n");
    let table = engine.ensure_converted(&path).await.unwrap();
    assert_eq!(table.row_count, 2);
    assert!(engine.converter().failures().await.unwrap().is_empty());
}

#[tokio::test]
async fn search_modes_match_expected_rows() {
    let fx = Fixture::new();
    fx.write("fruit.csv", FRUIT);
    let engine = fx.engine().await;

    let count = |mode| {
        let engine = &engine;
        async move {
            let outcome = engine
                .search_collect(SearchRequest::new("name", "apple", mode))
                .await
                .unwrap();
            assert!(outcome.errors.is_empty(), "{:?}", outcome.errors);
            names(&outcome.results[0].rows)
        }
    };

    assert_eq!(
        count(SearchMode::Contains).await,
        vec!["APPLE", "Apple", "Pineapple", "apple pie"]
    );
    assert_eq!(count(SearchMode::Exact).await, vec!["APPLE", "Apple"]);
    assert_eq!(count(SearchMode::StartsWith).await, vec!["APPLE", "Apple", "apple pie"]);
    assert_eq!(count(SearchMode::EndsWith).await, vec!["APPLE", "Apple", "Pineapple"]);
    assert_eq!(count(SearchMode::Pattern).await, vec!["APPLE", "Apple", "Pineapple", "apple pie"]);
}

#[tokio::test]
async fn case_sensitive_search_respects_case() {
    let fx = Fixture::new();
    fx.write("fruit.csv", FRUIT);
    let engine = fx.engine().await;

    let outcome = engine
        .search_collect(SearchRequest::new("name", "apple", SearchMode::Contains).case_sensitive(true))
        .await
        .unwrap();
    assert_eq!(names(&outcome.results[0].rows), vec!["Pineapple", "apple pie"]);
}

#[tokio::test]
async fn case_insensitive_modes_fold_non_ascii_letters() {
    let fx = Fixture::new();
    fx.write("words.csv", "word\nÄpfel\näpfel\nÉCOLE\nschool\n");
    let engine = fx.engine().await;

    let find = |term: &'static str, mode| {
        let engine = &engine;
        async move {
            let outcome = engine
                .search_collect(SearchRequest::new("word", term, mode))
                .await
                .unwrap();
            assert!(outcome.errors.is_empty(), "{:?}", outcome.errors);
            names(&outcome.results[0].rows)
        }
    };

    assert_eq!(find("äpfel", SearchMode::Contains).await, vec!["Äpfel", "äpfel"]);
    assert_eq!(find("ÄPF", SearchMode::StartsWith).await, vec!["Äpfel", "äpfel"]);
    assert_eq!(find("école", SearchMode::EndsWith).await, vec!["ÉCOLE"]);
    assert_eq!(find("école", SearchMode::Exact).await, vec!["ÉCOLE"]);
    assert_eq!(find("école", SearchMode::Pattern).await, vec!["ÉCOLE"]);

    let outcome = engine
        .search_collect(SearchRequest::new("word", "äpfel", SearchMode::Contains).case_sensitive(true))
        .await
        .unwrap();
    assert_eq!(names(&outcome.results[0].rows), vec!["äpfel"]);
}

#[tokio::test]
async fn numeric_columns_are_searched_as_text() {
    let fx = Fixture::new();
    fx.write("fruit.csv", FRUIT);
    let engine = fx.engine().await;

    let outcome = engine
        .search_collect(SearchRequest::new("price", "4", SearchMode::Exact))
        .await
        .unwrap();
    let rows = &outcome.results[0].rows;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][1], CellValue::Integer(4));
}

#[tokio::test]
async fn like_wildcards_in_the_term_are_literal() {
    let fx = Fixture::new();
    fx.write("codes.csv", "code\n50%\n500\n5_0\n");
    let engine = fx.engine().await;

    let outcome = engine
        .search_collect(SearchRequest::new("code", "50%", SearchMode::Contains))
        .await
        .unwrap();
    assert_eq!(names(&outcome.results[0].rows), vec!["50%"]);

    let outcome = engine
        .search_collect(SearchRequest::new("code", "5_", SearchMode::StartsWith))
        .await
        .unwrap();
    assert_eq!(names(&outcome.results[0].rows), vec!["5_0"]);
}

#[tokio::test]
async fn per_file_cap_truncates_and_counts() {
    let fx = Fixture::new();
    let mut content = String::from("name\n");
    for i in 0..20 {
        content.push_str(&format!("item {}\n", i));
    }
    fx.write("items.csv", &content);
    let engine = fx.engine().await;

    let outcome = engine
        .search_collect(SearchRequest::new("name", "item", SearchMode::Contains).per_file_limit(5))
        .await
        .unwrap();
    let result = &outcome.results[0];
    assert_eq!(result.rows.len(), 5);
    assert!(result.truncated);
    assert_eq!(result.match_count, 20);
    assert!(result.count_exact);
}

#[tokio::test]
async fn global_cap_bounds_the_combined_rows() {
    let fx = Fixture::new();
    for f in ["a.csv", "b.csv", "c.csv"] {
        fx.write(f, "name\nx1\nx2\nx3\nx4\n");
    }
    let engine = fx.engine().await;

    let outcome = engine
        .search_collect(
            SearchRequest::new("name", "x", SearchMode::StartsWith)
                .per_file_limit(3)
                .global_limit(7),
        )
        .await
        .unwrap();
    let total: usize = outcome.results.iter().map(|r| r.rows.len()).sum();
    assert_eq!(total, 7);
    assert_eq!(outcome.total_rows, 7);
    assert!(outcome.truncated);
    assert!(outcome.results.iter().all(|r| r.rows.len() <= 3));
}

#[tokio::test]
async fn one_bad_file_does_not_fail_the_search() {
    let mut fx = Fixture::new();
    fx.config.conversion.max_skipped_rows = Some(0);
    fx.write("good1.csv", "name\napple\n");
    fx.write("good2.csv", "name\ncrabapple\n");
    fx.write("bad.csv", "name,extra\napple,1\nragged\n");
    let engine = fx.engine().await;

    let outcome = engine
        .search_collect(SearchRequest::new("name", "apple", SearchMode::Contains))
        .await
        .unwrap();
    assert_eq!(outcome.results.len(), 2);
    assert_eq!(outcome.errors.len(), 1);
    let error = &outcome.errors[0];
    assert_eq!(error.kind, FileErrorKind::Conversion);
    assert!(error.path.ends_with("bad.csv"));
    assert!(error.hint.is_some());
}

#[tokio::test]
async fn files_without_the_column_are_skipped() {
    let fx = Fixture::new();
    fx.write("fruit.csv", FRUIT);
    fx.write("people.csv", "email\na@b.c\n");
    let engine = fx.engine().await;

    let outcome = engine
        .search_collect(SearchRequest::new("name", "apple", SearchMode::Contains))
        .await
        .unwrap();
    assert_eq!(outcome.results.len(), 1);
    assert_eq!(outcome.skipped.len(), 1);
    assert_eq!(outcome.skipped[0].file_name, "people.csv");
    assert_eq!(engine.dispatched_queries(), 1);
}

#[tokio::test]
async fn bad_pattern_is_reported_per_file() {
    let fx = Fixture::new();
    fx.write("fruit.csv", FRUIT);
    let engine = fx.engine().await;

    let outcome = engine
        .search_collect(SearchRequest::new("name", "(unclosed", SearchMode::Pattern))
        .await
        .unwrap();
    assert!(outcome.results.is_empty());
    assert_eq!(outcome.errors[0].kind, FileErrorKind::InvalidPattern);
}

#[tokio::test]
async fn empty_term_is_rejected() {
    let fx = Fixture::new();
    fx.write("fruit.csv", FRUIT);
    let engine = fx.engine().await;
    assert!(engine
        .search(SearchRequest::new("name", "", SearchMode::Contains))
        .await
        .is_err());
}

#[tokio::test]
async fn repeated_search_is_served_from_cache() {
    let fx = Fixture::new();
    fx.write("fruit.csv", FRUIT);
    fx.write("more.csv", "name\nappletini\n");
    let engine = fx.engine().await;
    let request = SearchRequest::new("name", "apple", SearchMode::Contains);

    let first = engine.search_collect(request.clone()).await.unwrap();
    assert_eq!(engine.dispatched_queries(), 2);
    assert!(!first.cached);

    let second = engine.search_collect(request.clone()).await.unwrap();
    assert_eq!(engine.dispatched_queries(), 2);
    assert!(second.cached);
    assert_eq!(first.results, second.results);
    assert_eq!(first.fingerprint, second.fingerprint);

    engine.search_collect(request.fresh(true)).await.unwrap();
    assert_eq!(engine.dispatched_queries(), 4);
}

#[tokio::test]
async fn expired_cache_entries_dispatch_again() {
    let fx = Fixture::new();
    fx.write("fruit.csv", FRUIT);
    let cache = Arc::new(QueryCache::new(Duration::from_millis(200), 16));
    let engine = Engine::with_cache(fx.config.clone(), cache).await.unwrap();
    let request = SearchRequest::new("name", "apple", SearchMode::Contains);

    engine.search_collect(request.clone()).await.unwrap();
    engine.search_collect(request.clone()).await.unwrap();
    assert_eq!(engine.dispatched_queries(), 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let outcome = engine.search_collect(request).await.unwrap();
    assert!(!outcome.cached);
    assert_eq!(engine.dispatched_queries(), 2);
}

#[tokio::test]
async fn changed_files_invalidate_the_cache() {
    let fx = Fixture::new();
    fx.write("fruit.csv", FRUIT);
    let engine = fx.engine().await;
    let request = SearchRequest::new("name", "apple", SearchMode::Contains);

    engine.search_collect(request.clone()).await.unwrap();
    fx.write("fruit.csv", &format!("{}Toffee apple,9\n", FRUIT));

    let outcome = engine.search_collect(request).await.unwrap();
    assert!(!outcome.cached);
    assert_eq!(outcome.results[0].rows.len(), 5);
}

#[tokio::test]
async fn stream_delivers_rows_before_completion() {
    let fx = Fixture::new();
    fx.write("fruit.csv", FRUIT);
    let engine = fx.engine().await;

    let mut stream = engine
        .search(SearchRequest::new("name", "apple", SearchMode::Contains))
        .await
        .unwrap();
    let mut chunks = 0;
    let mut rows = 0;
    let mut finished = 0;
    let mut completed = None;
    while let Some(event) = stream.next().await {
        match event {
            SearchEvent::Rows { rows: r, .. } => {
                assert!(completed.is_none());
                assert!(r.len() <= 2);
                chunks += 1;
                rows += r.len();
            }
            SearchEvent::FileFinished { match_count, .. } => {
                finished += 1;
                assert_eq!(match_count, 4);
            }
            SearchEvent::FileFailed(e) => panic!("unexpected failure: {:?}", e),
            SearchEvent::Completed(outcome) => completed = Some(outcome),
        }
    }
    assert_eq!((chunks, rows, finished), (2, 4, 1));
    assert_eq!(completed.unwrap().total_rows, 4);
}

#[tokio::test]
async fn csv_export_round_trips() {
    let fx = Fixture::new();
    fx.write("fruit.csv", "name,note\nApple,\"red, crisp\"\nPineapple,\"says \"\"hi\"\"\"\n");
    let engine = fx.engine().await;

    let outcome = engine
        .search_collect(SearchRequest::new("name", "apple", SearchMode::Contains))
        .await
        .unwrap();
    let result = &outcome.results[0];
    let artifact = export::export(ExportScope::File(result), ExportFormat::Csv).unwrap();
    assert!(artifact.filename.ends_with(".csv"));

    let mut reader = csv::Reader::from_reader(artifact.bytes.as_slice());
    let headers: Vec<String> = reader.headers().unwrap().iter().map(String::from).collect();
    assert_eq!(headers, result.columns);
    let parsed: Vec<Vec<String>> = reader
        .records()
        .map(|r| r.unwrap().iter().map(String::from).collect())
        .collect();
    let expected: Vec<Vec<String>> = result
        .rows
        .iter()
        .map(|r| r.iter().map(CellValue::to_text).collect())
        .collect();
    assert_eq!(parsed, expected);
}

#[tokio::test]
async fn combined_export_tags_the_source_file() {
    let fx = Fixture::new();
    fx.write("a.csv", "name\napple\n");
    fx.write("b.csv", "name,color\napple,green\n");
    let engine = fx.engine().await;

    let outcome = engine
        .search_collect(SearchRequest::new("name", "apple", SearchMode::Exact))
        .await
        .unwrap();
    let artifact = export::export(
        ExportScope::Combined {
            results: &outcome.results,
            term: "apple",
        },
        ExportFormat::Json,
    )
    .unwrap();
    let rows: Vec<serde_json::Value> = serde_json::from_slice(&artifact.bytes).unwrap();
    assert_eq!(rows.len(), 2);
    let mut sources: Vec<&str> = rows
        .iter()
        .map(|r| r[PROVENANCE_COLUMN].as_str().unwrap())
        .collect();
    sources.sort();
    assert_eq!(sources, vec!["a.csv", "b.csv"]);
}

#[tokio::test]
async fn pages_walk_matches_in_file_order() {
    let fx = Fixture::new();
    let mut content = String::from("name\n");
    for i in 0..7 {
        content.push_str(&format!("row{}\n", i));
    }
    fx.write("rows.csv", &content);
    let engine = fx.engine().await;

    let request = |page| PageRequest {
        file: "rows.csv".to_string(),
        column: "name".to_string(),
        term: "row".to_string(),
        mode: SearchMode::StartsWith,
        case_sensitive: false,
        page,
        page_size: Some(3),
    };

    let first = engine.fetch_page(&request(1)).await.unwrap().unwrap();
    assert_eq!(first.total_matches, 7);
    assert_eq!(first.total_pages, 3);
    assert_eq!(first.rows[0][0].to_text(), "row0");

    let last = engine.fetch_page(&request(3)).await.unwrap().unwrap();
    assert_eq!(last.rows.len(), 1);
    assert_eq!(last.rows[0][0].to_text(), "row6");

    let mut missing_column = request(1);
    missing_column.column = "nope".to_string();
    let err = engine.fetch_page(&missing_column).await.unwrap().unwrap_err();
    assert!(matches!(err, QueryError::ColumnMissing(_)));
}

#[tokio::test]
async fn page_far_past_the_end_is_empty() {
    let fx = Fixture::new();
    fx.write("rows.csv", "name\nrow0\nrow1\n");
    let engine = fx.engine().await;

    let request = |page| PageRequest {
        file: "rows.csv".to_string(),
        column: "name".to_string(),
        term: "row".to_string(),
        mode: SearchMode::StartsWith,
        case_sensitive: false,
        page,
        page_size: Some(500),
    };

    for page in [2, usize::MAX] {
        let past = engine.fetch_page(&request(page)).await.unwrap().unwrap();
        assert!(past.rows.is_empty());
        assert_eq!(past.total_matches, 2);
        assert_eq!(past.total_pages, 1);
    }
}

#[tokio::test]
async fn searches_are_recorded_in_history() {
    let fx = Fixture::new();
    fx.write("fruit.csv", FRUIT);
    let engine = fx.engine().await;

    let request = SearchRequest::new("name", "apple", SearchMode::Contains).user("alice");
    engine.search_collect(request.clone()).await.unwrap();
    engine.search_collect(request).await.unwrap();
    engine
        .search_collect(SearchRequest::new("name", "banana", SearchMode::Exact))
        .await
        .unwrap();

    let mine = history::history(engine.pool(), Some("alice"), 10).await.unwrap();
    assert_eq!(mine.len(), 2);
    assert!(mine.iter().any(|h| h.cached));

    let popular = history::popular(engine.pool(), 5, 1).await.unwrap();
    assert_eq!(popular[0].term, "apple");
    assert_eq!(popular[0].search_count, 2);
}

#[tokio::test]
async fn orphaned_tables_are_dropped() {
    let fx = Fixture::new();
    let keep = fx.write("keep.csv", FRUIT);
    let gone = fx.write("gone.csv", FRUIT);
    let engine = fx.engine().await;

    engine.ensure_converted(&keep).await.unwrap();
    let table = engine.ensure_converted(&gone).await.unwrap();
    fs::remove_file(&gone).unwrap();

    let dropped = engine.cleanup_orphans().await.unwrap();
    assert_eq!(dropped, vec![table.table_id]);
    let tables = engine.converter().tables().await.unwrap();
    assert_eq!(tables.len(), 1);
    assert_eq!(tables[0].file_name, "keep.csv");
}

#[tokio::test]
async fn convert_pending_skips_up_to_date_files() {
    let fx = Fixture::new();
    fx.write("a.csv", FRUIT);
    fx.write("b.csv", "name\nx\n");
    let engine = fx.engine().await;

    let report = engine.convert_pending(false, &NoProgress).await.unwrap();
    assert_eq!(report.converted.len(), 2);
    assert_eq!(report.converted[0].file_name, "b.csv");

    let report = engine.convert_pending(false, &NoProgress).await.unwrap();
    assert!(report.converted.is_empty());
    assert_eq!(report.up_to_date.len(), 2);

    let report = engine.convert_pending(true, &NoProgress).await.unwrap();
    assert_eq!(report.converted.len(), 2);
}

#[tokio::test]
async fn invalid_config_is_rejected_on_open() {
    let mut fx = Fixture::new();
    fx.config.search.max_global_limit = 0;
    let err = Engine::open(fx.config.clone()).await.err().unwrap();
    assert!(matches!(err, EngineError::Config(_)));
}

fn many_rows(prefix: &str, n: usize) -> String {
    let mut content = String::from("name\n");
    for i in 0..n {
        content.push_str(&format!("{}{}\n", prefix, i));
    }
    content
}

#[tokio::test]
async fn file_queries_never_exceed_max_workers() {
    let mut fx = Fixture::new();
    fx.config.search.max_workers = 1;
    for f in ["a.csv", "b.csv", "c.csv", "d.csv"] {
        fx.write(f, &many_rows("x", 10));
    }
    let engine = fx.engine().await;

    let outcome = engine
        .search_collect(SearchRequest::new("name", "x", SearchMode::StartsWith))
        .await
        .unwrap();
    assert_eq!(outcome.results.len(), 4);
    assert_eq!(engine.dispatched_queries(), 4);
    assert_eq!(engine.peak_concurrent_queries(), 1);
}

#[tokio::test]
async fn worker_pool_is_shared_up_to_its_size() {
    let mut fx = Fixture::new();
    fx.config.search.max_workers = 3;
    for i in 0..6 {
        fx.write(&format!("f{}.csv", i), &many_rows("x", 10));
    }
    let engine = fx.engine().await;

    let outcome = engine
        .search_collect(SearchRequest::new("name", "x", SearchMode::Contains))
        .await
        .unwrap();
    assert_eq!(outcome.results.len(), 6);
    let peak = engine.peak_concurrent_queries();
    assert!((1..=3).contains(&peak), "peak {}", peak);
}

#[tokio::test]
async fn slow_file_times_out_without_failing_the_others() {
    let mut fx = Fixture::new();
    fx.config.search.max_workers = 1;
    fx.config.search.pattern_timeout_secs = 1;
    fx.write("a.csv", "name\nx-small\n");
    fx.write("b.csv", "name\nx-tiny\n");
    // Far more row chunks than the event buffers hold, so the query stalls
    // while nobody reads the stream.
    fx.write("big.csv", &many_rows("x", 500));
    let engine = fx.engine().await;
    engine.convert_pending(false, &NoProgress).await.unwrap();

    let stream = engine
        .search(SearchRequest::new("name", "^x", SearchMode::Pattern))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(2500)).await;
    let outcome = stream.collect().await.unwrap();

    assert_eq!(outcome.errors.len(), 1, "{:?}", outcome.errors);
    assert_eq!(outcome.errors[0].kind, FileErrorKind::Timeout);
    assert!(outcome.errors[0].path.ends_with("big.csv"));

    let mut finished: Vec<&str> = outcome.results.iter().map(|r| r.file_name.as_str()).collect();
    finished.sort();
    assert_eq!(finished, vec!["a.csv", "b.csv"]);
    assert_eq!(outcome.total_rows, 2);
}

#[tokio::test]
async fn abandoned_search_is_not_cached() {
    let mut fx = Fixture::new();
    fx.config.search.max_workers = 1;
    fx.write("big.csv", &many_rows("x", 500));
    let engine = fx.engine().await;
    let request = SearchRequest::new("name", "x", SearchMode::StartsWith);

    let mut stream = engine.search(request.clone()).await.unwrap();
    assert!(matches!(stream.next().await, Some(SearchEvent::Rows { .. })));
    drop(stream);
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(engine.cache().is_empty());
    let outcome = engine.search_collect(request).await.unwrap();
    assert!(!outcome.cached);
    assert_eq!(engine.dispatched_queries(), 2);
}
