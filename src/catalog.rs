//! Source directory scanning and the global column catalog.
//!
//! A scan walks the source root, reads each CSV's header plus a bounded
//! sample of rows, and maps every column name to the files that contain it.
//! Unreadable files are recorded as failures and left out; they never stop
//! the scan.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::coerce;
use crate::config::SourcesConfig;
use crate::error::{DiscoveryError, EngineError, FileError};
use crate::models::{CatalogEntry, ColumnCatalog, ColumnInfo, ColumnType, SourceFile};

/// A file selected by the globs, before its contents are read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedFile {
    pub path: PathBuf,
    pub size: u64,
    pub modified: i64,
}

impl ListedFile {
    pub fn stat(path: &Path) -> std::io::Result<Self> {
        let path = std::fs::canonicalize(path)?;
        let metadata = std::fs::metadata(&path)?;
        Ok(Self {
            size: metadata.len(),
            modified: modified_nanos(&metadata),
            path,
        })
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

pub fn modified_nanos(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

/// Stable identifier for a source file, also used as its table name:
/// `csv_<sanitized stem>_<first 8 hex of sha256(canonical path)>`.
pub fn file_id(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let mut clean: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    clean.truncate(40);
    let clean = clean.trim_matches('_');
    let clean = if clean.is_empty() { "file" } else { clean };

    let digest = Sha256::digest(path.to_string_lossy().as_bytes());
    format!("csv_{}_{}", clean, &hex::encode(digest)[..8])
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(GlobBuilder::new(pattern).case_insensitive(true).build()?);
    }
    builder.build()
}

/// Files under the source root that pass the include/exclude globs, sorted
/// by path.
pub fn list_files(sources: &SourcesConfig) -> Result<Vec<ListedFile>, EngineError> {
    let root = &sources.root;
    if !root.is_dir() {
        return Err(EngineError::SourceRootMissing(root.clone()));
    }

    let include_set = build_globset(&sources.include_globs)?;
    let exclude_set = build_globset(&sources.exclude_globs)?;

    let mut walker = WalkDir::new(root).min_depth(1).follow_links(true);
    if !sources.recursive {
        walker = walker.max_depth(1);
    }

    let mut files = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable directory entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().to_string();

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }

        match ListedFile::stat(path) {
            Ok(listed) => files.push(listed),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "cannot stat file"),
        }
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

/// Hash of a listing. Changes whenever a file appears, disappears, or
/// changes size or mtime.
pub fn signature(files: &[ListedFile]) -> String {
    let mut hasher = Sha256::new();
    for f in files {
        hasher.update(f.path.to_string_lossy().as_bytes());
        hasher.update([0]);
        hasher.update(f.size.to_le_bytes());
        hasher.update(f.modified.to_le_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Header cleanup shared with the converter: trim, strip a BOM, name blank
/// headers `column_<n>` and suffix duplicates `_2`, `_3`, ...
pub fn normalize_headers(raw: &[String]) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut out = Vec::with_capacity(raw.len());
    for (i, name) in raw.iter().enumerate() {
        let trimmed = name.trim_start_matches('\u{feff}').trim();
        let base = if trimmed.is_empty() {
            format!("column_{}", i + 1)
        } else {
            trimmed.to_string()
        };

        let mut candidate = base.clone();
        let mut n = 1;
        while seen.contains_key(&candidate.to_lowercase()) {
            n += 1;
            candidate = format!("{}_{}", base, n);
        }
        seen.insert(candidate.to_lowercase(), i);
        out.push(candidate);
    }
    out
}

pub fn generated_headers(width: usize) -> Vec<String> {
    (1..=width).map(|i| format!("column_{}", i)).collect()
}

/// Decode one field. The flag is set when bytes had to be replaced.
pub fn decode_field<'a>(bytes: &'a [u8], encoding: &'static encoding_rs::Encoding) -> (Cow<'a, str>, bool) {
    encoding.decode_without_bom_handling(bytes)
}

pub fn csv_reader(path: &Path, sources: &SourcesConfig) -> Result<csv::Reader<std::fs::File>, csv::Error> {
    csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(sources.delimiter_byte())
        .from_path(path)
}

/// Read the header and up to `sample_rows` rows, inferring a type per
/// column from the sampled values.
pub fn sample_columns(path: &Path, sources: &SourcesConfig) -> Result<Vec<ColumnInfo>, DiscoveryError> {
    let encoding = sources.encoding();
    let mut reader = csv_reader(path, sources)?;
    let mut records = reader.byte_records();

    let first = match records.next() {
        Some(record) => record?,
        None => return Err(DiscoveryError::Empty),
    };
    let first_fields: Vec<String> = first
        .iter()
        .map(|f| decode_field(f, encoding).0.into_owned())
        .collect();

    let (names, mut pending) = if sources.has_header {
        (normalize_headers(&first_fields), Vec::new())
    } else {
        (generated_headers(first_fields.len()), vec![first_fields])
    };
    if names.is_empty() {
        return Err(DiscoveryError::Empty);
    }

    for record in records.take(sources.sample_rows.saturating_sub(pending.len())) {
        let record = record?;
        pending.push(
            record
                .iter()
                .map(|f| decode_field(f, encoding).0.into_owned())
                .collect(),
        );
    }

    let mut types = vec![ColumnType::Unknown; names.len()];
    for row in &pending {
        for (i, ty) in types.iter_mut().enumerate() {
            if let Some(value) = row.get(i) {
                *ty = ty.unify(coerce::sniff_value(value));
            }
        }
    }

    Ok(names
        .into_iter()
        .zip(types)
        .map(|(name, column_type)| ColumnInfo { name, column_type })
        .collect())
}

/// Build the catalog for the configured source directory.
pub fn discover(sources: &SourcesConfig) -> Result<ColumnCatalog, EngineError> {
    let listed = list_files(sources)?;
    let signature = signature(&listed);

    let mut files = Vec::with_capacity(listed.len());
    let mut failures = Vec::new();
    for item in &listed {
        match sample_columns(&item.path, sources) {
            Ok(columns) => files.push(SourceFile {
                file_id: file_id(&item.path),
                file_name: item.file_name(),
                path: item.path.clone(),
                size: item.size,
                modified: item.modified,
                row_count: None,
                columns,
            }),
            Err(e) => {
                tracing::warn!(path = %item.path.display(), error = %e, "excluding unreadable file");
                failures.push(FileError::from_discovery(&item.path, &e));
            }
        }
    }

    let mut columns: BTreeMap<String, Vec<CatalogEntry>> = BTreeMap::new();
    for file in &files {
        for col in &file.columns {
            columns.entry(col.name.clone()).or_default().push(CatalogEntry {
                file_id: file.file_id.clone(),
                path: file.path.clone(),
                file_name: file.file_name.clone(),
                column_type: col.column_type,
            });
        }
    }

    tracing::info!(
        files = files.len(),
        columns = columns.len(),
        failures = failures.len(),
        "catalog built"
    );

    Ok(ColumnCatalog {
        files,
        columns,
        failures,
        signature,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sources(root: &Path) -> SourcesConfig {
        SourcesConfig {
            root: root.to_path_buf(),
            ..SourcesConfig::default()
        }
    }

    #[test]
    fn headers_are_cleaned_and_deduplicated() {
        let raw = vec![
            "\u{feff}name".to_string(),
            " ".to_string(),
            "Name".to_string(),
            "name".to_string(),
        ];
        assert_eq!(
            normalize_headers(&raw),
            vec!["name", "column_2", "Name_2", "name_3"]
        );
    }

    #[test]
    fn file_ids_are_stable_and_sanitized() {
        let a = file_id(Path::new("/data/My Sales-2024.csv"));
        assert!(a.starts_with("csv_my_sales_2024_"));
        assert_eq!(a.len(), "csv_my_sales_2024_".len() + 8);
        assert_eq!(a, file_id(Path::new("/data/My Sales-2024.csv")));
        assert_ne!(a, file_id(Path::new("/other/My Sales-2024.csv")));
    }

    #[test]
    fn sample_infers_types() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("t.csv");
        std::fs::write(&path, "name,qty,when,blank\nApple,3,2024-01-02,\nPear,x,2024-02-03,\n").unwrap();
        let cols = sample_columns(&path, &sources(tmp.path())).unwrap();
        let types: Vec<_> = cols.iter().map(|c| (c.name.as_str(), c.column_type)).collect();
        assert_eq!(
            types,
            vec![
                ("name", ColumnType::Textual),
                ("qty", ColumnType::Textual),
                ("when", ColumnType::Temporal),
                ("blank", ColumnType::Unknown),
            ]
        );
    }

    #[test]
    fn headerless_files_get_generated_names() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("t.csv");
        std::fs::write(&path, "1,Apple\n2,Pear\n").unwrap();
        let mut cfg = sources(tmp.path());
        cfg.has_header = false;
        let cols = sample_columns(&path, &cfg).unwrap();
        assert_eq!(cols[0].name, "column_1");
        assert_eq!(cols[0].column_type, ColumnType::Numeric);
        assert_eq!(cols[1].name, "column_2");
    }

    #[test]
    fn discover_maps_columns_to_files() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("one.csv"), "A,B\n1,2\n").unwrap();
        std::fs::write(tmp.path().join("two.CSV"), "B,C\n3,4\n").unwrap();
        std::fs::write(tmp.path().join("empty.csv"), "").unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "A\n").unwrap();

        let catalog = discover(&sources(tmp.path())).unwrap();
        let names = |col: &str| -> Vec<String> {
            catalog.entries(col).iter().map(|e| e.file_name.clone()).collect()
        };
        assert_eq!(names("A"), vec!["one.csv"]);
        assert_eq!(names("B"), vec!["one.csv", "two.CSV"]);
        assert_eq!(names("C"), vec!["two.CSV"]);
        assert_eq!(catalog.files.len(), 2);
        assert_eq!(catalog.failures.len(), 1);
        assert!(catalog.failures[0].path.ends_with("empty.csv"));
    }

    #[test]
    fn nested_files_need_recursive() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("sub/deep.csv"), "A\n1\n").unwrap();

        let mut cfg = sources(tmp.path());
        assert!(list_files(&cfg).unwrap().is_empty());
        cfg.recursive = true;
        assert_eq!(list_files(&cfg).unwrap().len(), 1);
    }

    #[test]
    fn missing_root_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let err = discover(&sources(&tmp.path().join("nope"))).unwrap_err();
        assert!(matches!(err, EngineError::SourceRootMissing(_)));
    }

    #[test]
    fn signature_tracks_changes() {
        let a = ListedFile {
            path: PathBuf::from("/a.csv"),
            size: 10,
            modified: 1,
        };
        let mut b = a.clone();
        b.size = 11;
        assert_ne!(signature(&[a.clone()]), signature(&[b]));
        assert_eq!(signature(&[a.clone()]), signature(&[a]));
    }
}
