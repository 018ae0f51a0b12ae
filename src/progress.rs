//! Conversion progress reporting.
//!
//! Reports what `csvs convert` is doing so users see which file is being
//! converted, how many rows are in, and what is left. Progress goes to
//! **stderr** so stdout remains parseable for scripts.

use std::io::Write;
use std::path::PathBuf;

/// A single progress event for a conversion run.
#[derive(Clone, Debug)]
pub enum ConversionEvent {
    /// Starting file `index` of `total` (1-based).
    Started {
        file: PathBuf,
        index: usize,
        total: usize,
        bytes: u64,
    },
    /// Rows written to the staging table so far.
    Rows { file: PathBuf, rows: u64 },
    Finished {
        file: PathBuf,
        rows: u64,
        skipped: u64,
        elapsed_ms: u64,
    },
    UpToDate { file: PathBuf },
    Failed { file: PathBuf, error: String },
}

/// Reports conversion progress. Implementations write to stderr.
pub trait ConversionProgressReporter: Send + Sync {
    fn report(&self, event: ConversionEvent);
}

/// Human-friendly progress: "convert [2/5] sales.csv  1,234,000 rows".
pub struct StderrProgress;

fn display_name(path: &std::path::Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

impl ConversionProgressReporter for StderrProgress {
    fn report(&self, event: ConversionEvent) {
        let line = match &event {
            ConversionEvent::Started {
                file,
                index,
                total,
                bytes,
            } => format!(
                "convert [{}/{}] {}  {} bytes\n",
                index,
                total,
                display_name(file),
                format_number(*bytes)
            ),
            ConversionEvent::Rows { file, rows } => {
                format!("convert {}  {} rows\n", display_name(file), format_number(*rows))
            }
            ConversionEvent::Finished {
                file,
                rows,
                skipped,
                elapsed_ms,
            } => format!(
                "convert {}  done: {} rows, {} skipped, {:.1}s\n",
                display_name(file),
                format_number(*rows),
                format_number(*skipped),
                *elapsed_ms as f64 / 1000.0
            ),
            ConversionEvent::UpToDate { file } => {
                format!("convert {}  up to date\n", display_name(file))
            }
            ConversionEvent::Failed { file, error } => {
                format!("convert {}  FAILED: {}\n", display_name(file), error)
            }
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ConversionProgressReporter for JsonProgress {
    fn report(&self, event: ConversionEvent) {
        let obj = match &event {
            ConversionEvent::Started {
                file,
                index,
                total,
                bytes,
            } => serde_json::json!({
                "event": "progress",
                "phase": "started",
                "file": file,
                "index": index,
                "total": total,
                "bytes": bytes
            }),
            ConversionEvent::Rows { file, rows } => serde_json::json!({
                "event": "progress",
                "phase": "rows",
                "file": file,
                "rows": rows
            }),
            ConversionEvent::Finished {
                file,
                rows,
                skipped,
                elapsed_ms,
            } => serde_json::json!({
                "event": "progress",
                "phase": "finished",
                "file": file,
                "rows": rows,
                "skipped": skipped,
                "elapsed_ms": elapsed_ms
            }),
            ConversionEvent::UpToDate { file } => serde_json::json!({
                "event": "progress",
                "phase": "up_to_date",
                "file": file
            }),
            ConversionEvent::Failed { file, error } => serde_json::json!({
                "event": "progress",
                "phase": "failed",
                "file": file,
                "error": error
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ConversionProgressReporter for NoProgress {
    fn report(&self, _event: ConversionEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len().saturating_sub(1)) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ConversionProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

impl std::str::FromStr for ProgressMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" | "none" => Ok(ProgressMode::Off),
            "human" => Ok(ProgressMode::Human),
            "json" => Ok(ProgressMode::Json),
            other => Err(format!("Unknown progress mode: {}. Use off, human, or json", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn progress_mode_parses() {
        assert_eq!("json".parse::<ProgressMode>().unwrap(), ProgressMode::Json);
        assert!("loud".parse::<ProgressMode>().is_err());
    }
}
