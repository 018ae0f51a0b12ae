//! Column-name driven type coercion and value parsing.
//!
//! Conversion types a column from its header alone: identifier and
//! quantity-like names become numeric, date-like names become temporal, and
//! everything else stays textual. Values that do not parse under the chosen
//! type are stored as NULL and counted.

use chrono::{DateTime, NaiveDate, NaiveDateTime};

use crate::models::{CellValue, ColumnType};

/// Name tokens that mark a quantity column.
const NUMERIC_TOKENS: &[&str] = &[
    "score", "age", "price", "amount", "value", "count", "num", "number", "qty", "quantity",
    "total",
];

const TEMPORAL_NAMES: &[&str] = &["date", "time", "timestamp", "created", "updated"];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%Y/%m/%d %H:%M:%S",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%d.%m.%Y", "%Y/%m/%d"];

/// Storage form of temporal values. Sorts lexicographically.
pub const TEMPORAL_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn name_tokens(name: &str) -> Vec<String> {
    name.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Type a column gets in its converted table, from the header name.
pub fn coerced_type(name: &str) -> ColumnType {
    let tokens = name_tokens(name);
    let Some(last) = tokens.last() else {
        return ColumnType::Textual;
    };

    if last == "id" {
        return ColumnType::Numeric;
    }
    if (tokens.len() > 1 && matches!(last.as_str(), "date" | "time" | "at"))
        || tokens.iter().any(|t| TEMPORAL_NAMES.contains(&t.as_str()))
    {
        return ColumnType::Temporal;
    }
    if tokens.iter().any(|t| NUMERIC_TOKENS.contains(&t.as_str())) {
        return ColumnType::Numeric;
    }
    ColumnType::Textual
}

/// Integers stay integers; anything else numeric becomes a finite float.
pub fn parse_number(raw: &str) -> Option<CellValue> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(i) = s.parse::<i64>() {
        return Some(CellValue::Integer(i));
    }
    // Reject "nan", "inf" and friends, which f64 would otherwise accept.
    if !s
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'))
    {
        return None;
    }
    s.parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .map(CellValue::Real)
}

pub fn parse_temporal(raw: &str) -> Option<NaiveDateTime> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt);
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return d.and_hms_opt(0, 0, 0);
        }
    }
    None
}

/// Result of coercing one raw field.
#[derive(Debug, Clone, PartialEq)]
pub struct Coerced {
    pub value: CellValue,
    /// A non-empty field that did not parse under the column type.
    pub failed: bool,
}

pub fn coerce_value(column_type: ColumnType, raw: &str) -> Coerced {
    if raw.trim().is_empty() {
        return Coerced {
            value: CellValue::Null,
            failed: false,
        };
    }
    let parsed = match column_type {
        ColumnType::Numeric => parse_number(raw),
        ColumnType::Temporal => {
            parse_temporal(raw).map(|dt| CellValue::Text(dt.format(TEMPORAL_FORMAT).to_string()))
        }
        ColumnType::Textual | ColumnType::Unknown => Some(CellValue::Text(raw.to_string())),
    };
    match parsed {
        Some(value) => Coerced {
            value,
            failed: false,
        },
        None => Coerced {
            value: CellValue::Null,
            failed: true,
        },
    }
}

/// Type of a single sampled value, used by catalog inference. Empty values
/// say nothing and come back as `Unknown`.
pub fn sniff_value(raw: &str) -> ColumnType {
    if raw.trim().is_empty() {
        ColumnType::Unknown
    } else if parse_number(raw).is_some() {
        ColumnType::Numeric
    } else if parse_temporal(raw).is_some() {
        ColumnType::Temporal
    } else {
        ColumnType::Textual
    }
}
