//! Serialize search results as CSV, XLSX or JSON.
//!
//! Pure over already materialized rows: nothing here touches the store.
//! A combined export starts with a `source_file` column, followed by the
//! union of every file's columns in first-seen order. Single-file exports
//! keep the table's native column order.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;
use std::str::FromStr;

use crate::error::ExportError;
use crate::models::{CellValue, FileSearchResult};

pub const PROVENANCE_COLUMN: &str = "source_file";
const SHEET_NAME: &str = "Search Results";
/// Rows per worksheet, header included.
const XLSX_MAX_ROWS: usize = 1_048_576;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Xlsx,
    Json,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Xlsx => "xlsx",
            ExportFormat::Json => "json",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "text/csv",
            ExportFormat::Xlsx => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            ExportFormat::Json => "application/json",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "xlsx" | "excel" => Ok(ExportFormat::Xlsx),
            "json" => Ok(ExportFormat::Json),
            other => Err(format!("Unknown export format: {}. Use csv, xlsx, or json", other)),
        }
    }
}

/// What to export.
#[derive(Debug, Clone, Copy)]
pub enum ExportScope<'a> {
    File(&'a FileSearchResult),
    /// Several files' results, tagged with their origin. The term names the
    /// output file.
    Combined {
        results: &'a [FileSearchResult],
        term: &'a str,
    },
}

#[derive(Debug, Clone)]
pub struct ExportArtifact {
    pub bytes: Vec<u8>,
    pub filename: String,
    pub content_type: &'static str,
}

/// Rows aligned to a single header. `None` marks a column the row's file
/// does not have.
struct Table<'a> {
    header: Vec<String>,
    rows: Vec<Vec<Option<&'a CellValue>>>,
    /// File name per row, for combined exports.
    provenance: Option<Vec<&'a str>>,
}

impl<'a> Table<'a> {
    fn build(scope: ExportScope<'a>) -> Self {
        match scope {
            ExportScope::File(result) => Table {
                header: result.columns.clone(),
                rows: result
                    .rows
                    .iter()
                    .map(|row| row.iter().map(Some).collect())
                    .collect(),
                provenance: None,
            },
            ExportScope::Combined { results, .. } => {
                let mut header: Vec<String> = Vec::new();
                let mut position: HashMap<&str, usize> = HashMap::new();
                for result in results {
                    for column in &result.columns {
                        if !position.contains_key(column.as_str()) {
                            position.insert(column.as_str(), header.len());
                            header.push(column.clone());
                        }
                    }
                }

                let mut rows = Vec::new();
                let mut provenance = Vec::new();
                for result in results {
                    let slots: Vec<usize> = result
                        .columns
                        .iter()
                        .map(|c| position[c.as_str()])
                        .collect();
                    for row in &result.rows {
                        let mut out: Vec<Option<&CellValue>> = vec![None; header.len()];
                        for (cell, slot) in row.iter().zip(&slots) {
                            out[*slot] = Some(cell);
                        }
                        rows.push(out);
                        provenance.push(result.file_name.as_str());
                    }
                }

                Table {
                    header,
                    rows,
                    provenance: Some(provenance),
                }
            }
        }
    }

    fn full_header(&self) -> Vec<String> {
        let mut header = Vec::with_capacity(self.header.len() + 1);
        if self.provenance.is_some() {
            header.push(PROVENANCE_COLUMN.to_string());
        }
        header.extend(self.header.iter().cloned());
        header
    }

    /// Row `i` as display strings, provenance first.
    fn text_row(&self, i: usize) -> Vec<String> {
        let mut out = Vec::with_capacity(self.header.len() + 1);
        if let Some(provenance) = &self.provenance {
            out.push(provenance[i].to_string());
        }
        out.extend(
            self.rows[i]
                .iter()
                .map(|c| c.map(CellValue::to_text).unwrap_or_default()),
        );
        out
    }
}

pub fn export(scope: ExportScope<'_>, format: ExportFormat) -> Result<ExportArtifact, ExportError> {
    export_at(scope, format, Local::now())
}

/// As [`export`], with the timestamp used in the filename supplied.
pub fn export_at(
    scope: ExportScope<'_>,
    format: ExportFormat,
    now: DateTime<Local>,
) -> Result<ExportArtifact, ExportError> {
    let prefix = match scope {
        ExportScope::File(_) => "search_results".to_string(),
        ExportScope::Combined { term, .. } => format!("bulk_search_{}", sanitize(term)),
    };
    let table = Table::build(scope);
    let bytes = match format {
        ExportFormat::Csv => to_csv(&table)?,
        ExportFormat::Json => to_json(&table)?,
        ExportFormat::Xlsx => to_xlsx(&table)?,
    };
    Ok(ExportArtifact {
        bytes,
        filename: format!(
            "{}_{}.{}",
            prefix,
            now.format("%Y%m%d_%H%M%S"),
            format.extension()
        ),
        content_type: format.content_type(),
    })
}

/// Keep filenames portable: spaces become `_`, other unsafe characters are
/// dropped.
fn sanitize(term: &str) -> String {
    let cleaned: String = term
        .trim()
        .chars()
        .filter_map(|c| match c {
            ' ' => Some('_'),
            c if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') => Some(c),
            _ => None,
        })
        .take(50)
        .collect();
    if cleaned.is_empty() {
        "results".to_string()
    } else {
        cleaned
    }
}

fn to_csv(table: &Table<'_>) -> Result<Vec<u8>, ExportError> {
    let mut writer = csv::WriterBuilder::new()
        .quote_style(csv::QuoteStyle::Necessary)
        .from_writer(Vec::new());
    writer.write_record(table.full_header())?;
    for i in 0..table.rows.len() {
        writer.write_record(table.text_row(i))?;
    }
    writer
        .into_inner()
        .map_err(|e| ExportError::Io(e.into_error()))
}

fn to_json(table: &Table<'_>) -> Result<Vec<u8>, ExportError> {
    let mut records = Vec::with_capacity(table.rows.len());
    for (i, row) in table.rows.iter().enumerate() {
        let mut record = serde_json::Map::new();
        if let Some(provenance) = &table.provenance {
            record.insert(
                PROVENANCE_COLUMN.to_string(),
                serde_json::Value::String(provenance[i].to_string()),
            );
        }
        for (name, cell) in table.header.iter().zip(row) {
            let value = match cell {
                Some(cell) => serde_json::to_value(cell)?,
                None => serde_json::Value::Null,
            };
            record.insert(name.clone(), value);
        }
        records.push(serde_json::Value::Object(record));
    }
    Ok(serde_json::to_vec_pretty(&records)?)
}

/// Column letters: 0 -> A, 25 -> Z, 26 -> AA.
fn column_letter(mut index: usize) -> String {
    let mut letters = Vec::new();
    loop {
        letters.push(b'A' + (index % 26) as u8);
        if index < 26 {
            break;
        }
        index = index / 26 - 1;
    }
    letters.reverse();
    String::from_utf8_lossy(&letters).into_owned()
}

/// XML 1.0 forbids most control characters even when escaped.
fn xml_text(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\t' | '\n' | '\r'))
        .collect();
    quick_xml::escape::escape(cleaned.as_str()).into_owned()
}

fn xlsx_cell(out: &mut String, reference: &str, cell: Option<&CellValue>, text: &str) {
    match cell {
        Some(CellValue::Integer(i)) => {
            out.push_str(&format!("<c r=\"{}\"><v>{}</v></c>", reference, i));
        }
        Some(CellValue::Real(f)) => {
            out.push_str(&format!("<c r=\"{}\"><v>{}</v></c>", reference, f));
        }
        Some(CellValue::Null) | None if text.is_empty() => {}
        _ => {
            out.push_str(&format!(
                "<c r=\"{}\" t=\"inlineStr\"><is><t xml:space=\"preserve\">{}</t></is></c>",
                reference,
                xml_text(text)
            ));
        }
    }
}

fn sheet_xml(table: &Table<'_>) -> String {
    let header = table.full_header();
    let offset = usize::from(table.provenance.is_some());

    let mut widths: Vec<usize> = header.iter().map(|h| h.chars().count()).collect();
    let text_rows: Vec<Vec<String>> = (0..table.rows.len()).map(|i| table.text_row(i)).collect();
    for row in &text_rows {
        for (w, value) in widths.iter_mut().zip(row) {
            *w = (*w).max(value.chars().count());
        }
    }

    let mut xml = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\
         <worksheet xmlns=\"http://schemas.openxmlformats.org/spreadsheetml/2006/main\">",
    );
    if !widths.is_empty() {
        xml.push_str("<cols>");
        for (i, w) in widths.iter().enumerate() {
            xml.push_str(&format!(
                "<col min=\"{0}\" max=\"{0}\" width=\"{1}\" customWidth=\"1\"/>",
                i + 1,
                (w + 2).min(50)
            ));
        }
        xml.push_str("</cols>");
    }

    xml.push_str("<sheetData><row r=\"1\">");
    for (i, name) in header.iter().enumerate() {
        xlsx_cell(&mut xml, &format!("{}1", column_letter(i)), None, name);
    }
    xml.push_str("</row>");

    for (r, text_row) in text_rows.iter().enumerate() {
        let row_number = r + 2;
        xml.push_str(&format!("<row r=\"{}\">", row_number));
        for (c, text) in text_row.iter().enumerate() {
            let cell = if c < offset {
                None
            } else {
                table.rows[r][c - offset]
            };
            xlsx_cell(
                &mut xml,
                &format!("{}{}", column_letter(c), row_number),
                cell,
                text,
            );
        }
        xml.push_str("</row>");
    }
    xml.push_str("</sheetData></worksheet>");
    xml
}

fn to_xlsx(table: &Table<'_>) -> Result<Vec<u8>, ExportError> {
    if table.rows.len() + 1 > XLSX_MAX_ROWS {
        return Err(ExportError::TooManyRows(table.rows.len()));
    }

    let parts: [(&str, String); 6] = [
        (
            "[Content_Types].xml",
            "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\
             <Types xmlns=\"http://schemas.openxmlformats.org/package/2006/content-types\">\
             <Default Extension=\"rels\" ContentType=\"application/vnd.openxmlformats-package.relationships+xml\"/>\
             <Default Extension=\"xml\" ContentType=\"application/xml\"/>\
             <Override PartName=\"/xl/workbook.xml\" ContentType=\"application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml\"/>\
             <Override PartName=\"/xl/worksheets/sheet1.xml\" ContentType=\"application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml\"/>\
             <Override PartName=\"/docProps/app.xml\" ContentType=\"application/vnd.openxmlformats-officedocument.extended-properties+xml\"/>\
             </Types>"
                .to_string(),
        ),
        (
            "_rels/.rels",
            "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\
             <Relationships xmlns=\"http://schemas.openxmlformats.org/package/2006/relationships\">\
             <Relationship Id=\"rId1\" Type=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument\" Target=\"xl/workbook.xml\"/>\
             <Relationship Id=\"rId2\" Type=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships/extended-properties\" Target=\"docProps/app.xml\"/>\
             </Relationships>"
                .to_string(),
        ),
        (
            "docProps/app.xml",
            "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\
             <Properties xmlns=\"http://schemas.openxmlformats.org/officeDocument/2006/extended-properties\">\
             <Application>csvs</Application></Properties>"
                .to_string(),
        ),
        (
            "xl/workbook.xml",
            format!(
                "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\
                 <workbook xmlns=\"http://schemas.openxmlformats.org/spreadsheetml/2006/main\" \
                 xmlns:r=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships\">\
                 <sheets><sheet name=\"{}\" sheetId=\"1\" r:id=\"rId1\"/></sheets></workbook>",
                SHEET_NAME
            ),
        ),
        (
            "xl/_rels/workbook.xml.rels",
            "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\
             <Relationships xmlns=\"http://schemas.openxmlformats.org/package/2006/relationships\">\
             <Relationship Id=\"rId1\" Type=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet\" Target=\"worksheets/sheet1.xml\"/>\
             </Relationships>"
                .to_string(),
        ),
        ("xl/worksheets/sheet1.xml", sheet_xml(table)),
    ];

    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        for (name, content) in &parts {
            zip.start_file(*name, options)?;
            zip.write_all(content.as_bytes())?;
        }
        zip.finish()?;
    }
    Ok(buf)
}
