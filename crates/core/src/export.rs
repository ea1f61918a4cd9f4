//! JSON, CSV, and HTML audit exports of the extraction ledger.

use crate::security::escape_html;
use chrono::{DateTime, SecondsFormat, Utc};
use doc_model::Extraction;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::Write;
use viewer_core::AppSnapshot;

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV serialization error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type ExportResult<T> = Result<T, ExportError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
    Audit,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Csv => "csv",
            Self::Audit => "html",
        }
    }

    /// `extraction_<millis>.json|csv` or `audit_<millis>.html`.
    pub fn default_file_name(self, now: DateTime<Utc>) -> String {
        let stem = match self {
            Self::Json | Self::Csv => "extraction",
            Self::Audit => "audit",
        };
        format!("{stem}_{}.{}", now.timestamp_millis(), self.extension())
    }

    pub fn write<W: Write>(self, writer: W, export: &ExportData<'_>) -> ExportResult<()> {
        match self {
            Self::Json => write_json(writer, export),
            Self::Csv => write_csv(writer, export.extractions),
            Self::Audit => write_audit(writer, export),
        }
    }
}

/// Everything an export reads, captured at one instant.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportData<'a> {
    pub document: &'a str,
    pub export_date: DateTime<Utc>,
    pub form_data: &'a BTreeMap<String, String>,
    pub extractions: &'a [Extraction],
    #[serde(skip)]
    pub total_pages: u32,
}

impl<'a> ExportData<'a> {
    pub fn from_snapshot(
        snapshot: &'a AppSnapshot,
        form_data: &'a BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            document: &snapshot.document_name,
            export_date: now,
            form_data,
            extractions: &snapshot.extractions,
            total_pages: snapshot.total_pages,
        }
    }
}

/// Pretty-printed `{ document, exportDate, formData, extractions }`.
pub fn write_json<W: Write>(mut writer: W, export: &ExportData<'_>) -> ExportResult<()> {
    serde_json::to_writer_pretty(&mut writer, export)?;
    writer.write_all(b"\n")?;
    Ok(())
}

/// CSV columns: Field, Text, Page, X, Y, Width, Height, Timestamp (RFC 3339, ms).
pub fn write_csv<W: Write>(writer: W, extractions: &[Extraction]) -> ExportResult<()> {
    let mut csv_writer = csv::WriterBuilder::new().has_headers(false).from_writer(writer);

    csv_writer.write_record(["Field", "Text", "Page", "X", "Y", "Width", "Height", "Timestamp"])?;
    for extraction in extractions {
        let bounds = extraction.coordinates;
        csv_writer.write_record([
            extraction.field_name.clone(),
            extraction.text.clone(),
            extraction.page.to_string(),
            bounds.x.to_string(),
            bounds.y.to_string(),
            bounds.width.to_string(),
            bounds.height.to_string(),
            extraction.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        ])?;
    }

    csv_writer.flush()?;
    Ok(())
}

pub fn write_audit<W: Write>(mut writer: W, export: &ExportData<'_>) -> ExportResult<()> {
    writer.write_all(audit_html(export).as_bytes())?;
    Ok(())
}

fn display_time(timestamp: DateTime<Utc>) -> String {
    timestamp.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

/// Standalone HTML report. Every interpolated value is escaped.
pub fn audit_html(export: &ExportData<'_>) -> String {
    let document = if export.document.is_empty() { "N/A" } else { export.document };
    let mut html = String::new();

    html.push_str(concat!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n",
        "<title>Clinical Extraction Audit Report</title>\n<style>\n",
        "body { font-family: Arial, sans-serif; max-width: 1200px; margin: 0 auto; padding: 20px; }\n",
        "h1 { color: #1976D2; border-bottom: 2px solid #1976D2; padding-bottom: 10px; }\n",
        "table { width: 100%; border-collapse: collapse; margin: 20px 0; }\n",
        "th { background: #f5f5f5; padding: 10px; text-align: left; border: 1px solid #ddd; }\n",
        "td { padding: 10px; border: 1px solid #ddd; }\n",
        ".extraction { background: #f9f9f9; padding: 15px; margin: 15px 0; border-radius: 5px; }\n",
        ".coordinates { font-family: monospace; }\n",
        "</style>\n</head>\n<body>\n",
        "<h1>Clinical Study Extraction Audit Report</h1>\n",
    ));

    // Writing into a String cannot fail.
    let _ = write!(
        html,
        "<h2>Document Information</h2>\n<table>\n\
         <tr><th>Document Name</th><td>{}</td></tr>\n\
         <tr><th>Total Pages</th><td>{}</td></tr>\n\
         <tr><th>Total Extractions</th><td>{}</td></tr>\n\
         <tr><th>Report Generated</th><td>{}</td></tr>\n</table>\n",
        escape_html(document),
        export.total_pages,
        export.extractions.len(),
        display_time(export.export_date),
    );

    html.push_str("<h2>Extracted Form Data</h2>\n<table>\n<tr><th>Field</th><th>Value</th></tr>\n");
    for (field, value) in export.form_data {
        let _ = writeln!(
            html,
            "<tr><td>{}</td><td>{}</td></tr>",
            escape_html(field),
            escape_html(value)
        );
    }
    html.push_str("</table>\n<h2>Extraction Details with Coordinates</h2>\n");

    for (position, extraction) in export.extractions.iter().enumerate() {
        let bounds = extraction.coordinates;
        let _ = write!(
            html,
            "<div class=\"extraction\">\n<h3>{}. {}</h3>\n\
             <p><strong>Extracted Text:</strong> &quot;{}&quot;</p>\n\
             <p><strong>Page:</strong> {}</p>\n\
             <p><strong>Method:</strong> {}</p>\n\
             <p><strong>Coordinates:</strong> <span class=\"coordinates\">X: {}, Y: {}, Width: {}px, Height: {}px</span></p>\n\
             <p><strong>Timestamp:</strong> {}</p>\n</div>\n",
            position + 1,
            escape_html(&extraction.field_name),
            escape_html(&extraction.text),
            extraction.page,
            extraction.method,
            bounds.x,
            bounds.y,
            bounds.width,
            bounds.height,
            display_time(extraction.timestamp),
        );
    }

    html.push_str("</body>\n</html>\n");
    html
}
