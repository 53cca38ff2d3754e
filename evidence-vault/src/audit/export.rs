//! Audit trail export: structured JSON or a flat CSV table.

use super::event::AuditEvent;
use crate::utils::{Result, VaultError};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl FromStr for ExportFormat {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(VaultError::Audit(format!("unknown export format '{other}'"))),
        }
    }
}

const CSV_HEADER: [&str; 7] = [
    "event_id",
    "timestamp",
    "component",
    "action",
    "previous_hash",
    "signature_hash",
    "metadata",
];

pub fn render(events: &[AuditEvent], format: ExportFormat) -> Result<String> {
    match format {
        ExportFormat::Json => Ok(serde_json::to_string_pretty(events)?),
        ExportFormat::Csv => render_csv(events),
    }
}

fn render_csv(events: &[AuditEvent]) -> Result<String> {
    let mut out = CSV_HEADER.join(",");
    out.push_str("\r\n");

    for event in events {
        let row = [
            event.event_id.clone(),
            event.timestamp.to_rfc3339(),
            event.component.clone(),
            event.action.clone(),
            event.previous_hash.clone().unwrap_or_default(),
            event.signature_hash.clone(),
            serde_json::to_string(&event.metadata)?,
        ];
        let cells: Vec<String> = row.iter().map(|c| csv_cell(c)).collect();
        out.push_str(&cells.join(","));
        out.push_str("\r\n");
    }

    Ok(out)
}

/// RFC 4180 quoting.
fn csv_cell(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
