//! Hash-chain verification of a single audit file.
//!
//! Chains never span files, so verification is always a start-to-end walk of
//! one file. The walk stops at the first line that is not a structurally
//! valid event: nothing after a broken line can be trusted.

use super::event::compute_signature;
use crate::utils::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

const REQUIRED_FIELDS: [&str; 6] = [
    "event_id",
    "timestamp",
    "action",
    "component",
    "previous_hash",
    "signature_hash",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainIssueKind {
    /// Line is not a JSON object; verification stops here
    Unparsable,
    /// Required field absent or of the wrong type; verification stops here
    MissingField,
    /// `previous_hash` differs from the prior event's `signature_hash`
    BrokenLink,
    /// `signature_hash` does not match the event's fields
    BadSignature,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainIssue {
    /// 1-based line number in the file
    pub line: usize,
    pub kind: ChainIssueKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainVerification {
    pub file: PathBuf,
    pub valid: bool,
    pub events_checked: usize,
    /// Lines after a structural failure that were not examined
    pub lines_unverified: usize,
    pub issues: Vec<ChainIssue>,
}

/// Walk `path` and check every link and signature.
pub fn verify_audit_chain(path: &Path) -> Result<ChainVerification> {
    let content = std::fs::read_to_string(path)?;
    Ok(verify_chain_content(path, &content))
}

pub(crate) fn verify_chain_content(path: &Path, content: &str) -> ChainVerification {
    let mut issues = Vec::new();
    let mut events_checked = 0;
    let mut lines_unverified = 0;
    let mut prior_signature: Option<String> = None;

    let lines: Vec<(usize, &str)> = content
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l))
        .filter(|(_, l)| !l.trim().is_empty())
        .collect();

    for (position, (line_no, line)) in lines.iter().enumerate() {
        let fields = match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(fields)) => fields,
            Ok(_) | Err(_) => {
                issues.push(ChainIssue {
                    line: *line_no,
                    kind: ChainIssueKind::Unparsable,
                    message: "line is not a JSON object; chain not verified past this point".into(),
                });
                lines_unverified = lines.len() - position - 1;
                break;
            }
        };

        if let Some(missing) = first_missing_field(&fields) {
            issues.push(ChainIssue {
                line: *line_no,
                kind: ChainIssueKind::MissingField,
                message: format!("missing or malformed field '{missing}'; chain not verified past this point"),
            });
            lines_unverified = lines.len() - position - 1;
            break;
        }

        let previous = fields.get("previous_hash").and_then(Value::as_str);
        if previous != prior_signature.as_deref() {
            issues.push(ChainIssue {
                line: *line_no,
                kind: ChainIssueKind::BrokenLink,
                message: format!(
                    "previous_hash {} does not match prior signature {}",
                    previous.unwrap_or("null"),
                    prior_signature.as_deref().unwrap_or("null")
                ),
            });
        }

        let stored = fields
            .get("signature_hash")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        match compute_signature(&fields) {
            Ok(computed) if computed == stored => {}
            Ok(computed) => issues.push(ChainIssue {
                line: *line_no,
                kind: ChainIssueKind::BadSignature,
                message: format!("signature_hash {stored} does not match recomputed {computed}"),
            }),
            Err(e) => issues.push(ChainIssue {
                line: *line_no,
                kind: ChainIssueKind::BadSignature,
                message: format!("signature could not be recomputed: {e}"),
            }),
        }

        events_checked += 1;
        prior_signature = Some(stored);
    }

    ChainVerification {
        file: path.to_path_buf(),
        valid: issues.is_empty(),
        events_checked,
        lines_unverified,
        issues,
    }
}

fn first_missing_field(fields: &Map<String, Value>) -> Option<&'static str> {
    for key in REQUIRED_FIELDS {
        let ok = match (key, fields.get(key)) {
            ("previous_hash", Some(v)) => v.is_null() || v.is_string(),
            (_, Some(v)) => v.is_string(),
            (_, None) => false,
        };
        if !ok {
            return Some(key);
        }
    }
    match fields.get("metadata") {
        None => None,
        Some(v) if v.is_object() => None,
        Some(_) => Some("metadata"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::event::AuditEvent;
    use chrono::Utc;
    use serde_json::json;

    fn chain(n: usize) -> Vec<AuditEvent> {
        let mut events: Vec<AuditEvent> = Vec::new();
        for i in 0..n {
            let previous = events.last().map(|e| e.signature_hash.clone());
            let meta = json!({"i": i}).as_object().cloned().unwrap();
            events.push(AuditEvent::new(Utc::now(), "step", "test", meta, previous).unwrap());
        }
        events
    }

    fn render(lines: &[String]) -> String {
        lines.iter().map(|l| format!("{l}\n")).collect()
    }

    fn lines_of(events: &[AuditEvent]) -> Vec<String> {
        events.iter().map(|e| serde_json::to_string(e).unwrap()).collect()
    }

    #[test]
    fn test_valid_chain() {
        let report = verify_chain_content(Path::new("a.jsonl"), &render(&lines_of(&chain(3))));
        assert!(report.valid);
        assert_eq!(report.events_checked, 3);
        assert!(report.issues.is_empty());
    }

    #[test]
    fn test_empty_file_is_valid() {
        let report = verify_chain_content(Path::new("a.jsonl"), "");
        assert!(report.valid);
        assert_eq!(report.events_checked, 0);
    }

    #[test]
    fn test_first_event_must_have_null_previous() {
        let meta = Map::new();
        let orphan = AuditEvent::new(Utc::now(), "a", "b", meta, Some("feed".into())).unwrap();
        let report = verify_chain_content(Path::new("a.jsonl"), &render(&lines_of(&[orphan])));

        assert!(!report.valid);
        assert_eq!(report.issues[0].kind, ChainIssueKind::BrokenLink);
    }

    #[test]
    fn test_unparsable_line_stops_walk() {
        let mut lines = lines_of(&chain(3));
        lines[1] = "{not json".to_string();
        let report = verify_chain_content(Path::new("a.jsonl"), &render(&lines));

        assert!(!report.valid);
        assert_eq!(report.events_checked, 1);
        assert_eq!(report.lines_unverified, 1);
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].line, 2);
        assert_eq!(report.issues[0].kind, ChainIssueKind::Unparsable);
    }

    #[test]
    fn test_missing_field_stops_walk() {
        let mut lines = lines_of(&chain(2));
        let mut raw: Value = serde_json::from_str(&lines[0]).unwrap();
        raw.as_object_mut().unwrap().remove("signature_hash");
        lines[0] = raw.to_string();
        let report = verify_chain_content(Path::new("a.jsonl"), &render(&lines));

        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].kind, ChainIssueKind::MissingField);
        assert_eq!(report.lines_unverified, 1);
    }

    #[test]
    fn test_removed_event_breaks_link() {
        let mut lines = lines_of(&chain(3));
        lines.remove(1);
        let report = verify_chain_content(Path::new("a.jsonl"), &render(&lines));

        assert!(!report.valid);
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].line, 2);
        assert_eq!(report.issues[0].kind, ChainIssueKind::BrokenLink);
    }
}
