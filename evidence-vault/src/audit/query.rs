//! Filters and aggregate views over stored audit events.

use super::chain::ChainVerification;
use super::event::AuditEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditQuery {
    pub component: Option<String>,
    pub action: Option<String>,
    /// Inclusive lower bound
    pub start: Option<DateTime<Utc>>,
    /// Inclusive upper bound
    pub end: Option<DateTime<Utc>>,
    /// Keep only the newest `limit` matches
    pub limit: Option<usize>,
}

impl AuditQuery {
    pub fn component(component: &str) -> Self {
        Self {
            component: Some(component.to_string()),
            ..Self::default()
        }
    }

    pub fn with_action(mut self, action: &str) -> Self {
        self.action = Some(action.to_string());
        self
    }

    pub fn between(mut self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    pub fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(component) = &self.component {
            if &event.component != component {
                return false;
            }
        }
        if let Some(action) = &self.action {
            if &event.action != action {
                return false;
            }
        }
        if let Some(start) = self.start {
            if event.timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.end {
            if event.timestamp > end {
                return false;
            }
        }
        true
    }

    /// Sort ascending by time and apply the limit.
    pub(crate) fn finish(&self, mut events: Vec<AuditEvent>) -> Vec<AuditEvent> {
        events.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.event_id.cmp(&b.event_id))
        });
        if let Some(limit) = self.limit {
            if events.len() > limit {
                events.drain(..events.len() - limit);
            }
        }
        events
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChainStatus {
    pub file: PathBuf,
    pub valid: bool,
    pub events: usize,
    pub issues: usize,
}

impl From<&ChainVerification> for FileChainStatus {
    fn from(report: &ChainVerification) -> Self {
        Self {
            file: report.file.clone(),
            valid: report.valid,
            events: report.events_checked,
            issues: report.issues.len(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditSummary {
    pub total_events: usize,
    pub files_checked: usize,
    /// True only when every file's chain verifies
    pub chain_valid: bool,
    pub files: Vec<FileChainStatus>,
    pub events_by_component: BTreeMap<String, usize>,
    pub events_by_action: BTreeMap<String, usize>,
    pub earliest: Option<DateTime<Utc>>,
    pub latest: Option<DateTime<Utc>>,
}

impl AuditSummary {
    pub(crate) fn record_event(&mut self, event: &AuditEvent) {
        self.total_events += 1;
        *self.events_by_component.entry(event.component.clone()).or_default() += 1;
        *self.events_by_action.entry(event.action.clone()).or_default() += 1;
        self.earliest = Some(match self.earliest {
            Some(t) if t <= event.timestamp => t,
            _ => event.timestamp,
        });
        self.latest = Some(match self.latest {
            Some(t) if t >= event.timestamp => t,
            _ => event.timestamp,
        });
    }
}
