//! Audit event records and their signatures.

use crate::integrity::hash_value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Fields covered by `signature_hash`, in no particular order (the hash is
/// taken over their canonical form).
pub const SIGNED_FIELDS: [&str; 6] = [
    "event_id",
    "timestamp",
    "action",
    "component",
    "metadata",
    "previous_hash",
];

/// One line of an audit file. Never updated or deleted once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub component: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Signature of the previous event in the same file; `None` for the first
    pub previous_hash: Option<String>,
    pub signature_hash: String,
}

impl AuditEvent {
    /// Build and sign an event chained onto `previous_hash`.
    pub fn new(
        timestamp: DateTime<Utc>,
        action: &str,
        component: &str,
        metadata: Map<String, Value>,
        previous_hash: Option<String>,
    ) -> serde_json::Result<Self> {
        let mut event = Self {
            event_id: event_id(timestamp, component, action),
            timestamp,
            action: action.to_string(),
            component: component.to_string(),
            metadata,
            previous_hash,
            signature_hash: String::new(),
        };
        event.signature_hash = event.compute_signature()?;
        Ok(event)
    }

    /// Signature recomputed from the event's current fields.
    pub fn compute_signature(&self) -> serde_json::Result<String> {
        match serde_json::to_value(self)? {
            Value::Object(fields) => compute_signature(&fields),
            _ => Err(serde::ser::Error::custom("audit event is not an object")),
        }
    }

    pub fn verify_signature(&self) -> bool {
        matches!(self.compute_signature(), Ok(ref s) if *s == self.signature_hash)
    }
}

/// Signature over the signed fields of a raw event object. Missing fields
/// count as `null`.
pub fn compute_signature(fields: &Map<String, Value>) -> serde_json::Result<String> {
    let mut signed = Map::new();
    for key in SIGNED_FIELDS {
        signed.insert(
            key.to_string(),
            fields.get(key).cloned().unwrap_or(Value::Null),
        );
    }
    hash_value(&Value::Object(signed))
}

/// `<timestamp>_<component>_<action>_<random>`; the random suffix keeps ids
/// unique when the same action fires twice within a microsecond.
fn event_id(timestamp: DateTime<Utc>, component: &str, action: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}_{}_{}_{}",
        timestamp.format("%Y%m%d%H%M%S%6f"),
        component,
        action,
        &suffix[..12]
    )
}
