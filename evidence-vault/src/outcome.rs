//! Diagnostics attached to operation outcomes.

use serde::{Deserialize, Serialize};

/// One warning or error, tagged with the step that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub step: String,
    pub message: String,
}

impl Diagnostic {
    pub fn new(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.step, self.message)
    }
}

/// Ordered warning/error lists shared by every outcome record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub warnings: Vec<Diagnostic>,
    pub errors: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn warn(&mut self, step: &str, message: impl Into<String>) {
        let d = Diagnostic::new(step, message);
        tracing::warn!("{}", d);
        self.warnings.push(d);
    }

    pub fn error(&mut self, step: &str, message: impl Into<String>) {
        let d = Diagnostic::new(step, message);
        tracing::error!("{}", d);
        self.errors.push(d);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.warnings.extend(other.warnings);
        self.errors.extend(other.errors);
    }
}
