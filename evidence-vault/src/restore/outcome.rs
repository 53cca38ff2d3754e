//! Restore outcome records.

use crate::outcome::Diagnostics;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Restore state machine. Stages run in declaration order; `Failed` is
/// reachable from any of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStage {
    Validate,
    Checkpoint,
    Materialize,
    RestoreSnapshot,
    RestoreState,
    Done,
    Failed,
}

impl RestoreStage {
    pub fn as_str(self) -> &'static str {
        match self {
            RestoreStage::Validate => "validate",
            RestoreStage::Checkpoint => "checkpoint",
            RestoreStage::Materialize => "materialize",
            RestoreStage::RestoreSnapshot => "restore_snapshot",
            RestoreStage::RestoreState => "restore_state",
            RestoreStage::Done => "done",
            RestoreStage::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RestoreStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to live data after a state restore failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RollbackStatus {
    NotNeeded,
    /// The checkpoint's snapshot was written back
    RolledBack { checkpoint: PathBuf },
    RollbackFailed { checkpoint: PathBuf, error: String },
    /// Live data is mixed; an operator has to restore `checkpoint` (if any)
    ManualRecoveryRequired { checkpoint: Option<PathBuf> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestorationOutcome {
    pub success: bool,
    pub backup_path: PathBuf,
    /// Last stage reached; `Failed` when the run stopped early
    pub stage: RestoreStage,
    pub stages_completed: Vec<RestoreStage>,
    pub checkpoint_path: Option<PathBuf>,
    pub components_restored: Vec<String>,
    /// Backup files merged, the restored one included
    pub chain_length: usize,
    pub duration_ms: u64,
    pub rollback: RollbackStatus,
    pub diagnostics: Diagnostics,
}

impl RestorationOutcome {
    pub(crate) fn new(backup_path: PathBuf) -> Self {
        Self {
            success: false,
            backup_path,
            stage: RestoreStage::Validate,
            stages_completed: Vec::new(),
            checkpoint_path: None,
            components_restored: Vec::new(),
            chain_length: 0,
            duration_ms: 0,
            rollback: RollbackStatus::NotNeeded,
            diagnostics: Diagnostics::default(),
        }
    }

    pub(crate) fn advance(&mut self, next: RestoreStage) {
        self.stages_completed.push(self.stage);
        self.stage = next;
    }

    pub(crate) fn fail(&mut self, message: impl Into<String>) {
        let stage = self.stage;
        self.diagnostics.error(stage.as_str(), message);
        self.stage = RestoreStage::Failed;
    }
}
