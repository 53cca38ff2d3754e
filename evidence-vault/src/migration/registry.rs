//! Migration steps and the registry that plans paths between versions.

use super::version::SchemaVersion;
use crate::fs::{AtomicWriter, StorageLayout};
use crate::utils::{Result, VaultError};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// What a step's action and conditions get to work with.
pub struct StepContext<'a> {
    pub layout: &'a StorageLayout,
    pub writer: &'a AtomicWriter,
}

pub type StepAction = Box<dyn Fn(&StepContext<'_>) -> anyhow::Result<()> + Send + Sync>;
pub type ConditionCheck = Box<dyn Fn(&StepContext<'_>) -> anyhow::Result<bool> + Send + Sync>;

/// A named yes/no check run before or after a step.
pub struct Condition {
    pub name: String,
    check: ConditionCheck,
}

impl Condition {
    pub fn new<F>(name: &str, check: F) -> Self
    where
        F: Fn(&StepContext<'_>) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            check: Box::new(check),
        }
    }

    pub fn evaluate(&self, ctx: &StepContext<'_>) -> anyhow::Result<bool> {
        (self.check)(ctx)
    }
}

impl std::fmt::Debug for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Condition").field("name", &self.name).finish()
    }
}

/// One forward transformation of on-disk data. Versions are kept as written
/// and validated when the step is registered.
pub struct MigrationStep {
    from: String,
    to: String,
    pub description: String,
    action: StepAction,
    pub preconditions: Vec<Condition>,
    pub postconditions: Vec<Condition>,
    pub requires_confirmation: bool,
    pub idempotent: bool,
}

impl MigrationStep {
    pub fn new<F>(from: &str, to: &str, description: &str, action: F) -> Self
    where
        F: Fn(&StepContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            description: description.to_string(),
            action: Box::new(action),
            preconditions: Vec::new(),
            postconditions: Vec::new(),
            requires_confirmation: false,
            idempotent: false,
        }
    }

    pub fn precondition(mut self, condition: Condition) -> Self {
        self.preconditions.push(condition);
        self
    }

    pub fn postcondition(mut self, condition: Condition) -> Self {
        self.postconditions.push(condition);
        self
    }

    pub fn requires_confirmation(mut self) -> Self {
        self.requires_confirmation = true;
        self
    }

    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    pub fn from_version(&self) -> &str {
        &self.from
    }

    pub fn to_version(&self) -> &str {
        &self.to
    }

    pub fn run(&self, ctx: &StepContext<'_>) -> anyhow::Result<()> {
        (self.action)(ctx)
    }
}

impl std::fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationStep")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("description", &self.description)
            .field("preconditions", &self.preconditions)
            .field("postconditions", &self.postconditions)
            .field("requires_confirmation", &self.requires_confirmation)
            .field("idempotent", &self.idempotent)
            .finish()
    }
}

/// A step accepted by the registry, with its parsed versions.
#[derive(Debug)]
pub struct RegisteredStep {
    pub from: SchemaVersion,
    pub to: SchemaVersion,
    pub step: MigrationStep,
}

impl RegisteredStep {
    pub fn label(&self) -> String {
        format!("{} -> {}", self.from, self.to)
    }
}

#[derive(Debug, Default)]
pub struct MigrationRegistry {
    steps: Vec<RegisteredStep>,
    /// from -> (to -> index into `steps`)
    edges: BTreeMap<SchemaVersion, BTreeMap<SchemaVersion, usize>>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects unparseable versions, steps that do not move forward and
    /// duplicate edges.
    pub fn register(&mut self, step: MigrationStep) -> Result<()> {
        let from: SchemaVersion = step.from.parse()?;
        let to: SchemaVersion = step.to.parse()?;
        if from >= to {
            return Err(VaultError::NonMonotonicStep {
                from: step.from.clone(),
                to: step.to.clone(),
            });
        }
        let targets = self.edges.entry(from).or_default();
        if targets.contains_key(&to) {
            return Err(VaultError::DuplicateStep {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        targets.insert(to, self.steps.len());
        tracing::debug!("[MIGRATION] Registered step {} -> {}", from, to);
        self.steps.push(RegisteredStep { from, to, step });
        Ok(())
    }

    pub fn known_versions(&self) -> BTreeSet<SchemaVersion> {
        self.steps.iter().flat_map(|s| [s.from, s.to]).collect()
    }

    pub fn steps(&self) -> impl Iterator<Item = &RegisteredStep> {
        self.steps.iter()
    }

    /// Steps leading from `from` to `to`: the direct step when one is
    /// registered, otherwise the first path found depth-first with lower
    /// target versions tried first. Empty when `from == to`.
    pub fn get_migration_path(&self, from: &SchemaVersion, to: &SchemaVersion) -> Result<Vec<&RegisteredStep>> {
        if from == to {
            return Ok(Vec::new());
        }
        if let Some(&index) = self.edges.get(from).and_then(|targets| targets.get(to)) {
            return Ok(vec![&self.steps[index]]);
        }

        let mut visited = HashSet::new();
        let mut path = Vec::new();
        if self.search(*from, *to, &mut visited, &mut path) {
            Ok(path.into_iter().map(|i| &self.steps[i]).collect())
        } else {
            Err(VaultError::NoMigrationPath {
                from: from.to_string(),
                to: to.to_string(),
            })
        }
    }

    fn search(
        &self,
        current: SchemaVersion,
        target: SchemaVersion,
        visited: &mut HashSet<SchemaVersion>,
        path: &mut Vec<usize>,
    ) -> bool {
        if current == target {
            return true;
        }
        if !visited.insert(current) {
            return false;
        }
        let Some(targets) = self.edges.get(&current) else {
            return false;
        };
        for (&next, &index) in targets {
            // Steps only move forward, so overshooting can never come back.
            if next > target {
                continue;
            }
            path.push(index);
            if self.search(next, target, visited, path) {
                return true;
            }
            path.pop();
        }
        false
    }
}
