use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

pub type VariableMap = serde_json::Map<String, serde_json::Value>;

// ─── Deployment Key ─────────────────────────────────────────────────────────

/// Identity of a module deployment: the (module, account, region) triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct DeploymentKey {
    pub module: String,
    pub account_id: String,
    pub region: String,
}

impl DeploymentKey {
    pub fn new(module: &str, account_id: &str, region: &str) -> Self {
        Self {
            module: module.to_string(),
            account_id: account_id.to_string(),
            region: region.to_string(),
        }
    }
}

impl fmt::Display for DeploymentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{},{}]", self.module, self.account_id, self.region)
    }
}

// ─── References ─────────────────────────────────────────────────────────────

/// A reference to another deployment listed under `Dependencies`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct DependencyRef {
    pub module: String,
    pub account_id: String,
    pub region: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub ignore_if_not_exists: bool,
}

impl DependencyRef {
    pub fn key(&self) -> DeploymentKey {
        DeploymentKey::new(&self.module, &self.account_id, &self.region)
    }
}

/// A reference to another deployment's output, listed under
/// `VariablesFromOutputs`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct OutputRef {
    pub module: String,
    pub account_id: String,
    pub region: String,
    pub output_name: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub ignore_if_not_exists: bool,
}

impl OutputRef {
    pub fn key(&self) -> DeploymentKey {
        DeploymentKey::new(&self.module, &self.account_id, &self.region)
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

// ─── Target & Current State ─────────────────────────────────────────────────

/// What a deployment should look like, derived from the package definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct TargetState {
    pub variables: VariableMap,
    pub variables_from_outputs: BTreeMap<String, OutputRef>,
    pub dependencies: Vec<DependencyRef>,
    pub module_hash: String,
}

/// What a deployment looked like at its last successful apply, as persisted
/// in the package state document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct CurrentState {
    pub variables: VariableMap,
    pub variables_from_outputs: BTreeMap<String, OutputRef>,
    pub dependencies: Vec<DependencyRef>,
    pub module_hash: String,
    pub outputs: VariableMap,
    pub last_changed_time: String,
}

/// Dependencies are order-insensitive: two lists are equal if they contain
/// the same set of references.
pub fn dependencies_equal(a: &[DependencyRef], b: &[DependencyRef]) -> bool {
    let left: BTreeSet<&DependencyRef> = a.iter().collect();
    let right: BTreeSet<&DependencyRef> = b.iter().collect();
    left == right
}

// ─── Actions ────────────────────────────────────────────────────────────────

/// The action the reconciler assigned to a deployment key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Create,
    Update,
    ConditionalUpdate,
    Destroy,
    NoChange,
}

impl Action {
    /// Label used in output documents.
    pub fn export_label(&self) -> &'static str {
        match self {
            Action::Create => "Create",
            Action::Update => "Update",
            Action::ConditionalUpdate => "ConditionalUpdate",
            Action::Destroy => "Destroy",
            Action::NoChange => "NoChange",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::ConditionalUpdate => "conditional-update",
            Action::Destroy => "destroy",
            Action::NoChange => "none",
        };
        write!(f, "{}", verb)
    }
}

// ─── Step Failures ──────────────────────────────────────────────────────────

/// Why a step failed. Graph-construction failures abort the run before
/// scheduling and are not represented here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepErrorKind {
    PreviewBlockedByPendingUpstream,
    UpstreamOutputMissing,
    UpstreamFailed,
    EngineFailure,
    Interrupted,
}

impl StepErrorKind {
    pub fn is_retriable(&self) -> bool {
        matches!(self, StepErrorKind::EngineFailure)
    }
}

impl fmt::Display for StepErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepErrorKind::PreviewBlockedByPendingUpstream => "PreviewBlockedByPendingUpstream",
            StepErrorKind::UpstreamOutputMissing => "UpstreamOutputMissing",
            StepErrorKind::UpstreamFailed => "UpstreamFailed",
            StepErrorKind::EngineFailure => "EngineFailure",
            StepErrorKind::Interrupted => "Interrupted",
        };
        write!(f, "{}", name)
    }
}

/// A per-step failure carried on the step record.
#[derive(Debug, Clone)]
pub struct StepFailure {
    pub kind: StepErrorKind,
    pub message: String,
    pub detailed_results: Option<serde_json::Value>,
}

impl StepFailure {
    pub fn new(kind: StepErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detailed_results: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.detailed_results = Some(details);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dep(module: &str, account: &str, region: &str) -> DependencyRef {
        DependencyRef {
            module: module.to_string(),
            account_id: account.to_string(),
            region: region.to_string(),
            ignore_if_not_exists: false,
        }
    }

    #[test]
    fn key_display_uses_bracket_form() {
        let key = DeploymentKey::new("vpc", "123456789012", "eu-west-1");
        assert_eq!(key.to_string(), "[vpc,123456789012,eu-west-1]");
    }

    #[test]
    fn dependencies_compare_as_sets() {
        let a = vec![dep("a", "1", "r"), dep("b", "2", "r")];
        let b = vec![dep("b", "2", "r"), dep("a", "1", "r")];
        assert!(dependencies_equal(&a, &b));
        let c = vec![dep("a", "1", "r")];
        assert!(!dependencies_equal(&a, &c));
    }

    #[test]
    fn key_serde_round_trip() {
        let key = DeploymentKey::new("vpc", "123456789012", "eu-west-1");
        let json = serde_json::to_string(&key).unwrap();
        assert!(json.contains("\"Module\":\"vpc\""));
        assert!(json.contains("\"AccountId\":\"123456789012\""));
        let back: DeploymentKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
