pub mod shell;
pub mod terraform;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Result};

use crate::store::models::{Action, DeploymentKey, VariableMap};

/// CLI command driving a run. Engines may behave differently under
/// `preview` (no resource mutation) and `apply`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliCommand {
    Orga,
    List,
    Preview,
    Apply,
    UpdateHash,
    RemoveOrphans,
}

impl CliCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            CliCommand::Orga => "orga",
            CliCommand::List => "list",
            CliCommand::Preview => "preview",
            CliCommand::Apply => "apply",
            CliCommand::UpdateHash => "update-hash",
            CliCommand::RemoveOrphans => "remove-orphans",
        }
    }
}

/// A subprocess to execute for a step.
#[derive(Debug, Clone)]
pub struct StepCommand {
    /// Friendly name used in logs.
    pub name: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// True if assumed-role credentials must be injected as environment
    /// variables of the subprocess.
    pub assume_role: bool,
    pub env: BTreeMap<String, String>,
    /// Capture the subprocess standard output into this file.
    pub stdout_file: Option<PathBuf>,
}

/// Result of a step after postprocess.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// True if the step resulted in changes made or to be made.
    pub made_changes: bool,
    /// One-line summary.
    pub result: String,
    pub detailed_results: Option<serde_json::Value>,
    /// Outputs returned by the deployment. Only meaningful under `apply`
    /// for non-destroy actions.
    pub outputs: Option<VariableMap>,
}

/// Everything an engine needs to prepare or postprocess one step.
pub struct StepContext<'a> {
    pub key: &'a DeploymentKey,
    pub command: CliCommand,
    pub action: Action,
    pub variables: &'a VariableMap,
    pub module_config: &'a VariableMap,
    /// Directory holding the module source files.
    pub module_dir: &'a Path,
    /// Scratch directory private to this step; created before `prepare`,
    /// removed after `postprocess` unless the user keeps it.
    pub deployment_cache_dir: &'a Path,
    /// Cache directory shared by all steps of the same engine, persisted
    /// across runs.
    pub engine_cache_dir: &'a Path,
}

/// The contract between the core and an engine implementation.
pub trait Engine: Send + Sync {
    /// Engine name, also the first directory level under the package root.
    fn name(&self) -> &'static str;

    /// Filename patterns hashed by default for modules of this engine.
    fn default_included_patterns(&self) -> Vec<String> {
        vec!["*".to_string()]
    }

    fn default_excluded_patterns(&self) -> Vec<String> {
        Vec::new()
    }

    /// Reject malformed module configuration before any step runs.
    fn validate_module_config(&self, module: &str, config: &VariableMap) -> Result<()>;

    /// Write input files and return the subprocesses to execute, in order.
    fn prepare(&self, ctx: &StepContext<'_>) -> Result<Vec<StepCommand>>;

    /// Parse the files produced by the subprocesses into a step outcome.
    fn postprocess(&self, ctx: &StepContext<'_>) -> Result<StepOutcome>;
}

/// The engines shipped in-tree, keyed by name.
pub fn builtin_engines() -> BTreeMap<String, Arc<dyn Engine>> {
    let mut engines: BTreeMap<String, Arc<dyn Engine>> = BTreeMap::new();
    engines.insert("terraform".to_string(), Arc::new(terraform::TerraformEngine));
    engines.insert("shell".to_string(), Arc::new(shell::ShellEngine));
    engines
}

/// Validate the module configuration fields consumed by the core itself:
/// `AssumeRole`, `Retry` and `EndpointUrls`. Engines call this before
/// checking their own settings.
pub fn validate_core_config(module: &str, config: &VariableMap) -> Result<()> {
    if let Some(role) = config.get("AssumeRole") {
        if !role.is_string() && !role.is_null() {
            bail!("Configuration of {}: AssumeRole must be null or a string", module);
        }
    }
    if let Some(retry) = config.get("Retry") {
        let Some(retry) = retry.as_object() else {
            bail!("Configuration of {}: Retry must be an object", module);
        };
        if let Some(max_attempts) = retry.get("MaxAttempts") {
            match max_attempts.as_u64() {
                Some(value) if value > 0 => {}
                _ => bail!(
                    "Configuration of {}: MaxAttempts must be a positive integer",
                    module
                ),
            }
        }
        if let Some(delay) = retry.get("DelayBeforeRetrying") {
            if delay.as_u64().is_none() {
                bail!(
                    "Configuration of {}: DelayBeforeRetrying must be a non-negative integer",
                    module
                );
            }
        }
    }
    if let Some(endpoints) = config.get("EndpointUrls") {
        if !endpoints.is_object() {
            bail!("Configuration of {}: EndpointUrls must be an object", module);
        }
    }
    Ok(())
}
