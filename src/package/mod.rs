pub mod expand;
pub mod reconcile;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tracing::info;

use crate::config::{merge_values, retry_parameters, PackageDefinition};
use crate::engines::{CliCommand, Engine, StepOutcome};
use crate::graph::{DeploymentGraph, StepStatus};
use crate::inventory::Inventory;
use crate::module::ModuleInfo;
use crate::store::models::{
    Action, CurrentState, DeploymentKey, StepErrorKind, StepFailure, TargetState, VariableMap,
};
use crate::store::state::StateStore;
use crate::store::ObjectStore;

/// Scope restrictions from the CLI `--include-*` / `--exclude-*` flags.
/// They intersect with the package scope: out-of-scope steps are marked
/// skipped, not removed, so graph validation still sees them.
#[derive(Debug, Default, Clone)]
pub struct CliFilters {
    pub include_modules: Option<Vec<String>>,
    pub exclude_modules: Option<Vec<String>>,
    pub include_account_ids: Option<Vec<String>>,
    pub include_account_names: Option<Vec<String>>,
    pub include_account_tags: Option<Vec<String>>,
    pub include_ou_ids: Option<Vec<String>>,
    pub include_ou_tags: Option<Vec<String>>,
    pub exclude_account_ids: Option<Vec<String>>,
    pub exclude_account_names: Option<Vec<String>>,
    pub exclude_account_tags: Option<Vec<String>>,
    pub exclude_ou_ids: Option<Vec<String>>,
    pub exclude_ou_tags: Option<Vec<String>>,
    pub include_regions: Option<Vec<String>>,
    pub exclude_regions: Option<Vec<String>>,
}

/// The resolved filter sets a key must fall into to be in scope.
#[derive(Debug)]
struct ResolvedFilters {
    modules: BTreeSet<String>,
    account_ids: BTreeSet<String>,
    regions: BTreeSet<String>,
}

/// A loaded package: definition, discovered modules, inventory, persisted
/// state, the expanded target set and the validated deployment graph.
#[derive(Debug)]
pub struct Package {
    pub definition: PackageDefinition,
    pub modules: BTreeMap<String, ModuleInfo>,
    pub inventory: Inventory,
    pub target: HashMap<DeploymentKey, TargetState>,
    pub current: StateStore,
    pub graph: DeploymentGraph,
    pub command: CliCommand,
    modules_config: BTreeMap<String, VariableMap>,
    filters: ResolvedFilters,
}

impl Package {
    /// Expand, reconcile and build the validated deployment graph.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        definition: PackageDefinition,
        modules: BTreeMap<String, ModuleInfo>,
        inventory: Inventory,
        current: StateStore,
        engines: &BTreeMap<String, Arc<dyn Engine>>,
        command: CliCommand,
        cli_filters: &CliFilters,
        force_update: bool,
    ) -> Result<Self> {
        // Merge and validate module configuration layers up front, so a
        // malformed configuration fails before any step runs.
        let mut modules_config = BTreeMap::new();
        for (name, block) in &definition.modules {
            let module = modules
                .get(name)
                .with_context(|| format!("Unknown module '{}'", name))?;
            let mut config = VariableMap::new();
            if let Some(defaults) = definition.default_module_configuration.get("All") {
                merge_values(&mut config, defaults);
            }
            if let Some(defaults) = definition.default_module_configuration.get(&module.engine)
            {
                merge_values(&mut config, defaults);
            }
            merge_values(&mut config, &block.configuration);
            engines[&module.engine].validate_module_config(name, &config)?;
            modules_config.insert(name.clone(), config);
        }

        let mut target = expand::expand_targets(&definition, &modules, &inventory)?;
        for state in target.values_mut() {
            expand::resolve_variables_from_state(state, &current);
        }

        let filters = resolve_filters(cli_filters, &modules, &inventory);

        let mut package = Self {
            definition,
            modules,
            inventory,
            target,
            current,
            graph: DeploymentGraph::new(),
            command,
            modules_config,
            filters,
        };
        package.build_graph(force_update)?;
        Ok(package)
    }

    fn build_graph(&mut self, force_update: bool) -> Result<()> {
        let mut keys: Vec<DeploymentKey> = self.target.keys().cloned().collect();
        keys.sort();
        for key in keys {
            let target = &self.target[&key];
            let action = reconcile::classify(target, self.current.get(&key), force_update);
            let skip = !self.in_scope(&key);
            let (max_attempts, delay) = self.retry_for(&key.module);
            self.graph.add_step(key, action, skip, max_attempts, delay);
        }
        let mut current_keys: Vec<DeploymentKey> = self.current.keys().cloned().collect();
        current_keys.sort();
        for key in current_keys {
            if self.target.contains_key(&key) {
                continue;
            }
            // Destroys still need engine settings, so the module block must
            // exist even with an empty list of deployments.
            if !self.modules_config.contains_key(&key.module) {
                bail!(
                    "There must be a block for the module '{}' even with an empty list of deployments",
                    key.module
                );
            }
            let skip = !self.in_scope(&key);
            let (max_attempts, delay) = self.retry_for(&key.module);
            self.graph
                .add_step(key.clone(), Action::Destroy, skip, max_attempts, delay);
        }

        // Dependencies come from the target state when the key is in it,
        // otherwise from the record persisted at the last apply.
        let step_keys: Vec<DeploymentKey> =
            self.graph.steps().map(|(key, _)| key.clone()).collect();
        for key in step_keys {
            let (dependencies, var_refs) = match self.target.get(&key) {
                Some(target) => (
                    target.dependencies.clone(),
                    target.variables_from_outputs.clone(),
                ),
                None => {
                    let current = self.current.get(&key).unwrap();
                    (
                        current.dependencies.clone(),
                        current.variables_from_outputs.clone(),
                    )
                }
            };
            for dep in &dependencies {
                self.graph
                    .add_dependency(&dep.key(), &key, false, dep.ignore_if_not_exists)?;
            }
            for output_ref in var_refs.values() {
                self.graph.add_dependency(
                    &output_ref.key(),
                    &key,
                    true,
                    output_ref.ignore_if_not_exists,
                )?;
            }
        }
        self.graph.validate()
    }

    fn retry_for(&self, module: &str) -> (u32, u64) {
        self.modules_config
            .get(module)
            .map(|config| retry_parameters(config))
            .unwrap_or((1, 0))
    }

    fn in_scope(&self, key: &DeploymentKey) -> bool {
        self.filters.modules.contains(&key.module)
            && self.filters.account_ids.contains(&key.account_id)
            && self.filters.regions.contains(&key.region)
    }

    pub fn module_info(&self, key: &DeploymentKey) -> &ModuleInfo {
        &self.modules[&key.module]
    }

    /// Module configuration for one deployment, with the current-account and
    /// current-region keywords substituted.
    pub fn module_config(&self, key: &DeploymentKey) -> Result<VariableMap> {
        let config = self
            .modules_config
            .get(&key.module)
            .with_context(|| format!("No configuration for module '{}'", key.module))?;
        expand::substitute_map(config, &key.account_id, &key.region)
    }

    /// Resolve the variables an engine receives for one step. Create and
    /// update steps use target variables with the freshest upstream outputs
    /// folded in; destroys replay the variables recorded at apply time.
    /// A missing upstream output fails the step unless the reference
    /// carries `IgnoreIfNotExists`, in which case lower layers survive.
    pub fn resolve_step_variables(
        &self,
        key: &DeploymentKey,
        action: Action,
    ) -> Result<VariableMap, StepFailure> {
        if action == Action::Destroy {
            return Ok(self
                .current
                .get(key)
                .map(|state| state.variables.clone())
                .unwrap_or_default());
        }
        let target = &self.target[key];
        let mut variables = target.variables.clone();
        for (var_name, output_ref) in &target.variables_from_outputs {
            let output = self
                .current
                .get(&output_ref.key())
                .and_then(|state| state.outputs.get(&output_ref.output_name));
            match output {
                Some(value) => {
                    variables.insert(var_name.clone(), value.clone());
                }
                None if output_ref.ignore_if_not_exists => {}
                None => {
                    return Err(StepFailure::new(
                        StepErrorKind::UpstreamOutputMissing,
                        format!(
                            "The output '{}' of {} required by variable '{}' does not exist",
                            output_ref.output_name,
                            output_ref.key(),
                            var_name
                        ),
                    ));
                }
            }
        }
        Ok(variables)
    }

    /// Decide whether a ConditionalUpdate must actually execute: resolve
    /// the current output values and compare with the persisted record.
    pub fn conditional_update_needed(
        &self,
        key: &DeploymentKey,
    ) -> Result<bool, StepFailure> {
        let variables = self.resolve_step_variables(key, Action::Update)?;
        let target = &self.target[key];
        let current = self.current.get(key).expect("conditional update has state");
        Ok(variables != current.variables || target.module_hash != current.module_hash)
    }

    /// Record a successful step. Under `apply` the persisted state is
    /// rewritten: destroys drop the record, everything else stores the
    /// target state plus the returned outputs.
    pub fn complete(&mut self, key: &DeploymentKey, outcome: StepOutcome) {
        {
            let details = self.graph.details_mut(key);
            details.status = StepStatus::Completed;
            details.made_changes = outcome.made_changes;
            details.result = outcome.result;
            details.detailed_results = outcome.detailed_results;
        }
        if self.command != CliCommand::Apply {
            return;
        }
        let action = self.graph.details(key).action;
        if action == Action::Destroy {
            self.current.remove(key);
            return;
        }
        let target = &self.target[key];
        let variables = match self.resolve_step_variables(key, action) {
            Ok(variables) => variables,
            Err(_) => target.variables.clone(),
        };
        self.current.insert(
            key.clone(),
            CurrentState {
                variables,
                variables_from_outputs: target.variables_from_outputs.clone(),
                dependencies: target.dependencies.clone(),
                module_hash: target.module_hash.clone(),
                outputs: outcome.outputs.unwrap_or_default(),
                last_changed_time: Utc::now().to_rfc3339(),
            },
        );
    }

    /// Record a step completion that made no changes, leaving the persisted
    /// record untouched.
    pub fn complete_without_changes(&mut self, key: &DeploymentKey, result: &str) {
        let details = self.graph.details_mut(key);
        details.status = StepStatus::Completed;
        details.made_changes = false;
        details.result = result.to_string();
    }

    /// Record a failed step. The persisted state is never touched.
    pub fn fail(&mut self, key: &DeploymentKey, failure: StepFailure) {
        let details = self.graph.details_mut(key);
        details.status = StepStatus::Failed;
        details.error = Some(failure.kind);
        details.result = failure.message;
        details.detailed_results = failure.detailed_results;
    }

    /// `update-hash`: rewrite the persisted module hash of an Update step
    /// without executing anything. Returns true if the hash changed.
    pub fn update_hash(&mut self, key: &DeploymentKey) -> bool {
        if self.graph.details(key).action == Action::Update {
            let target_hash = self.target[key].module_hash.clone();
            if let Some(state) = self.current.get(key) {
                if state.module_hash != target_hash {
                    let mut state = state.clone();
                    state.module_hash = target_hash;
                    state.last_changed_time = Utc::now().to_rfc3339();
                    self.current.insert(key.clone(), state);
                    let details = self.graph.details_mut(key);
                    details.status = StepStatus::Completed;
                    details.made_changes = true;
                    details.result = "Updated the module hash".to_string();
                    return true;
                }
            }
        }
        self.complete_without_changes(key, "No action needed");
        false
    }

    /// Drop state records whose account or region is no longer active.
    /// Scope filters do not apply here: the whole state is walked.
    pub fn remove_orphans(&mut self, dry_run: bool) -> Vec<DeploymentKey> {
        let orphans: Vec<DeploymentKey> = self
            .current
            .keys()
            .filter(|key| {
                !self
                    .inventory
                    .account_region_exists(&key.account_id, &key.region)
            })
            .cloned()
            .collect();
        if !dry_run {
            for key in &orphans {
                self.current.remove(key);
            }
        }
        info!(
            orphans = orphans.len(),
            dry_run, "Orphaned module deployments"
        );
        orphans
    }

    /// Log a summary of the pending changes and return whether any step in
    /// scope has work to do.
    pub fn analyze_changes(&self) -> bool {
        let mut pending: BTreeMap<&'static str, usize> = BTreeMap::new();
        let mut skipped: BTreeMap<&'static str, usize> = BTreeMap::new();
        let mut pending_total = 0;
        for (_, details) in self.graph.steps() {
            if details.action == Action::NoChange {
                continue;
            }
            let label = details.action.export_label();
            if details.skip {
                *skipped.entry(label).or_insert(0) += 1;
            } else {
                *pending.entry(label).or_insert(0) += 1;
                pending_total += 1;
            }
        }
        let prefixes = [
            ("Create", "Deployments to create"),
            ("Update", "Deployments to update"),
            (
                "ConditionalUpdate",
                "Deployments that may need updates if the outputs on which they depend change",
            ),
            ("Destroy", "Deployments to destroy"),
        ];
        for (label, prefix) in prefixes {
            let count = pending.get(label).copied().unwrap_or(0);
            let skipped_count = skipped.get(label).copied().unwrap_or(0);
            if count + skipped_count > 0 {
                info!(
                    "{}: {} ({} skipped due to CLI filters)",
                    prefix, count, skipped_count
                );
            }
        }
        if pending_total == 0 {
            info!("No changes to be made during this run");
        }
        pending_total > 0
    }

    /// Counts after execution: (steps that made changes, steps that failed,
    /// steps still pending).
    pub fn analyze_results(&self) -> (usize, usize, usize) {
        let mut with_changes = 0;
        let mut failed = 0;
        let mut pending = 0;
        for (_, details) in self.graph.steps() {
            match details.status {
                StepStatus::Completed if details.made_changes => with_changes += 1,
                StepStatus::Failed => failed += 1,
                StepStatus::Pending | StepStatus::Ongoing => pending += 1,
                _ => {}
            }
        }
        (with_changes, failed, pending)
    }

    /// Persist the package state.
    pub async fn save(&mut self, store: &dyn ObjectStore) -> Result<bool> {
        self.current.save(store).await
    }
}

fn resolve_filters(
    filters: &CliFilters,
    modules: &BTreeMap<String, ModuleInfo>,
    inventory: &Inventory,
) -> ResolvedFilters {
    let mut in_scope_modules: BTreeSet<String> = modules.keys().cloned().collect();
    if let Some(include) = &filters.include_modules {
        in_scope_modules.retain(|module| include.contains(module));
    }
    if let Some(exclude) = &filters.exclude_modules {
        in_scope_modules.retain(|module| !exclude.contains(module));
    }

    let mut account_ids: BTreeSet<String> = inventory.all_accounts().into_iter().collect();
    let mut apply_include = |selected: Vec<String>| {
        let selected: BTreeSet<String> = selected.into_iter().collect();
        account_ids.retain(|id| selected.contains(id));
    };
    if let Some(ids) = &filters.include_account_ids {
        apply_include(inventory.accounts_by_id(ids));
    }
    if let Some(names) = &filters.include_account_names {
        apply_include(inventory.accounts_by_name(names));
    }
    if let Some(tags) = &filters.include_account_tags {
        apply_include(inventory.accounts_by_tag(tags));
    }
    if let Some(ous) = &filters.include_ou_ids {
        apply_include(inventory.accounts_by_ou(ous));
    }
    if let Some(tags) = &filters.include_ou_tags {
        apply_include(inventory.accounts_by_ou_tag(tags));
    }
    let mut apply_exclude = |selected: Vec<String>| {
        for id in selected {
            account_ids.remove(&id);
        }
    };
    if let Some(ids) = &filters.exclude_account_ids {
        apply_exclude(inventory.accounts_by_id(ids));
    }
    if let Some(names) = &filters.exclude_account_names {
        apply_exclude(inventory.accounts_by_name(names));
    }
    if let Some(tags) = &filters.exclude_account_tags {
        apply_exclude(inventory.accounts_by_tag(tags));
    }
    if let Some(ous) = &filters.exclude_ou_ids {
        apply_exclude(inventory.accounts_by_ou(ous));
    }
    if let Some(tags) = &filters.exclude_ou_tags {
        apply_exclude(inventory.accounts_by_ou_tag(tags));
    }

    let mut regions: BTreeSet<String> = inventory.all_enabled_regions().into_iter().collect();
    if let Some(include) = &filters.include_regions {
        regions.retain(|region| include.contains(region));
    }
    if let Some(exclude) = &filters.exclude_regions {
        regions.retain(|region| !exclude.contains(region));
    }

    ResolvedFilters {
        modules: in_scope_modules,
        account_ids,
        regions,
    }
}
