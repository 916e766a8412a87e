use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::{bail, Result};
use regex::Regex;

use crate::config::{merge_values, DeploymentBlock, PackageDefinition};
use crate::inventory::Inventory;
use crate::module::ModuleInfo;
use crate::store::models::{
    DependencyRef, DeploymentKey, OutputRef, TargetState, VariableMap,
};
use crate::store::state::StateStore;

pub const CURRENT_ACCOUNT_ID: &str = "${CURRENT_ACCOUNT_ID}";
pub const CURRENT_REGION: &str = "${CURRENT_REGION}";

/// Expand the package definition against the inventory into the target
/// deployment set. Later blocks override earlier blocks for the same key.
pub fn expand_targets(
    definition: &PackageDefinition,
    modules: &BTreeMap<String, ModuleInfo>,
    inventory: &Inventory,
) -> Result<HashMap<DeploymentKey, TargetState>> {
    let mut targets = HashMap::new();
    for (module_name, module_block) in &definition.modules {
        let module = &modules[module_name];

        // Variable layering, innermost wins: defaults-all < defaults-engine
        // < module-level. Block-level variables land on top per block.
        let mut module_variables = VariableMap::new();
        if let Some(defaults) = definition.default_variables.get("All") {
            merge_values(&mut module_variables, defaults);
        }
        if let Some(defaults) = definition.default_variables.get(&module.engine) {
            merge_values(&mut module_variables, defaults);
        }
        merge_values(&mut module_variables, &module_block.variables);

        for block in &module_block.deployments {
            let mut variables = module_variables.clone();
            merge_values(&mut variables, &block.variables);

            let mut var_from_outputs = module_block.variables_from_outputs.clone();
            var_from_outputs.extend(
                block
                    .variables_from_outputs
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            );

            for (account_id, regions) in block_scope(inventory, block) {
                for region in regions {
                    let key = DeploymentKey::new(module_name, &account_id, &region);
                    let target = TargetState {
                        variables: substitute_map(&variables, &account_id, &region)?,
                        variables_from_outputs: substitute_output_refs(
                            &var_from_outputs,
                            &account_id,
                            &region,
                        )?,
                        dependencies: substitute_dependencies(
                            &block.dependencies,
                            &account_id,
                            &region,
                        )?,
                        module_hash: module.hash.clone(),
                    };
                    targets.insert(key, target);
                }
            }
        }
    }
    Ok(targets)
}

/// Resolve the (account, region) scope of one deployment block. An empty
/// Include selects all active accounts and all enabled regions; Exclude
/// subtracts from the result.
fn block_scope(inventory: &Inventory, block: &DeploymentBlock) -> Vec<(String, Vec<String>)> {
    let mut accounts: BTreeSet<String> = inventory.all_accounts().into_iter().collect();

    let include = &block.include;
    if !include.account_ids.is_empty() {
        intersect(&mut accounts, inventory.accounts_by_id(&include.account_ids));
    }
    if !include.account_names.is_empty() {
        intersect(&mut accounts, inventory.accounts_by_name(&include.account_names));
    }
    if !include.account_tags.is_empty() {
        intersect(&mut accounts, inventory.accounts_by_tag(&include.account_tags));
    }
    if !include.ou_ids.is_empty() {
        intersect(&mut accounts, inventory.accounts_by_ou(&include.ou_ids));
    }
    if !include.ou_tags.is_empty() {
        intersect(&mut accounts, inventory.accounts_by_ou_tag(&include.ou_tags));
    }

    let exclude = &block.exclude;
    if !exclude.account_ids.is_empty() {
        subtract(&mut accounts, inventory.accounts_by_id(&exclude.account_ids));
    }
    if !exclude.account_names.is_empty() {
        subtract(&mut accounts, inventory.accounts_by_name(&exclude.account_names));
    }
    if !exclude.account_tags.is_empty() {
        subtract(&mut accounts, inventory.accounts_by_tag(&exclude.account_tags));
    }
    if !exclude.ou_ids.is_empty() {
        subtract(&mut accounts, inventory.accounts_by_ou(&exclude.ou_ids));
    }
    if !exclude.ou_tags.is_empty() {
        subtract(&mut accounts, inventory.accounts_by_ou_tag(&exclude.ou_tags));
    }

    let all_enabled = vec!["ALL_ENABLED".to_string()];
    accounts
        .into_iter()
        .map(|account_id| {
            let mut regions: BTreeSet<String> = inventory
                .account_regions(&account_id, &all_enabled)
                .into_iter()
                .collect();
            if !include.regions.is_empty() {
                intersect(
                    &mut regions,
                    inventory.account_regions(&account_id, &include.regions),
                );
            }
            if !exclude.regions.is_empty() {
                subtract(
                    &mut regions,
                    inventory.account_regions(&account_id, &exclude.regions),
                );
            }
            (account_id, regions.into_iter().collect())
        })
        .collect()
}

fn intersect(set: &mut BTreeSet<String>, keep: Vec<String>) {
    let keep: BTreeSet<String> = keep.into_iter().collect();
    set.retain(|item| keep.contains(item));
}

fn subtract(set: &mut BTreeSet<String>, drop: Vec<String>) {
    for item in drop {
        set.remove(&item);
    }
}

// ─── Keyword Substitution ───────────────────────────────────────────────────

/// Replace `${CURRENT_ACCOUNT_ID}` and `${CURRENT_REGION}` in a string.
/// Any other `${CURRENT_*}` token is a validation error.
pub fn substitute_str(source: &str, account_id: &str, region: &str) -> Result<String> {
    let replaced = source
        .replace(CURRENT_ACCOUNT_ID, account_id)
        .replace(CURRENT_REGION, region);
    let unknown = Regex::new(r"\$\{CURRENT_[A-Z_]*\}").unwrap();
    if let Some(found) = unknown.find(&replaced) {
        bail!(
            "ValidationError: unrecognized keyword '{}' in '{}'",
            found.as_str(),
            source
        );
    }
    Ok(replaced)
}

/// Replace keywords recursively across a JSON value.
pub fn substitute_value(
    value: &serde_json::Value,
    account_id: &str,
    region: &str,
) -> Result<serde_json::Value> {
    Ok(match value {
        serde_json::Value::String(s) => {
            serde_json::Value::String(substitute_str(s, account_id, region)?)
        }
        serde_json::Value::Array(items) => serde_json::Value::Array(
            items
                .iter()
                .map(|item| substitute_value(item, account_id, region))
                .collect::<Result<_>>()?,
        ),
        serde_json::Value::Object(map) => {
            serde_json::Value::Object(substitute_map(map, account_id, region)?)
        }
        other => other.clone(),
    })
}

pub fn substitute_map(
    map: &VariableMap,
    account_id: &str,
    region: &str,
) -> Result<VariableMap> {
    map.iter()
        .map(|(key, value)| Ok((key.clone(), substitute_value(value, account_id, region)?)))
        .collect()
}

fn substitute_dependencies(
    dependencies: &[DependencyRef],
    account_id: &str,
    region: &str,
) -> Result<Vec<DependencyRef>> {
    dependencies
        .iter()
        .map(|dep| {
            Ok(DependencyRef {
                module: substitute_str(&dep.module, account_id, region)?,
                account_id: substitute_str(&dep.account_id, account_id, region)?,
                region: substitute_str(&dep.region, account_id, region)?,
                ignore_if_not_exists: dep.ignore_if_not_exists,
            })
        })
        .collect()
}

fn substitute_output_refs(
    refs: &BTreeMap<String, OutputRef>,
    account_id: &str,
    region: &str,
) -> Result<BTreeMap<String, OutputRef>> {
    refs.iter()
        .map(|(name, output_ref)| {
            Ok((
                name.clone(),
                OutputRef {
                    module: substitute_str(&output_ref.module, account_id, region)?,
                    account_id: substitute_str(&output_ref.account_id, account_id, region)?,
                    region: substitute_str(&output_ref.region, account_id, region)?,
                    output_name: output_ref.output_name.clone(),
                    ignore_if_not_exists: output_ref.ignore_if_not_exists,
                },
            ))
        })
        .collect()
}

/// Fold the outputs already recorded in the persisted state into the target
/// variables, so that the reconciler compares against the values a fresh
/// apply would use. Missing outputs are left alone here; they only become
/// an error at dispatch time.
pub fn resolve_variables_from_state(target: &mut TargetState, current: &StateStore) {
    for (var_name, output_ref) in &target.variables_from_outputs {
        if let Some(state) = current.get(&output_ref.key()) {
            if let Some(value) = state.outputs.get(&output_ref.output_name) {
                target.variables.insert(var_name.clone(), value.clone());
            }
        }
    }
}
