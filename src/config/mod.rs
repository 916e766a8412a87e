pub mod loader;

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::store::models::{DependencyRef, OutputRef, VariableMap};

/// Default number of concurrent workers executing steps.
pub const DEFAULT_CONCURRENT_WORKERS: usize = 10;

/// Default period in seconds during which the cached inventory is reused
/// instead of querying the organization directory.
pub const DEFAULT_ORGA_CACHE_EXPIRATION: u64 = 5 * 60;

/// Name of the optional per-module file listing filename patterns used to
/// compute the module hash.
pub const HASH_CONFIG_FILENAME: &str = "hash-config.json";

/// Root of the package definition file. Unknown properties are rejected at
/// every level.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct PackageDefinition {
    pub package_configuration: PackageConfiguration,
    /// Default module configuration, keyed by engine name or `All`.
    #[serde(default)]
    pub default_module_configuration: BTreeMap<String, VariableMap>,
    /// Default variables, keyed by engine name or `All`.
    #[serde(default)]
    pub default_variables: BTreeMap<String, VariableMap>,
    #[serde(default)]
    pub modules: BTreeMap<String, ModuleBlock>,
}

/// Package-level settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct PackageConfiguration {
    /// Location of the object store holding persisted documents
    /// (`state.json`, `orga.json`).
    pub state_location: String,
    /// Optional local inventory document used as the inventory source when
    /// the cache is missing or expired.
    #[serde(default)]
    pub inventory_file: Option<String>,
    #[serde(default = "default_orga_cache_expiration")]
    pub orga_cache_expiration: u64,
    #[serde(default = "default_concurrent_workers")]
    pub concurrent_workers: usize,
    /// ARN of the IAM role to assume when querying the organization
    /// directory.
    #[serde(default)]
    pub assume_orga_role_arn: Option<String>,
    /// Tag key whose value overrides the account name.
    #[serde(default)]
    pub override_account_name_by_tag: Option<String>,
}

fn default_orga_cache_expiration() -> u64 {
    DEFAULT_ORGA_CACHE_EXPIRATION
}

fn default_concurrent_workers() -> usize {
    DEFAULT_CONCURRENT_WORKERS
}

/// Per-module block of the package definition.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ModuleBlock {
    /// Engine-opaque module configuration. The core consumes `AssumeRole`,
    /// `Retry` and `EndpointUrls`; the rest is passed through.
    #[serde(default)]
    pub configuration: VariableMap,
    #[serde(default)]
    pub variables: VariableMap,
    #[serde(default)]
    pub variables_from_outputs: BTreeMap<String, OutputRef>,
    #[serde(default)]
    pub deployments: Vec<DeploymentBlock>,
}

/// One deployment block: a scope (Include/Exclude) plus block-level
/// variables, output references and dependencies.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct DeploymentBlock {
    #[serde(default)]
    pub include: ScopePredicates,
    #[serde(default)]
    pub exclude: ScopePredicates,
    #[serde(default)]
    pub variables: VariableMap,
    #[serde(default)]
    pub variables_from_outputs: BTreeMap<String, OutputRef>,
    #[serde(default)]
    pub dependencies: Vec<DependencyRef>,
}

/// Account and region predicates. All listed predicates are conjunctive;
/// an empty `Include` selects all active accounts and enabled regions.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ScopePredicates {
    #[serde(default)]
    pub account_ids: Vec<String>,
    /// Case-sensitive glob patterns with `*`.
    #[serde(default)]
    pub account_names: Vec<String>,
    /// `Key=Value` pairs.
    #[serde(default)]
    pub account_tags: Vec<String>,
    #[serde(default, rename = "OUIds")]
    pub ou_ids: Vec<String>,
    #[serde(default, rename = "OUTags")]
    pub ou_tags: Vec<String>,
    #[serde(default)]
    pub regions: Vec<String>,
}

/// Retry settings extracted from a module configuration.
/// Defaults: one attempt, no delay.
pub fn retry_parameters(module_config: &VariableMap) -> (u32, u64) {
    let retry = match module_config.get("Retry") {
        Some(serde_json::Value::Object(map)) => map,
        _ => return (1, 0),
    };
    let max_attempts = retry
        .get("MaxAttempts")
        .and_then(|v| v.as_u64())
        .unwrap_or(1) as u32;
    let delay = retry
        .get("DelayBeforeRetrying")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    (max_attempts, delay)
}

/// Merge configuration layers: objects merge by key union, every other
/// value is replaced by the overriding layer (last wins on leaves).
pub fn merge_values(base: &mut VariableMap, overlay: &VariableMap) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(serde_json::Value::Object(existing)), serde_json::Value::Object(incoming)) => {
                merge_values(existing, incoming);
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_is_last_wins_on_leaves() {
        let mut base = json!({"A": 1, "Nested": {"X": 1, "Y": 2}})
            .as_object()
            .unwrap()
            .clone();
        let overlay = json!({"Nested": {"Y": 3, "Z": 4}, "B": true})
            .as_object()
            .unwrap()
            .clone();
        merge_values(&mut base, &overlay);
        assert_eq!(base["A"], json!(1));
        assert_eq!(base["B"], json!(true));
        assert_eq!(base["Nested"], json!({"X": 1, "Y": 3, "Z": 4}));
    }

    #[test]
    fn retry_defaults_when_absent() {
        let config = VariableMap::new();
        assert_eq!(retry_parameters(&config), (1, 0));
    }

    #[test]
    fn retry_reads_module_config() {
        let config = json!({"Retry": {"MaxAttempts": 3, "DelayBeforeRetrying": 10}})
            .as_object()
            .unwrap()
            .clone();
        assert_eq!(retry_parameters(&config), (3, 10));
    }
}
