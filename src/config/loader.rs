use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use regex::Regex;

use super::{PackageDefinition, ScopePredicates};
use crate::module::ModuleInfo;
use crate::store::models::{DependencyRef, OutputRef};

/// Load and validate the package definition file.
pub fn load_package(path: &Path) -> Result<PackageDefinition> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read package file {}", path.display()))?;
    let definition: PackageDefinition = serde_yaml::from_str(&content)
        .context("The package definition file is invalid")?;
    validate_definition(&definition)?;
    Ok(definition)
}

/// Cross-field validation that does not require the module registry.
fn validate_definition(definition: &PackageDefinition) -> Result<()> {
    let config = &definition.package_configuration;
    if config.state_location.is_empty() {
        bail!("PackageConfiguration.StateLocation must not be empty");
    }
    if config.concurrent_workers == 0 {
        bail!("PackageConfiguration.ConcurrentWorkers must be at least 1");
    }
    let account_id = Regex::new(r"^[0-9]{12}$").unwrap();
    for (module, block) in &definition.modules {
        for (index, deployment) in block.deployments.iter().enumerate() {
            for scope in [&deployment.include, &deployment.exclude] {
                validate_scope(module, index, scope, &account_id)?;
            }
            for dep in &deployment.dependencies {
                validate_dependency(module, dep)?;
            }
            for output_ref in deployment.variables_from_outputs.values() {
                validate_output_ref(module, output_ref)?;
            }
        }
        for output_ref in block.variables_from_outputs.values() {
            validate_output_ref(module, output_ref)?;
        }
    }
    Ok(())
}

fn validate_scope(
    module: &str,
    index: usize,
    scope: &ScopePredicates,
    account_id: &Regex,
) -> Result<()> {
    for id in &scope.account_ids {
        if !account_id.is_match(id) {
            bail!(
                "Module {}, deployment block {}: '{}' is not a 12-digit account ID",
                module,
                index + 1,
                id
            );
        }
    }
    for tag in scope.account_tags.iter().chain(scope.ou_tags.iter()) {
        if !tag.contains('=') {
            bail!(
                "Module {}, deployment block {}: tag predicate '{}' must be Key=Value",
                module,
                index + 1,
                tag
            );
        }
    }
    Ok(())
}

fn validate_dependency(module: &str, dep: &DependencyRef) -> Result<()> {
    if dep.module.is_empty() || dep.account_id.is_empty() || dep.region.is_empty() {
        bail!(
            "Module {}: dependency references must set Module, AccountId and Region",
            module
        );
    }
    Ok(())
}

fn validate_output_ref(module: &str, output_ref: &OutputRef) -> Result<()> {
    if output_ref.output_name.is_empty() {
        bail!(
            "Module {}: VariablesFromOutputs references must set OutputName",
            module
        );
    }
    Ok(())
}

/// Validate the parts of the definition that need the module registry:
/// every referenced module must exist in the package directory.
pub fn validate_against_modules(
    definition: &PackageDefinition,
    modules: &BTreeMap<String, ModuleInfo>,
) -> Result<()> {
    for (name, block) in &definition.modules {
        if !modules.contains_key(name) {
            bail!(
                "The package references the module '{}' which does not exist",
                name
            );
        }
        for deployment in &block.deployments {
            for dep in &deployment.dependencies {
                if !modules.contains_key(&dep.module) {
                    bail!(
                        "Module {}: dependency references unknown module '{}'",
                        name,
                        dep.module
                    );
                }
            }
            for output_ref in deployment.variables_from_outputs.values() {
                if !modules.contains_key(&output_ref.module) {
                    bail!(
                        "Module {}: VariablesFromOutputs references unknown module '{}'",
                        name,
                        output_ref.module
                    );
                }
            }
        }
        for output_ref in block.variables_from_outputs.values() {
            if !modules.contains_key(&output_ref.module) {
                bail!(
                    "Module {}: VariablesFromOutputs references unknown module '{}'",
                    name,
                    output_ref.module
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Result<PackageDefinition> {
        let definition: PackageDefinition = serde_yaml::from_str(yaml)?;
        validate_definition(&definition)?;
        Ok(definition)
    }

    #[test]
    fn minimal_package_parses() {
        let definition = parse(
            r#"
PackageConfiguration:
  StateLocation: /tmp/armada-state
"#,
        )
        .unwrap();
        assert_eq!(definition.package_configuration.concurrent_workers, 10);
        assert!(definition.modules.is_empty());
    }

    #[test]
    fn unknown_properties_are_rejected() {
        let result = parse(
            r#"
PackageConfiguration:
  StateLocation: /tmp/armada-state
  SomethingElse: true
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn bad_account_id_is_rejected() {
        let err = parse(
            r#"
PackageConfiguration:
  StateLocation: /tmp/armada-state
Modules:
  vpc:
    Deployments:
      - Include:
          AccountIds: ["12345"]
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("12-digit"));
    }

    #[test]
    fn bad_tag_predicate_is_rejected() {
        let err = parse(
            r#"
PackageConfiguration:
  StateLocation: /tmp/armada-state
Modules:
  vpc:
    Deployments:
      - Include:
          AccountTags: ["Environment"]
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Key=Value"));
    }
}
