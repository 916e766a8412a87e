use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};

use super::{
    validate_core_config, CliCommand, Engine, StepCommand, StepContext, StepOutcome,
};
use crate::store::models::{Action, DeploymentKey, VariableMap};

/// Engine for Terraform modules. When the module configuration sets
/// `Source`, a `main.tf` wrapping that module is rendered from the resolved
/// variables; otherwise the module's own `.tf` sources are copied into the
/// step workspace and variables are passed through `terraform.tfvars.json`.
/// An `armada.tf` override carries the AWS provider block (region,
/// assume-role, custom endpoints). The engine cache directory is used as
/// the provider plugin cache, shared across steps. Terraform does not
/// serialize concurrent writes to a cold plugin cache; run with
/// `ConcurrentWorkers: 1` until the cache is warm.
pub struct TerraformEngine;

const PLAN_FILE: &str = "plan.tfplan";
const PLAN_JSON: &str = "plan.json";
const OUTPUTS_JSON: &str = "outputs.json";
const OVERRIDE_FILE: &str = "armada.tf";

impl Engine for TerraformEngine {
    fn name(&self) -> &'static str {
        "terraform"
    }

    fn default_excluded_patterns(&self) -> Vec<String> {
        vec![
            ".terraform*".to_string(),
            "*.tfstate*".to_string(),
            "*.tfplan".to_string(),
        ]
    }

    fn validate_module_config(&self, module: &str, config: &VariableMap) -> Result<()> {
        validate_core_config(module, config)?;
        for key in ["TerraformBinary", "Source", "Version"] {
            if let Some(value) = config.get(key) {
                if !value.is_string() {
                    bail!("Configuration of {}: {} must be a string", module, key);
                }
            }
        }
        if let Some(outputs) = config.get("Outputs") {
            let valid = outputs
                .as_array()
                .map(|items| items.iter().all(|item| item.is_string()))
                .unwrap_or(false);
            if !valid {
                bail!(
                    "Configuration of {}: Outputs must be a list of strings",
                    module
                );
            }
        }
        Ok(())
    }

    fn prepare(&self, ctx: &StepContext<'_>) -> Result<Vec<StepCommand>> {
        let workspace = ctx.deployment_cache_dir;

        match ctx.module_config.get("Source").and_then(|v| v.as_str()) {
            Some(source) => {
                let version = ctx.module_config.get("Version").and_then(|v| v.as_str());
                let outputs: Vec<&str> = ctx
                    .module_config
                    .get("Outputs")
                    .and_then(|v| v.as_array())
                    .map(|items| items.iter().filter_map(|item| item.as_str()).collect())
                    .unwrap_or_default();
                let main_tf = render_module_wrapper(source, version, ctx.variables, &outputs);
                std::fs::write(workspace.join("main.tf"), main_tf)
                    .context("Failed to write main.tf")?;
            }
            None => {
                copy_module_sources(ctx.module_dir, workspace)?;
                let tfvars = serde_json::to_vec_pretty(&ctx.variables)?;
                std::fs::write(workspace.join("terraform.tfvars.json"), tfvars)
                    .context("Failed to write terraform.tfvars.json")?;
            }
        }
        std::fs::write(
            workspace.join(OVERRIDE_FILE),
            render_provider_override(ctx.key, ctx.module_config),
        )
        .with_context(|| format!("Failed to write {}", OVERRIDE_FILE))?;

        let binary = ctx
            .module_config
            .get("TerraformBinary")
            .and_then(|v| v.as_str())
            .unwrap_or("terraform")
            .to_string();

        let mut env = BTreeMap::new();
        env.insert("TF_IN_AUTOMATION".to_string(), "1".to_string());
        env.insert("TF_INPUT".to_string(), "0".to_string());
        env.insert(
            "TF_PLUGIN_CACHE_DIR".to_string(),
            ctx.engine_cache_dir.display().to_string(),
        );
        env.insert(
            "TF_PLUGIN_CACHE_MAY_BREAK_DEPENDENCY_LOCK_FILE".to_string(),
            "true".to_string(),
        );
        env.insert("AWS_DEFAULT_REGION".to_string(), ctx.key.region.clone());

        let command = |name: &str, args: &[&str], stdout_file: Option<&str>| StepCommand {
            name: name.to_string(),
            args: std::iter::once(binary.clone())
                .chain(args.iter().map(|a| a.to_string()))
                .collect(),
            cwd: workspace.to_path_buf(),
            assume_role: true,
            env: env.clone(),
            stdout_file: stdout_file.map(|f| workspace.join(f)),
        };

        let mut commands = vec![command("init", &["init", "-no-color"], None)];
        let plan_args: Vec<&str> = if ctx.action == Action::Destroy {
            vec!["plan", "-destroy", "-no-color", "-out", PLAN_FILE]
        } else {
            vec!["plan", "-no-color", "-out", PLAN_FILE]
        };
        commands.push(command("plan", &plan_args, None));
        commands.push(command("show", &["show", "-json", PLAN_FILE], Some(PLAN_JSON)));
        if ctx.command == CliCommand::Apply {
            commands.push(command(
                "apply",
                &["apply", "-no-color", "-auto-approve", PLAN_FILE],
                None,
            ));
            if ctx.action != Action::Destroy {
                commands.push(command("output", &["output", "-json"], Some(OUTPUTS_JSON)));
            }
        }
        Ok(commands)
    }

    fn postprocess(&self, ctx: &StepContext<'_>) -> Result<StepOutcome> {
        let workspace = ctx.deployment_cache_dir;
        let plan: serde_json::Value = read_json(&workspace.join(PLAN_JSON))
            .context("Failed to parse the Terraform plan document")?;
        let (add, change, destroy) = count_resource_changes(&plan);
        let made_changes = add + change + destroy > 0;

        let verb = if ctx.command == CliCommand::Apply {
            "Applied"
        } else {
            "Plan"
        };
        let result = format!(
            "{}: {} to add, {} to change, {} to destroy",
            verb, add, change, destroy
        );
        let detailed_results = plan.get("resource_changes").cloned();

        let outputs = if ctx.command == CliCommand::Apply && ctx.action != Action::Destroy {
            let raw: serde_json::Value = read_json(&workspace.join(OUTPUTS_JSON))
                .context("Failed to parse the Terraform outputs document")?;
            Some(flatten_outputs(&raw))
        } else {
            None
        };

        Ok(StepOutcome {
            made_changes,
            result,
            detailed_results,
            outputs,
        })
    }
}

/// Render a `main.tf` wrapping a registry module: the resolved variables
/// are inlined as HCL and one forwarding output block is emitted per
/// requested output.
fn render_module_wrapper(
    source: &str,
    version: Option<&str>,
    variables: &VariableMap,
    outputs: &[&str],
) -> String {
    let mut tf = String::new();
    tf.push_str("module \"this\" {\n");
    tf.push_str(&format!("  source = \"{}\"\n", source));
    if let Some(version) = version {
        tf.push_str(&format!("  version = \"{}\"\n", version));
    }
    tf.push('\n');
    for (key, value) in variables {
        tf.push_str(&format!("  {} = {}\n", key, json_to_hcl(value)));
    }
    tf.push_str("}\n");
    for output in outputs {
        tf.push_str(&format!(
            "\noutput \"{}\" {{\n  value = module.this.{}\n}}\n",
            output, output
        ));
    }
    tf
}

/// Render the provider override: the step's region, an assume-role section
/// when `AssumeRole` is set, and custom service endpoints from
/// `EndpointUrls`.
fn render_provider_override(key: &DeploymentKey, module_config: &VariableMap) -> String {
    let mut tf = String::new();
    tf.push_str("provider \"aws\" {\n");
    tf.push_str(&format!("  region = \"{}\"\n", key.region));
    if let Some(role_arn) = module_config.get("AssumeRole").and_then(|v| v.as_str()) {
        tf.push_str("  assume_role {\n");
        tf.push_str(&format!("    role_arn = \"{}\"\n", role_arn));
        tf.push_str("    session_name = \"armada\"\n");
        tf.push_str("  }\n");
    }
    if let Some(endpoints) = module_config.get("EndpointUrls").and_then(|v| v.as_object()) {
        tf.push_str("  endpoints {\n");
        for (service, url) in endpoints {
            if let Some(url) = url.as_str() {
                tf.push_str(&format!("    {} = \"{}\"\n", service, url));
            }
        }
        tf.push_str("  }\n");
    }
    tf.push_str("}\n");
    tf
}

/// Convert a JSON value to HCL syntax.
fn json_to_hcl(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => format!("\"{}\"", s),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Array(arr) => {
            let items: Vec<String> = arr.iter().map(json_to_hcl).collect();
            format!("[{}]", items.join(", "))
        }
        serde_json::Value::Object(map) => {
            let entries: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("  {} = {}", k, json_to_hcl(v)))
                .collect();
            format!("{{\n{}\n}}", entries.join("\n"))
        }
        serde_json::Value::Null => "null".to_string(),
    }
}

fn read_json(path: &Path) -> Result<serde_json::Value> {
    let body = std::fs::read(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(serde_json::from_slice(&body)?)
}

/// Count planned actions from a `terraform show -json` document.
fn count_resource_changes(plan: &serde_json::Value) -> (usize, usize, usize) {
    let mut add = 0;
    let mut change = 0;
    let mut destroy = 0;
    let changes = plan
        .get("resource_changes")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    for entry in &changes {
        let actions = entry
            .pointer("/change/actions")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        for action in &actions {
            match action.as_str() {
                Some("create") => add += 1,
                Some("update") => change += 1,
                Some("delete") => destroy += 1,
                _ => {}
            }
        }
    }
    (add, change, destroy)
}

/// Reduce `terraform output -json` entries to their bare values.
fn flatten_outputs(raw: &serde_json::Value) -> VariableMap {
    let mut outputs = VariableMap::new();
    if let Some(map) = raw.as_object() {
        for (name, entry) in map {
            let value = entry.get("value").cloned().unwrap_or(serde_json::Value::Null);
            outputs.insert(name.clone(), value);
        }
    }
    outputs
}

/// Copy module sources into the step workspace so concurrent deployments of
/// the same module never share a working directory.
fn copy_module_sources(from: &Path, to: &Path) -> Result<()> {
    for entry in std::fs::read_dir(from)
        .with_context(|| format!("Failed to list module directory {}", from.display()))?
    {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            std::fs::create_dir_all(&target)?;
            copy_module_sources(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
