use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};

use super::{validate_core_config, Engine, StepCommand, StepContext, StepOutcome};
use crate::store::models::VariableMap;

/// Engine for arbitrary scripts. The step exchange happens through files in
/// the deployment cache directory: the core writes `input.json`, the script
/// writes `output.json`. Files are the sole channel between the supervisor
/// and the subprocess.
pub struct ShellEngine;

const INPUT_FILE: &str = "input.json";
const OUTPUT_FILE: &str = "output.json";

impl Engine for ShellEngine {
    fn name(&self) -> &'static str {
        "shell"
    }

    fn validate_module_config(&self, module: &str, config: &VariableMap) -> Result<()> {
        validate_core_config(module, config)?;
        for key in ["Script", "Interpreter"] {
            if let Some(value) = config.get(key) {
                if !value.is_string() {
                    bail!("Configuration of {}: {} must be a string", module, key);
                }
            }
        }
        Ok(())
    }

    fn prepare(&self, ctx: &StepContext<'_>) -> Result<Vec<StepCommand>> {
        let input = serde_json::json!({
            "Deployment": ctx.key,
            "Command": ctx.command.as_str(),
            "Action": ctx.action.to_string(),
            "Variables": ctx.variables,
            "ModuleConfig": ctx.module_config,
            "ModulePath": ctx.module_dir,
            "DeploymentCacheDir": ctx.deployment_cache_dir,
            "EngineCacheDir": ctx.engine_cache_dir,
        });
        std::fs::write(
            ctx.deployment_cache_dir.join(INPUT_FILE),
            serde_json::to_vec_pretty(&input)?,
        )
        .context("Failed to write input.json")?;

        let interpreter = ctx
            .module_config
            .get("Interpreter")
            .and_then(|v| v.as_str())
            .unwrap_or("sh")
            .to_string();
        let script = ctx
            .module_config
            .get("Script")
            .and_then(|v| v.as_str())
            .unwrap_or("run.sh");
        let script_path = ctx.module_dir.join(script);
        if !script_path.is_file() {
            bail!(
                "The module script {} does not exist",
                script_path.display()
            );
        }

        Ok(vec![StepCommand {
            name: "script".to_string(),
            args: vec![interpreter, script_path.display().to_string()],
            cwd: ctx.deployment_cache_dir.to_path_buf(),
            assume_role: true,
            env: BTreeMap::new(),
            stdout_file: None,
        }])
    }

    fn postprocess(&self, ctx: &StepContext<'_>) -> Result<StepOutcome> {
        let path = ctx.deployment_cache_dir.join(OUTPUT_FILE);
        let body = std::fs::read(&path)
            .with_context(|| format!("The script did not write {}", path.display()))?;
        let envelope: serde_json::Value =
            serde_json::from_slice(&body).context("output.json is malformed")?;

        let made_changes = envelope
            .get("MadeChanges")
            .and_then(|v| v.as_bool())
            .context("output.json is missing the MadeChanges boolean")?;
        let result = envelope
            .get("Result")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let detailed_results = envelope
            .get("DetailedResults")
            .filter(|v| !v.is_null())
            .cloned();
        let outputs = envelope
            .get("Outputs")
            .and_then(|v| v.as_object())
            .cloned();

        Ok(StepOutcome {
            made_changes,
            result,
            detailed_results,
            outputs,
        })
    }
}
