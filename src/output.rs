use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;
use serde_json::json;
use tracing::info;

use crate::engines::CliCommand;
use crate::graph::StepStatus;
use crate::package::Package;
use crate::store::models::{Action, DeploymentKey};

pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green().bold(), msg.green());
}

pub fn print_error(msg: &str) {
    println!("{} {}", "✗".red().bold(), msg.red());
}

/// Write an output document to the output file.
pub fn write_output(path: &Path, content: &serde_json::Value, description: &str) -> Result<()> {
    let body = serde_json::to_vec_pretty(content)?;
    std::fs::write(path, body)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    info!("Wrote {} to {}", description, path.display());
    Ok(())
}

fn deployment_entry(package: &Package, key: &DeploymentKey) -> serde_json::Value {
    let mut entry = serde_json::to_value(key).expect("keys serialize");
    entry["AccountName"] = json!(package.inventory.account_name(&key.account_id));
    entry
}

/// Export the reconciliation for the `list` command: pending changes,
/// changes skipped by CLI filters, and deployments needing no change.
pub fn export_changes(package: &Package) -> serde_json::Value {
    let mut result = json!({});
    for (key, details) in package.graph.steps() {
        let mut item = json!({
            "Deployment": deployment_entry(package, key),
            "ModuleConfig": package.module_config(key).unwrap_or_default(),
        });
        let show_current = details.action != Action::Create;
        let show_target = details.action != Action::Destroy;
        if show_current {
            if let Some(current) = package.current.get(key) {
                item["CurrentState"] = serde_json::to_value(current).expect("state serializes");
            }
        }
        if show_target && details.action != Action::NoChange {
            if let Some(target) = package.target.get(key) {
                item["TargetState"] = serde_json::to_value(target).expect("state serializes");
            }
        }
        if details.action == Action::NoChange {
            push_into(&mut result, &["NoChanges"], item);
            continue;
        }
        let category = if details.skip {
            "PendingButSkippedChanges"
        } else {
            "PendingChanges"
        };
        push_into(&mut result, &[category, details.action.export_label()], item);
    }
    result
}

/// Export the execution results: completed, failed and still-pending steps
/// grouped by action.
pub fn export_results(package: &Package) -> serde_json::Value {
    let mut result = json!({});
    for (key, details) in package.graph.steps() {
        let status = match details.status {
            StepStatus::Skipped => continue,
            StepStatus::Completed => "Completed",
            StepStatus::Failed => "Failed",
            StepStatus::Pending | StepStatus::Ongoing => "Pending",
        };
        let mut item = json!({
            "Deployment": deployment_entry(package, key),
            "NbAttempts": details.nb_attempts,
        });
        if !details.result.is_empty() {
            item["Result"] = json!(details.result);
        }
        if let Some(error) = details.error {
            item["ErrorKind"] = json!(error.to_string());
        }
        if let Some(detailed) = &details.detailed_results {
            item["DetailedResults"] = detailed.clone();
        }
        if details.status == StepStatus::Completed {
            item["ResultedInChanges"] = json!(details.made_changes);
            if package.command == CliCommand::Apply {
                if let Some(current) = package.current.get(key) {
                    item["Outputs"] = json!(current.outputs);
                }
            }
        }
        push_into(&mut result, &[status, details.action.export_label()], item);
    }
    result
}

/// Export the orphaned deployments found by `remove-orphans`.
pub fn export_orphans(orphans: &[DeploymentKey]) -> serde_json::Value {
    json!({ "OrphanedDeployments": orphans })
}

fn push_into(root: &mut serde_json::Value, path: &[&str], item: serde_json::Value) {
    let mut node = root;
    for segment in path {
        if node.get(*segment).is_none() {
            let next = if segment == path.last().unwrap() {
                json!([])
            } else {
                json!({})
            };
            node[*segment] = next;
        }
        node = node.get_mut(*segment).unwrap();
    }
    node.as_array_mut().expect("leaf is an array").push(item);
}

/// Print the post-run summary line.
pub fn print_run_summary(with_changes: usize, failed: usize, pending: usize) {
    let summary = format!(
        "{} deployments resulted in changes, {} failed, {} still pending",
        with_changes, failed, pending
    );
    if failed > 0 {
        print_error(&summary);
    } else {
        print_success(&summary);
    }
}
