#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use tokio::sync::watch;

use armada::engines::{builtin_engines, CliCommand};
use armada::exec::credentials::{CliCredentialsProvider, CredentialCache};
use armada::exec::scheduler::{Scheduler, SchedulerOptions};
use armada::exec::{CancelLevel, Dispatcher};
use armada::inventory::Inventory;
use armada::module::discover_modules;
use armada::package::{CliFilters, Package};
use armada::store::models::{CurrentState, DeploymentKey};
use armada::store::state::StateStore;
use armada::store::ObjectStore;

pub const ACCOUNT: &str = "123456789012";

/// One account enabled in eu-west-1 and us-east-1.
pub fn one_account_inventory() -> Inventory {
    serde_json::from_value(serde_json::json!({
        "Accounts": {
            ACCOUNT: {
                "Name": "workload-prod",
                "ParentOUs": ["ou-root"],
                "Tags": {"Environment": "prod"},
                "EnabledRegions": ["eu-west-1", "us-east-1"],
            },
        },
        "OUs": {
            "ou-root": {"Name": "Root", "Tags": {}},
        },
    }))
    .unwrap()
}

/// Script that reports a successful step with one output.
pub const SUCCESS_SCRIPT: &str = r#"cat > output.json <<'EOF'
{"MadeChanges": true, "Result": "applied", "DetailedResults": null, "Outputs": {"SSMParameterID": "param-1234"}}
EOF
"#;

/// Script that always fails.
pub const FAIL_SCRIPT: &str = "exit 1\n";

/// Script that fails on the first attempt and succeeds afterwards.
pub const FLAKY_SCRIPT: &str = r#"dir=$(dirname "$0")
if [ -f "$dir/.tried" ]; then
cat > output.json <<'EOF'
{"MadeChanges": true, "Result": "applied on retry", "DetailedResults": null, "Outputs": {}}
EOF
else
touch "$dir/.tried"
exit 1
fi
"#;

/// Write a shell module under `<package_dir>/shell/<name>/run.sh`.
pub fn write_shell_module(package_dir: &Path, name: &str, script: &str) {
    let module_dir = package_dir.join("shell").join(name);
    std::fs::create_dir_all(&module_dir).unwrap();
    std::fs::write(module_dir.join("run.sh"), script).unwrap();
}

/// Build a package from a definition document and the modules found under
/// `package_dir`, with no CLI filters.
pub fn build_package(
    yaml: &str,
    package_dir: &Path,
    inventory: Inventory,
    state: StateStore,
    command: CliCommand,
    force_update: bool,
) -> anyhow::Result<Package> {
    let engines = builtin_engines();
    let modules = discover_modules(package_dir, &engines)?;
    let definition = serde_yaml::from_str(yaml)?;
    Package::new(
        definition,
        modules,
        inventory,
        state,
        &engines,
        command,
        &CliFilters::default(),
        force_update,
    )
}

/// Run the scheduler to completion with a quiet cancellation channel.
pub async fn run_scheduler(
    package: &mut Package,
    store: &dyn ObjectStore,
    temp_dir: &Path,
    workers: usize,
) -> anyhow::Result<()> {
    let (_tx, rx) = watch::channel(CancelLevel::None);
    run_scheduler_with_cancel(package, store, temp_dir, workers, rx).await
}

pub async fn run_scheduler_with_cancel(
    package: &mut Package,
    store: &dyn ObjectStore,
    temp_dir: &Path,
    workers: usize,
    cancel: watch::Receiver<CancelLevel>,
) -> anyhow::Result<()> {
    let credentials = Arc::new(CredentialCache::new(Arc::new(CliCredentialsProvider)));
    let dispatcher = Arc::new(Dispatcher::new(
        builtin_engines(),
        temp_dir,
        false,
        credentials,
    )?);
    let scheduler = Scheduler::new(SchedulerOptions {
        workers,
        checkpoint_every_secs: None,
    });
    scheduler.run(package, dispatcher, store, cancel).await
}

pub fn key(module: &str, region: &str) -> DeploymentKey {
    DeploymentKey::new(module, ACCOUNT, region)
}

/// A persisted record equivalent to a target with no variables and no
/// dependencies, as if the module had been applied unchanged.
pub fn unchanged_record(module_hash: &str, outputs: serde_json::Value) -> CurrentState {
    CurrentState {
        variables: Default::default(),
        variables_from_outputs: Default::default(),
        dependencies: Vec::new(),
        module_hash: module_hash.to_string(),
        outputs: outputs.as_object().cloned().unwrap_or_default(),
        last_changed_time: "2024-01-01T00:00:00Z".to_string(),
    }
}
