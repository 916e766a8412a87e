mod common;

use armada::engines::CliCommand;
use armada::output::{export_changes, export_results};
use armada::store::state::StateStore;
use armada::store::LocalObjectStore;
use common::*;
use tempfile::TempDir;

const YAML: &str = r#"
PackageConfiguration:
  StateLocation: unused
Modules:
  module1:
    Deployments:
      - Include:
          Regions: [eu-west-1]
  module2:
    Deployments:
      - Include:
          Regions: [eu-west-1]
"#;

#[test]
fn list_export_groups_changes_by_category() {
    let root = TempDir::new().unwrap();
    let package_dir = root.path().join("package");
    write_shell_module(&package_dir, "module1", SUCCESS_SCRIPT);
    write_shell_module(&package_dir, "module2", SUCCESS_SCRIPT);

    // module2 already applied and unchanged; module1 pending creation.
    let engines = armada::engines::builtin_engines();
    let modules = armada::module::discover_modules(&package_dir, &engines).unwrap();
    let mut state = StateStore::default();
    state.insert(
        key("module2", "eu-west-1"),
        unchanged_record(&modules["module2"].hash, serde_json::json!({})),
    );

    let package = build_package(
        YAML,
        &package_dir,
        one_account_inventory(),
        state,
        CliCommand::List,
        false,
    )
    .unwrap();
    let export = export_changes(&package);

    let creates = export["PendingChanges"]["Create"].as_array().unwrap();
    assert_eq!(creates.len(), 1);
    let entry = &creates[0];
    assert_eq!(entry["Deployment"]["Module"], "module1");
    assert_eq!(entry["Deployment"]["AccountId"], ACCOUNT);
    assert_eq!(entry["Deployment"]["AccountName"], "workload-prod");
    assert!(entry["TargetState"]["ModuleHash"].is_string());
    assert!(entry.get("CurrentState").is_none());

    let no_changes = export["NoChanges"].as_array().unwrap();
    assert_eq!(no_changes.len(), 1);
    assert_eq!(no_changes[0]["Deployment"]["Module"], "module2");
    assert!(no_changes[0]["CurrentState"]["ModuleHash"].is_string());
}

#[tokio::test]
async fn results_export_carries_attempts_and_outputs() {
    let root = TempDir::new().unwrap();
    let package_dir = root.path().join("package");
    write_shell_module(&package_dir, "module1", SUCCESS_SCRIPT);
    write_shell_module(&package_dir, "module2", FAIL_SCRIPT);
    let store = LocalObjectStore::new(root.path().join("store"));
    let temp = root.path().join("temp");

    let mut package = build_package(
        YAML,
        &package_dir,
        one_account_inventory(),
        StateStore::default(),
        CliCommand::Apply,
        false,
    )
    .unwrap();
    run_scheduler(&mut package, &store, &temp, 10).await.unwrap();

    let export = export_results(&package);
    let completed = export["Completed"]["Create"].as_array().unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0]["Deployment"]["Module"], "module1");
    assert_eq!(completed[0]["NbAttempts"], 1);
    assert_eq!(completed[0]["ResultedInChanges"], true);
    assert_eq!(
        completed[0]["Outputs"]["SSMParameterID"],
        serde_json::json!("param-1234")
    );

    let failed = export["Failed"]["Create"].as_array().unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0]["Deployment"]["Module"], "module2");
    assert_eq!(failed[0]["ErrorKind"], "EngineFailure");
}
