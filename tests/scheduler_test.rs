mod common;

use armada::engines::CliCommand;
use armada::graph::StepStatus;
use armada::module::discover_modules;
use armada::store::models::{Action, StepErrorKind};
use armada::store::state::StateStore;
use armada::store::LocalObjectStore;
use common::*;
use tempfile::TempDir;
use tokio::sync::watch;

const TWO_MODULE_OUTPUT_YAML: &str = r#"
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
        VariablesFromOutputs:
          VarKey:
            Module: module1
            AccountId: "123456789012"
            Region: eu-west-1
            OutputName: SSMParameterID
"#;

fn module1_hash(package_dir: &std::path::Path) -> String {
    let engines = armada::engines::builtin_engines();
    let modules = discover_modules(package_dir, &engines).unwrap();
    modules["module1"].hash.clone()
}

/// Preview fails a step whose upstream has pending changes: its inputs
/// would be predicted against a state that does not exist yet.
#[tokio::test]
async fn preview_blocked_by_pending_upstream() {
    let root = TempDir::new().unwrap();
    let package_dir = root.path().join("package");
    write_shell_module(&package_dir, "module1", SUCCESS_SCRIPT);
    write_shell_module(&package_dir, "module2", SUCCESS_SCRIPT);
    let store = LocalObjectStore::new(root.path().join("store"));
    let temp = root.path().join("temp");

    let mut package = build_package(
        TWO_MODULE_OUTPUT_YAML,
        &package_dir,
        one_account_inventory(),
        StateStore::default(),
        CliCommand::Preview,
        false,
    )
    .unwrap();
    run_scheduler(&mut package, &store, &temp, 10).await.unwrap();

    assert_eq!(
        package.graph.details(&key("module1", "eu-west-1")).status,
        StepStatus::Completed
    );
    let module2 = package.graph.details(&key("module2", "eu-west-1"));
    assert_eq!(module2.status, StepStatus::Failed);
    assert_eq!(
        module2.error,
        Some(StepErrorKind::PreviewBlockedByPendingUpstream)
    );
    // Preview never touches the persisted state.
    assert!(package.current.is_empty());
}

/// Preview proceeds when the upstream reconciled to NoChange.
#[tokio::test]
async fn preview_allowed_when_upstream_unchanged() {
    let root = TempDir::new().unwrap();
    let package_dir = root.path().join("package");
    write_shell_module(&package_dir, "module1", SUCCESS_SCRIPT);
    write_shell_module(&package_dir, "module2", SUCCESS_SCRIPT);
    let store = LocalObjectStore::new(root.path().join("store"));
    let temp = root.path().join("temp");

    let mut state = StateStore::default();
    state.insert(
        key("module1", "eu-west-1"),
        unchanged_record(
            &module1_hash(&package_dir),
            serde_json::json!({"SSMParameterID": "param-1234"}),
        ),
    );

    let mut package = build_package(
        TWO_MODULE_OUTPUT_YAML,
        &package_dir,
        one_account_inventory(),
        state,
        CliCommand::Preview,
        false,
    )
    .unwrap();
    assert_eq!(
        package.graph.details(&key("module1", "eu-west-1")).action,
        Action::NoChange
    );
    run_scheduler(&mut package, &store, &temp, 10).await.unwrap();

    let module2 = package.graph.details(&key("module2", "eu-west-1"));
    assert_eq!(module2.status, StepStatus::Completed);
}

/// Applying resolves output-backed variables from the upstream step that
/// just completed, and records them in the persisted state.
#[tokio::test]
async fn outputs_flow_into_downstream_variables() {
    let root = TempDir::new().unwrap();
    let package_dir = root.path().join("package");
    write_shell_module(&package_dir, "module1", SUCCESS_SCRIPT);
    write_shell_module(&package_dir, "module2", SUCCESS_SCRIPT);
    let store = LocalObjectStore::new(root.path().join("store"));
    let temp = root.path().join("temp");

    let mut package = build_package(
        TWO_MODULE_OUTPUT_YAML,
        &package_dir,
        one_account_inventory(),
        StateStore::default(),
        CliCommand::Apply,
        false,
    )
    .unwrap();
    run_scheduler(&mut package, &store, &temp, 10).await.unwrap();

    let module2 = package.current.get(&key("module2", "eu-west-1")).unwrap();
    assert_eq!(module2.variables["VarKey"], serde_json::json!("param-1234"));
}

/// A missing upstream output fails the step unless the reference carries
/// IgnoreIfNotExists.
#[tokio::test]
async fn missing_output_fails_or_is_ignored() {
    let yaml_missing = r#"
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
        VariablesFromOutputs:
          VarKey:
            Module: module1
            AccountId: "123456789012"
            Region: eu-west-1
            OutputName: DoesNotExist
"#;
    let yaml_ignored = r#"
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
        Variables:
          VarKey: fallback
        VariablesFromOutputs:
          VarKey:
            Module: module1
            AccountId: "123456789012"
            Region: eu-west-1
            OutputName: DoesNotExist
            IgnoreIfNotExists: true
"#;
    for (yaml, expect_failure) in [(yaml_missing, true), (yaml_ignored, false)] {
        let root = TempDir::new().unwrap();
        let package_dir = root.path().join("package");
        write_shell_module(&package_dir, "module1", SUCCESS_SCRIPT);
        write_shell_module(&package_dir, "module2", SUCCESS_SCRIPT);
        let store = LocalObjectStore::new(root.path().join("store"));
        let temp = root.path().join("temp");

        let mut state = StateStore::default();
        state.insert(
            key("module1", "eu-west-1"),
            unchanged_record(
                &module1_hash(&package_dir),
                serde_json::json!({"SSMParameterID": "param-1234"}),
            ),
        );
        let mut package = build_package(
            yaml,
            &package_dir,
            one_account_inventory(),
            state,
            CliCommand::Apply,
            false,
        )
        .unwrap();
        run_scheduler(&mut package, &store, &temp, 10).await.unwrap();

        let module2 = package.graph.details(&key("module2", "eu-west-1"));
        if expect_failure {
            assert_eq!(module2.status, StepStatus::Failed);
            assert_eq!(module2.error, Some(StepErrorKind::UpstreamOutputMissing));
        } else {
            assert_eq!(module2.status, StepStatus::Completed);
            let record = package.current.get(&key("module2", "eu-west-1")).unwrap();
            assert_eq!(record.variables["VarKey"], serde_json::json!("fallback"));
        }
    }
}

/// A failed step fails its transitive dependents with UpstreamFailed, and
/// never writes its own state.
#[tokio::test]
async fn failure_skips_downstream_and_leaves_no_state() {
    let yaml = r#"
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
        Dependencies:
          - Module: module1
            AccountId: "123456789012"
            Region: eu-west-1
"#;
    let root = TempDir::new().unwrap();
    let package_dir = root.path().join("package");
    write_shell_module(&package_dir, "module1", FAIL_SCRIPT);
    write_shell_module(&package_dir, "module2", SUCCESS_SCRIPT);
    let store = LocalObjectStore::new(root.path().join("store"));
    let temp = root.path().join("temp");

    let mut package = build_package(
        yaml,
        &package_dir,
        one_account_inventory(),
        StateStore::default(),
        CliCommand::Apply,
        false,
    )
    .unwrap();
    run_scheduler(&mut package, &store, &temp, 10).await.unwrap();

    let module1 = package.graph.details(&key("module1", "eu-west-1"));
    assert_eq!(module1.status, StepStatus::Failed);
    assert_eq!(module1.error, Some(StepErrorKind::EngineFailure));
    let module2 = package.graph.details(&key("module2", "eu-west-1"));
    assert_eq!(module2.status, StepStatus::Failed);
    assert_eq!(module2.error, Some(StepErrorKind::UpstreamFailed));
    assert!(package.current.is_empty());
}

/// Retry policy: a transient failure is retried after the configured
/// delay, and the attempt count is recorded.
#[tokio::test]
async fn transient_failure_is_retried() {
    let yaml = r#"
PackageConfiguration:
  StateLocation: unused
Modules:
  flaky:
    Configuration:
      Retry:
        MaxAttempts: 2
        DelayBeforeRetrying: 0
    Deployments:
      - Include:
          Regions: [eu-west-1]
"#;
    let root = TempDir::new().unwrap();
    let package_dir = root.path().join("package");
    write_shell_module(&package_dir, "flaky", FLAKY_SCRIPT);
    let store = LocalObjectStore::new(root.path().join("store"));
    let temp = root.path().join("temp");

    let mut package = build_package(
        yaml,
        &package_dir,
        one_account_inventory(),
        StateStore::default(),
        CliCommand::Apply,
        false,
    )
    .unwrap();
    run_scheduler(&mut package, &store, &temp, 10).await.unwrap();

    let step = package.graph.details(&key("flaky", "eu-west-1"));
    assert_eq!(step.status, StepStatus::Completed);
    assert_eq!(step.nb_attempts, 2);
}

/// A ConditionalUpdate whose upstream outputs did not drift finalizes as
/// NoChange without touching the persisted record.
#[tokio::test]
async fn conditional_update_short_circuits() {
    let root = TempDir::new().unwrap();
    let package_dir = root.path().join("package");
    write_shell_module(&package_dir, "module1", SUCCESS_SCRIPT);
    write_shell_module(&package_dir, "module2", SUCCESS_SCRIPT);
    let store = LocalObjectStore::new(root.path().join("store"));
    let temp = root.path().join("temp");

    // First apply seeds the state, including the output-derived variable.
    let mut package = build_package(
        TWO_MODULE_OUTPUT_YAML,
        &package_dir,
        one_account_inventory(),
        StateStore::default(),
        CliCommand::Apply,
        false,
    )
    .unwrap();
    run_scheduler(&mut package, &store, &temp, 10).await.unwrap();
    let before = package
        .current
        .get(&key("module2", "eu-west-1"))
        .unwrap()
        .clone();

    let state = StateStore::load(&store).await.unwrap();
    let mut package = build_package(
        TWO_MODULE_OUTPUT_YAML,
        &package_dir,
        one_account_inventory(),
        state,
        CliCommand::Apply,
        false,
    )
    .unwrap();
    assert_eq!(
        package.graph.details(&key("module2", "eu-west-1")).action,
        Action::ConditionalUpdate
    );
    run_scheduler(&mut package, &store, &temp, 10).await.unwrap();

    let step = package.graph.details(&key("module2", "eu-west-1"));
    assert_eq!(step.status, StepStatus::Completed);
    assert!(!step.made_changes);
    let after = package.current.get(&key("module2", "eu-west-1")).unwrap();
    assert_eq!(*after, before);
}

/// `ConcurrentWorkers: 1` serializes all step execution.
#[tokio::test]
async fn single_worker_serializes_steps() {
    let yaml = r#"
PackageConfiguration:
  StateLocation: unused
Modules:
  slow:
    Deployments:
      - Include:
          Regions: [eu-west-1, us-east-1]
"#;
    let script = format!("sleep 1\n{}", SUCCESS_SCRIPT);
    let root = TempDir::new().unwrap();
    let package_dir = root.path().join("package");
    write_shell_module(&package_dir, "slow", &script);
    let store = LocalObjectStore::new(root.path().join("store"));
    let temp = root.path().join("temp");

    let mut package = build_package(
        yaml,
        &package_dir,
        one_account_inventory(),
        StateStore::default(),
        CliCommand::Apply,
        false,
    )
    .unwrap();
    let start = std::time::Instant::now();
    run_scheduler(&mut package, &store, &temp, 1).await.unwrap();
    // Two one-second steps on one worker cannot overlap.
    assert!(start.elapsed() >= std::time::Duration::from_secs(2));
    assert_eq!(package.current.len(), 2);
}

/// Cancellation level 1 stops dispatching: running steps finish, the rest
/// stay pending.
#[tokio::test]
async fn drain_leaves_undispatched_steps_pending() {
    let yaml = r#"
PackageConfiguration:
  StateLocation: unused
Modules:
  slow:
    Deployments:
      - Include:
          Regions: [eu-west-1, us-east-1]
"#;
    let script = format!("sleep 1\n{}", SUCCESS_SCRIPT);
    let root = TempDir::new().unwrap();
    let package_dir = root.path().join("package");
    write_shell_module(&package_dir, "slow", &script);
    let store = LocalObjectStore::new(root.path().join("store"));
    let temp = root.path().join("temp");

    let mut package = build_package(
        yaml,
        &package_dir,
        one_account_inventory(),
        StateStore::default(),
        CliCommand::Apply,
        false,
    )
    .unwrap();
    let (tx, rx) = watch::channel(armada::exec::CancelLevel::None);
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        let _ = tx.send(armada::exec::CancelLevel::Drain);
        // Keep the sender alive until the run is over.
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
    });
    run_scheduler_with_cancel(&mut package, &store, &temp, 1, rx)
        .await
        .unwrap();

    let statuses: Vec<StepStatus> = ["eu-west-1", "us-east-1"]
        .into_iter()
        .map(|region| package.graph.details(&key("slow", region)).status)
        .collect();
    assert!(statuses.contains(&StepStatus::Completed));
    assert!(statuses.contains(&StepStatus::Pending));
    // The dispatched step was persisted by the final flush.
    let state = StateStore::load(&store).await.unwrap();
    assert_eq!(state.len(), 1);
}
