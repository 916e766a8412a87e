pub mod credentials;
pub mod scheduler;
pub mod subprocess;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::watch;
use tracing::debug;

use crate::engines::{CliCommand, Engine, StepContext, StepOutcome};
use crate::store::models::{
    Action, DeploymentKey, StepErrorKind, StepFailure, VariableMap,
};
use credentials::CredentialCache;

/// The cancellation ladder. Each Ctrl-C raises the level by one:
/// stop dispatching, interrupt subprocesses cooperatively, terminate them,
/// abort the supervisor. The state store is flushed on exit at every level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CancelLevel {
    None,
    Drain,
    Interrupt,
    Kill,
    Abort,
}

impl CancelLevel {
    pub fn next(self) -> Self {
        match self {
            CancelLevel::None => CancelLevel::Drain,
            CancelLevel::Drain => CancelLevel::Interrupt,
            CancelLevel::Interrupt => CancelLevel::Kill,
            _ => CancelLevel::Abort,
        }
    }
}

/// Everything a worker needs to execute one step, resolved on the
/// supervisor side at dispatch time.
#[derive(Clone)]
pub struct StepRequest {
    pub key: DeploymentKey,
    pub command: CliCommand,
    /// Effective action: a ConditionalUpdate that must run arrives as
    /// Update.
    pub action: Action,
    pub variables: VariableMap,
    pub module_config: VariableMap,
    pub module_dir: PathBuf,
    pub engine: String,
    pub max_attempts: u32,
    pub delay_secs: u64,
}

/// Uniform interface between the scheduler and engine implementations:
/// prepare, subprocess fan-out, postprocess. Owns the on-disk layout of
/// engine caches, per-step deployment caches and run logs.
pub struct Dispatcher {
    engines: BTreeMap<String, Arc<dyn Engine>>,
    credentials: Arc<CredentialCache>,
    engine_cache_dirs: BTreeMap<String, PathBuf>,
    deployments_cache_dir: PathBuf,
    logs_dir: PathBuf,
    keep_deployment_cache: bool,
}

impl Dispatcher {
    /// Prepare the temp directory layout: one persistent cache directory
    /// per engine, a fresh deployment cache root, and a timestamped logs
    /// directory for this run.
    pub fn new(
        engines: BTreeMap<String, Arc<dyn Engine>>,
        temp_dir: &Path,
        keep_deployment_cache: bool,
        credentials: Arc<CredentialCache>,
    ) -> Result<Self> {
        let cache_dir = temp_dir.join("cache");
        let mut engine_cache_dirs = BTreeMap::new();
        for name in engines.keys() {
            let dir = cache_dir.join("engines").join(name);
            std::fs::create_dir_all(&dir)?;
            engine_cache_dirs.insert(name.clone(), dir);
        }
        let deployments_cache_dir = cache_dir.join("deployments");
        if deployments_cache_dir.exists() {
            std::fs::remove_dir_all(&deployments_cache_dir)?;
        }
        std::fs::create_dir_all(&deployments_cache_dir)?;
        let logs_dir = temp_dir
            .join("logs")
            .join(Utc::now().format("%Y%m%d-%H%M%S").to_string());
        std::fs::create_dir_all(&logs_dir)?;
        Ok(Self {
            engines,
            credentials,
            engine_cache_dirs,
            deployments_cache_dir,
            logs_dir,
            keep_deployment_cache,
        })
    }

    /// Execute a step with its retry policy. Returns the number of attempts
    /// made together with the outcome of the last one.
    pub async fn execute(
        &self,
        request: &StepRequest,
        mut cancel: watch::Receiver<CancelLevel>,
    ) -> (u32, Result<StepOutcome, StepFailure>) {
        let mut attempt = 0;
        loop {
            attempt += 1;
            debug!(key = %request.key, attempt, "Starting attempt");
            let result = self.execute_attempt(request, attempt, &mut cancel).await;
            match &result {
                Err(failure)
                    if failure.kind.is_retriable()
                        && attempt < request.max_attempts
                        && *cancel.borrow() == CancelLevel::None =>
                {
                    debug!(
                        key = %request.key,
                        attempt,
                        delay_secs = request.delay_secs,
                        "Retrying after failure"
                    );
                    tokio::time::sleep(std::time::Duration::from_secs(request.delay_secs))
                        .await;
                }
                _ => return (attempt, result),
            }
        }
    }

    async fn execute_attempt(
        &self,
        request: &StepRequest,
        attempt: u32,
        cancel: &mut watch::Receiver<CancelLevel>,
    ) -> Result<StepOutcome, StepFailure> {
        let key = &request.key;
        let deployment_cache_dir = self
            .deployments_cache_dir
            .join(&key.module)
            .join(&key.account_id)
            .join(&key.region);
        let result = self
            .run_engine(request, attempt, &deployment_cache_dir, cancel)
            .await;
        if !self.keep_deployment_cache {
            let _ = std::fs::remove_dir_all(&deployment_cache_dir);
        }
        result
    }

    async fn run_engine(
        &self,
        request: &StepRequest,
        attempt: u32,
        deployment_cache_dir: &Path,
        cancel: &mut watch::Receiver<CancelLevel>,
    ) -> Result<StepOutcome, StepFailure> {
        let key = &request.key;
        let engine = self
            .engines
            .get(&request.engine)
            .ok_or_else(|| {
                StepFailure::new(
                    StepErrorKind::EngineFailure,
                    format!("Unknown engine '{}'", request.engine),
                )
            })?;
        if deployment_cache_dir.exists() {
            let _ = std::fs::remove_dir_all(deployment_cache_dir);
        }
        std::fs::create_dir_all(deployment_cache_dir).map_err(|err| {
            StepFailure::new(
                StepErrorKind::EngineFailure,
                format!("Failed to create the deployment cache directory: {}", err),
            )
        })?;

        let ctx = StepContext {
            key,
            command: request.command,
            action: request.action,
            variables: &request.variables,
            module_config: &request.module_config,
            module_dir: &request.module_dir,
            deployment_cache_dir,
            engine_cache_dir: &self.engine_cache_dirs[&request.engine],
        };

        let commands = engine
            .prepare(&ctx)
            .map_err(|err| engine_failure("prepare", &err))?;

        let log_dir = self
            .logs_dir
            .join(&key.module)
            .join(&key.account_id)
            .join(&key.region);
        let role_arn = request
            .module_config
            .get("AssumeRole")
            .and_then(|v| v.as_str());

        for command in &commands {
            let mut extra_env = BTreeMap::new();
            if command.assume_role {
                if let Some(role_arn) = role_arn {
                    let creds =
                        self.credentials
                            .credentials_for(role_arn)
                            .await
                            .map_err(|err| {
                                StepFailure::new(StepErrorKind::EngineFailure, err.to_string())
                            })?;
                    extra_env.insert("AWS_ACCESS_KEY_ID".to_string(), creds.access_key_id);
                    extra_env
                        .insert("AWS_SECRET_ACCESS_KEY".to_string(), creds.secret_access_key);
                    extra_env.insert("AWS_SESSION_TOKEN".to_string(), creds.session_token);
                }
            }
            let result =
                subprocess::run_command(command, &extra_env, &log_dir, attempt, cancel)
                    .await
                    .map_err(|err| {
                        engine_failure(&format!("subprocess '{}'", command.name), &err)
                    })?;
            if result.interrupted {
                return Err(StepFailure::new(
                    StepErrorKind::Interrupted,
                    format!("Subprocess '{}' was interrupted", command.name),
                ));
            }
            if result.exit_code != 0 {
                return Err(StepFailure::new(
                    StepErrorKind::EngineFailure,
                    format!(
                        "Subprocess '{}' exited with code {}",
                        command.name, result.exit_code
                    ),
                )
                .with_details(serde_json::json!({
                    "FailedSection": format!("subprocess '{}'", command.name),
                    "ExitCode": result.exit_code,
                })));
            }
        }

        engine
            .postprocess(&ctx)
            .map_err(|err| engine_failure("postprocess", &err))
    }
}

fn engine_failure(section: &str, err: &anyhow::Error) -> StepFailure {
    StepFailure::new(
        StepErrorKind::EngineFailure,
        format!("Failed during {}: {:#}", section, err),
    )
    .with_details(serde_json::json!({
        "FailedSection": section,
        "ErrorMessage": format!("{:#}", err),
    }))
}
