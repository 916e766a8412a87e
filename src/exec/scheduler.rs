use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use anyhow::Result;
use colored::Colorize;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, info};

use super::{CancelLevel, Dispatcher, StepRequest};
use crate::engines::{CliCommand, StepOutcome};
use crate::graph::StepStatus;
use crate::package::Package;
use crate::store::models::{Action, DeploymentKey, StepErrorKind, StepFailure};
use crate::store::ObjectStore;

pub struct SchedulerOptions {
    pub workers: usize,
    /// Persist the state store every N seconds during the run; otherwise
    /// only at run completion.
    pub checkpoint_every_secs: Option<u64>,
}

struct WorkerReport {
    key: DeploymentKey,
    attempts: u32,
    result: Result<StepOutcome, StepFailure>,
}

/// Drive the deployment graph with a bounded worker pool. The supervisor
/// owns every mutation of the graph and the state store; workers execute
/// engine subprocesses and report back over a completion channel.
pub struct Scheduler {
    options: SchedulerOptions,
}

impl Scheduler {
    pub fn new(options: SchedulerOptions) -> Self {
        Self { options }
    }

    pub async fn run(
        &self,
        package: &mut Package,
        dispatcher: Arc<Dispatcher>,
        store: &dyn ObjectStore,
        mut cancel: watch::Receiver<CancelLevel>,
    ) -> Result<()> {
        let order = package.graph.topological_order();
        let mut pending: BTreeSet<DeploymentKey> = package
            .graph
            .steps()
            .filter(|(_, details)| details.status == StepStatus::Pending)
            .map(|(key, _)| key.clone())
            .collect();
        let total = pending.len();
        let mut completed = 0usize;
        let mut in_flight = 0usize;

        let semaphore = Arc::new(Semaphore::new(self.options.workers));
        let (tx, mut rx) = mpsc::channel::<WorkerReport>(total.max(1));

        let mut cancel_open = true;
        let mut ticker = self
            .options
            .checkpoint_every_secs
            .map(|secs| {
                let mut interval =
                    tokio::time::interval(std::time::Duration::from_secs(secs.max(1)));
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                interval
            });
        // The first tick of an interval fires immediately.
        if let Some(ticker) = ticker.as_mut() {
            ticker.tick().await;
        }
        let checkpoints_enabled = ticker.is_some();

        loop {
            if *cancel.borrow() == CancelLevel::None {
                self.dispatch_ready(
                    package,
                    &dispatcher,
                    &order,
                    &mut pending,
                    &semaphore,
                    &tx,
                    &cancel,
                    &mut in_flight,
                    &mut completed,
                )?;
            }

            if in_flight == 0
                && (pending.is_empty() || *cancel.borrow() != CancelLevel::None)
            {
                break;
            }

            tokio::select! {
                report = rx.recv() => {
                    let Some(report) = report else { break };
                    in_flight -= 1;
                    completed += 1;
                    self.handle_report(package, &mut pending, report, &mut completed, total);
                }
                _ = async { ticker.as_mut().unwrap().tick().await }, if checkpoints_enabled => {
                    package.save(store).await?;
                }
                changed = cancel.changed(), if cancel_open => {
                    if changed.is_err() {
                        cancel_open = false;
                        continue;
                    }
                    let level = *cancel.borrow();
                    info!(level = ?level, "Cancellation requested");
                    if level >= CancelLevel::Abort {
                        self.abort_ongoing(package);
                        break;
                    }
                }
            }
        }

        package.save(store).await?;
        Ok(())
    }

    /// Dispatch every ready step to the pool. Supervisor-side transitions
    /// (preview gate, conditional-update short-circuit, resolution
    /// failures) may unblock further steps, so the scan repeats until it
    /// reaches a fixpoint or the pool is full.
    #[allow(clippy::too_many_arguments)]
    fn dispatch_ready(
        &self,
        package: &mut Package,
        dispatcher: &Arc<Dispatcher>,
        order: &[DeploymentKey],
        pending: &mut BTreeSet<DeploymentKey>,
        semaphore: &Arc<Semaphore>,
        tx: &mpsc::Sender<WorkerReport>,
        cancel: &watch::Receiver<CancelLevel>,
        in_flight: &mut usize,
        completed: &mut usize,
    ) -> Result<()> {
        'scan: loop {
            let mut settled_locally = false;
            for key in order {
                if !pending.contains(key) || !is_ready(package, key) {
                    continue;
                }
                let action = package.graph.details(key).action;

                // Previewing a step whose inputs depend on unapplied
                // upstream changes would predict against a state that does
                // not exist yet.
                if package.command == CliCommand::Preview
                    && action != Action::Destroy
                    && package.graph.has_upstream_pending_changes(key)
                {
                    let failure = StepFailure::new(
                        StepErrorKind::PreviewBlockedByPendingUpstream,
                        "Unable to preview changes as this deployment depends on other \
                         deployments with pending changes",
                    );
                    println!("{}: {} — {}", key, "FAILED".red().bold(), failure.message);
                    pending.remove(key);
                    *completed += 1;
                    package.fail(key, failure);
                    propagate_upstream_failure(package, pending, key, completed);
                    settled_locally = true;
                    continue;
                }

                let mut effective_action = action;
                if action == Action::ConditionalUpdate {
                    match package.conditional_update_needed(key) {
                        Ok(false) => {
                            println!(
                                "{}: {}",
                                key,
                                "No changes — upstream outputs are unchanged".green()
                            );
                            pending.remove(key);
                            *completed += 1;
                            package.complete_without_changes(
                                key,
                                "No changes required because the dependent output values \
                                 have not changed",
                            );
                            settled_locally = true;
                            continue;
                        }
                        Ok(true) => effective_action = Action::Update,
                        Err(failure) => {
                            println!(
                                "{}: {} — {}",
                                key,
                                "FAILED".red().bold(),
                                failure.message
                            );
                            pending.remove(key);
                            *completed += 1;
                            package.fail(key, failure);
                            propagate_upstream_failure(package, pending, key, completed);
                            settled_locally = true;
                            continue;
                        }
                    }
                }

                let prepared = package
                    .resolve_step_variables(key, effective_action)
                    .and_then(|variables| {
                        let module_config = package.module_config(key).map_err(|err| {
                            StepFailure::new(StepErrorKind::EngineFailure, format!("{:#}", err))
                        })?;
                        Ok((variables, module_config))
                    });
                let (variables, module_config) = match prepared {
                    Ok(prepared) => prepared,
                    Err(failure) => {
                        println!("{}: {} — {}", key, "FAILED".red().bold(), failure.message);
                        pending.remove(key);
                        *completed += 1;
                        package.fail(key, failure);
                        propagate_upstream_failure(package, pending, key, completed);
                        settled_locally = true;
                        continue;
                    }
                };

                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    break 'scan;
                };
                pending.remove(key);
                let details = package.graph.details_mut(key);
                details.status = StepStatus::Ongoing;
                let module = package.module_info(key);
                let request = StepRequest {
                    key: key.clone(),
                    command: package.command,
                    action: effective_action,
                    variables,
                    module_config,
                    module_dir: module.dir.clone(),
                    engine: module.engine.clone(),
                    max_attempts: package.graph.details(key).max_attempts,
                    delay_secs: package.graph.details(key).delay_secs,
                };
                println!("{}: {}...", key, verb_for(package.command, effective_action).cyan());
                debug!(key = %key, action = %effective_action, "Dispatching step");

                let dispatcher = Arc::clone(dispatcher);
                let tx = tx.clone();
                let cancel = cancel.clone();
                *in_flight += 1;
                tokio::spawn(async move {
                    let _permit = permit;
                    let (attempts, result) = dispatcher.execute(&request, cancel).await;
                    let _ = tx
                        .send(WorkerReport {
                            key: request.key.clone(),
                            attempts,
                            result,
                        })
                        .await;
                });
            }
            if !settled_locally {
                break;
            }
        }
        Ok(())
    }

    fn handle_report(
        &self,
        package: &mut Package,
        pending: &mut BTreeSet<DeploymentKey>,
        report: WorkerReport,
        completed: &mut usize,
        total: usize,
    ) {
        package.graph.details_mut(&report.key).nb_attempts = report.attempts;
        match report.result {
            Ok(outcome) => {
                println!(
                    "{}: {} [{}/{}] — {}",
                    report.key,
                    "Completed".green().bold(),
                    completed,
                    total,
                    outcome.result
                );
                package.complete(&report.key, outcome);
            }
            Err(failure) => {
                println!(
                    "{}: {} after {} attempt(s) — {}",
                    report.key,
                    "FAILED".red().bold(),
                    report.attempts,
                    failure.message
                );
                package.fail(&report.key, failure);
                propagate_upstream_failure(package, pending, &report.key, completed);
            }
        }
    }

    fn abort_ongoing(&self, package: &mut Package) {
        let ongoing: Vec<DeploymentKey> = package
            .graph
            .steps()
            .filter(|(_, details)| details.status == StepStatus::Ongoing)
            .map(|(key, _)| key.clone())
            .collect();
        for key in ongoing {
            package.fail(
                &key,
                StepFailure::new(StepErrorKind::Interrupted, "The run was aborted"),
            );
        }
    }
}

/// A step is ready when everything it is scheduled after reached a
/// successful terminal state.
fn is_ready(package: &Package, key: &DeploymentKey) -> bool {
    package
        .graph
        .scheduling_predecessors(key)
        .iter()
        .all(|pred| {
            matches!(
                package.graph.details(pred).status,
                StepStatus::Completed | StepStatus::Skipped
            )
        })
}

/// Mark every transitive scheduling-dependent of a failed step as failed
/// with the UpstreamFailed kind; they will never become ready.
fn propagate_upstream_failure(
    package: &mut Package,
    pending: &mut BTreeSet<DeploymentKey>,
    from: &DeploymentKey,
    completed: &mut usize,
) {
    let mut visited: HashSet<DeploymentKey> = HashSet::new();
    let mut stack = vec![from.clone()];
    while let Some(key) = stack.pop() {
        for dependent in package.graph.scheduling_successors(&key) {
            if !visited.insert(dependent.clone()) {
                continue;
            }
            if pending.remove(&dependent) {
                *completed += 1;
                println!(
                    "{}: {} — {}",
                    dependent,
                    "Skipped".yellow(),
                    "an upstream dependency failed".dimmed()
                );
                package.fail(
                    &dependent,
                    StepFailure::new(
                        StepErrorKind::UpstreamFailed,
                        "Failed because at least one dependency failed",
                    ),
                );
            }
            stack.push(dependent);
        }
    }
}

fn verb_for(command: CliCommand, action: Action) -> &'static str {
    if command == CliCommand::Preview {
        return "Previewing";
    }
    match action {
        Action::Create => "Creating",
        Action::Update | Action::ConditionalUpdate => "Updating",
        Action::Destroy => "Destroying",
        Action::NoChange => "Skipping",
    }
}
