use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use armada::config::loader;
use armada::engines::{builtin_engines, CliCommand};
use armada::exec::credentials::{CliCredentialsProvider, CredentialCache};
use armada::exec::scheduler::{Scheduler, SchedulerOptions};
use armada::exec::{CancelLevel, Dispatcher};
use armada::graph::StepStatus;
use armada::inventory::{FileInventorySource, Inventory, InventorySource};
use armada::module::discover_modules;
use armada::output;
use armada::package::{CliFilters, Package};
use armada::store::state::StateStore;
use armada::store::LocalObjectStore;

/// Reset SIGPIPE to default behavior so piping (e.g. `armada list | jq`)
/// exits cleanly instead of panicking on broken pipe.
#[cfg(unix)]
fn reset_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }
}

/// armada - Multi-account, multi-region infrastructure deployer
#[derive(Parser)]
#[command(name = "armada", version, about, long_about = None)]
struct Cli {
    /// Path to the package definition file
    #[arg(long, default_value = "package.yaml")]
    package_file: PathBuf,

    /// Path of the output JSON document
    #[arg(long, default_value = "output.json")]
    output_file: PathBuf,

    /// Directory holding caches and logs
    #[arg(long, default_value = ".armada")]
    temp_dir: PathBuf,

    /// Ignore the inventory cache and query the inventory source
    #[arg(long)]
    force_orga_refresh: bool,

    /// Enable verbose logging
    #[arg(long)]
    debug: bool,

    /// Exit with 2 when there are pending changes or changes were made
    #[arg(long)]
    detailed_exitcode: bool,

    /// Promote every existing deployment to Update
    #[arg(long)]
    force_update: bool,

    /// Skip the confirmation prompt
    #[arg(long)]
    non_interactive: bool,

    /// Keep per-step deployment cache directories for troubleshooting
    #[arg(long)]
    keep_deployment_cache: bool,

    /// Persist the package state every N seconds during execution
    #[arg(long)]
    save_state_every_seconds: Option<u64>,

    #[arg(long, value_delimiter = ',')]
    include_modules: Option<Vec<String>>,
    #[arg(long, value_delimiter = ',')]
    exclude_modules: Option<Vec<String>>,
    #[arg(long, value_delimiter = ',')]
    include_account_ids: Option<Vec<String>>,
    #[arg(long, value_delimiter = ',')]
    exclude_account_ids: Option<Vec<String>>,
    #[arg(long, value_delimiter = ',')]
    include_account_names: Option<Vec<String>>,
    #[arg(long, value_delimiter = ',')]
    exclude_account_names: Option<Vec<String>>,
    #[arg(long, value_delimiter = ',')]
    include_account_tags: Option<Vec<String>>,
    #[arg(long, value_delimiter = ',')]
    exclude_account_tags: Option<Vec<String>>,
    #[arg(long, value_delimiter = ',')]
    include_ou_ids: Option<Vec<String>>,
    #[arg(long, value_delimiter = ',')]
    exclude_ou_ids: Option<Vec<String>>,
    #[arg(long, value_delimiter = ',')]
    include_ou_tags: Option<Vec<String>>,
    #[arg(long, value_delimiter = ',')]
    exclude_ou_tags: Option<Vec<String>>,
    #[arg(long, value_delimiter = ',')]
    include_regions: Option<Vec<String>>,
    #[arg(long, value_delimiter = ',')]
    exclude_regions: Option<Vec<String>>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dump the account and organizational unit inventory
    Orga,
    /// Reconcile only; show the changes that a run would make
    List,
    /// Reconcile and run engine previews without mutating resources
    Preview,
    /// Reconcile and apply the pending changes
    Apply,
    /// Rewrite the persisted module hash without executing anything
    UpdateHash,
    /// Drop state entries whose account or region is no longer active
    RemoveOrphans {
        /// List the orphans without removing them
        #[arg(long)]
        dry_run: bool,
    },
}

impl Commands {
    fn cli_command(&self) -> CliCommand {
        match self {
            Commands::Orga => CliCommand::Orga,
            Commands::List => CliCommand::List,
            Commands::Preview => CliCommand::Preview,
            Commands::Apply => CliCommand::Apply,
            Commands::UpdateHash => CliCommand::UpdateHash,
            Commands::RemoveOrphans { .. } => CliCommand::RemoveOrphans,
        }
    }
}

#[tokio::main]
async fn main() {
    #[cfg(unix)]
    reset_sigpipe();

    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match run(&cli).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            output::print_error(&format!("{:#}", err));
            std::process::exit(1);
        }
    }
}

async fn run(cli: &Cli) -> Result<i32> {
    let command = cli.command.cli_command();
    let engines = builtin_engines();

    let package_dir = cli
        .package_file
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .to_path_buf();
    let modules = discover_modules(&package_dir, &engines)?;

    let definition = loader::load_package(&cli.package_file)?;
    loader::validate_against_modules(&definition, &modules)?;

    let store = LocalObjectStore::from_location(&definition.package_configuration.state_location);

    let source = definition
        .package_configuration
        .inventory_file
        .as_ref()
        .map(|file| {
            let path = Path::new(file);
            let path = if path.is_relative() {
                package_dir.join(path)
            } else {
                path.to_path_buf()
            };
            FileInventorySource::new(path)
        });
    let inventory = Inventory::load(
        &store,
        source.as_ref().map(|s| s as &dyn InventorySource),
        definition.package_configuration.orga_cache_expiration,
        cli.force_orga_refresh,
        definition
            .package_configuration
            .override_account_name_by_tag
            .as_deref(),
    )
    .await?;

    if command == CliCommand::Orga {
        output::write_output(
            &cli.output_file,
            &inventory.export(),
            "the account list and organization structure",
        )?;
        return Ok(0);
    }

    let state = StateStore::load(&store).await?;
    let filters = CliFilters {
        include_modules: cli.include_modules.clone(),
        exclude_modules: cli.exclude_modules.clone(),
        include_account_ids: cli.include_account_ids.clone(),
        exclude_account_ids: cli.exclude_account_ids.clone(),
        include_account_names: cli.include_account_names.clone(),
        exclude_account_names: cli.exclude_account_names.clone(),
        include_account_tags: cli.include_account_tags.clone(),
        exclude_account_tags: cli.exclude_account_tags.clone(),
        include_ou_ids: cli.include_ou_ids.clone(),
        exclude_ou_ids: cli.exclude_ou_ids.clone(),
        include_ou_tags: cli.include_ou_tags.clone(),
        exclude_ou_tags: cli.exclude_ou_tags.clone(),
        include_regions: cli.include_regions.clone(),
        exclude_regions: cli.exclude_regions.clone(),
    };
    let concurrent_workers = definition.package_configuration.concurrent_workers;
    let mut package = Package::new(
        definition,
        modules,
        inventory,
        state,
        &engines,
        command,
        &filters,
        cli.force_update,
    )?;

    if let Commands::RemoveOrphans { dry_run } = &cli.command {
        let orphans = package.remove_orphans(*dry_run);
        if !*dry_run {
            package.save(&store).await?;
        }
        output::write_output(
            &cli.output_file,
            &output::export_orphans(&orphans),
            "the list of orphaned module deployments",
        )?;
        if !orphans.is_empty() && cli.detailed_exitcode {
            return Ok(2);
        }
        return Ok(0);
    }

    let has_pending_changes = package.analyze_changes();

    if command == CliCommand::List {
        output::write_output(
            &cli.output_file,
            &output::export_changes(&package),
            "the list of deployed modules and changes to be made",
        )?;
        if has_pending_changes && cli.detailed_exitcode {
            return Ok(2);
        }
        return Ok(0);
    }

    if !has_pending_changes {
        return Ok(0);
    }

    match command {
        CliCommand::Preview => info!(
            "\"preview\" will determine which resources to add, update or delete if the pending deployments are applied"
        ),
        CliCommand::Apply => info!(
            "\"apply\" will apply pending deployments, resulting in the creation, update or deletion of resources"
        ),
        CliCommand::UpdateHash => info!(
            "\"update-hash\" will update the value of the module hash for deployments to update"
        ),
        _ => {}
    }

    if !cli.non_interactive {
        print!(
            "Enter \"{}\" to confirm the deployment scope (use the command \"list\" for details): ",
            "yes".bold()
        );
        use std::io::Write;
        std::io::stdout().flush()?;
        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if input.trim() != "yes" {
            return Ok(0);
        }
    }

    if command == CliCommand::UpdateHash {
        let keys: Vec<_> = package
            .graph
            .steps()
            .filter(|(_, details)| details.status == StepStatus::Pending)
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            if package.update_hash(&key) {
                info!(key = %key, "Updated the value of the module hash");
            }
        }
        package.save(&store).await?;
        output::write_output(
            &cli.output_file,
            &output::export_results(&package),
            "the result of the execution",
        )?;
        let (with_changes, _, _) = package.analyze_results();
        if with_changes > 0 && cli.detailed_exitcode {
            return Ok(2);
        }
        return Ok(0);
    }

    // Escalating Ctrl-C ladder: drain, interrupt, terminate, abort.
    let (cancel_tx, cancel_rx) = watch::channel(CancelLevel::None);
    tokio::spawn(async move {
        let mut level = CancelLevel::None;
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            level = level.next();
            info!(level = ?level, "Interrupted");
            if cancel_tx.send(level).is_err() {
                return;
            }
        }
    });

    let credentials = Arc::new(CredentialCache::new(Arc::new(CliCredentialsProvider)));
    let dispatcher = Arc::new(Dispatcher::new(
        engines,
        &cli.temp_dir,
        cli.keep_deployment_cache,
        credentials,
    )?);
    let scheduler = Scheduler::new(SchedulerOptions {
        workers: concurrent_workers,
        checkpoint_every_secs: cli.save_state_every_seconds,
    });
    scheduler
        .run(&mut package, dispatcher, &store, cancel_rx)
        .await
        .context("The scheduler failed")?;

    let (with_changes, failed, pending) = package.analyze_results();
    output::print_run_summary(with_changes, failed, pending);
    output::write_output(
        &cli.output_file,
        &output::export_results(&package),
        "the result of the execution",
    )?;
    if failed > 0 {
        return Ok(1);
    }
    if with_changes > 0 && cli.detailed_exitcode {
        return Ok(2);
    }
    Ok(0)
}
