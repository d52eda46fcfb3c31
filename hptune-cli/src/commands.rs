//! Subcommand handlers.

use crate::{Commands, ConfigAction, Overrides, StrategyAction};
use hptune_core::config::{TuneConfig, load_config};
use hptune_core::notify::notifier_from_config;
use hptune_core::strategy::store::{NewStrategy, SqliteStrategyStore};
use hptune_core::{ControllerReport, RunController, Status, StrategyStore, run_guarded};
use std::path::Path;
use tracing::{info, warn};

pub async fn handle_command(
    command: Commands,
    overrides: &Overrides,
    workspace: &Path,
) -> anyhow::Result<bool> {
    match command {
        Commands::Run => handle_run(None, overrides, workspace).await,
        Commands::Pbt { num_samples } => {
            handle_run(Some(num_samples), overrides, workspace).await
        }
        Commands::Strategy { action } => {
            handle_strategy(action, overrides, workspace).await?;
            Ok(true)
        }
        Commands::Config { action } => {
            handle_config(action, overrides, workspace)?;
            Ok(true)
        }
    }
}

fn effective_config(overrides: &Overrides, workspace: &Path) -> anyhow::Result<TuneConfig> {
    let mut config = load_config(Some(workspace), overrides.config.as_deref())
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    config.resolve_paths(workspace);
    if let Some(max) = overrides.max_iterations {
        config.controller.max_iterations = Some(max);
    }
    Ok(config)
}

/// Run the controller under the failure guard. `pbt` is `Some` for the
/// scheduled variant, carrying an optional population size override.
/// Returns `false` when the guard caught a failure.
async fn handle_run(
    pbt: Option<Option<usize>>,
    overrides: &Overrides,
    workspace: &Path,
) -> anyhow::Result<bool> {
    let mut config = effective_config(overrides, workspace)?;
    if let Some(Some(num_samples)) = pbt {
        config.pbt.num_samples = num_samples;
    }
    let notifier = notifier_from_config(&config.notify)?;
    info!(
        workspace = %workspace.display(),
        scheduled = pbt.is_some(),
        population = config.pbt.num_samples,
        "Starting run controller"
    );

    let result: Result<ControllerReport, _> = run_guarded(notifier.as_ref(), async {
        let mut controller = RunController::from_config(&config)?;
        match pbt {
            Some(_) => controller.run_with_scheduler(config.pbt.clone()).await,
            None => controller.run_without_scheduler().await,
        }
    })
    .await;

    match result {
        Ok(report) => {
            println!(
                "Finished after {} step(s): {} trained, {} checked ({} failed).",
                report.steps, report.trained, report.debugged, report.debug_failures
            );
            Ok(true)
        }
        Err(e) => {
            warn!(error = %e, "Run controller stopped on error");
            Ok(false)
        }
    }
}

async fn handle_strategy(
    action: StrategyAction,
    overrides: &Overrides,
    workspace: &Path,
) -> anyhow::Result<()> {
    let config = effective_config(overrides, workspace)?;
    let store = SqliteStrategyStore::open(&config.store.path)?;

    match action {
        StrategyAction::Add {
            name,
            dataset_idx,
            params,
            skip_check,
        } => {
            let params = match params {
                Some(raw) => serde_json::from_str(&raw)
                    .map_err(|e| anyhow::anyhow!("--params must be a JSON object: {}", e))?,
                None => serde_json::Map::new(),
            };
            let id = store
                .add(NewStrategy {
                    name: name.clone(),
                    dataset_idx,
                    params,
                    skip_check,
                })
                .await?;
            info!(id, name = %name, dataset_idx, skip_check, "Strategy added");
            println!("Added strategy {} ({}) with id {}", name, dataset_idx, id);
            Ok(())
        }
        StrategyAction::List => {
            let records = store.list().await?;
            if records.is_empty() {
                println!("No strategies. Add one with `hptune strategy add <name>`.");
                return Ok(());
            }
            println!("{:>5}  {:<10}  {:>8}  {:>7}  NAME", "ID", "STATUS", "DATASET", "SAMPLED");
            for record in records {
                println!(
                    "{:>5}  {:<10}  {:>8}  {:>7}  {}",
                    record.strategy.id,
                    record.status,
                    record.strategy.dataset_idx,
                    record.attempts,
                    record.strategy.name
                );
            }
            Ok(())
        }
        StrategyAction::SetStatus { id, status } => {
            let status: Status = status.parse().map_err(|e: String| anyhow::anyhow!(e))?;
            store.mark(id, status).await?;
            info!(id, status = %status, "Strategy status changed");
            println!("Strategy {} is now {}", id, status);
            Ok(())
        }
    }
}

fn handle_config(action: ConfigAction, overrides: &Overrides, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".hptune");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&TuneConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = effective_config(overrides, workspace)?;
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}
