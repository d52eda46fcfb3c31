//! hptune CLI: runs the strategy controller and manages the strategy store.

mod commands;

use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Hyperparameter search and training-run orchestration
#[derive(Parser, Debug)]
#[command(name = "hptune", version, about, long_about = None)]
pub(crate) struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Stop after this many sampling steps
    #[arg(long, global = true)]
    max_iterations: Option<usize>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    /// Subcommand (defaults to `run`)
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum Commands {
    /// Sample strategies and train each one directly
    Run,
    /// Sample strategies and train each one with population-based training
    Pbt {
        /// Population size
        #[arg(long)]
        num_samples: Option<usize>,
    },
    /// Manage the strategy store
    Strategy {
        #[command(subcommand)]
        action: StrategyAction,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum StrategyAction {
    /// Add a strategy; it gets a pipeline check before its first training run
    Add {
        /// Strategy name, as defined in the strategy space
        name: String,
        /// Dataset split index
        #[arg(long, default_value_t = 0)]
        dataset_idx: usize,
        /// Extra overrides as a JSON object
        #[arg(long)]
        params: Option<String>,
        /// Skip the pipeline check
        #[arg(long)]
        skip_check: bool,
    },
    /// List all strategies
    List,
    /// Change the status of a strategy
    SetStatus {
        id: i64,
        /// READY, DEBUGGING, RUNNABLE, RUNNING, DONE or FAILED
        status: String,
    },
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum ConfigAction {
    /// Write a default workspace configuration
    Init,
    /// Print the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "hptune", "hptune")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "hptune.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = resolve_workspace(&cli.workspace)?;

    let overrides = cli_overrides(&cli);
    let command = cli.command.unwrap_or(Commands::Run);
    let ok = commands::handle_command(command, &overrides, &workspace).await?;
    Ok(if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Options given on the command line that override configuration.
#[derive(Debug, Default)]
pub(crate) struct Overrides {
    pub config: Option<PathBuf>,
    pub max_iterations: Option<usize>,
}

fn cli_overrides(cli: &Cli) -> Overrides {
    Overrides {
        config: cli.config.clone(),
        max_iterations: cli.max_iterations,
    }
}

/// The workspace must exist: the strategy database and space live under it.
fn resolve_workspace(path: &Path) -> anyhow::Result<PathBuf> {
    path.canonicalize().map_err(|e| {
        anyhow::anyhow!("Workspace directory {} is not accessible: {}", path.display(), e)
    })
}
