mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Krigzis insights CLI -- predictions, insights, and training over a task export.
#[derive(Parser)]
#[command(name = "kz", version, about)]
struct Cli {
    /// Config file (defaults to ~/.krigzis/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    /// Print Prometheus metrics to stderr when the command finishes.
    #[arg(long, global = true)]
    metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Estimate how long tasks will take.
    Predict {
        /// JSON file holding an array of tasks.
        tasks: PathBuf,
        /// Only predict the task with this id.
        #[arg(long)]
        id: Option<i64>,
    },

    /// Suggest a category for tasks.
    Categorize {
        /// JSON file holding an array of tasks.
        tasks: PathBuf,
        /// Only categorize the task with this id.
        #[arg(long)]
        id: Option<i64>,
    },

    /// Generate productivity insights for a task corpus.
    Insights {
        /// JSON file holding an array of tasks.
        tasks: PathBuf,
    },

    /// Train the local models on a task corpus.
    Train {
        /// JSON file holding an array of tasks.
        tasks: PathBuf,
        /// Train only when the retraining policy asks for it.
        #[arg(long)]
        if_needed: bool,
    },

    /// Print the effective configuration.
    Config {
        /// Show a named preset applied to the `[ai]` section instead.
        #[arg(long)]
        preset: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = commands::load_config(cli.config.as_deref())?;

    let format = kz_telemetry::LogFormat::from_json_flag(cli.json_logs || config.general.json_logs);
    kz_telemetry::logging::init("kz", &config.general.log_level, format);

    let engine = match cli.command {
        Commands::Config { preset } => {
            commands::config::run(&config, preset.as_deref())?;
            return Ok(());
        }
        Commands::Predict { tasks, id } => commands::predict::run(&config, &tasks, id).await?,
        Commands::Categorize { tasks, id } => commands::categorize::run(&config, &tasks, id).await?,
        Commands::Insights { tasks } => commands::insights::run(&config, &tasks).await?,
        Commands::Train { tasks, if_needed } => commands::train::run(&config, &tasks, if_needed).await?,
    };

    if cli.metrics {
        eprint!("{}", engine.metrics().export_prometheus());
    }
    Ok(())
}
