//! Yield rebalancing agent CLI
//!
//! Command-line interface for running and inspecting a rebalancing agent.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use yield_rebalancer::{Agent, Collaborators, Config, Result, StatsReport, TimeWindow};

#[derive(Parser)]
#[command(name = "yield-agent")]
#[command(about = "Autonomous cross-network yield rebalancing agent")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent loop until Ctrl-C
    Run,

    /// Run a single cycle now and print the report
    Cycle,

    /// Show the agent's performance aggregate
    Status,

    /// Show the agent's rebalance history
    History {
        /// Only records initiated in the last H hours
        #[arg(long)]
        hours: Option<i64>,
    },

    /// Show the agent's performance series, newest first
    Performance {
        /// Maximum number of rows
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },

    /// Show totals across all agents and per-network metrics
    Stats {
        /// Only snapshots and records from the last H hours
        #[arg(long)]
        hours: Option<i64>,
    },

    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (ignore if not found)
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    let registry = tracing_subscriber::registry().with(filter);
    if cli.json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    // Load config
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    config.apply_env();

    match cli.command {
        Commands::Run => run_agent(config).await?,
        Commands::Cycle => {
            let agent = Agent::from_config(config).await?;
            agent.provision().await?;
            let report = agent.run_cycle_now().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Status => {
            let agent = Agent::from_config(config).await?;
            println!("{}", serde_json::to_string_pretty(&agent.status().await?)?);
        }
        Commands::History { hours } => {
            let agent = Agent::from_config(config).await?;
            let window = window(hours)?;
            println!("{}", serde_json::to_string_pretty(&agent.history(window).await?)?);
        }
        Commands::Performance { limit } => {
            let agent = Agent::from_config(config).await?;
            let rows = agent.performance_history(limit).await?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Commands::Stats { hours } => {
            config.validate()?;
            let window = window(hours)?;
            let collaborators = Collaborators::from_config(&config).await?;
            let report =
                StatsReport::collect(collaborators.store.as_ref(), &config.networks, window).await?;
            report.log();
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Config => {
            config.validate()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn window(hours: Option<i64>) -> Result<TimeWindow> {
    hours.map_or_else(|| Ok(TimeWindow::all()), TimeWindow::last_hours)
}

async fn run_agent(config: Config) -> Result<()> {
    tracing::info!(
        agent_id = %config.agent_id,
        networks = ?config.networks,
        oracle = ?config.oracle.mode,
        interval_ms = config.check_interval_ms,
        "Starting yield agent"
    );

    let agent = Arc::new(Agent::from_config(config).await?);
    let wallet = agent.provision().await?;
    tracing::info!(address = %wallet.address, network = %wallet.network, "Agent provisioned");

    agent.start().await;
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutdown requested, waiting for the current cycle");
    agent.shutdown().await;
    Ok(())
}
