use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "strata")]
#[command(version, about = "Multi-stage infrastructure deployment pipeline")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Deployment stage (overrides strata.toml, STRATA_STAGE and ENV)
    #[arg(long, global = true)]
    pub stage: Option<String>,

    /// Emit log lines as JSON
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new strata project with a sample pipeline
    Init {
        /// Overwrite an existing pipeline.toml
        #[arg(long)]
        force: bool,
    },
    /// Show the stages and waves the pipeline would execute
    Plan {
        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
    /// Execute the pipeline
    Run {
        /// Provision against the simulated backend
        #[arg(long)]
        dry_run: bool,

        /// UI output mode: full, minimal, json
        #[arg(long, default_value = "full")]
        ui: String,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default strata.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Init { force } => cmd::cmd_init(&project_dir, *force)?,
        Commands::Plan { json } => cmd::cmd_plan(&cli, project_dir, *json)?,
        Commands::Run { dry_run, ui } => cmd::cmd_run(&cli, project_dir, *dry_run, ui).await?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
