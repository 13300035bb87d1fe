use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

use cmd::up::UpArgs;

#[derive(Parser)]
#[command(name = "devstack")]
#[command(version, about = "Local development stack orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Write log records as JSON
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check ports, start the stack and wait until it is torn down (default)
    Up(UpArgs),
    /// Run only the port pre-flight check
    Precheck,
    /// Show tracked services, their ready markers and whether they are required
    Services {
        /// Print the table as JSON
        #[arg(long)]
        json: bool,
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
    /// Initialize a default devstack.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let command = cli
        .command
        .take()
        .unwrap_or_else(|| Commands::Up(UpArgs::default()));

    // The progress UI owns the terminal during `up`, so its records go to a file.
    let _guard = match &command {
        Commands::Up(_) => {
            let log_dir = project_dir
                .join(devstack::config::CONFIG_DIR)
                .join("logs");
            Some(devstack::logging::init(&log_dir, cli.verbose, cli.log_json)?)
        }
        _ => {
            devstack::logging::init_stderr(cli.verbose, cli.log_json)?;
            None
        }
    };

    match &command {
        Commands::Up(args) => cmd::cmd_up(&cli, project_dir, args).await?,
        Commands::Precheck => cmd::cmd_precheck(&project_dir).await?,
        Commands::Services { json } => cmd::cmd_services(&project_dir, *json)?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
