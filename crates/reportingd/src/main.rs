//! reportingd - Report delivery daemon.
//!
//! Holds queued reports and registered endpoints, uploads them in the
//! background, and persists the cache across restarts. Input is a
//! JSON-lines command feed on stdin.

mod app;
mod commands;
mod config;
mod inspect;
mod logging;
mod paths;

use anyhow::Result;
use clap::{Parser, Subcommand};
use config::Config;
use logging::{init_logging, LogOptions};
use paths::Paths;
use std::path::PathBuf;

/// reportingd command-line interface.
#[derive(Parser)]
#[command(name = "reportingd")]
#[command(about = "Queues reports and delivers them to registered reporting endpoints")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error). Overrides the config file.
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Base directory for config, state and logs. Defaults to ~/.reporting
    #[arg(long, global = true, env = "REPORTING_BASE_DIR")]
    base_dir: Option<PathBuf>,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon, reading commands from stdin
    Run,
    /// Summarize a persisted state file
    Inspect {
        /// State file to read. Defaults to the configured state file
        path: Option<PathBuf>,
    },
    /// Print the effective configuration
    Config {
        /// Write the effective configuration to the config file
        #[arg(long)]
        save: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let paths = match cli.base_dir {
        Some(base) => Paths::with_base_dir(base),
        None => Paths::new()?,
    };
    let mut config = Config::load(&paths)?;
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    if cli.json_logs {
        config.json_logs = true;
    }

    let log_file = config.log_to_file.then(|| paths.log_file());
    init_logging(LogOptions {
        level: &config.log_level,
        json: config.json_logs,
        file: log_file.as_deref(),
    })?;

    match cli.command {
        Some(Commands::Run) | None => {
            app::run(config, paths).await?;
        }
        Some(Commands::Inspect { path }) => {
            let path = path.unwrap_or_else(|| config.state_file(&paths));
            let state = inspect::load_state(&path)?;
            println!("{}", serde_json::to_string_pretty(&inspect::summarize(&state))?);
        }
        Some(Commands::Config { save }) => {
            if save {
                config.save(&paths)?;
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
