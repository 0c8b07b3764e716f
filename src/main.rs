//! statewright - hierarchical state machines from the command line
//!
//! Validates, inspects and drives JSON or YAML designs, either from a
//! script or interactively.

mod commands;
mod config;
mod repl;

use clap::{Parser, Subcommand};
use colored::Colorize;
use config::Config;
use statewright_core::{Machine, StateTree};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "statewright")]
#[command(about = "Compile, inspect and run hierarchical state machine designs")]
#[command(version)]
struct Cli {
    /// Path to a YAML config file
    #[arg(short, long, env = "STATEWRIGHT_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a design and report errors
    Check {
        /// Design file (.json, .yaml or .yml)
        design: PathBuf,
    },

    /// Print the state tree
    States {
        /// Design file
        design: PathBuf,

        /// Emit JSON instead of a tree
        #[arg(long)]
        json: bool,
    },

    /// List events and the states handling them
    Events {
        /// Design file
        design: PathBuf,
    },

    /// Feed a script of events to a machine
    Run {
        /// Design file
        design: PathBuf,

        /// Script file, one `EVENT [payload]`, `wait <secs>` or `reset` per line (stdin if omitted)
        #[arg(short, long)]
        script: Option<PathBuf>,

        /// Print the final snapshot as JSON
        #[arg(long)]
        json: bool,
    },

    /// Start an interactive REPL on a machine
    Repl {
        /// Design file
        design: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter)),
        )
        .init();

    if let Some(path) = &cli.config {
        tracing::debug!("loaded config from {}", path.display());
    }

    if let Err(e) = execute(cli.command, &config).await {
        eprintln!("{}: {}", "Error".red(), e);
        std::process::exit(1);
    }
    Ok(())
}

async fn execute(command: Commands, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Check { design } => {
            let design = commands::load_design(&design, config)?;
            println!("{}", commands::check(&design)?);
        }
        Commands::States { design, json } => {
            let design = commands::load_design(&design, config)?;
            let tree = StateTree::compile(&design)?;
            if json {
                let states = statewright_core::introspect::flat_states(&tree);
                println!("{}", serde_json::to_string_pretty(&states)?);
            } else {
                print!("{}", commands::states(&tree));
            }
        }
        Commands::Events { design } => {
            let design = commands::load_design(&design, config)?;
            let tree = StateTree::compile(&design)?;
            print!("{}", commands::events(&tree));
        }
        Commands::Run {
            design,
            script,
            json,
        } => {
            let design = commands::load_design(&design, config)?;
            let script = match script {
                Some(path) => std::fs::read_to_string(&path)
                    .map_err(|e| format!("failed to read script '{}': {}", path.display(), e))?,
                None => std::io::read_to_string(std::io::stdin())?,
            };
            print!("{}", commands::run(design, &script, json).await?);
        }
        Commands::Repl { design } => {
            let design = commands::load_design(&design, config)?;
            let machine = Machine::new(design)?;
            tracing::info!(machine = %machine.id(), "repl started");
            repl::run(machine, &config.repl.history_path()).await?;
        }
    }
    Ok(())
}
