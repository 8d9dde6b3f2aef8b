//! chatsync CLI
//!
//! Command-line tools for exercising the synchronizer against the reference
//! server.
//!
//! # Commands
//!
//! - `replay` - Run a scenario script and report the client state
//! - `check` - Parse a scenario script and list its steps

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// chatsync scenario tools.
#[derive(Parser)]
#[command(name = "chatsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scenario script and report the client state
    Replay {
        /// Scenario file (JSON)
        script: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,

        /// Fail if the client did not converge with the server
        #[arg(short, long)]
        strict: bool,
    },

    /// Parse a scenario script and list its steps
    Check {
        /// Scenario file (JSON)
        script: PathBuf,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr so json reports stay parseable.
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Replay {
            script,
            format,
            strict,
        } => {
            commands::replay::run(&script, &format, strict)?;
        }
        Commands::Check { script } => {
            commands::check::run(&script)?;
        }
        Commands::Version => {
            println!("chatsync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
