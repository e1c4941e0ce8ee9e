// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Snapvisor CLI
//!
//! Command-line interface for the snapvisor microVM orchestrator.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::snapload::Snapload;

/// Snapvisor - microVM lifecycle orchestrator with snapshot/restore
#[derive(Parser)]
#[command(name = "snapvisor")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "snapvisor.yaml", global = true)]
    pub config: String,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        file: String,
    },

    /// Drive a VM through repeated checkpoint/restore cycles and report timings
    Snapload(Snapload),

    /// Inspect or remove published snapshots
    Snapshots {
        #[command(subcommand)]
        action: SnapshotsAction,
    },
}

#[derive(Subcommand)]
pub enum SnapshotsAction {
    /// List published snapshots
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Delete a published snapshot
    Delete {
        /// Snapshot key
        key: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging; RUST_LOG overrides the -v switch.
    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Validate { file } => commands::validate::execute(&file).await?,
        Commands::Snapload(args) => commands::snapload::execute(&cli.config, args).await?,
        Commands::Snapshots { action } => match action {
            SnapshotsAction::List { json } => commands::snapshots::list(&cli.config, json).await?,
            SnapshotsAction::Delete { key } => {
                commands::snapshots::delete(&cli.config, &key).await?
            }
        },
    }

    Ok(())
}
