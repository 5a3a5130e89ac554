//! CLI commands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Temporal-History inspection CLI
#[derive(Parser)]
#[command(name = "temporal-history")]
#[command(about = "Inspect saved undo/redo history documents")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print HEAD, event count and entry count
    Info {
        /// Saved history document
        file: PathBuf,
    },
    /// List the event graph
    Events {
        /// Saved history document
        file: PathBuf,
        /// Only the chain from the root to HEAD
        #[arg(short, long)]
        chain: bool,
    },
    /// Check the container checksum and that every recorded change has its entry
    Verify {
        /// Saved history document
        file: PathBuf,
    },
}
