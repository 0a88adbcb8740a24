//! CLI command definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// studiod - job execution core for the studio
#[derive(Parser)]
#[command(
    name = "studiod",
    about = "Job execution core: assistant CLI jobs, pattern renders, workflow orchestration",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Run the daemon in the foreground
    Start,

    /// Print the effective configuration and exit
    Check,

    /// Validate a pattern source file without rendering it
    Validate {
        /// Path to the pattern source
        file: PathBuf,
    },
}
