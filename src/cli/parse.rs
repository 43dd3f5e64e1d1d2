//! CLI parse: clap types for scenesync. No behavior; definitions only.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// scenesync - scene replica synchronization and render load balancing
#[derive(Parser, Debug)]
#[command(name = "scenesync")]
#[command(about = "Hash-tree scene synchronization and adaptive render partitioning")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Workspace root directory
    #[arg(long, default_value = ".")]
    pub workspace: PathBuf,

    /// Configuration file path (overrides default config loading)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long, default_value = "false")]
    pub verbose: bool,

    /// Disable logging entirely
    #[arg(long, default_value = "false")]
    pub quiet: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Log output (stdout, stderr, file)
    #[arg(long)]
    pub log_output: Option<String>,

    /// Log file path (if output is "file")
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Compute a render partition for a set of workers
    Partition {
        /// TOML file with [[workers]] entries (id, k, setup, enabled, manual_fraction)
        #[arg(long)]
        workers: PathBuf,
        /// Frame width in pixels; columns are the partition unit
        #[arg(long)]
        width: u32,
        /// Frame height in pixels
        #[arg(long)]
        height: u32,
        /// Samples per pixel
        #[arg(long, default_value = "1")]
        samples: u32,
        /// Seed for region order (random when omitted)
        #[arg(long)]
        seed: Option<u64>,
        /// Replace file coefficients with stored history from this session
        #[arg(long)]
        session: Option<String>,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Print the effective configuration
    Config {
        /// Output format (toml or json)
        #[arg(long, default_value = "toml")]
        format: String,
    },
    /// Inspect stored worker performance history
    Perf {
        #[command(subcommand)]
        command: PerfCommands,
    },
    /// Run a controller and simulated workers in-process and report the outcome
    Simulate {
        /// Number of simulated workers
        #[arg(long, default_value = "3")]
        workers: usize,
        /// Rig objects in the generated scene
        #[arg(long, default_value = "16")]
        objects: usize,
        /// Local edits announced after the workers sync
        #[arg(long, default_value = "4")]
        edits: usize,
        #[arg(long, default_value = "640")]
        width: u32,
        #[arg(long, default_value = "360")]
        height: u32,
        /// Render jobs run back to back; later jobs use learned coefficients
        #[arg(long, default_value = "2")]
        jobs: usize,
        #[arg(long)]
        seed: Option<u64>,
    },
}

#[derive(Subcommand, Debug)]
pub enum PerfCommands {
    /// Show history for every worker of a session and engine
    Show {
        #[arg(long)]
        session: String,
        /// Render engine (defaults to balance.engine)
        #[arg(long)]
        engine: Option<String>,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
}
