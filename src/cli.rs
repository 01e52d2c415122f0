//! CLI definitions for AppShots.

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};

/// AppShots CLI.
#[derive(Parser)]
#[command(name = "appshots")]
#[command(about = "Drive iOS simulators through declared UI states and capture screenshots")]
#[command(version)]
pub(crate) struct Cli {
    /// Project file path
    #[arg(short, long, default_value = "appshots.yaml", env = "APPSHOTS_CONFIG", global = true)]
    pub config: Utf8PathBuf,

    /// Verbose logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Log directory
    #[arg(long, default_value = "logs", global = true)]
    pub log_dir: Utf8PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Validate the plan, capture every screen on every device and print the report
    Capture {
        /// Only these devices (repeatable)
        #[arg(short, long = "device")]
        devices: Vec<String>,

        /// Only these screens (repeatable)
        #[arg(short, long = "screen")]
        screens: Vec<String>,

        /// Cancel the whole run after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Check the project file and plan without touching any device
    Validate,

    /// Delete the simulators AppShots created
    Clean,

    /// Write a starter project file
    Init {
        /// Where to write it (defaults to --config)
        #[arg(short, long)]
        output: Option<Utf8PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}
