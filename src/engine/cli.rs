//! Blocklist CLI Module
//! Command-line interface for the local blocklist updater

pub mod formatter;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::engine::updater::ArtifactStore;

#[derive(Parser, Debug)]
#[command(name = "blocklist-cli")]
#[command(author = "Blocklist Updater Team")]
#[command(version)]
#[command(about = "Check, download and delete the on-device DNS blocklist", long_about = None)]
pub struct Cli {
    /// Data directory (defaults to the platform data directory)
    #[arg(short, long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Output format (json for scripting)
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Treat outbound traffic as forced through the VPN tunnel
    #[arg(long, global = true)]
    pub restricted: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show the installed blocklist and its lifecycle state
    Status,

    /// Check the remote for a newer blocklist
    Check,

    /// Download the newest blocklist
    Download {
        /// Download again even if the installed version is current
        #[arg(long)]
        force: bool,

        /// On a restricted network, enable the in-app downloader and proceed
        #[arg(long, group = "downloader")]
        in_process: bool,

        /// On a restricted network, use the system downloader this time
        #[arg(long, group = "downloader")]
        system: bool,
    },

    /// Delete the local blocklist
    Delete {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Set which downloader to use on restricted networks
    Prefer {
        #[arg(value_enum)]
        downloader: DownloaderChoice,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum DownloaderChoice {
    InProcess,
    System,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Write a default updater.config.json
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration
    Show,
}

impl Cli {
    pub fn get_data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .or_else(ArtifactStore::platform_base_dir)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}
