//! Command-line interface for nsfleet
//!
//! Uses clap with derive for type-safe CLI parsing

use crate::topology::Action;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// nsfleet - Linux network namespace topology builder
#[derive(Parser)]
#[command(name = "nsfleet")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Topology file (JSON, or TOML when it ends in .toml)
    #[arg(short, long, global = true, default_value = "topology.json")]
    pub config: PathBuf,

    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Worker threads for namespace setup and teardown
    #[arg(short, long, global = true)]
    pub workers: Option<usize>,

    /// Per-command timeout in seconds (0 waits forever)
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Build every namespace, link, address and route in the topology
    Create,

    /// Delete the host OOB interface and every namespace in the topology
    Delete,

    /// Print addresses and routes of each namespace
    Check,

    /// Validate the topology file without touching the system
    Validate,

    /// Print a sample topology with COUNT namespaces
    Generate {
        /// Number of namespaces (1-250)
        count: u32,

        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Emit TOML instead of JSON
        #[arg(long)]
        toml: bool,
    },

    /// Generate shell completion scripts
    Completion {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Commands {
    /// Topology action for commands that run one
    pub fn action(&self) -> Option<Action> {
        match self {
            Commands::Create => Some(Action::Create),
            Commands::Delete => Some(Action::Delete),
            Commands::Check => Some(Action::Check),
            _ => None,
        }
    }
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Generate shell completion scripts
    pub fn generate_completion(shell: Shell) {
        let mut cmd = Self::command();
        clap_complete::generate(shell, &mut cmd, "nsfleet", &mut std::io::stdout());
    }
}
