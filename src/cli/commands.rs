//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - serve: run the registry server
//! - claim: claim the next key and print it
//! - done: report a key as finished
//! - status: summarize the registry
//! - run: claim a key, run a command for it, report it done

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Claimr - hand out work items to independently launched jobs
#[derive(Parser, Debug)]
#[command(name = "claimr")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Append log output to this file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the registry server
    Serve {
        /// Work item keys, in claim order
        keys: Vec<String>,

        /// Read additional keys from a file, one per line
        #[arg(short, long)]
        keys_file: Option<PathBuf>,

        /// Endpoint to bind, e.g. tcp://*:5555
        #[arg(short, long)]
        bind: Option<String>,

        /// Persist the registry to this JSON-lines file and resume from it
        #[arg(short, long)]
        state_file: Option<PathBuf>,

        /// Release claims older than this many seconds
        #[arg(long)]
        stale_timeout: Option<u64>,

        /// Stop serving once every item is done
        #[arg(long)]
        exit_when_done: bool,
    },

    /// Claim the next work item and print its key
    Claim {
        #[command(flatten)]
        job: JobArgs,
    },

    /// Report a work item as finished
    Done {
        /// Key to mark done
        key: String,

        /// Server endpoint
        #[arg(short, long)]
        server: Option<String>,
    },

    /// Show registry status
    Status {
        /// Server endpoint
        #[arg(short, long)]
        server: Option<String>,

        /// List every item
        #[arg(short, long)]
        detailed: bool,
    },

    /// Claim a work item, run a command for it, and report it done on success
    Run {
        #[command(flatten)]
        job: JobArgs,

        /// Command to run; receives CLAIMR_KEY in its environment
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

/// Identity of the job asking for work
#[derive(Args, Debug, Clone, Default)]
pub struct JobArgs {
    /// Server endpoint
    #[arg(short, long)]
    pub server: Option<String>,

    /// Job id; defaults to the batch scheduler's id or a generated one
    #[arg(long)]
    pub job_id: Option<String>,

    /// Human-readable job name
    #[arg(long)]
    pub job_name: Option<String>,

    /// Log path reported to the server; defaults to --log-file
    #[arg(long)]
    pub log_path: Option<PathBuf>,
}
