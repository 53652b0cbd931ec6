//! # CLI Interface
//!
//! Defines the command-line argument structure for `basalt-node` using
//! `clap` derive. Supports three subcommands: `run`, `init`, and
//! `version`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// BASALT verifier node.
///
/// A verifier node for the BASALT network: participates in BFT consensus,
/// seals blocks, and maintains the finalized chain.
#[derive(Parser, Debug)]
#[command(
    name = "basalt-node",
    about = "BASALT verifier node",
    version,
    propagate_version = true
)]
pub struct BasaltNodeCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the node binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the verifier node.
    Run(RunArgs),
    /// Initialize a node — creates the data directory and generates a
    /// fresh verifier key.
    Init(InitArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to the node data directory where the chain and verifier key
    /// are stored. Created on first run if it does not exist.
    #[arg(long, short = 'd', env = "BASALT_DATA_DIR", default_value = ".basalt")]
    pub data_dir: PathBuf,

    /// Round timeout in milliseconds before a round change fires.
    #[arg(long, env = "BASALT_REQUEST_TIMEOUT_MS", default_value_t = 10_000)]
    pub request_timeout_ms: u64,

    /// Seconds between sealed blocks in devnet mode.
    #[arg(long, env = "BASALT_BLOCK_PERIOD", default_value_t = 5)]
    pub block_period_secs: u64,

    /// Number of blocks between verifier-vote checkpoints.
    #[arg(long, env = "BASALT_EPOCH", default_value_t = 1024)]
    pub epoch: u64,

    /// Log output format: "pretty" or "json".
    #[arg(long, env = "BASALT_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}

/// Arguments for the `init` subcommand.
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Path to the node data directory to initialize.
    #[arg(long, short = 'd', env = "BASALT_DATA_DIR", default_value = ".basalt")]
    pub data_dir: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_defaults_parse() {
        let cli = BasaltNodeCli::parse_from(["basalt-node", "run"]);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.request_timeout_ms, 10_000);
                assert_eq!(args.block_period_secs, 5);
                assert_eq!(args.epoch, 1024);
            }
            other => panic!("expected run, got {:?}", other),
        }
    }

    #[test]
    fn init_takes_data_dir() {
        let cli = BasaltNodeCli::parse_from(["basalt-node", "init", "--data-dir", "/tmp/x"]);
        match cli.command {
            Commands::Init(args) => assert_eq!(args.data_dir, PathBuf::from("/tmp/x")),
            other => panic!("expected init, got {:?}", other),
        }
    }
}
