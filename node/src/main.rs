// Copyright (c) 2026 The Basalt Contributors. MIT License.
// See LICENSE for details.

//! # basalt-node — BASALT Verifier Node
//!
//! The node binary: loads (or mints) a verifier identity, opens the chain
//! database, wires the consensus engine together, and — in the current
//! single-verifier devnet mode — runs a block production loop that seals
//! an empty block every block period.
//!
//! Multi-node deployments attach a real peer-to-peer broadcaster to the
//! engine server; the consensus engine itself is already multi-verifier
//! (see the protocol crate's end-to-end tests).

mod cli;
mod logging;

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

use basalt_protocol::consensus::{BftConfig, Core, EngineServer, ProposerPolicy, ServerOps};
use basalt_protocol::crypto::keys::BasaltKeypair;
use basalt_protocol::storage::{BasaltDB, Block, Chain, ChainReader};

use cli::{BasaltNodeCli, Commands, InitArgs, RunArgs};

/// File inside the data directory holding the hex-encoded verifier key.
const KEY_FILE: &str = "verifier.key";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = BasaltNodeCli::parse();
    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Init(args) => init(args),
        Commands::Version => {
            println!("basalt-node {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Create the data directory and mint a fresh verifier key.
fn init(args: InitArgs) -> Result<()> {
    fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("creating data directory {}", args.data_dir.display()))?;
    let key_path = args.data_dir.join(KEY_FILE);
    if key_path.exists() {
        bail!("already initialized: {} exists", key_path.display());
    }
    let keypair = BasaltKeypair::generate();
    fs::write(&key_path, hex::encode(keypair.secret_key_bytes()))
        .with_context(|| format!("writing {}", key_path.display()))?;
    println!(
        "initialized {} (verifier {})",
        args.data_dir.display(),
        keypair.address()
    );
    Ok(())
}

/// Start the engine and the devnet block production loop.
async fn run(args: RunArgs) -> Result<()> {
    logging::init("info", logging::LogFormat::from_str_lossy(&args.log_format));

    fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("creating data directory {}", args.data_dir.display()))?;
    let keypair = load_or_create_key(&args.data_dir)?;
    info!(address = %keypair.address(), "verifier identity loaded");

    let config = BftConfig {
        request_timeout_ms: args.request_timeout_ms,
        block_period_secs: args.block_period_secs,
        proposer_policy: ProposerPolicy::RoundRobin,
        epoch: args.epoch,
    };

    // Single-verifier devnet: this node is the entire genesis set.
    let db = Arc::new(BasaltDB::open(args.data_dir.join("chain"))?);
    let genesis = Block::genesis(vec![keypair.address()]);
    let chain = Arc::new(Chain::with_genesis(db, genesis)?);
    info!(height = chain.current_block().height(), "chain opened");

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let server = Arc::new(EngineServer::new(
        config.clone(),
        keypair.clone(),
        Arc::clone(&chain),
        events_tx.clone(),
    ));
    server.start();

    let core = Core::new(
        config.clone(),
        Arc::clone(&server) as Arc<dyn ServerOps>,
        events_tx,
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let core_task = tokio::spawn(core.run(events_rx, shutdown_rx));

    info!(
        block_period_secs = config.block_period_secs,
        "block production loop starting"
    );
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
            _ = tokio::time::sleep(Duration::from_secs(config.block_period_secs.max(1))) => {
                if let Err(err) = produce_block(&server, &chain, &keypair).await {
                    error!(error = %err, "block production failed");
                }
            }
        }
    }

    let _ = shutdown_tx.send(true);
    server.stop();
    let _ = core_task.await;
    info!("node stopped");
    Ok(())
}

/// Assemble, seal, and commit the next block.
async fn produce_block(
    server: &Arc<EngineServer>,
    chain: &Arc<Chain>,
    keypair: &BasaltKeypair,
) -> Result<()> {
    let parent = chain.current_block();
    let timestamp = now_secs().max(parent.header.timestamp);

    let mut block = Block::new(
        &parent.header,
        Vec::new(),
        keypair.address(),
        Vec::new(),
        timestamp,
    );
    let seal = keypair.sign(&block.header.seal_hash())?;
    block.header.write_seal(seal)?;

    let sealed = server.seal(block).await?;
    chain.insert_block(sealed.clone())?;
    server.handle_new_chain_head()?;

    info!(
        height = sealed.height(),
        hash = %hex::encode(sealed.hash()),
        "block finalized"
    );
    Ok(())
}

/// Load the verifier key from the data directory, minting one on first
/// run.
fn load_or_create_key(data_dir: &Path) -> Result<BasaltKeypair> {
    let key_path = data_dir.join(KEY_FILE);
    if key_path.exists() {
        let hex_key = fs::read_to_string(&key_path)
            .with_context(|| format!("reading {}", key_path.display()))?;
        return BasaltKeypair::from_hex(hex_key.trim())
            .with_context(|| format!("parsing {}", key_path.display()));
    }
    let keypair = BasaltKeypair::generate();
    fs::write(&key_path, hex::encode(keypair.secret_key_bytes()))
        .with_context(|| format!("writing {}", key_path.display()))?;
    Ok(keypair)
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
