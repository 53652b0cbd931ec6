//! # BasaltDB — Persistent Storage Engine
//!
//! The persistence layer for the chain, built on sled's embedded key-value
//! store. All on-disk data flows through this module.
//!
//! ## Tree Layout
//!
//! sled organizes data into named "trees", each an independent B+ tree
//! with its own keyspace:
//!
//! | Tree           | Key                        | Value            |
//! |----------------|----------------------------|------------------|
//! | `blocks`       | `height` (8B BE)           | `bincode(Block)` |
//! | `block_hashes` | `hash` (32B)               | `height` (8B BE) |
//! | `snapshots`    | `"bft-snapshot" ‖ hash`    | JSON snapshot    |
//! | `metadata`     | key (UTF-8)                | value (bytes)    |
//!
//! Block heights are stored as big-endian u64 so that sled's lexicographic
//! ordering matches numeric ordering.
//!
//! ## Atomicity
//!
//! Persisting a block writes the block body, the hash index entry, and the
//! updated latest height in a single atomic `Batch` — either everything
//! lands on disk or nothing does.

use sled::{Batch, Db, Tree};
use std::path::Path;

use crate::config::SNAPSHOT_KEY_PREFIX;
use crate::crypto::hash::Hash;

use super::block::Block;

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Errors that can occur during database operations.
///
/// `Sled` failures are the one fatal error class in the engine: a node that
/// cannot persist snapshots cannot safely keep verifying.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("key not found: {0}")]
    NotFound(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Well-known key in the `metadata` tree for the latest block height.
const META_LATEST_HEIGHT: &[u8] = b"latest_block_height";

// ---------------------------------------------------------------------------
// BasaltDB
// ---------------------------------------------------------------------------

/// Persistent storage engine for the chain and the consensus snapshots.
///
/// Wraps a sled `Db` instance with typed accessors. sled is inherently
/// thread-safe — `BasaltDB` can be shared across threads via `Arc<BasaltDB>`
/// without external synchronization.
#[derive(Debug, Clone)]
pub struct BasaltDB {
    /// The underlying sled database handle.
    db: Db,
    /// Blocks indexed by height (big-endian u64 keys).
    blocks: Tree,
    /// Reverse index: block hash (32 bytes) -> height (8 bytes BE).
    block_hashes: Tree,
    /// Verifier-set snapshots keyed by `"bft-snapshot" ‖ block hash`.
    snapshots: Tree,
    /// Arbitrary key-value metadata (latest height, etc.).
    metadata: Tree,
}

impl BasaltDB {
    /// Open or create a database at the given filesystem path.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Create a temporary database that lives in memory and is cleaned up
    /// automatically on drop. Ideal for tests — no filesystem side effects.
    pub fn open_temporary() -> DbResult<Self> {
        let config = sled::Config::new().temporary(true);
        let db = config.open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> DbResult<Self> {
        let blocks = db.open_tree("blocks")?;
        let block_hashes = db.open_tree("block_hashes")?;
        let snapshots = db.open_tree("snapshots")?;
        let metadata = db.open_tree("metadata")?;

        Ok(Self {
            db,
            blocks,
            block_hashes,
            snapshots,
            metadata,
        })
    }

    // -- Block operations ---------------------------------------------------

    /// Persist a block atomically: body, hash index, and latest height.
    pub fn put_block(&self, block: &Block) -> DbResult<()> {
        let encoded =
            bincode::serialize(block).map_err(|e| DbError::Serialization(e.to_string()))?;
        let height_key = block.height().to_be_bytes();

        let mut batch = Batch::default();
        batch.insert(&height_key[..], encoded);
        self.blocks.apply_batch(batch)?;

        self.block_hashes
            .insert(block.hash(), &height_key[..])?;

        let current = self.latest_height()?;
        if current.map_or(true, |h| block.height() >= h) {
            self.metadata
                .insert(META_LATEST_HEIGHT, &height_key[..])?;
        }
        Ok(())
    }

    /// Fetch a block by height.
    pub fn block_by_height(&self, height: u64) -> DbResult<Option<Block>> {
        match self.blocks.get(height.to_be_bytes())? {
            Some(bytes) => {
                let block = bincode::deserialize(&bytes)
                    .map_err(|e| DbError::Serialization(e.to_string()))?;
                Ok(Some(block))
            }
            None => Ok(None),
        }
    }

    /// Fetch a block by its hash via the reverse index.
    pub fn block_by_hash(&self, hash: &Hash) -> DbResult<Option<Block>> {
        match self.block_hashes.get(hash)? {
            Some(height_bytes) => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&height_bytes);
                self.block_by_height(u64::from_be_bytes(buf))
            }
            None => Ok(None),
        }
    }

    /// The height of the most recently persisted block, if any.
    pub fn latest_height(&self) -> DbResult<Option<u64>> {
        match self.metadata.get(META_LATEST_HEIGHT)? {
            Some(bytes) => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes);
                Ok(Some(u64::from_be_bytes(buf)))
            }
            None => Ok(None),
        }
    }

    // -- Snapshot operations ------------------------------------------------

    /// Persist a snapshot blob under `"bft-snapshot" ‖ hash`.
    pub fn put_snapshot(&self, hash: &Hash, blob: &[u8]) -> DbResult<()> {
        self.snapshots.insert(snapshot_key(hash), blob)?;
        Ok(())
    }

    /// Load a snapshot blob previously stored for the given block hash.
    pub fn snapshot(&self, hash: &Hash) -> DbResult<Option<Vec<u8>>> {
        Ok(self.snapshots.get(snapshot_key(hash))?.map(|v| v.to_vec()))
    }

    /// Flush all trees to disk.
    pub fn flush(&self) -> DbResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn snapshot_key(hash: &Hash) -> Vec<u8> {
    let mut key = SNAPSHOT_KEY_PREFIX.to_vec();
    key.extend_from_slice(hash);
    key
}
