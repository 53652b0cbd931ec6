//! # Chain Store
//!
//! A minimal chain: the persisted block sequence plus an in-memory head.
//! The consensus engine reads it through the [`ChainReader`] trait (so
//! tests can substitute a fixture chain) and appends finalized blocks
//! through [`Chain::insert_block`].
//!
//! Fork choice, reorgs, and state execution are the business of a full
//! node; the engine only ever extends the head with BFT-final blocks, so a
//! straight line is all the structure this store needs.

use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::info;

use crate::crypto::hash::Hash;

use super::block::{Block, BlockHeader};
use super::db::{BasaltDB, DbError};

/// Read access to the chain, as consumed by the consensus engine.
pub trait ChainReader: Send + Sync {
    /// The current head block.
    fn current_block(&self) -> Block;

    /// Look up a block by hash.
    fn block_by_hash(&self, hash: &Hash) -> Option<Block>;

    /// Look up a header by height.
    fn header_by_height(&self, height: u64) -> Option<BlockHeader>;
}

/// Errors raised when appending to the chain.
#[derive(Debug, Error)]
pub enum ChainError {
    /// The block does not extend the current head.
    #[error("block at height {height} does not extend the chain head at {head_height}")]
    NotExtendingHead { height: u64, head_height: u64 },

    /// Persistence failed.
    #[error(transparent)]
    Db(#[from] DbError),
}

/// The linear chain store: sled persistence plus a cached head.
pub struct Chain {
    db: Arc<BasaltDB>,
    head: RwLock<Block>,
}

impl Chain {
    /// Open a chain over the given database, seeding it with `genesis` if
    /// empty. On restart the head is recovered from the latest persisted
    /// height.
    pub fn with_genesis(db: Arc<BasaltDB>, genesis: Block) -> Result<Self, ChainError> {
        let head = match db.latest_height()? {
            Some(height) => db
                .block_by_height(height)?
                .ok_or_else(|| DbError::NotFound(format!("block at height {}", height)))?,
            None => {
                db.put_block(&genesis)?;
                genesis
            }
        };
        Ok(Self {
            db,
            head: RwLock::new(head),
        })
    }

    /// Append a finalized block. The block must directly extend the head.
    pub fn insert_block(&self, block: Block) -> Result<(), ChainError> {
        let mut head = self.head.write();
        if block.height() != head.height() + 1 || block.header.parent_hash != head.hash() {
            return Err(ChainError::NotExtendingHead {
                height: block.height(),
                head_height: head.height(),
            });
        }
        self.db.put_block(&block)?;
        info!(height = block.height(), hash = %hex::encode(block.hash()), "chain head advanced");
        *head = block;
        Ok(())
    }

    /// The database backing this chain.
    pub fn db(&self) -> &Arc<BasaltDB> {
        &self.db
    }
}

impl ChainReader for Chain {
    fn current_block(&self) -> Block {
        self.head.read().clone()
    }

    fn block_by_hash(&self, hash: &Hash) -> Option<Block> {
        self.db.block_by_hash(hash).ok().flatten()
    }

    fn header_by_height(&self, height: u64) -> Option<BlockHeader> {
        self.db
            .block_by_height(height)
            .ok()
            .flatten()
            .map(|b| b.header)
    }
}
