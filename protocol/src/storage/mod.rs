//! # Storage Module
//!
//! Chain data structures and persistence: the seal-carrying block format,
//! the sled-backed database, and the chain store the consensus engine
//! reads from and commits into.

pub mod block;
pub mod chain;
pub mod db;

pub use block::{Block, BlockHeader};
pub use chain::{Chain, ChainReader};
pub use db::BasaltDB;
