// Copyright (c) 2026 The Basalt Contributors. MIT License.
// See LICENSE for details.

//! # BASALT Protocol — Core Library
//!
//! BASALT is a blockchain node built around one hard problem: Byzantine
//! fault tolerant block finalization. The consensus engine is a PBFT-style
//! three-phase protocol (pre-prepare, prepare, commit) driven by a dynamic
//! set of verifiers, with round changes for liveness and header-level
//! voting to grow or shrink the verifier set over time.
//!
//! ## Architecture
//!
//! The crate is split into modules that mirror the actual concerns of a
//! BFT-finalized chain:
//!
//! - **crypto** — Keccak-256 hashing and recoverable secp256k1 signatures.
//!   Verifier identity is a 20-byte address derived from the public key.
//! - **consensus** — The engine itself: verifier sets, the typed message
//!   pipeline, the per-sequence round state machine, the server that wires
//!   the state machine to the chain, and the snapshot vote log.
//! - **storage** — Blocks, the seal-carrying header format, and the sled
//!   persistence layer for blocks and snapshots.
//! - **config** — Protocol constants and network parameters.
//!
//! ## Design Philosophy
//!
//! 1. Safety first: a node never commits two different blocks at one height.
//! 2. The state machine owns its state — one task, no locks, no surprises.
//! 3. Every public API is documented. Every quorum rule has a test.

pub mod config;
pub mod consensus;
pub mod crypto;
pub mod storage;
