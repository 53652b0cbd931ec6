//! # BFT Consensus Engine
//!
//! A PBFT-style three-phase consensus protocol driving block finalization
//! among a dynamic set of verifiers. One verifier per view is the proposer;
//! it broadcasts a pre-prepare carrying the proposed block, every verifier
//! answers with a prepare, and once a quorum of prepares is seen each
//! verifier locks on the block hash and broadcasts a commit. A quorum of
//! commits finalizes the block; the committed seals are written into the
//! header as a portable finality proof.
//!
//! ## Module map
//!
//! - [`types`] — views, subjects, requests, events, config, and the error
//!   taxonomy shared by every component.
//! - [`verifier`] — the ordered verifier set and proposer selection.
//! - [`message`] — the signed wire message, canonical encoding, and signer
//!   recovery.
//! - [`round`] — per-round bookkeeping: message sets, round state, and the
//!   round-change collections.
//! - [`backlog`] — the future-message queue replayed as the machine
//!   advances.
//! - [`core`] / [`handlers`] — the state machine itself.
//! - [`server`] — the engine server wiring the state machine to the chain,
//!   the network, and the node key.
//! - [`snapshot`] — the header-vote log that grows and shrinks the
//!   verifier set across epochs.
//!
//! ## Liveness vs. safety
//!
//! Safety never depends on timing: a node only commits on 2F+1 matching
//! commit messages, and once Prepared it stays locked on the hash across
//! round changes. Liveness is the round-change machinery's job — timeouts,
//! weak certificates (F+1) to catch up, strong certificates (2F+1) to
//! actually move.

pub mod backlog;
pub mod core;
pub mod handlers;
pub mod message;
pub mod round;
pub mod server;
pub mod snapshot;
pub mod types;
pub mod verifier;

pub use self::core::{Core, CoreState};
pub use message::{Message, MessageCode};
pub use round::{MessageSet, RoundChangeSet, RoundState};
pub use server::{Broadcaster, EngineServer, Peer, ServerOps};
pub use snapshot::{Snapshot, Tally, Vote};
pub use types::{
    BftConfig, ConsensusError, ConsensusEvent, PrePrepare, ProposerPolicy, Request, Subject, View,
};
pub use verifier::{Verifier, VerifierSet};
