//! # Shared Consensus Types
//!
//! The vocabulary of the protocol: views, subjects, pre-prepares, the
//! engine configuration, the event stream feeding the state machine, and
//! the error taxonomy every handler speaks.

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{DEFAULT_BLOCK_PERIOD_SECS, DEFAULT_EPOCH, DEFAULT_REQUEST_TIMEOUT_MS};
use crate::crypto::hash::Hash;
use crate::storage::Block;

use super::message::Message;

// ---------------------------------------------------------------------------
// View
// ---------------------------------------------------------------------------

/// A consensus attempt, identified by `(sequence, round)`.
///
/// The sequence is the target block height; the round counts attempts
/// within that sequence. Comparison is lexicographic — sequence first,
/// then round — which is exactly the derive order below, so the derived
/// `Ord` is the consensus ordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct View {
    /// Target block height.
    pub sequence: u64,
    /// Attempt index within the sequence; bumped on timeout or failure.
    pub round: u64,
}

impl View {
    /// Construct a view.
    pub fn new(sequence: u64, round: u64) -> Self {
        Self { sequence, round }
    }
}

impl std::fmt::Display for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(seq {}, round {})", self.sequence, self.round)
    }
}

// ---------------------------------------------------------------------------
// Payload bodies
// ---------------------------------------------------------------------------

/// A request to run consensus on a proposal, handed to the engine by the
/// block assembler.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// The block to agree on.
    pub proposal: Block,
}

/// The proposer's opening message for a view: the full proposal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrePrepare {
    /// The view this proposal belongs to.
    pub view: View,
    /// The proposed block.
    pub proposal: Block,
}

/// The body of prepare, commit, and round-change messages: a view plus the
/// digest being agreed on. Round changes carry a zero digest — they are
/// about the view, not a block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    /// The view the statement refers to.
    pub view: View,
    /// The proposal hash (zero for round changes).
    pub digest: Hash,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// How the proposer for a view is chosen from the verifier set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposerPolicy {
    /// The proposer advances one slot on every new sequence and round.
    #[default]
    RoundRobin,
    /// The proposer stays put until a round change forces a move.
    Sticky,
}

/// Engine configuration. Consensus-critical: nodes with different epochs
/// or policies will disagree about verifier sets and proposers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BftConfig {
    /// Base round timeout in milliseconds. Rounds past zero add an
    /// exponential `2^round` seconds on top.
    pub request_timeout_ms: u64,
    /// Minimum spacing between consecutive block timestamps, in seconds.
    pub block_period_secs: u64,
    /// Proposer selection policy.
    pub proposer_policy: ProposerPolicy,
    /// Number of blocks between vote-log checkpoints.
    pub epoch: u64,
}

impl Default for BftConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            block_period_secs: DEFAULT_BLOCK_PERIOD_SECS,
            proposer_policy: ProposerPolicy::RoundRobin,
            epoch: DEFAULT_EPOCH,
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// The sum-typed event stream consumed by the core's single worker task.
///
/// Everything that can happen to the state machine — new requests from the
/// assembler, frames from the network, internal replays, timer expiry,
/// chain head advancement — arrives through one channel and is processed
/// strictly one at a time. That serialization is what lets the round state
/// live without a single lock.
#[derive(Clone, Debug)]
pub enum ConsensusEvent {
    /// The block assembler asked for consensus on a new proposal.
    Request {
        /// The proposed block.
        proposal: Block,
    },
    /// A consensus frame arrived (from a peer, or our own broadcast looped
    /// back through the server).
    Message {
        /// The encoded [`Message`].
        payload: Bytes,
    },
    /// Internal replay of a message that was queued for the future and is
    /// now (possibly) ready. Also used to redeliver a pre-prepare whose
    /// block was timestamped slightly ahead of our clock.
    Backlog {
        /// The already-validated message.
        message: Message,
    },
    /// The round-change timer fired.
    Timeout,
    /// The chain accepted a block; move to the next sequence.
    FinalCommitted,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// The consensus error taxonomy.
///
/// The first three variants are routing outcomes, not failures: `Future*`
/// sends a message to the backlog, `Old*` and `Ignored` drop it. Protocol
/// violations are logged and dropped — never fatal. Everything feeds back
/// into the event loop, which carries on regardless.
#[derive(Debug, Error)]
pub enum ConsensusError {
    // -- Transient routing --------------------------------------------------
    /// The message belongs to a future view or a state we haven't reached.
    #[error("message is ahead of the current view")]
    FutureMessage,

    /// The message belongs to a view that has already concluded.
    #[error("message is behind the current view")]
    OldMessage,

    /// Nothing to do with this message here (e.g. a round-change for a
    /// round we only need to gossip).
    #[error("message ignored")]
    Ignored,

    // -- Protocol violations ------------------------------------------------
    /// A prepare or commit whose subject doesn't match the current one.
    #[error("inconsistent subjects between message and current proposal")]
    InconsistentSubjects,

    /// A pre-prepare from someone other than the view's proposer.
    #[error("pre-prepare does not come from the proposer")]
    NotFromProposer,

    /// Signature does not match the claimed sender.
    #[error("invalid message signature")]
    InvalidSignature,

    /// The signer is not a member of the current verifier set.
    #[error("message signer is not an authorized verifier")]
    AddressUnauthorized,

    /// The message is structurally invalid (unknown code, misplaced
    /// committed seal, ...).
    #[error("invalid message")]
    InvalidMessage,

    /// The frame or its payload failed to decode canonically.
    #[error("failed to decode message")]
    DecodeFailed,

    // -- Proposal & engine --------------------------------------------------
    /// The proposed block is timestamped ahead of our clock; retry after
    /// the given wait.
    #[error("proposal is from the future; retry in {0:?}")]
    FutureBlock(Duration),

    /// The server rejected the proposal for any other reason.
    #[error("proposal rejected: {0}")]
    InvalidProposal(String),

    /// The chain refused the sealed block at commit time.
    #[error("failed to commit proposal: {0}")]
    CommitFailed(String),

    /// A frame arrived before the engine was started.
    #[error("engine is stopped")]
    EngineStopped,
}

impl ConsensusError {
    /// Whether this is a routing outcome rather than a real failure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::FutureMessage | Self::OldMessage | Self::Ignored
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_ordering_is_lexicographic() {
        // Sequence dominates; round breaks ties.
        assert!(View::new(1, 5) < View::new(2, 0));
        assert!(View::new(2, 0) < View::new(2, 1));
        assert_eq!(View::new(3, 3), View::new(3, 3));

        let mut views = vec![View::new(2, 1), View::new(1, 9), View::new(2, 0)];
        views.sort();
        assert_eq!(
            views,
            vec![View::new(1, 9), View::new(2, 0), View::new(2, 1)]
        );
    }

    #[test]
    fn config_defaults() {
        let config = BftConfig::default();
        assert_eq!(config.request_timeout_ms, 10_000);
        assert_eq!(config.block_period_secs, 5);
        assert_eq!(config.proposer_policy, ProposerPolicy::RoundRobin);
        assert_eq!(config.epoch, 1024);
    }

    #[test]
    fn transient_errors_are_routing_outcomes() {
        assert!(ConsensusError::FutureMessage.is_transient());
        assert!(ConsensusError::OldMessage.is_transient());
        assert!(ConsensusError::Ignored.is_transient());
        assert!(!ConsensusError::InvalidSignature.is_transient());
        assert!(!ConsensusError::NotFromProposer.is_transient());
    }
}
