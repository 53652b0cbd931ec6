//! # Protocol Configuration & Constants
//!
//! Every magic number in BASALT lives here. If you're hardcoding a constant
//! somewhere else, you're doing it wrong and you owe the team coffee.
//!
//! Most of these values are consensus-critical: two nodes that disagree on
//! a witness tag or a seal length will never agree on anything else either.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Wire Protocol
// ---------------------------------------------------------------------------

/// The single peer-to-peer opcode carrying an encoded consensus [`Message`].
///
/// Everything the engine says on the wire — pre-prepares, prepares, commits,
/// round changes — travels under this one code. Non-canonical encodings are
/// rejected at decode time.
///
/// [`Message`]: crate::consensus::Message
pub const BFT_MSG_CODE: u16 = 0x12;

// ---------------------------------------------------------------------------
// Header Seal Format
// ---------------------------------------------------------------------------

/// Fixed vanity prefix length (bytes) at the front of `extra_data` and
/// `second_witness`. Free space for proposers to stamp whatever they like;
/// the seal payload starts right after it.
pub const EXTRA_VANITY: usize = 32;

/// Length of a single seal: a recoverable secp256k1 signature,
/// `r ‖ s ‖ v` = 64 + 1 bytes.
pub const SEAL_LENGTH: usize = 65;

/// Size of the `witness` header field carrying the vote direction tag.
pub const WITNESS_SIZE: usize = 8;

/// Witness tag cast by a verifier voting to authorize the header's
/// `creator` as a new verifier.
pub const WITNESS_AUTH_VOTE: [u8; WITNESS_SIZE] = [0xff; WITNESS_SIZE];

/// Witness tag cast by a verifier voting to drop the header's `creator`
/// from the verifier set.
pub const WITNESS_DROP_VOTE: [u8; WITNESS_SIZE] = [0x00; WITNESS_SIZE];

// ---------------------------------------------------------------------------
// Consensus Timing
// ---------------------------------------------------------------------------

/// Default round timeout in milliseconds. If a round has not committed
/// within this window (plus the exponential round backoff), the node
/// broadcasts a round change.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Default minimum spacing between consecutive block timestamps, in seconds.
pub const DEFAULT_BLOCK_PERIOD_SECS: u64 = 5;

/// Default number of blocks between vote-log checkpoints. At every multiple
/// of this height the pending votes and tally are cleared.
pub const DEFAULT_EPOCH: u64 = 1024;

/// Upper bound on the exponential round-change backoff. `2^round` seconds
/// grows fast; past this cap a struggling network gains nothing from
/// waiting longer.
pub const MAX_ROUND_BACKOFF: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// Engine Cache Capacities
// ---------------------------------------------------------------------------

/// Number of recent verifier-set snapshots kept in memory.
pub const INMEMORY_SNAPSHOTS: usize = 128;

/// Number of recently seen message hashes kept per dedup cache.
pub const INMEMORY_MESSAGES: usize = 1024;

/// Number of peers tracked in the per-peer recent-message cache.
pub const INMEMORY_PEERS: usize = 40;

// ---------------------------------------------------------------------------
// Persistence Keys
// ---------------------------------------------------------------------------

/// Key prefix for persisted snapshots: the stored key is this prefix
/// followed by the 32-byte block hash the snapshot was taken at.
pub const SNAPSHOT_KEY_PREFIX: &[u8] = b"bft-snapshot";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn witness_tags_are_distinct() {
        // A header whose witness matches neither tag is an invalid vote,
        // so the two tags must never collide.
        assert_ne!(WITNESS_AUTH_VOTE, WITNESS_DROP_VOTE);
        assert_eq!(WITNESS_AUTH_VOTE.len(), WITNESS_SIZE);
        assert_eq!(WITNESS_DROP_VOTE.len(), WITNESS_SIZE);
    }

    #[test]
    fn seal_length_matches_recoverable_signature() {
        // r (32) + s (32) + recovery id (1).
        assert_eq!(SEAL_LENGTH, 65);
    }
}
