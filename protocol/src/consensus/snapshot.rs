//! # Snapshot & Vote Log
//!
//! The verifier set is not static: sitting verifiers vote — one vote per
//! block header they seal — to authorize new members or drop existing
//! ones. A [`Snapshot`] is the state of that voting at a specific block:
//! the authorized set, the votes still pending, and a running tally.
//!
//! ## Voting rules
//!
//! - The header's `creator` field names the candidate; the 8-byte
//!   `witness` tag says which way the vote goes. An unknown tag is a
//!   consensus error, not a no-op.
//! - One live vote per (signer, candidate): re-voting replaces the
//!   earlier vote.
//! - A candidate passes at a strict majority (`votes > N/2`). The change
//!   applies immediately and every vote involving the candidate — cast by
//!   them or about them — is scrubbed.
//! - At every epoch boundary the pending votes and tally reset. Anything
//!   that hadn't passed starts over.
//!
//! Snapshots are immutable once taken; [`Snapshot::apply_headers`]
//! returns a new one. Persistence is JSON under `"bft-snapshot" ‖ hash`,
//! with the verifier list stored sorted.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{WITNESS_AUTH_VOTE, WITNESS_DROP_VOTE};
use crate::crypto::hash::Hash;
use crate::crypto::keys::Address;
use crate::storage::db::{BasaltDB, DbError};
use crate::storage::block::BlockHeader;

use super::types::ProposerPolicy;
use super::verifier::VerifierSet;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while applying voting headers. Any of these aborts the
/// whole batch — the caller retries from an earlier checkpoint.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The header batch is not strictly consecutive from the snapshot.
    #[error("headers do not form a consecutive voting chain")]
    InvalidVotingChain,

    /// A voting header was sealed by a non-verifier.
    #[error("vote signer is not an authorized verifier")]
    Unauthorized,

    /// The witness tag is neither the authorize nor the drop pattern.
    #[error("unknown witness tag on voting header")]
    InvalidVote,

    /// The header seal did not yield a signer.
    #[error("failed to recover the voting header's signer")]
    SignerRecovery,

    /// Snapshot persistence failed. The one fatal class in the engine.
    #[error(transparent)]
    Db(#[from] DbError),

    /// A stored snapshot blob did not parse.
    #[error("failed to decode stored snapshot: {0}")]
    Decode(String),
}

// ---------------------------------------------------------------------------
// Vote & Tally
// ---------------------------------------------------------------------------

/// A single authorization vote cast by a sitting verifier.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    /// The verifier that cast the vote.
    pub verifier: Address,
    /// Height of the header carrying the vote.
    pub block: u64,
    /// The candidate being voted on.
    pub address: Address,
    /// `true` to authorize the candidate, `false` to drop them.
    pub authorize: bool,
}

/// Running score for one candidate. Contradictory votes never share a
/// tally: a vote only counts if it is meaningful for the candidate's
/// current membership, so all counted votes agree on direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    /// The direction every counted vote shares.
    pub authorize: bool,
    /// Number of votes so far.
    pub votes: u32,
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// The authorization-voting state at a specific block.
#[derive(Clone, Debug)]
pub struct Snapshot {
    /// Blocks between checkpoints (vote resets).
    pub epoch: u64,
    /// Height the snapshot was taken at.
    pub height: u64,
    /// Hash of the block the snapshot was taken at.
    pub hash: Hash,
    /// Pending votes, in the order they were cast.
    pub votes: Vec<Vote>,
    /// Per-candidate score, kept in sync with `votes`.
    pub tally: HashMap<Address, Tally>,
    /// The authorized verifier set at this block.
    pub verifier_set: VerifierSet,
}

impl Snapshot {
    /// A fresh snapshot with no pending votes. Only ever correct for a
    /// checkpoint or the genesis block.
    pub fn new(epoch: u64, height: u64, hash: Hash, verifier_set: VerifierSet) -> Self {
        Self {
            epoch,
            height,
            hash,
            votes: Vec::new(),
            tally: HashMap::new(),
            verifier_set,
        }
    }

    // -- Persistence --------------------------------------------------------

    /// Persist this snapshot as JSON under its block hash.
    pub fn store(&self, db: &BasaltDB) -> Result<(), SnapshotError> {
        let blob = serde_json::to_vec(&SnapshotJson::from(self))
            .map_err(|e| SnapshotError::Decode(e.to_string()))?;
        db.put_snapshot(&self.hash, &blob)?;
        Ok(())
    }

    /// Load the snapshot stored for a block hash, if any. The epoch is not
    /// persisted authoritatively; the caller's configured value wins.
    pub fn load(db: &BasaltDB, epoch: u64, hash: &Hash) -> Result<Option<Self>, SnapshotError> {
        let Some(blob) = db.snapshot(hash)? else {
            return Ok(None);
        };
        let json: SnapshotJson = serde_json::from_slice(&blob)
            .map_err(|e| SnapshotError::Decode(e.to_string()))?;
        let mut snapshot = Snapshot::from(json);
        snapshot.epoch = epoch;
        Ok(Some(snapshot))
    }

    // -- Voting -------------------------------------------------------------

    /// Whether a vote would be meaningful: authorizing a non-member or
    /// dropping a member. Everything else is a wasted ballot.
    fn check_vote(&self, address: Address, authorize: bool) -> bool {
        let member = self.verifier_set.contains(address);
        (member && !authorize) || (!member && authorize)
    }

    /// Count a vote into the tally. Returns `false` for meaningless votes.
    fn cast(&mut self, address: Address, authorize: bool) -> bool {
        if !self.check_vote(address, authorize) {
            return false;
        }
        self.tally
            .entry(address)
            .and_modify(|t| t.votes += 1)
            .or_insert(Tally {
                authorize,
                votes: 1,
            });
        true
    }

    /// Remove a previously counted vote from the tally.
    fn uncast(&mut self, address: Address, authorize: bool) -> bool {
        let Some(tally) = self.tally.get_mut(&address) else {
            // Dangling vote, nothing to revert.
            return false;
        };
        if tally.authorize != authorize {
            return false;
        }
        if tally.votes > 1 {
            tally.votes -= 1;
        } else {
            self.tally.remove(&address);
        }
        true
    }

    /// Apply a strictly consecutive batch of headers, producing the
    /// snapshot at the last of them. `self` is untouched; any error
    /// abandons the batch entirely.
    pub fn apply_headers(&self, headers: &[BlockHeader]) -> Result<Snapshot, SnapshotError> {
        if headers.is_empty() {
            return Ok(self.clone());
        }
        if headers[0].height != self.height + 1 {
            return Err(SnapshotError::InvalidVotingChain);
        }
        for pair in headers.windows(2) {
            if pair[1].height != pair[0].height + 1 {
                return Err(SnapshotError::InvalidVotingChain);
            }
        }

        let mut snap = self.clone();
        for header in headers {
            // Checkpoint: pending votes do not survive an epoch boundary.
            if header.height % snap.epoch == 0 {
                snap.votes.clear();
                snap.tally.clear();
            }

            let signer = header
                .recover_creator()
                .map_err(|_| SnapshotError::SignerRecovery)?;
            if !snap.verifier_set.contains(signer) {
                return Err(SnapshotError::Unauthorized);
            }

            // One live vote per (signer, candidate): uncast any earlier one.
            if let Some(position) = snap
                .votes
                .iter()
                .position(|v| v.verifier == signer && v.address == header.creator)
            {
                let previous = snap.votes.remove(position);
                snap.uncast(previous.address, previous.authorize);
            }

            let authorize = if header.witness == WITNESS_AUTH_VOTE {
                true
            } else if header.witness == WITNESS_DROP_VOTE {
                false
            } else {
                return Err(SnapshotError::InvalidVote);
            };

            if snap.cast(header.creator, authorize) {
                snap.votes.push(Vote {
                    verifier: signer,
                    block: header.height,
                    address: header.creator,
                    authorize,
                });
            }

            // A strict majority applies the change immediately.
            let passed = snap
                .tally
                .get(&header.creator)
                .map_or(false, |t| t.votes as usize > snap.verifier_set.size() / 2);
            if passed {
                let authorize = snap
                    .tally
                    .get(&header.creator)
                    .map_or(false, |t| t.authorize);
                if authorize {
                    snap.verifier_set.add_verifier(header.creator);
                } else {
                    snap.verifier_set.remove_verifier(header.creator);

                    // The dropped verifier's own pending votes die with
                    // their seat.
                    let mut index = 0;
                    while index < snap.votes.len() {
                        if snap.votes[index].verifier == header.creator {
                            let vote = snap.votes.remove(index);
                            snap.uncast(vote.address, vote.authorize);
                        } else {
                            index += 1;
                        }
                    }
                }

                // Either way, the candidate's slate is wiped clean.
                snap.votes.retain(|v| v.address != header.creator);
                snap.tally.remove(&header.creator);
            }
        }

        snap.height += headers.len() as u64;
        snap.hash = headers[headers.len() - 1].hash();
        Ok(snap)
    }

    /// The authorized addresses, ascending.
    pub fn verifiers(&self) -> Vec<Address> {
        self.verifier_set.addresses()
    }
}

impl PartialEq for Snapshot {
    /// Snapshots compare by voting content. The verifier set's transient
    /// proposer slot is bookkeeping for the core, not part of the
    /// authorization state, and is deliberately excluded.
    fn eq(&self, other: &Self) -> bool {
        self.epoch == other.epoch
            && self.height == other.height
            && self.hash == other.hash
            && self.votes == other.votes
            && self.tally == other.tally
            && self.verifier_set.addresses() == other.verifier_set.addresses()
            && self.verifier_set.policy() == other.verifier_set.policy()
    }
}

// ---------------------------------------------------------------------------
// JSON form
// ---------------------------------------------------------------------------

/// The persisted shape: verifiers flattened to a sorted address list plus
/// the policy, the hash hex-encoded.
#[derive(Serialize, Deserialize)]
struct SnapshotJson {
    epoch: u64,
    number: u64,
    hash: String,
    votes: Vec<Vote>,
    tally: HashMap<Address, Tally>,
    verifiers: Vec<Address>,
    policy: ProposerPolicy,
}

impl From<&Snapshot> for SnapshotJson {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            epoch: snapshot.epoch,
            number: snapshot.height,
            hash: hex::encode(snapshot.hash),
            votes: snapshot.votes.clone(),
            tally: snapshot.tally.clone(),
            verifiers: snapshot.verifier_set.addresses(),
            policy: snapshot.verifier_set.policy(),
        }
    }
}

impl From<SnapshotJson> for Snapshot {
    fn from(json: SnapshotJson) -> Self {
        let mut hash = [0u8; 32];
        if let Ok(bytes) = hex::decode(&json.hash) {
            if bytes.len() == 32 {
                hash.copy_from_slice(&bytes);
            }
        }
        Self {
            epoch: json.epoch,
            height: json.number,
            hash,
            votes: json.votes,
            tally: json.tally,
            verifier_set: VerifierSet::new(json.verifiers, json.policy),
        }
    }
}
