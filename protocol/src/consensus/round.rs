//! # Round Bookkeeping
//!
//! The mutable state a node keeps for the sequence it is currently trying
//! to finalize: the accepted pre-prepare, the prepare and commit tallies,
//! the locked hash, and the round-change collections used to coordinate
//! liveness recoveries.
//!
//! All of it is owned by the core's single worker task and rebuilt on every
//! `start_new_round` — no locks, no sharing, no partial resets.

use std::collections::BTreeMap;

use crate::crypto::hash::Hash;
use crate::crypto::keys::Address;
use crate::storage::Block;

use super::message::Message;
use super::types::{ConsensusError, PrePrepare, Request, Subject, View};
use super::verifier::VerifierSet;

// ---------------------------------------------------------------------------
// MessageSet
// ---------------------------------------------------------------------------

/// A per-view collection of verified messages, at most one per signer.
///
/// Bound to a verifier set: adding a message from an outsider fails, so
/// `size()` is a sound quorum counter. Iteration order is by signer
/// address, which keeps anything derived from it (committed seal order,
/// logs) deterministic.
#[derive(Clone, Debug)]
pub struct MessageSet {
    view: View,
    verifier_set: VerifierSet,
    messages: BTreeMap<Address, Message>,
}

impl MessageSet {
    /// A fresh, empty set bound to a view and a verifier set.
    pub fn new(view: View, verifier_set: VerifierSet) -> Self {
        Self {
            view,
            verifier_set,
            messages: BTreeMap::new(),
        }
    }

    /// The view this set is bound to.
    pub fn view(&self) -> View {
        self.view
    }

    /// Insert a message, keyed by signer. A later message from the same
    /// signer replaces the earlier one; the count never double-counts.
    pub fn add(&mut self, message: Message) -> Result<(), ConsensusError> {
        if !self.verifier_set.contains(message.address) {
            return Err(ConsensusError::AddressUnauthorized);
        }
        self.messages.insert(message.address, message);
        Ok(())
    }

    /// Number of distinct signers seen.
    pub fn size(&self) -> usize {
        self.messages.len()
    }

    /// The stored messages, in signer-address order.
    pub fn values(&self) -> impl Iterator<Item = &Message> {
        self.messages.values()
    }

    /// The message from a given signer, if any.
    pub fn get(&self, address: Address) -> Option<&Message> {
        self.messages.get(&address)
    }
}

// ---------------------------------------------------------------------------
// RoundState
// ---------------------------------------------------------------------------

/// Everything a node tracks for one `(sequence, round)` attempt.
///
/// `locked_hash` is only ever set after a prepared quorum, and it is the
/// one piece of state deliberately carried across round changes: a node
/// that promised to commit a block keeps that promise in later rounds.
#[derive(Clone, Debug)]
pub struct RoundState {
    sequence: u64,
    round: u64,
    preprepare: Option<PrePrepare>,
    /// Prepare messages for the current view.
    pub prepares: MessageSet,
    /// Commit messages for the current view.
    pub commits: MessageSet,
    locked_hash: Option<Hash>,
    pending_request: Option<Request>,
}

impl RoundState {
    /// Build the state for a new view. `locked_hash` and `preprepare` are
    /// carried in from the previous round when a lock exists, so a locked
    /// proposer can re-propose the exact block it locked on.
    pub fn new(
        view: View,
        verifier_set: VerifierSet,
        locked_hash: Option<Hash>,
        preprepare: Option<PrePrepare>,
        pending_request: Option<Request>,
    ) -> Self {
        Self {
            sequence: view.sequence,
            round: view.round,
            preprepare,
            prepares: MessageSet::new(view, verifier_set.clone()),
            commits: MessageSet::new(view, verifier_set),
            locked_hash,
            pending_request,
        }
    }

    /// The current view.
    pub fn view(&self) -> View {
        View::new(self.sequence, self.round)
    }

    /// The target block height.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// The attempt index within the sequence.
    pub fn round(&self) -> u64 {
        self.round
    }

    /// The accepted pre-prepare, if any.
    pub fn preprepare(&self) -> Option<&PrePrepare> {
        self.preprepare.as_ref()
    }

    /// Accept a pre-prepare for this view.
    pub fn set_preprepare(&mut self, preprepare: PrePrepare) {
        self.preprepare = Some(preprepare);
    }

    /// The proposal inside the accepted pre-prepare.
    pub fn proposal(&self) -> Option<&Block> {
        self.preprepare.as_ref().map(|p| &p.proposal)
    }

    /// The subject of the current proposal: this view plus the proposal
    /// hash. `None` until a pre-prepare is accepted.
    pub fn subject(&self) -> Option<Subject> {
        self.preprepare.as_ref().map(|p| Subject {
            view: self.view(),
            digest: p.proposal.hash(),
        })
    }

    /// Lock on the current proposal's hash. No-op without a pre-prepare.
    pub fn lock_hash(&mut self) {
        if let Some(preprepare) = &self.preprepare {
            self.locked_hash = Some(preprepare.proposal.hash());
        }
    }

    /// Release the lock (the chain refused the block).
    pub fn unlock_hash(&mut self) {
        self.locked_hash = None;
    }

    /// The locked hash, if a prepared quorum was reached this sequence.
    pub fn locked_hash(&self) -> Option<Hash> {
        self.locked_hash
    }

    /// The request parked on this round (we are proposer-in-waiting).
    pub fn pending_request(&self) -> Option<&Request> {
        self.pending_request.as_ref()
    }

    /// Park a request for when this node becomes proposer.
    pub fn set_pending_request(&mut self, request: Request) {
        self.pending_request = Some(request);
    }

    /// Distinct signers across prepares and commits. A commit implies a
    /// prepare, so a verifier that skipped straight to commit still counts
    /// toward the prepared quorum — but never twice.
    pub fn prepare_or_commit_count(&self) -> usize {
        let mut count = self.prepares.size() + self.commits.size();
        for message in self.prepares.values() {
            if self.commits.get(message.address).is_some() {
                count -= 1;
            }
        }
        count
    }
}

// ---------------------------------------------------------------------------
// RoundChangeSet
// ---------------------------------------------------------------------------

/// Round-change messages bucketed by their target round.
///
/// Two thresholds matter: `F+1` messages for some round form a weak
/// certificate (someone honest wants that round — worth catching up to),
/// and `2F+1` form a strong certificate (start the round now).
#[derive(Clone, Debug)]
pub struct RoundChangeSet {
    verifier_set: VerifierSet,
    round_changes: BTreeMap<u64, MessageSet>,
}

impl RoundChangeSet {
    /// An empty set bound to the current verifier set.
    pub fn new(verifier_set: VerifierSet) -> Self {
        Self {
            verifier_set,
            round_changes: BTreeMap::new(),
        }
    }

    /// Store a round-change message under its target round. Returns the
    /// number of distinct signers now at that round.
    pub fn add(&mut self, round: u64, message: Message) -> Result<usize, ConsensusError> {
        let set = self
            .round_changes
            .entry(round)
            .or_insert_with(|| MessageSet::new(View::new(0, round), self.verifier_set.clone()));
        set.add(message)?;
        Ok(set.size())
    }

    /// Drop buckets for rounds below `round`, plus any empty ones.
    pub fn clear(&mut self, round: u64) {
        self.round_changes
            .retain(|&r, set| r >= round && set.size() > 0);
    }

    /// The highest round backed by at least `threshold` distinct signers.
    pub fn max_round(&self, threshold: usize) -> Option<u64> {
        self.round_changes
            .iter()
            .filter(|(_, set)| set.size() >= threshold)
            .map(|(&round, _)| round)
            .max()
    }

    /// Number of signers currently at the given round.
    pub fn size_at(&self, round: u64) -> usize {
        self.round_changes.get(&round).map_or(0, |s| s.size())
    }
}
