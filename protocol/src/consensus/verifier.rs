//! # Verifier Set & Proposer Selection
//!
//! The ordered set of identities authorized to sign consensus messages,
//! plus the arithmetic that picks which of them proposes a given view.
//!
//! Ordering is by address bytes and is total — every honest node holds the
//! same list in the same order, which is what makes "index modulo size" a
//! well-defined proposer. Sets are plain owned values: the core owns its
//! copy, snapshots own theirs, and nobody mutates a set somebody else is
//! reading (copy-on-write instead of a shared lock).

use serde::{Deserialize, Serialize};

use crate::crypto::keys::Address;

use super::types::ProposerPolicy;

// ---------------------------------------------------------------------------
// Verifier
// ---------------------------------------------------------------------------

/// A single authorized signing identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Verifier {
    address: Address,
}

impl Verifier {
    /// Wrap an address as a verifier.
    pub fn new(address: Address) -> Self {
        Self { address }
    }

    /// The verifier's address.
    pub fn address(&self) -> Address {
        self.address
    }
}

impl std::fmt::Display for Verifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.address)
    }
}

// ---------------------------------------------------------------------------
// VerifierSet
// ---------------------------------------------------------------------------

/// The ordered set of verifiers for a point in the chain, with the
/// currently selected proposer and the selection policy.
///
/// Invariants: addresses are unique and sorted ascending; the proposer is
/// either the first verifier (fresh set) or whatever
/// [`calc_proposer`](Self::calc_proposer) last selected.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifierSet {
    verifiers: Vec<Verifier>,
    policy: ProposerPolicy,
    proposer: Option<Verifier>,
}

impl VerifierSet {
    /// Build a set from addresses. Duplicates are collapsed, the list is
    /// sorted, and the first verifier starts as proposer.
    pub fn new(addresses: Vec<Address>, policy: ProposerPolicy) -> Self {
        let mut addresses = addresses;
        addresses.sort();
        addresses.dedup();
        let verifiers: Vec<Verifier> = addresses.into_iter().map(Verifier::new).collect();
        let proposer = verifiers.first().copied();
        Self {
            verifiers,
            policy,
            proposer,
        }
    }

    /// Number of verifiers in the set.
    pub fn size(&self) -> usize {
        self.verifiers.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.verifiers.is_empty()
    }

    /// The verifier at a given index in address order.
    pub fn get_by_index(&self, index: u64) -> Option<&Verifier> {
        self.verifiers.get(index as usize)
    }

    /// Look up a verifier and its index by address.
    pub fn get_by_address(&self, address: Address) -> Option<(usize, &Verifier)> {
        self.verifiers
            .iter()
            .enumerate()
            .find(|(_, v)| v.address() == address)
    }

    /// Whether an address is a member of the set.
    pub fn contains(&self, address: Address) -> bool {
        self.get_by_address(address).is_some()
    }

    /// The ordered verifier list.
    pub fn list(&self) -> &[Verifier] {
        &self.verifiers
    }

    /// The ordered address list.
    pub fn addresses(&self) -> Vec<Address> {
        self.verifiers.iter().map(|v| v.address()).collect()
    }

    /// The selection policy.
    pub fn policy(&self) -> ProposerPolicy {
        self.policy
    }

    /// Add a verifier, keeping the order. Returns `false` if already
    /// present.
    pub fn add_verifier(&mut self, address: Address) -> bool {
        if self.contains(address) {
            return false;
        }
        self.verifiers.push(Verifier::new(address));
        self.verifiers.sort();
        if self.proposer.is_none() {
            self.proposer = self.verifiers.first().copied();
        }
        true
    }

    /// Remove a verifier. Returns `false` if absent.
    pub fn remove_verifier(&mut self, address: Address) -> bool {
        let before = self.verifiers.len();
        self.verifiers.retain(|v| v.address() != address);
        before != self.verifiers.len()
    }

    // -- Proposer selection -------------------------------------------------

    /// The currently selected proposer.
    pub fn proposer(&self) -> Option<&Verifier> {
        self.proposer.as_ref()
    }

    /// Whether the address is the current proposer.
    pub fn is_proposer(&self, address: Address) -> bool {
        self.proposer.map_or(false, |p| p.address() == address)
    }

    /// Select and store the proposer for a round.
    ///
    /// With seed `s`: if `last_proposer` is the zero address, `s = round`;
    /// otherwise `s = index_of(last_proposer) + round`, plus one under
    /// round-robin so the slot advances every block. The proposer is
    /// `list[s % size]`.
    pub fn calc_proposer(&mut self, last_proposer: Address, round: u64) {
        self.proposer = self.select_proposer(last_proposer, round);
    }

    fn select_proposer(&self, last_proposer: Address, round: u64) -> Option<Verifier> {
        if self.verifiers.is_empty() {
            return None;
        }
        let seed = if last_proposer.is_zero() {
            round
        } else {
            let offset = self
                .get_by_address(last_proposer)
                .map(|(i, _)| i as u64)
                .unwrap_or(0);
            let advance = match self.policy {
                ProposerPolicy::RoundRobin => 1,
                ProposerPolicy::Sticky => 0,
            };
            offset + round + advance
        };
        let pick = (seed % self.verifiers.len() as u64) as usize;
        Some(self.verifiers[pick])
    }

    // -- Fault tolerance ----------------------------------------------------

    /// Maximum number of Byzantine verifiers tolerated:
    /// `F = (N - 1) / 3` (integer division).
    pub fn fault_tolerance(&self) -> usize {
        self.verifiers.len().saturating_sub(1) / 3
    }

    /// The strong quorum `2F + 1`.
    pub fn quorum(&self) -> usize {
        2 * self.fault_tolerance() + 1
    }
}
