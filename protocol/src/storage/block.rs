//! # Block Structure & Seal Format
//!
//! A block is the atomic unit of consensus. The header carries, besides the
//! usual chain linkage, three BFT-specific fields:
//!
//! - `witness` — an 8-byte vote tag. All-ones votes to authorize the
//!   header's `creator` as a verifier, all-zeros votes to drop them.
//! - `extra_data` — `[32-byte vanity] ‖ encode(BftExtra)`, written in two
//!   stages: the proposer writes the verifier list and its own seal before
//!   consensus; the committed seals collected from the commit quorum are
//!   appended when the block is finalized.
//! - `second_witness` — `[32-byte vanity] ‖ encode(SecondWitness)` carrying
//!   challenged transactions and deposit/exit verifier lists.
//!
//! ## Hash discipline
//!
//! Three digests of one header, and the distinction matters:
//!
//! - [`BlockHeader::seal_hash`] — seal and committed seals stripped. This
//!   is what the proposer signs and what the signer is recovered against.
//! - [`BlockHeader::hash`] — committed seals stripped, proposer seal kept.
//!   This is the block identity: it must not change when the commit quorum
//!   writes its seals, or every node would disagree about what it agreed on.
//! - The wire form hashes nothing implicitly; both digests recompute from
//!   the canonical encoding.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{EXTRA_VANITY, SEAL_LENGTH, WITNESS_SIZE};
use crate::crypto::hash::{keccak256, merkle_root, Hash, ZERO_HASH};
use crate::crypto::keys::{recover_signer, Address, KeyError};

/// Vanity bytes stamped into the genesis block's extra data — the
/// protocol's birth certificate. Exactly [`EXTRA_VANITY`] bytes.
pub const GENESIS_VANITY: &[u8; EXTRA_VANITY] = b"BASALT/2026 genesis  ### ### ###";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while reading or writing the header seal fields.
#[derive(Debug, Error)]
pub enum BlockError {
    /// `extra_data` is shorter than the mandatory vanity prefix.
    #[error("header extra data is shorter than the {EXTRA_VANITY}-byte vanity prefix")]
    MissingVanity,

    /// The bytes after the vanity prefix did not decode as a seal container.
    #[error("failed to decode the header seal container")]
    MalformedExtra,

    /// `write_committed_seals` was handed an empty seal list.
    #[error("committed seal list is empty")]
    EmptyCommittedSeals,

    /// A committed seal has the wrong length.
    #[error("committed seal is not {SEAL_LENGTH} bytes")]
    InvalidCommittedSeal,

    /// The bytes after the vanity prefix did not decode as a second witness.
    #[error("failed to decode the header second witness")]
    MalformedSecondWitness,

    /// The header seal did not yield a signer.
    #[error("failed to recover the header signer: {0}")]
    SignerRecovery(#[from] KeyError),
}

// ---------------------------------------------------------------------------
// BftExtra
// ---------------------------------------------------------------------------

/// The seal container stored in `extra_data` after the vanity prefix.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BftExtra {
    /// The verifier set this header declares (meaningful on genesis and
    /// checkpoint headers; informational elsewhere).
    pub verifiers: Vec<Address>,
    /// The proposer's seal over [`BlockHeader::seal_hash`]. Empty until the
    /// proposer signs.
    pub seal: Vec<u8>,
    /// One seal per committing verifier, each over
    /// `proposal hash ‖ commit code`. Empty until finalization.
    pub committed_seals: Vec<Vec<u8>>,
}

impl BftExtra {
    /// Decode the seal container out of a header's `extra_data`.
    pub fn extract(header: &BlockHeader) -> Result<Self, BlockError> {
        if header.extra_data.len() < EXTRA_VANITY {
            return Err(BlockError::MissingVanity);
        }
        bincode::deserialize(&header.extra_data[EXTRA_VANITY..])
            .map_err(|_| BlockError::MalformedExtra)
    }

    /// Encode this container behind the given vanity prefix. The vanity is
    /// padded or truncated to exactly [`EXTRA_VANITY`] bytes.
    pub fn encode(&self, vanity: &[u8]) -> Vec<u8> {
        let mut out = vanity.to_vec();
        out.resize(EXTRA_VANITY, 0x00);
        let body = bincode::serialize(self).unwrap_or_default();
        out.extend_from_slice(&body);
        out
    }
}

// ---------------------------------------------------------------------------
// SecondWitness
// ---------------------------------------------------------------------------

/// The auxiliary witness stored in `second_witness` after its vanity
/// prefix: transactions challenged in this block and the verifiers entering
/// or leaving via deposit and exit transactions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondWitness {
    /// Hashes of transactions challenged in this block.
    pub challenged_txs: Vec<Hash>,
    /// Verifiers joining through deposit transactions.
    pub deposit_verifiers: Vec<Address>,
    /// Verifiers leaving through exit transactions.
    pub exit_verifiers: Vec<Address>,
}

impl SecondWitness {
    /// Decode the second witness out of a header.
    pub fn extract(header: &BlockHeader) -> Result<Self, BlockError> {
        if header.second_witness.len() < EXTRA_VANITY {
            return Err(BlockError::MissingVanity);
        }
        bincode::deserialize(&header.second_witness[EXTRA_VANITY..])
            .map_err(|_| BlockError::MalformedSecondWitness)
    }

    /// Encode this witness behind a vanity prefix, padded to
    /// [`EXTRA_VANITY`] bytes.
    pub fn encode(&self, vanity: &[u8]) -> Vec<u8> {
        let mut out = vanity.to_vec();
        out.resize(EXTRA_VANITY, 0x00);
        let body = bincode::serialize(self).unwrap_or_default();
        out.extend_from_slice(&body);
        out
    }
}

// ---------------------------------------------------------------------------
// BlockHeader
// ---------------------------------------------------------------------------

/// A block header with the BFT seal fields.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block height (genesis = 0).
    pub height: u64,
    /// Hash of the parent block. All zeros for genesis.
    pub parent_hash: Hash,
    /// Address of the block creator. Under the vote log this is also the
    /// candidate being voted on by the `witness` tag.
    pub creator: Address,
    /// Unix timestamp in seconds.
    pub timestamp: u64,
    /// Merkle root over the transaction payload hashes.
    pub tx_root: Hash,
    /// State root after applying this block.
    pub state_root: Hash,
    /// 8-byte vote direction tag; see [`crate::config::WITNESS_AUTH_VOTE`].
    pub witness: [u8; WITNESS_SIZE],
    /// `[vanity] ‖ encode(BftExtra)`.
    pub extra_data: Vec<u8>,
    /// `[vanity] ‖ encode(SecondWitness)`.
    pub second_witness: Vec<u8>,
}

impl BlockHeader {
    /// The block identity hash: Keccak-256 over the canonical encoding with
    /// the committed seals stripped. Stable across
    /// [`write_committed_seals`](Self::write_committed_seals), so the hash
    /// agreed on during consensus is the hash of the finalized block.
    pub fn hash(&self) -> Hash {
        let stripped = self.without_seals(true);
        keccak256(&bincode::serialize(&stripped).unwrap_or_default())
    }

    /// The signing digest: Keccak-256 over the canonical encoding with both
    /// the proposer seal and the committed seals stripped. This is what the
    /// creator signs and what [`Self::recover_creator`] verifies against.
    pub fn seal_hash(&self) -> Hash {
        let stripped = self.without_seals(false);
        keccak256(&bincode::serialize(&stripped).unwrap_or_default())
    }

    /// Copy of the header with committed seals removed, and optionally the
    /// proposer seal kept. Headers whose extra data does not parse are
    /// hashed as-is — their identity is still well defined.
    fn without_seals(&self, keep_seal: bool) -> BlockHeader {
        let mut header = self.clone();
        if let Ok(mut extra) = BftExtra::extract(&header) {
            extra.committed_seals = Vec::new();
            if !keep_seal {
                extra.seal = Vec::new();
            }
            let vanity = &self.extra_data[..EXTRA_VANITY];
            header.extra_data = extra.encode(vanity);
        }
        header
    }

    /// Initialize `extra_data` with a vanity prefix and an unsealed
    /// container declaring the given verifiers. Called by the block
    /// assembler before sealing.
    pub fn prepare_extra(&mut self, vanity: &[u8], verifiers: Vec<Address>) {
        let extra = BftExtra {
            verifiers,
            seal: Vec::new(),
            committed_seals: Vec::new(),
        };
        self.extra_data = extra.encode(vanity);
    }

    /// Write the proposer's seal into the container. Stage one of the
    /// two-stage sealing.
    pub fn write_seal(&mut self, seal: Vec<u8>) -> Result<(), BlockError> {
        let mut extra = BftExtra::extract(self)?;
        extra.seal = seal;
        let vanity = self.extra_data[..EXTRA_VANITY].to_vec();
        self.extra_data = extra.encode(&vanity);
        Ok(())
    }

    /// Write the committed seals collected from the commit quorum. Stage
    /// two of the two-stage sealing. Replaces any committed seals already
    /// present, so writing the same set twice is a no-op.
    pub fn write_committed_seals(&mut self, seals: &[Vec<u8>]) -> Result<(), BlockError> {
        if seals.is_empty() {
            return Err(BlockError::EmptyCommittedSeals);
        }
        if seals.iter().any(|s| s.len() != SEAL_LENGTH) {
            return Err(BlockError::InvalidCommittedSeal);
        }
        let mut extra = BftExtra::extract(self)?;
        extra.committed_seals = seals.to_vec();
        let vanity = self.extra_data[..EXTRA_VANITY].to_vec();
        self.extra_data = extra.encode(&vanity);
        Ok(())
    }

    /// Recover the address that sealed this header from the proposer seal
    /// in `extra_data`.
    pub fn recover_creator(&self) -> Result<Address, BlockError> {
        let extra = BftExtra::extract(self)?;
        let signer = recover_signer(&self.seal_hash(), &extra.seal)?;
        Ok(signer)
    }
}

// ---------------------------------------------------------------------------
// Block
// ---------------------------------------------------------------------------

/// A full block: header plus the ordered, opaque transaction payloads.
///
/// Transaction semantics live outside the consensus engine; all the engine
/// cares about is that the payloads are fixed by `tx_root` and that the
/// block exposes a height and a stable hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Block metadata, chain linkage, and seals.
    pub header: BlockHeader,
    /// Ordered transaction payloads, opaque to consensus.
    pub transactions: Vec<Vec<u8>>,
}

impl Block {
    /// The height this block sits at.
    pub fn height(&self) -> u64 {
        self.header.height
    }

    /// The block identity hash (committed seals excluded).
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    /// Construct the genesis block for the given initial verifier set.
    ///
    /// Height 0, zero parent, no transactions, unsigned. The verifier list
    /// in the extra container is where every snapshot chain starts.
    pub fn genesis(verifiers: Vec<Address>) -> Self {
        let mut header = BlockHeader {
            height: 0,
            parent_hash: ZERO_HASH,
            creator: Address::ZERO,
            timestamp: 0,
            tx_root: ZERO_HASH,
            state_root: ZERO_HASH,
            witness: [0u8; WITNESS_SIZE],
            extra_data: Vec::new(),
            second_witness: SecondWitness::default().encode(&[]),
        };
        header.prepare_extra(GENESIS_VANITY, verifiers);
        Block {
            header,
            transactions: Vec::new(),
        }
    }

    /// Construct an unsealed block extending `parent`.
    ///
    /// The tx root is computed over the payload hashes; the extra container
    /// is initialized with the given verifier list and no seals. The caller
    /// signs afterwards via [`BlockHeader::write_seal`].
    pub fn new(
        parent: &BlockHeader,
        transactions: Vec<Vec<u8>>,
        creator: Address,
        verifiers: Vec<Address>,
        timestamp: u64,
    ) -> Self {
        let tx_root = compute_tx_root(&transactions);
        let mut header = BlockHeader {
            height: parent.height + 1,
            parent_hash: parent.hash(),
            creator,
            timestamp,
            tx_root,
            state_root: ZERO_HASH,
            witness: [0u8; WITNESS_SIZE],
            extra_data: Vec::new(),
            second_witness: SecondWitness::default().encode(&[]),
        };
        header.prepare_extra(&[], verifiers);
        Block {
            header,
            transactions,
        }
    }
}

/// Merkle root over the Keccak-256 hashes of each transaction payload.
pub fn compute_tx_root(transactions: &[Vec<u8>]) -> Hash {
    let leaves: Vec<Hash> = transactions.iter().map(|tx| keccak256(tx)).collect();
    merkle_root(&leaves)
}
