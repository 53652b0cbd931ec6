//! # Hashing Utilities
//!
//! Two hash functions, two jobs, no exceptions:
//!
//! - **Keccak-256** — The consensus digest. Message signing, header hashes,
//!   committed seals, transaction roots: if two nodes must agree on it, it
//!   goes through Keccak. (Keccak, not NIST SHA-3 — the padding differs and
//!   the addresses derived from public keys care.)
//!
//! - **BLAKE3** — Local bookkeeping only. The gossip dedup caches hash
//!   payloads thousands of times per second and never put the result on the
//!   wire, so they get the fast hash.
//!
//! Mixing the two up is not a style problem, it is a consensus failure.

use sha3::{Digest, Keccak256};

/// A 32-byte digest. Used for block hashes, message digests, and every
/// other place the protocol needs a fixed-size fingerprint.
pub type Hash = [u8; 32];

/// The all-zero hash. Doubles as "no digest" in round-change subjects and
/// as the unlocked state of a round.
pub const ZERO_HASH: Hash = [0u8; 32];

/// Compute the Keccak-256 hash of the input data.
pub fn keccak256(data: &[u8]) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute Keccak-256 over multiple byte slices without concatenation
/// overhead. Feeding parts sequentially into the hasher gives the same
/// result as hashing their concatenation.
pub fn keccak256_multi(parts: &[&[u8]]) -> Hash {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Compute the BLAKE3 content hash of a payload.
///
/// This is the dedup-cache fingerprint for gossip suppression. It never
/// appears on the wire or in a block — use [`keccak256`] for anything
/// consensus-visible.
pub fn content_hash(data: &[u8]) -> Hash {
    *blake3::hash(data).as_bytes()
}

/// Compute a binary Merkle root over a list of leaf hashes with Keccak-256.
///
/// If the number of nodes at a level is odd, the last node is paired with
/// itself. A single leaf is likewise hashed against itself so the root is
/// always the output of a hash operation, never a raw leaf. An empty input
/// returns the all-zero sentinel.
pub fn merkle_root(leaves: &[Hash]) -> Hash {
    if leaves.is_empty() {
        return ZERO_HASH;
    }

    let mut current_level: Vec<Hash> = leaves.to_vec();

    if current_level.len() == 1 {
        return keccak256_multi(&[&current_level[0], &current_level[0]]);
    }

    while current_level.len() > 1 {
        let mut next_level = Vec::with_capacity((current_level.len() + 1) / 2);

        for chunk in current_level.chunks(2) {
            let left = &chunk[0];
            let right = if chunk.len() == 2 { &chunk[1] } else { &chunk[0] };
            next_level.push(keccak256_multi(&[left, right]));
        }

        current_level = next_level;
    }

    current_level[0]
}
