//! # Cryptographic Primitives
//!
//! Everything the consensus engine needs from cryptography, and nothing
//! else: Keccak-256 digests, recoverable secp256k1 signatures, and the
//! 20-byte addresses derived from public keys.
//!
//! Signer **recovery** is the load-bearing feature here. Consensus messages
//! and header seals do not ship public keys — the verifier identity is
//! recovered from the signature itself and checked against the authorized
//! set. That rules out Ed25519 and friends; this module is secp256k1 or
//! nothing.

pub mod hash;
pub mod keys;

pub use hash::{content_hash, keccak256, keccak256_multi, merkle_root, Hash, ZERO_HASH};
pub use keys::{recover_signer, Address, BasaltKeypair, KeyError};
