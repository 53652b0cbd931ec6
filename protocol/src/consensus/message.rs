//! # Consensus Messages
//!
//! The typed, signed frame every consensus statement travels in. One frame
//! shape covers all four phases; the `code` says which phase, the payload
//! carries the body (a [`PrePrepare`] for pre-prepares, a [`Subject`] for
//! everything else).
//!
//! ## Canonical encoding
//!
//! Frames are bincode in both directions. Signing covers the tuple
//! `(code, payload, address, committed_seal)` — everything except the
//! signature itself. A frame whose encoding is not the canonical one
//! (trailing bytes, padded fields) is rejected outright: signature checks
//! over malleable encodings are how replay bugs are born.
//!
//! ## Committed seals
//!
//! Commit messages carry a second signature, the *committed seal*, over
//! `proposal hash ‖ commit code`. These are the per-verifier finality
//! proofs that end up aggregated in the sealed block header, so they are
//! validated here with the same rigor as the frame signature.

use serde::{Deserialize, Serialize};

use crate::crypto::hash::Hash;
use crate::crypto::keys::{recover_signer, Address};

use super::types::{ConsensusError, PrePrepare, Subject, View};

// ---------------------------------------------------------------------------
// MessageCode
// ---------------------------------------------------------------------------

/// The four message kinds of the protocol.
///
/// The numeric values are wire-visible and the commit code doubles as the
/// domain-separation byte in committed seals. Do not reorder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageCode {
    /// The proposer's opening move: the full proposal for a view.
    Preprepare = 0,
    /// "I have seen the proposal for this view."
    Prepare = 1,
    /// "I am ready to finalize this proposal" — carries a committed seal.
    Commit = 2,
    /// "This round is dead, let's move to a higher one."
    RoundChange = 3,
}

impl MessageCode {
    /// The wire byte for this code.
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// The committed-seal preimage for a proposal hash: `hash ‖ commit code`.
/// The seal itself is a recoverable signature over the Keccak-256 of this.
pub fn commit_seal_data(hash: &Hash) -> Vec<u8> {
    let mut data = Vec::with_capacity(hash.len() + 1);
    data.extend_from_slice(hash);
    data.push(MessageCode::Commit.as_u8());
    data
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A signed consensus frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Which phase this frame belongs to.
    pub code: MessageCode,
    /// The encoded body: a [`PrePrepare`] or a [`Subject`].
    pub payload: Vec<u8>,
    /// The sender's address. Verified against the recovered signer before
    /// anything trusts it.
    pub address: Address,
    /// Recoverable signature over the frame minus this field.
    pub signature: Vec<u8>,
    /// Commit messages only: the committed seal. Empty everywhere else.
    pub committed_seal: Vec<u8>,
}

impl Message {
    /// Build an unsigned frame around an already-encoded body. The sender
    /// fills in `address`, `committed_seal`, and `signature` when
    /// finalizing.
    pub fn new(code: MessageCode, payload: Vec<u8>) -> Self {
        Self {
            code,
            payload,
            address: Address::ZERO,
            signature: Vec::new(),
            committed_seal: Vec::new(),
        }
    }

    /// Encode a payload body for [`Message::new`].
    pub fn encode_body<T: Serialize>(body: &T) -> Result<Vec<u8>, ConsensusError> {
        bincode::serialize(body).map_err(|_| ConsensusError::DecodeFailed)
    }

    /// The full wire encoding of this frame.
    pub fn encode(&self) -> Result<Vec<u8>, ConsensusError> {
        bincode::serialize(self).map_err(|_| ConsensusError::DecodeFailed)
    }

    /// Decode a frame, rejecting non-canonical encodings: the bytes must
    /// re-encode to exactly the input.
    pub fn decode(bytes: &[u8]) -> Result<Self, ConsensusError> {
        let message: Message =
            bincode::deserialize(bytes).map_err(|_| ConsensusError::DecodeFailed)?;
        let canonical = bincode::serialized_size(&message)
            .map_err(|_| ConsensusError::DecodeFailed)?;
        if canonical != bytes.len() as u64 {
            return Err(ConsensusError::DecodeFailed);
        }
        Ok(message)
    }

    /// The signing preimage: this frame with the signature blanked.
    pub fn payload_for_signing(&self) -> Result<Vec<u8>, ConsensusError> {
        let mut unsigned = self.clone();
        unsigned.signature = Vec::new();
        bincode::serialize(&unsigned).map_err(|_| ConsensusError::DecodeFailed)
    }

    /// Decode the body as a [`Subject`] (prepare, commit, round change).
    pub fn decode_subject(&self) -> Result<Subject, ConsensusError> {
        bincode::deserialize(&self.payload).map_err(|_| ConsensusError::DecodeFailed)
    }

    /// Decode the body as a [`PrePrepare`].
    pub fn decode_preprepare(&self) -> Result<PrePrepare, ConsensusError> {
        bincode::deserialize(&self.payload).map_err(|_| ConsensusError::DecodeFailed)
    }

    /// The view this frame refers to, from whichever body shape it carries.
    pub fn view(&self) -> Result<View, ConsensusError> {
        match self.code {
            MessageCode::Preprepare => Ok(self.decode_preprepare()?.view),
            _ => Ok(self.decode_subject()?.view),
        }
    }

    /// Decode and fully validate an incoming frame.
    ///
    /// 1. Canonical decode.
    /// 2. Recover the signer over the signature-less encoding; it must
    ///    equal the claimed `address`, and `is_member` must accept it.
    /// 3. For commits, the committed seal must be present and recover — over
    ///    the seal preimage of the subject's digest — to the same signer.
    ///    Any other code must carry no committed seal at all.
    pub fn validate_payload(
        bytes: &[u8],
        is_member: impl Fn(Address) -> bool,
    ) -> Result<Self, ConsensusError> {
        let message = Self::decode(bytes)?;

        let unsigned = message.payload_for_signing()?;
        let signer = recover_signer(&unsigned, &message.signature)
            .map_err(|_| ConsensusError::InvalidSignature)?;
        if signer != message.address {
            return Err(ConsensusError::InvalidSignature);
        }
        if !is_member(signer) {
            return Err(ConsensusError::AddressUnauthorized);
        }

        match message.code {
            MessageCode::Commit => {
                if message.committed_seal.is_empty() {
                    return Err(ConsensusError::InvalidMessage);
                }
                let subject = message.decode_subject()?;
                let seal_signer =
                    recover_signer(&commit_seal_data(&subject.digest), &message.committed_seal)
                        .map_err(|_| ConsensusError::InvalidSignature)?;
                if seal_signer != signer {
                    return Err(ConsensusError::InvalidSignature);
                }
            }
            _ => {
                if !message.committed_seal.is_empty() {
                    return Err(ConsensusError::InvalidMessage);
                }
            }
        }

        // The signer is now established; downstream code reads
        // `message.address` instead of re-running recovery.
        Ok(message)
    }
}
