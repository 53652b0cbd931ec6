//! # Engine Server
//!
//! The adapter between the single-threaded core and everything that is
//! not single-threaded: the node key, the peer-to-peer broadcaster, the
//! chain store, and the block assembler.
//!
//! The core never touches any of this directly — it sees the [`ServerOps`]
//! trait and an event channel, nothing more. In the other direction, the
//! server is the multi-threaded surface of the engine: inbound frames
//! arrive from many peer tasks at once, so the decode/dedup/post path runs
//! under its own mutex, and the seal handshake with the assembler under
//! another.
//!
//! ## Message suppression
//!
//! Two bounded caches keep gossip storms down: `known_messages` (have we
//! seen this payload at all?) and a per-peer `recent_messages` (does this
//! peer already have it?). Inbound duplicates are acknowledged and
//! dropped; outbound gossip skips peers that are known to hold the
//! payload.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::{BFT_MSG_CODE, INMEMORY_MESSAGES, INMEMORY_PEERS, INMEMORY_SNAPSHOTS};
use crate::crypto::hash::{content_hash, Hash};
use crate::crypto::keys::{Address, BasaltKeypair};
use crate::storage::block::{compute_tx_root, BftExtra, Block, BlockHeader};
use crate::storage::chain::{Chain, ChainReader};

use super::snapshot::{Snapshot, SnapshotError};
use super::types::{BftConfig, ConsensusError, ConsensusEvent};
use super::verifier::VerifierSet;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// What the core needs from its server. [`EngineServer`] is the real
/// implementation; tests drive the state machine against fakes.
pub trait ServerOps: Send + Sync {
    /// This node's verifier address.
    fn address(&self) -> Address;

    /// Sign `keccak256(data)` with the node key (65-byte recoverable form).
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, ConsensusError>;

    /// Deliver a payload to every verifier, ourselves included — our own
    /// copy is posted straight onto the event channel.
    fn broadcast(&self, verifier_set: &VerifierSet, payload: Bytes)
        -> Result<(), ConsensusError>;

    /// Deliver a payload to every verifier except ourselves, respecting
    /// the suppression caches.
    fn gossip(&self, verifier_set: &VerifierSet, payload: Bytes) -> Result<(), ConsensusError>;

    /// Take an agreed proposal, write its committed seals, and hand it to
    /// the chain (via the waiting assembler if we proposed it).
    fn commit(&self, proposal: &Block, seals: Vec<Vec<u8>>) -> Result<(), ConsensusError>;

    /// Check a proposed block against the chain. A block dated ahead of
    /// our clock returns [`ConsensusError::FutureBlock`] with the wait.
    fn verify(&self, proposal: &Block) -> Result<(), ConsensusError>;

    /// The latest committed block and the address that sealed it.
    fn last_proposal(&self) -> (Block, Address);

    /// The verifier set as of the given proposal.
    fn verifiers(&self, proposal: &Block) -> VerifierSet;

    /// Whether the chain has flagged this hash as a bad block.
    fn has_bad_proposal(&self, hash: &Hash) -> bool;
}

/// A connected peer's send queue. `send` enqueues and returns — the
/// server never blocks on a slow peer.
pub trait Peer: Send + Sync {
    /// Enqueue a frame to this peer.
    fn send(&self, code: u16, payload: Bytes);
}

/// The node's view of the peer table.
pub trait Broadcaster: Send + Sync {
    /// Resolve addresses to currently connected peers.
    fn find_peers(&self, targets: &[Address]) -> HashMap<Address, Arc<dyn Peer>>;
}

// ---------------------------------------------------------------------------
// Dedup cache
// ---------------------------------------------------------------------------

/// A bounded seen-set over content hashes. Entries carry an insertion
/// counter; when the set overflows its capacity, the oldest entries are
/// evicted down to 75%.
struct DedupCache {
    entries: DashMap<Hash, u64>,
    counter: AtomicU64,
    capacity: usize,
}

impl DedupCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            counter: AtomicU64::new(0),
            capacity,
        }
    }

    fn contains(&self, hash: &Hash) -> bool {
        self.entries.contains_key(hash)
    }

    /// Mark a hash as seen. Returns `false` if it was already present.
    fn insert(&self, hash: Hash) -> bool {
        let stamp = self.counter.fetch_add(1, Ordering::Relaxed);
        let fresh = self.entries.insert(hash, stamp).is_none();
        if fresh && self.entries.len() > self.capacity {
            self.evict_oldest();
        }
        fresh
    }

    fn evict_oldest(&self) {
        let target = self.capacity * 3 / 4;
        let mut stamped: Vec<(Hash, u64)> = self
            .entries
            .iter()
            .map(|e| (*e.key(), *e.value()))
            .collect();
        stamped.sort_by_key(|(_, stamp)| *stamp);
        let excess = stamped.len().saturating_sub(target);
        for (hash, _) in stamped.into_iter().take(excess) {
            self.entries.remove(&hash);
        }
    }
}

// ---------------------------------------------------------------------------
// EngineServer
// ---------------------------------------------------------------------------

/// The production [`ServerOps`] implementation.
pub struct EngineServer {
    config: BftConfig,
    keypair: BasaltKeypair,
    address: Address,
    chain: Arc<Chain>,
    events_tx: mpsc::UnboundedSender<ConsensusEvent>,
    broadcaster: RwLock<Option<Arc<dyn Broadcaster>>>,
    core_started: AtomicBool,

    /// Guards the inbound decode + dedup + post critical section.
    inbound_mu: Mutex<()>,
    /// The hash we are currently asking the network to seal, if any.
    proposed_block_hash: Mutex<Option<Hash>>,
    commit_tx: mpsc::Sender<Block>,
    commit_rx: tokio::sync::Mutex<mpsc::Receiver<Block>>,

    /// Payload hashes this node has seen at all.
    known_messages: DedupCache,
    /// Per-peer payload hashes we know that peer holds.
    recent_messages: DashMap<Address, DedupCache>,
    /// Recently computed verifier-set snapshots, by block hash.
    recent_snapshots: DashMap<Hash, Snapshot>,
    /// Hashes the chain refused at commit time.
    bad_proposals: DashMap<Hash, ()>,
}

impl EngineServer {
    /// Wire a server to the node key, the chain, and the core's event
    /// channel.
    pub fn new(
        config: BftConfig,
        keypair: BasaltKeypair,
        chain: Arc<Chain>,
        events_tx: mpsc::UnboundedSender<ConsensusEvent>,
    ) -> Self {
        let (commit_tx, commit_rx) = mpsc::channel(1);
        let address = keypair.address();
        Self {
            config,
            keypair,
            address,
            chain,
            events_tx,
            broadcaster: RwLock::new(None),
            core_started: AtomicBool::new(false),
            inbound_mu: Mutex::new(()),
            proposed_block_hash: Mutex::new(None),
            commit_tx,
            commit_rx: tokio::sync::Mutex::new(commit_rx),
            known_messages: DedupCache::new(INMEMORY_MESSAGES),
            recent_messages: DashMap::new(),
            recent_snapshots: DashMap::new(),
            bad_proposals: DashMap::new(),
        }
    }

    /// Attach the peer-to-peer broadcaster. Until one is attached, gossip
    /// is a local no-op (loopback still works).
    pub fn set_broadcaster(&self, broadcaster: Arc<dyn Broadcaster>) {
        *self.broadcaster.write() = Some(broadcaster);
    }

    /// Mark the engine as running. Frames arriving earlier are refused
    /// with [`ConsensusError::EngineStopped`].
    pub fn start(&self) {
        self.core_started.store(true, Ordering::SeqCst);
        info!(address = %self.address, "engine server started");
    }

    /// Mark the engine as stopped.
    pub fn stop(&self) {
        self.core_started.store(false, Ordering::SeqCst);
    }

    /// The chain this server commits into.
    pub fn chain(&self) -> &Arc<Chain> {
        &self.chain
    }

    /// Handle a raw frame from a peer. Returns `Ok(false)` for opcodes
    /// that are not ours, `Ok(true)` once the frame is consumed (posted or
    /// deduplicated away).
    pub fn handle_inbound_frame(
        &self,
        src: Address,
        code: u16,
        data: &[u8],
    ) -> Result<bool, ConsensusError> {
        if code != BFT_MSG_CODE {
            return Ok(false);
        }
        if !self.core_started.load(Ordering::SeqCst) {
            return Err(ConsensusError::EngineStopped);
        }

        let _guard = self.inbound_mu.lock();
        let hash = content_hash(data);

        // Whatever happens next, this peer evidently has the payload.
        self.recent_peer_cache(src).insert(hash);

        if !self.known_messages.insert(hash) {
            trace!(peer = %src, "dropping duplicate consensus frame");
            return Ok(true);
        }

        let _ = self.events_tx.send(ConsensusEvent::Message {
            payload: Bytes::copy_from_slice(data),
        });
        Ok(true)
    }

    /// The chain accepted a new head; tell the core to move on.
    pub fn handle_new_chain_head(&self) -> Result<(), ConsensusError> {
        if !self.core_started.load(Ordering::SeqCst) {
            return Err(ConsensusError::EngineStopped);
        }
        let _ = self.events_tx.send(ConsensusEvent::FinalCommitted);
        Ok(())
    }

    /// Block assembler entry point: submit a block for consensus and wait
    /// for the sealed result. The registered hash is what routes the
    /// committed block back to us instead of straight into the chain.
    pub async fn seal(&self, block: Block) -> Result<Block, ConsensusError> {
        *self.proposed_block_hash.lock() = Some(block.hash());
        let _ = self
            .events_tx
            .send(ConsensusEvent::Request { proposal: block });

        let mut commit_rx = self.commit_rx.lock().await;
        let sealed = commit_rx.recv().await.ok_or(ConsensusError::EngineStopped);
        *self.proposed_block_hash.lock() = None;
        sealed
    }

    /// The address that sealed the block at `height`, if known.
    pub fn get_proposer(&self, height: u64) -> Address {
        self.chain
            .header_by_height(height)
            .and_then(|h| h.recover_creator().ok())
            .unwrap_or(Address::ZERO)
    }

    /// The verifier-set snapshot as of `(height, hash)`.
    ///
    /// Walks headers backward — memory cache first, the database at epoch
    /// checkpoints, genesis as the floor — then applies the collected
    /// headers forward. Checkpoint results are persisted so the next walk
    /// is short.
    pub fn snapshot(&self, height: u64, hash: Hash) -> Result<Snapshot, SnapshotError> {
        let mut cursor_height = height;
        let mut cursor_hash = hash;
        let mut headers: Vec<BlockHeader> = Vec::new();

        let base = loop {
            if let Some(found) = self.recent_snapshots.get(&cursor_hash) {
                break found.clone();
            }
            if cursor_height % self.config.epoch == 0 {
                if let Some(stored) =
                    Snapshot::load(self.chain.db(), self.config.epoch, &cursor_hash)?
                {
                    break stored;
                }
                if cursor_height == 0 {
                    break self.genesis_snapshot()?;
                }
            }
            let Some(block) = self.chain.block_by_hash(&cursor_hash) else {
                return Err(SnapshotError::InvalidVotingChain);
            };
            cursor_hash = block.header.parent_hash;
            cursor_height = block.header.height.saturating_sub(1);
            headers.push(block.header);
        };

        headers.reverse();
        let snapshot = base.apply_headers(&headers)?;

        if self.recent_snapshots.len() >= INMEMORY_SNAPSHOTS {
            self.recent_snapshots.clear();
        }
        self.recent_snapshots
            .insert(snapshot.hash, snapshot.clone());
        if !headers.is_empty() && snapshot.height % self.config.epoch == 0 {
            snapshot.store(self.chain.db())?;
        }
        Ok(snapshot)
    }

    /// The founding snapshot: the verifier list declared in the genesis
    /// header's seal container.
    fn genesis_snapshot(&self) -> Result<Snapshot, SnapshotError> {
        let genesis = self
            .chain
            .header_by_height(0)
            .ok_or(SnapshotError::InvalidVotingChain)?;
        let extra = BftExtra::extract(&genesis)
            .map_err(|e| SnapshotError::Decode(e.to_string()))?;
        let set = VerifierSet::new(extra.verifiers, self.config.proposer_policy);
        let snapshot = Snapshot::new(self.config.epoch, 0, genesis.hash(), set);
        snapshot.store(self.chain.db())?;
        Ok(snapshot)
    }

    fn verifiers_at(&self, height: u64, hash: Hash) -> VerifierSet {
        match self.snapshot(height, hash) {
            Ok(snapshot) => snapshot.verifier_set,
            Err(err) => {
                warn!(height, error = %err, "no verifier snapshot available");
                VerifierSet::new(Vec::new(), self.config.proposer_policy)
            }
        }
    }

    fn recent_peer_cache(
        &self,
        peer: Address,
    ) -> dashmap::mapref::one::RefMut<'_, Address, DedupCache> {
        if self.recent_messages.len() >= INMEMORY_PEERS
            && !self.recent_messages.contains_key(&peer)
        {
            // Room must be made; the tracked set of peers is small and
            // churns slowly, so dropping an arbitrary one is fine.
            if let Some(stale) = self.recent_messages.iter().next().map(|e| *e.key()) {
                self.recent_messages.remove(&stale);
            }
        }
        self.recent_messages
            .entry(peer)
            .or_insert_with(|| DedupCache::new(INMEMORY_MESSAGES))
    }

    fn now_secs() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

impl ServerOps for EngineServer {
    fn address(&self) -> Address {
        self.address
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, ConsensusError> {
        self.keypair
            .sign(data)
            .map_err(|_| ConsensusError::InvalidSignature)
    }

    fn broadcast(
        &self,
        verifier_set: &VerifierSet,
        payload: Bytes,
    ) -> Result<(), ConsensusError> {
        // Fan out to the others, then inform ourselves through the same
        // channel every other message uses.
        self.gossip(verifier_set, payload.clone())?;
        let _ = self.events_tx.send(ConsensusEvent::Message { payload });
        Ok(())
    }

    fn gossip(&self, verifier_set: &VerifierSet, payload: Bytes) -> Result<(), ConsensusError> {
        let hash = content_hash(&payload);
        self.known_messages.insert(hash);

        let targets: Vec<Address> = verifier_set
            .addresses()
            .into_iter()
            .filter(|address| *address != self.address)
            .collect();
        let broadcaster = self.broadcaster.read().clone();
        let (Some(broadcaster), false) = (broadcaster, targets.is_empty()) else {
            return Ok(());
        };

        for (address, peer) in broadcaster.find_peers(&targets) {
            {
                let recent = self.recent_peer_cache(address);
                if recent.contains(&hash) {
                    continue;
                }
                recent.insert(hash);
            }
            peer.send(BFT_MSG_CODE, payload.clone());
        }
        Ok(())
    }

    fn commit(&self, proposal: &Block, seals: Vec<Vec<u8>>) -> Result<(), ConsensusError> {
        let mut block = proposal.clone();
        block
            .header
            .write_committed_seals(&seals)
            .map_err(|e| ConsensusError::CommitFailed(e.to_string()))?;

        info!(
            height = block.height(),
            hash = %hex::encode(block.hash()),
            seals = seals.len(),
            "committing sealed block"
        );

        // If this is the block we proposed, the assembler is parked in
        // `seal` waiting for it.
        if *self.proposed_block_hash.lock() == Some(block.hash()) {
            if self.commit_tx.try_send(block).is_err() {
                warn!("no assembler waiting for the sealed block");
            }
            return Ok(());
        }

        // Someone else proposed it; append it ourselves. The chain head
        // event then restarts the core at the next sequence.
        match self.chain.insert_block(block.clone()) {
            Ok(()) => {
                let _ = self.handle_new_chain_head();
                Ok(())
            }
            Err(err) => {
                self.bad_proposals.insert(block.hash(), ());
                Err(ConsensusError::CommitFailed(err.to_string()))
            }
        }
    }

    fn verify(&self, proposal: &Block) -> Result<(), ConsensusError> {
        if compute_tx_root(&proposal.transactions) != proposal.header.tx_root {
            return Err(ConsensusError::InvalidProposal(
                "transaction root mismatch".into(),
            ));
        }

        let header = &proposal.header;
        let now = Self::now_secs();
        if header.timestamp > now {
            // Not wrong, just early. The core holds the pre-prepare and
            // retries once the timestamp is reachable.
            return Err(ConsensusError::FutureBlock(Duration::from_secs(
                header.timestamp - now,
            )));
        }

        let Some(parent) = self.chain.block_by_hash(&header.parent_hash) else {
            return Err(ConsensusError::InvalidProposal("unknown parent".into()));
        };
        if header.height != parent.height() + 1 {
            return Err(ConsensusError::InvalidProposal(
                "height does not extend parent".into(),
            ));
        }
        if header.timestamp < parent.header.timestamp {
            return Err(ConsensusError::InvalidProposal(
                "timestamp before parent".into(),
            ));
        }

        let signer = header
            .recover_creator()
            .map_err(|e| ConsensusError::InvalidProposal(e.to_string()))?;
        if !self
            .verifiers_at(parent.height(), parent.hash())
            .contains(signer)
        {
            return Err(ConsensusError::AddressUnauthorized);
        }
        Ok(())
    }

    fn last_proposal(&self) -> (Block, Address) {
        let block = self.chain.current_block();
        let proposer = if block.height() > 0 {
            block.header.recover_creator().unwrap_or_else(|err| {
                debug!(error = %err, "failed to recover the head block's sealer");
                Address::ZERO
            })
        } else {
            Address::ZERO
        };
        (block, proposer)
    }

    fn verifiers(&self, proposal: &Block) -> VerifierSet {
        self.verifiers_at(proposal.height(), proposal.hash())
    }

    fn has_bad_proposal(&self, hash: &Hash) -> bool {
        self.bad_proposals.contains_key(hash)
    }
}
