//! # The Core State Machine
//!
//! One instance per participating node. The core owns the round state, the
//! round-change collections, and the backlog; everything it owns lives on
//! a single worker task fed by one event channel, so none of it needs a
//! lock.
//!
//! ## Phase flow
//!
//! ```text
//! AcceptRequest --preprepare--> Preprepared --2F+1 prepares--> Prepared
//!       ^                                                         |
//!       |                                                 2F+1 commits
//!       +------------- start_new_round <------ Committed <--------+
//! ```
//!
//! State only moves forward within a round; `start_new_round` is the one
//! place it resets. A node that reaches Prepared locks on the proposal
//! hash and carries that lock through round changes until the block either
//! commits or the chain rejects it.
//!
//! This file holds the machinery: construction, the run loop, round
//! management, broadcasting, committing, and the timers. The per-message
//! handlers live in [`handlers`](super::handlers).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::MAX_ROUND_BACKOFF;
use crate::crypto::keys::Address;

use super::backlog::Backlog;
use super::message::{commit_seal_data, Message, MessageCode};
use super::round::{RoundChangeSet, RoundState};
use super::server::ServerOps;
use super::types::{BftConfig, ConsensusError, ConsensusEvent, Request, Subject, View};
use super::verifier::VerifierSet;

// ---------------------------------------------------------------------------
// CoreState
// ---------------------------------------------------------------------------

/// The four phases of a consensus round, in order. The derived `Ord` is
/// the protocol's "at least this far along" comparison.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum CoreState {
    /// Waiting for a proposal (ours to send, or the proposer's to arrive).
    AcceptRequest = 0,
    /// A pre-prepare was accepted; collecting prepares.
    Preprepared = 1,
    /// A prepared quorum was seen; locked on the hash, collecting commits.
    Prepared = 2,
    /// A commit quorum was seen; the block is being handed to the chain.
    Committed = 3,
}

// ---------------------------------------------------------------------------
// Core
// ---------------------------------------------------------------------------

/// The per-node consensus state machine.
///
/// Talks to the outside world exclusively through a [`ServerOps`]
/// implementation (signing, broadcast, chain access) and the event channel
/// (inbound messages, timers, chain notifications). That boundary is what
/// makes the machine testable against a fake server.
pub struct Core {
    pub(super) config: BftConfig,
    pub(super) address: Address,
    pub(super) state: CoreState,
    pub(super) server: Arc<dyn ServerOps>,
    pub(super) verifier_set: VerifierSet,
    pub(super) waiting_for_round_change: bool,
    pub(super) current: Option<RoundState>,
    pub(super) round_change_set: RoundChangeSet,
    pub(super) backlog: Backlog,
    /// Requests for future heights, keyed by height, replayed when the
    /// machine returns to `AcceptRequest`.
    pub(super) pending_requests: BTreeMap<u64, Request>,
    pub(super) events_tx: mpsc::UnboundedSender<ConsensusEvent>,
    round_change_timer: Option<JoinHandle<()>>,
    future_preprepare_timer: Option<JoinHandle<()>>,
}

impl Core {
    /// Build a core around a server. The returned machine is idle; call
    /// [`start`](Self::start) (or let [`run`](Self::run) do it) to enter
    /// the first round.
    pub fn new(
        config: BftConfig,
        server: Arc<dyn ServerOps>,
        events_tx: mpsc::UnboundedSender<ConsensusEvent>,
    ) -> Self {
        let address = server.address();
        let verifier_set = VerifierSet::new(Vec::new(), config.proposer_policy);
        Self {
            config,
            address,
            state: CoreState::AcceptRequest,
            server,
            round_change_set: RoundChangeSet::new(verifier_set.clone()),
            verifier_set,
            waiting_for_round_change: false,
            current: None,
            backlog: Backlog::new(),
            pending_requests: BTreeMap::new(),
            events_tx,
            round_change_timer: None,
            future_preprepare_timer: None,
        }
    }

    /// Enter the first round for the sequence after the chain head.
    pub fn start(&mut self) {
        self.start_new_round(0);
    }

    /// Drive the machine until shutdown: start the opening round, then
    /// pull events one at a time. All state mutation happens here, on this
    /// task — that is the whole concurrency story.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<ConsensusEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(address = %self.address, "consensus core starting");
        self.start();

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    // A dropped sender counts as a shutdown request too.
                    if changed.is_err() || *shutdown.borrow() {
                        info!("consensus core received shutdown signal");
                        break;
                    }
                }
                maybe_event = events.recv() => match maybe_event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
            }
        }

        self.stop_timers();
        info!("consensus core stopped");
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// This node's verifier address.
    pub fn address(&self) -> Address {
        self.address
    }

    /// The current phase.
    pub fn state(&self) -> CoreState {
        self.state
    }

    /// The view currently being attempted, if a round has started.
    pub fn current_view(&self) -> Option<View> {
        self.current.as_ref().map(|c| c.view())
    }

    /// The verifier set the machine is running against.
    pub fn verifier_set(&self) -> &VerifierSet {
        &self.verifier_set
    }

    /// Whether this node proposes the current view.
    pub fn is_proposer(&self) -> bool {
        self.verifier_set.is_proposer(self.address)
    }

    /// Whether the current round holds a live lock: a locked hash the
    /// chain has not flagged as bad.
    pub fn is_hash_locked(&self) -> bool {
        match self.current.as_ref().and_then(|c| c.locked_hash()) {
            Some(hash) => !self.server.has_bad_proposal(&hash),
            None => false,
        }
    }

    // -----------------------------------------------------------------------
    // State transitions
    // -----------------------------------------------------------------------

    /// Advance (or reset) the phase. Returning to `AcceptRequest` replays
    /// parked requests; every transition replays whatever the backlog now
    /// considers processable.
    pub(super) fn set_state(&mut self, state: CoreState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "state transition");
            self.state = state;
        }
        if state == CoreState::AcceptRequest {
            self.process_pending_requests();
        }
        self.process_backlog();
    }

    /// Start a round.
    ///
    /// Decides between three situations: the chain has moved past our
    /// sequence (catch up: next sequence, fresh verifier set), we are
    /// changing rounds within the sequence (keep the lock, bump the
    /// round), or the call is stale (reject). Ends with the proposer
    /// recalculated, the machine in `AcceptRequest`, and the round-change
    /// timer armed.
    pub(super) fn start_new_round(&mut self, round: u64) {
        let (last_proposal, last_proposer) = self.server.last_proposal();

        let mut round_changed = false;
        match &self.current {
            None => {
                info!("initiating the first round");
            }
            Some(current) if last_proposal.height() >= current.sequence() => {
                info!(
                    height = last_proposal.height(),
                    hash = %hex::encode(last_proposal.hash()),
                    "catching up to the latest proposal"
                );
            }
            Some(current) if last_proposal.height() == current.sequence() - 1 => {
                if round == 0 {
                    // Same sequence, same round: nothing to start.
                    return;
                }
                if round < current.round() {
                    warn!(
                        new_round = round,
                        current_round = current.round(),
                        "refusing to move to a smaller round"
                    );
                    return;
                }
                round_changed = true;
            }
            Some(_) => {
                warn!("new sequence should be larger than the current one");
                return;
            }
        }

        let new_view = if round_changed {
            // The lock (if any) survives; the verifier set is unchanged.
            View::new(
                self.current.as_ref().map(|c| c.sequence()).unwrap_or(0),
                round,
            )
        } else {
            self.verifier_set = self.server.verifiers(&last_proposal);
            View::new(last_proposal.height() + 1, 0)
        };

        self.round_change_set = RoundChangeSet::new(self.verifier_set.clone());
        self.update_round_state(new_view, round_changed);
        self.verifier_set.calc_proposer(last_proposer, new_view.round);
        self.waiting_for_round_change = false;
        self.set_state(CoreState::AcceptRequest);

        // A newly selected proposer re-proposes its locked block, or picks
        // up the request it was sitting on.
        if round_changed && self.is_proposer() {
            if self.is_hash_locked() {
                if let Some(proposal) = self.current.as_ref().and_then(|c| c.proposal()).cloned() {
                    self.send_preprepare(&Request { proposal });
                }
            } else if let Some(request) =
                self.current.as_ref().and_then(|c| c.pending_request()).cloned()
            {
                self.send_preprepare(&request);
            }
        }

        self.arm_round_change_timer();
        info!(
            view = %new_view,
            proposer = %self
                .verifier_set
                .proposer()
                .map(|p| p.address().to_hex())
                .unwrap_or_else(|| "<none>".into()),
            verifiers = self.verifier_set.size(),
            is_proposer = self.is_proposer(),
            "new round started"
        );
    }

    /// Jump our round number forward without a strong certificate: mark
    /// ourselves as waiting, rebuild the round state (keeping the lock),
    /// drop stale round-change buckets, and re-arm the timer.
    pub(super) fn catch_up_round(&mut self, view: View) {
        self.waiting_for_round_change = true;
        self.update_round_state(view, true);
        self.round_change_set.clear(view.round);
        self.arm_round_change_timer();
        debug!(%view, "caught up to a higher round");
    }

    /// Rebuild the round state for a view. On a round change a live lock
    /// carries its hash and pre-prepare into the new state; without one,
    /// only the pending request survives. A sequence change starts clean.
    fn update_round_state(&mut self, view: View, round_changed: bool) {
        let verifier_set = self.verifier_set.clone();
        self.current = Some(match self.current.take() {
            Some(previous) if round_changed => {
                let live_lock = previous
                    .locked_hash()
                    .filter(|h| !self.server.has_bad_proposal(h));
                match live_lock {
                    Some(locked) => RoundState::new(
                        view,
                        verifier_set,
                        Some(locked),
                        previous.preprepare().cloned(),
                        previous.pending_request().cloned(),
                    ),
                    None => RoundState::new(
                        view,
                        verifier_set,
                        None,
                        None,
                        previous.pending_request().cloned(),
                    ),
                }
            }
            _ => RoundState::new(view, verifier_set, None, None, None),
        });
    }

    // -----------------------------------------------------------------------
    // Round changes
    // -----------------------------------------------------------------------

    /// Broadcast a round change targeting `round`. Refuses to go sideways
    /// or backwards.
    pub(super) fn send_round_change(&mut self, round: u64) {
        let Some(view) = self.current_view() else { return };
        if view.round >= round {
            error!(
                current_round = view.round,
                target_round = round,
                "cannot send a round change that does not increase the round"
            );
            return;
        }

        self.catch_up_round(View::new(view.sequence, round));

        let Some(view) = self.current_view() else { return };
        let subject = Subject {
            view,
            digest: crate::crypto::hash::ZERO_HASH,
        };
        match Message::encode_body(&subject) {
            Ok(body) => self.broadcast(MessageCode::RoundChange, body),
            Err(err) => error!(error = %err, "failed to encode round change"),
        }
    }

    /// Broadcast a round change for `current round + 1`.
    pub(super) fn send_next_round_change(&mut self) {
        if let Some(view) = self.current_view() {
            self.send_round_change(view.round + 1);
        }
    }

    // -----------------------------------------------------------------------
    // Broadcasting & committing
    // -----------------------------------------------------------------------

    /// Finalize and broadcast a message to the verifier set (self
    /// included — our own copy loops back through the event channel).
    pub(super) fn broadcast(&mut self, code: MessageCode, body: Vec<u8>) {
        let mut message = Message::new(code, body);
        let payload = match self.finalize_message(&mut message) {
            Ok(payload) => payload,
            Err(err) => {
                error!(code = ?code, error = %err, state = ?self.state, "failed to finalize message");
                return;
            }
        };
        if let Err(err) = self
            .server
            .broadcast(&self.verifier_set, payload.into())
        {
            error!(code = ?code, error = %err, state = ?self.state, "failed to broadcast message");
        }
    }

    /// Stamp our address, attach the committed seal for commits, sign, and
    /// encode.
    fn finalize_message(&self, message: &mut Message) -> Result<Vec<u8>, ConsensusError> {
        message.address = self.address;
        message.committed_seal = Vec::new();

        if message.code == MessageCode::Commit {
            if let Some(proposal) = self.current.as_ref().and_then(|c| c.proposal()) {
                let seal_data = commit_seal_data(&proposal.hash());
                message.committed_seal = self.server.sign(&seal_data)?;
            }
        }

        let unsigned = message.payload_for_signing()?;
        message.signature = self.server.sign(&unsigned)?;
        message.encode()
    }

    /// Hand the current proposal and its committed seals to the server.
    /// If the chain refuses the block, release the lock and move on to the
    /// next round — the sequence will be retried from a clean slate.
    pub(super) fn commit(&mut self) {
        self.set_state(CoreState::Committed);

        let Some(proposal) = self.current.as_ref().and_then(|c| c.proposal()).cloned() else {
            return;
        };
        let seals: Vec<Vec<u8>> = self
            .current
            .as_ref()
            .map(|c| c.commits.values().map(|m| m.committed_seal.clone()).collect())
            .unwrap_or_default();

        info!(
            height = proposal.height(),
            hash = %hex::encode(proposal.hash()),
            seals = seals.len(),
            "committing proposal"
        );
        if let Err(err) = self.server.commit(&proposal, seals) {
            warn!(error = %err, "chain refused the sealed block; unlocking and changing round");
            if let Some(current) = self.current.as_mut() {
                current.unlock_hash();
            }
            self.send_next_round_change();
        }
    }

    // -----------------------------------------------------------------------
    // Backlog & pending requests
    // -----------------------------------------------------------------------

    /// Re-post every backlogged message the machine can now process.
    pub(super) fn process_backlog(&mut self) {
        let Some(view) = self.current_view() else { return };
        let state = self.state;
        let waiting = self.waiting_for_round_change;
        let ready = self
            .backlog
            .drain_ready(|code, message_view| {
                super::handlers::check_message_at(state, view, waiting, code, message_view)
            });
        for message in ready {
            let _ = self.events_tx.send(ConsensusEvent::Backlog { message });
        }
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    /// Arm the round-change timer for the current round:
    /// `request_timeout + 2^round seconds` past round zero, capped. Any
    /// previous timers are stopped first — a state machine with two clocks
    /// ticking is a state machine with none.
    pub(super) fn arm_round_change_timer(&mut self) {
        self.stop_timers();

        let mut timeout = Duration::from_millis(self.config.request_timeout_ms);
        let round = self.current.as_ref().map(|c| c.round()).unwrap_or(0);
        if round > 0 {
            let backoff = Duration::from_secs(2u64.saturating_pow(round.min(32) as u32));
            timeout += backoff.min(MAX_ROUND_BACKOFF);
        }

        let events_tx = self.events_tx.clone();
        self.round_change_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events_tx.send(ConsensusEvent::Timeout);
        }));
    }

    /// Schedule a future-dated pre-prepare for redelivery once its
    /// timestamp is reachable.
    pub(super) fn arm_future_preprepare_timer(&mut self, message: Message, wait: Duration) {
        self.stop_future_preprepare_timer();
        let events_tx = self.events_tx.clone();
        self.future_preprepare_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let _ = events_tx.send(ConsensusEvent::Backlog { message });
        }));
    }

    fn stop_future_preprepare_timer(&mut self) {
        if let Some(timer) = self.future_preprepare_timer.take() {
            timer.abort();
        }
    }

    /// Stop every pending timer.
    pub(super) fn stop_timers(&mut self) {
        self.stop_future_preprepare_timer();
        if let Some(timer) = self.round_change_timer.take() {
            timer.abort();
        }
    }
}
