//! # Future-Message Backlog
//!
//! Messages from views or states we haven't reached yet are parked here
//! instead of dropped — a prepare that arrives a moment before its
//! pre-prepare is early, not wrong. Each signer gets its own priority
//! queue, keyed by `(sequence, round, code priority)`, so one chatty peer
//! cannot reorder or starve anyone else's replay.
//!
//! On every state advance the core drains whatever has become processable
//! and re-posts it through the event channel. Entries that have fallen
//! behind the current view are discarded on pop.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use tracing::trace;

use crate::crypto::keys::Address;

use super::message::{Message, MessageCode};
use super::types::{ConsensusError, View};

/// Replay order within a view: the pre-prepare must come first (nothing
/// else is processable without it), and commits beat prepares so a node
/// that is behind can jump straight to the decisive quorum.
fn code_priority(code: MessageCode) -> u8 {
    match code {
        MessageCode::Preprepare => 1,
        MessageCode::Commit => 2,
        MessageCode::Prepare => 3,
        MessageCode::RoundChange => 0,
    }
}

/// Heap key for a message. Round changes are keyed on sequence alone —
/// they are valid in any round of their sequence.
fn entry_key(code: MessageCode, view: View) -> (u64, u64, u8) {
    match code {
        MessageCode::RoundChange => (view.sequence, 0, 0),
        _ => (view.sequence, view.round, code_priority(code)),
    }
}

#[derive(Clone, Debug)]
struct Entry {
    key: (u64, u64, u8),
    /// Insertion counter, breaking ties deterministically (FIFO).
    order: u64,
    view: View,
    message: Message,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.order == other.order
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.key, self.order).cmp(&(other.key, other.order))
    }
}

/// The per-signer backlog of future messages.
#[derive(Debug, Default)]
pub struct Backlog {
    queues: HashMap<Address, BinaryHeap<Reverse<Entry>>>,
    counter: u64,
}

impl Backlog {
    /// A fresh, empty backlog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a validated message for later replay. Messages whose view
    /// cannot be decoded are dropped — they were never processable.
    pub fn store(&mut self, message: Message) {
        let view = match message.view() {
            Ok(view) => view,
            Err(_) => return,
        };
        trace!(signer = %message.address, code = ?message.code, %view, "backlogging future message");
        let entry = Entry {
            key: entry_key(message.code, view),
            order: self.counter,
            view,
            message,
        };
        self.counter += 1;
        self.queues
            .entry(entry.message.address)
            .or_default()
            .push(Reverse(entry));
    }

    /// Pop every message that `check` now accepts, in priority order per
    /// signer. Entries `check` reports as old are discarded; the first
    /// still-future entry stops that signer's drain (everything behind it
    /// is at least as future).
    pub fn drain_ready(
        &mut self,
        check: impl Fn(MessageCode, View) -> Result<(), ConsensusError>,
    ) -> Vec<Message> {
        let mut ready = Vec::new();
        for queue in self.queues.values_mut() {
            while let Some(Reverse(entry)) = queue.peek() {
                match check(entry.message.code, entry.view) {
                    Err(ConsensusError::OldMessage) => {
                        queue.pop();
                    }
                    Err(_) => break,
                    Ok(()) => {
                        if let Some(Reverse(entry)) = queue.pop() {
                            ready.push(entry.message);
                        }
                    }
                }
            }
        }
        self.queues.retain(|_, q| !q.is_empty());
        ready
    }

    /// Total number of parked messages.
    pub fn len(&self) -> usize {
        self.queues.values().map(|q| q.len()).sum()
    }

    /// Whether nothing is parked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::types::Subject;
    use crate::crypto::hash::ZERO_HASH;

    fn addr(byte: u8) -> Address {
        Address::new([byte; 20])
    }

    fn subject_message(code: MessageCode, address: Address, view: View) -> Message {
        let body = Message::encode_body(&Subject {
            view,
            digest: ZERO_HASH,
        })
        .unwrap();
        let mut msg = Message::new(code, body);
        msg.address = address;
        msg
    }

    /// A checker that accepts exactly `current`, calls earlier views old,
    /// and later views future.
    fn view_checker(current: View) -> impl Fn(MessageCode, View) -> Result<(), ConsensusError> {
        move |_, view| {
            if view < current {
                Err(ConsensusError::OldMessage)
            } else if view > current {
                Err(ConsensusError::FutureMessage)
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn drains_only_ready_messages() {
        let mut backlog = Backlog::new();
        backlog.store(subject_message(MessageCode::Prepare, addr(1), View::new(2, 0)));
        backlog.store(subject_message(MessageCode::Prepare, addr(1), View::new(3, 0)));

        let ready = backlog.drain_ready(view_checker(View::new(2, 0)));
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].view().unwrap(), View::new(2, 0));
        // The sequence-3 message is still parked.
        assert_eq!(backlog.len(), 1);
    }

    #[test]
    fn old_entries_discarded_on_pop() {
        let mut backlog = Backlog::new();
        backlog.store(subject_message(MessageCode::Prepare, addr(1), View::new(1, 0)));
        backlog.store(subject_message(MessageCode::Prepare, addr(1), View::new(5, 0)));

        let ready = backlog.drain_ready(view_checker(View::new(5, 0)));
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].view().unwrap(), View::new(5, 0));
        assert!(backlog.is_empty());
    }

    #[test]
    fn preprepare_replays_before_prepare_and_commit() {
        let view = View::new(4, 0);
        let mut backlog = Backlog::new();
        backlog.store(subject_message(MessageCode::Prepare, addr(1), view));
        backlog.store(subject_message(MessageCode::Commit, addr(1), view));
        // Pre-prepare stored last but must come out first.
        let body = Message::encode_body(&crate::consensus::types::PrePrepare {
            view,
            proposal: crate::storage::Block::genesis(vec![]),
        })
        .unwrap();
        let mut preprepare = Message::new(MessageCode::Preprepare, body);
        preprepare.address = addr(1);
        backlog.store(preprepare);

        let ready = backlog.drain_ready(|_, _| Ok(()));
        let codes: Vec<MessageCode> = ready.iter().map(|m| m.code).collect();
        assert_eq!(
            codes,
            vec![
                MessageCode::Preprepare,
                MessageCode::Commit,
                MessageCode::Prepare
            ]
        );
    }

    #[test]
    fn queues_are_per_signer() {
        let mut backlog = Backlog::new();
        backlog.store(subject_message(MessageCode::Prepare, addr(1), View::new(9, 0)));
        backlog.store(subject_message(MessageCode::Prepare, addr(2), View::new(2, 0)));

        // Signer 1's future message does not block signer 2's ready one.
        let ready = backlog.drain_ready(view_checker(View::new(2, 0)));
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].address, addr(2));
        assert_eq!(backlog.len(), 1);
    }

    #[test]
    fn undecodable_views_are_dropped() {
        let mut backlog = Backlog::new();
        let mut junk = Message::new(MessageCode::Prepare, vec![0xff, 0xee]);
        junk.address = addr(1);
        backlog.store(junk);
        assert!(backlog.is_empty());
    }
}
