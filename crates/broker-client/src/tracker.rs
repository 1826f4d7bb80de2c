//! Outstanding-confirm tracker.
//!
//! Every accepted message lives here until the broker confirms it. An entry
//! is created provisionally when `publish` accepts the message, gets a
//! sequence tag when it is handed to a channel, and loses that tag again if
//! the channel dies before the confirm arrives. Entries without a tag are
//! "unsent" and are picked up in admission order by the dispatcher.

use crate::message::OutboundMessage;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::watch;

/// Admission order of an accepted message. Stable across resends.
pub type EntryId = u64;

/// Sequence tag assigned when a message is handed to a channel.
pub type SequenceTag = u64;

#[derive(Debug)]
struct PendingEntry {
    sequence_tag: Option<SequenceTag>,
    message: Arc<OutboundMessage>,
}

#[derive(Debug, Default)]
struct TrackerState {
    next_id: EntryId,
    entries: BTreeMap<EntryId, PendingEntry>,
    by_tag: BTreeMap<SequenceTag, EntryId>,
    unsent: BTreeSet<EntryId>,
    /// Total entries ever removed by a broker ack.
    confirmed: u64,
}

impl TrackerState {
    /// Detach `tag` from its entry and mark the entry unsent.
    fn untag(&mut self, tag: SequenceTag) -> bool {
        let Some(id) = self.by_tag.remove(&tag) else {
            return false;
        };
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.sequence_tag = None;
            self.unsent.insert(id);
            true
        } else {
            false
        }
    }

    /// Remove the entries for the given tags (all tags `<= tag` when `multiple`).
    fn take_tags(&mut self, tag: SequenceTag, multiple: bool) -> Vec<EntryId> {
        if multiple {
            let rest = self.by_tag.split_off(&(tag.saturating_add(1)));
            let taken = std::mem::replace(&mut self.by_tag, rest);
            taken.into_values().collect()
        } else {
            self.by_tag.remove(&tag).into_iter().collect()
        }
    }
}

/// Pending messages shared by the publish path and the confirm listener.
#[derive(Debug)]
pub struct OutstandingConfirms {
    state: Mutex<TrackerState>,
    /// Current [`size`](Self::size), published on every change.
    size_tx: watch::Sender<usize>,
}

impl Default for OutstandingConfirms {
    fn default() -> Self {
        Self::new()
    }
}

impl OutstandingConfirms {
    pub fn new() -> Self {
        let (size_tx, _) = watch::channel(0);
        Self {
            state: Mutex::new(TrackerState::default()),
            size_tx,
        }
    }

    /// Called with the state lock held so observers see sizes in order.
    fn publish_size(&self, state: &TrackerState) {
        self.size_tx.send_replace(state.entries.len());
    }

    /// Accept a message that has not been handed to a channel yet.
    pub fn hold(&self, message: OutboundMessage) -> EntryId {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.entries.insert(
            id,
            PendingEntry {
                sequence_tag: None,
                message: Arc::new(message),
            },
        );
        state.unsent.insert(id);
        self.publish_size(&state);
        id
    }

    /// Take the oldest unsent entry for transmission.
    ///
    /// The entry stays counted by [`size`](Self::size). The caller must either
    /// [`record`](Self::record) a tag for it, [`release`](Self::release) it or
    /// [`discard`](Self::discard) it.
    pub fn next_unsent(&self) -> Option<(EntryId, Arc<OutboundMessage>)> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        while let Some(id) = state.unsent.pop_first() {
            if let Some(entry) = state.entries.get(&id) {
                return Some((id, Arc::clone(&entry.message)));
            }
        }
        None
    }

    /// Return an entry taken by `next_unsent` that could not be handed off.
    pub fn release(&self, id: EntryId) {
        let mut state = self.state.lock();
        if state.entries.contains_key(&id) {
            state.unsent.insert(id);
        }
    }

    /// Drop an entry taken by `next_unsent` that can never be delivered.
    pub fn discard(&self, id: EntryId) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(entry) = state.entries.remove(&id) else {
            return false;
        };
        if let Some(tag) = entry.sequence_tag {
            state.by_tag.remove(&tag);
        }
        state.unsent.remove(&id);
        self.publish_size(state);
        true
    }

    /// Bind the sequence tag a channel assigned to an entry.
    ///
    /// Returns false when the entry is gone (drained in the meantime).
    pub fn record(&self, tag: SequenceTag, id: EntryId) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(entry) = state.entries.get_mut(&id) else {
            return false;
        };
        if let Some(old) = entry.sequence_tag.replace(tag) {
            state.by_tag.remove(&old);
        }
        state.unsent.remove(&id);
        state.by_tag.insert(tag, id);
        true
    }

    /// Broker ack: remove the entry for `tag`, or every entry up to it.
    pub fn acknowledge(&self, tag: SequenceTag, multiple: bool) -> usize {
        let mut state = self.state.lock();
        let ids = state.take_tags(tag, multiple);
        let acked = ids
            .into_iter()
            .filter(|id| state.entries.remove(id).is_some())
            .count();
        state.confirmed += acked as u64;
        self.publish_size(&state);
        acked
    }

    /// Broker nack. Entries go back to unsent when `resend` is set and are
    /// dropped otherwise.
    pub fn reject(&self, tag: SequenceTag, multiple: bool, resend: bool) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let ids = state.take_tags(tag, multiple);
        let mut affected = 0;
        for id in ids {
            if resend {
                if let Some(entry) = state.entries.get_mut(&id) {
                    entry.sequence_tag = None;
                    state.unsent.insert(id);
                    affected += 1;
                }
            } else if state.entries.remove(&id).is_some() {
                affected += 1;
            }
        }
        self.publish_size(state);
        affected
    }

    /// The confirm for `tag` will never arrive; resend the entry.
    pub fn requeue(&self, tag: SequenceTag) -> bool {
        self.state.lock().untag(tag)
    }

    /// Mark every tagged entry unsent. Used when a fresh channel replaces one
    /// whose confirms can no longer arrive.
    pub fn requeue_in_flight(&self) -> usize {
        let mut state = self.state.lock();
        let tags: Vec<SequenceTag> = state.by_tag.keys().copied().collect();
        tags.into_iter().filter(|tag| state.untag(*tag)).count()
    }

    /// Number of accepted, unconfirmed messages.
    pub fn size(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Receiver that sees [`size`](Self::size) after every change.
    pub fn watch_size(&self) -> watch::Receiver<usize> {
        self.size_tx.subscribe()
    }

    /// Total number of entries confirmed by the broker so far.
    pub fn confirmed(&self) -> u64 {
        self.state.lock().confirmed
    }

    pub fn has_unsent(&self) -> bool {
        !self.state.lock().unsent.is_empty()
    }

    /// Entries currently waiting for a broker confirm.
    #[cfg(test)]
    pub fn in_flight(&self) -> usize {
        self.state.lock().by_tag.len()
    }

    #[cfg(test)]
    pub fn unsent_count(&self) -> usize {
        self.state.lock().unsent.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Forget every pending entry without resending. Returns how many were dropped.
    pub fn drain(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.entries.len();
        state.entries.clear();
        state.by_tag.clear();
        state.unsent.clear();
        self.publish_size(&state);
        dropped
    }
}
