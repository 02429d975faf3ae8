//! In-flight operation slots with cancel-on-supersede.
//!
//! Each key has at most one outstanding operation per tracker. Starting a new
//! one cancels the previous token and bumps the generation, so the stale
//! operation's settlement finds a different generation in the slot and
//! becomes a no-op.
//!
//! ```text
//! begin(k) ──► slot[k] = { gen: n, token }   (previous token cancelled)
//!    │
//!    ├─ await collaborator (select on token)
//!    │
//!    └─ settle(ticket, apply)
//!          ├─ slot[k].gen == n ─► apply(), slot cleared
//!          └─ otherwise        ─► skipped, slot untouched
//! ```
//!
//! A [`Ticket`] dropped without settling clears its slot if it still owns it,
//! so abandoned futures never leave a dangling slot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::key::CacheKey;

/// The kind of operation a tracker holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// A fetch started by `get_data`.
    Fetch,
    /// An update started by `update_data`.
    Update,
}

struct Slot {
    generation: u64,
    cancel: CancellationToken,
}

/// Tracks the single in-flight operation per key for one [`OperationKind`].
pub(crate) struct OperationTracker<K> {
    kind: OperationKind,
    next_generation: AtomicU64,
    slots: Mutex<HashMap<K, Slot>>,
}

impl<K: CacheKey> OperationTracker<K> {
    pub fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            next_generation: AtomicU64::new(1),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Cancel and clear the in-flight operation for `key`, if any.
    pub fn cancel(&self, key: &K) -> bool {
        match self.slots.lock().remove(key) {
            Some(slot) => {
                slot.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Register a new operation for `key`, superseding any previous one.
    ///
    /// `on_start` runs while the slot is held, so nothing can settle or
    /// supersede on this key between the registration and its effects.
    pub fn begin<R>(&self, key: &K, on_start: impl FnOnce() -> R) -> (Ticket<'_, K>, R) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        let mut slots = self.slots.lock();
        let previous = slots.insert(
            key.clone(),
            Slot {
                generation,
                cancel: cancel.clone(),
            },
        );
        let superseded = match previous {
            Some(slot) => {
                slot.cancel.cancel();
                true
            }
            None => false,
        };
        let output = on_start();
        drop(slots);

        let ticket = Ticket {
            tracker: self,
            key: key.clone(),
            generation,
            cancel,
            superseded,
            settled: false,
        };
        (ticket, output)
    }

    /// Apply the settlement of `ticket` if it still owns its slot, clearing the slot.
    ///
    /// Returns `None` when the operation was superseded or cancelled; `apply`
    /// is not run in that case.
    pub fn settle<R>(&self, ticket: &mut Ticket<'_, K>, apply: impl FnOnce() -> R) -> Option<R> {
        ticket.settled = true;
        let mut slots = self.slots.lock();
        if !Self::owns(&slots, &ticket.key, ticket.generation) {
            return None;
        }
        let output = apply();
        slots.remove(&ticket.key);
        Some(output)
    }

    /// Cancel and clear every slot. Returns how many were in flight.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<Slot> = self.slots.lock().drain().map(|(_, slot)| slot).collect();
        for slot in &drained {
            slot.cancel.cancel();
        }
        tracing::trace!(kind = ?self.kind, cancelled = drained.len(), "cancelled in-flight operations");
        drained.len()
    }

    pub fn is_active(&self, key: &K) -> bool {
        self.slots.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    fn owns(slots: &HashMap<K, Slot>, key: &K, generation: u64) -> bool {
        slots
            .get(key)
            .is_some_and(|slot| slot.generation == generation)
    }

    fn release(&self, key: &K, generation: u64) {
        let mut slots = self.slots.lock();
        if Self::owns(&slots, key, generation) {
            slots.remove(key);
        }
    }
}

/// Handle for one registered operation.
pub(crate) struct Ticket<'a, K: CacheKey> {
    tracker: &'a OperationTracker<K>,
    key: K,
    generation: u64,
    cancel: CancellationToken,
    superseded: bool,
    settled: bool,
}

impl<K: CacheKey> Ticket<'_, K> {
    /// Resolves once this operation is superseded or the tracker is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// True if registering this operation cancelled an older one.
    pub fn superseded_previous(&self) -> bool {
        self.superseded
    }
}

impl<K: CacheKey> Drop for Ticket<'_, K> {
    fn drop(&mut self) {
        if !self.settled {
            self.tracker.release(&self.key, self.generation);
        }
    }
}
