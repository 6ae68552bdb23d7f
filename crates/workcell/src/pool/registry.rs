//! Registry of live slots.
//!
//! Tracks each slot's busy flag and its availability signal: a
//! single-resolution future installed whenever the slot goes busy and
//! resolved when it goes idle again. Every method runs under the pool lock.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::Shared;
use tokio::sync::oneshot;

use crate::context::{ContextSpawner, SpawnError};
use crate::kind::{SlotId, WorkerKind};
use crate::status::SlotSnapshot;

use super::TerminateOrder;
use super::slot::Slot;

/// Resolves with the slot id once the slot goes from busy to idle.
pub(crate) type AvailabilitySignal = Shared<oneshot::Receiver<SlotId>>;

struct Availability {
    resolve: Option<oneshot::Sender<SlotId>>,
    signal: AvailabilitySignal,
}

impl Availability {
    fn pending() -> Self {
        let (resolve, signal) = oneshot::channel();
        Self {
            resolve: Some(resolve),
            signal: signal.shared(),
        }
    }

    fn resolve(&mut self, id: SlotId) {
        if let Some(resolve) = self.resolve.take() {
            // Nobody listening is fine: waiters re-check state under the lock.
            let _ = resolve.send(id);
        }
    }
}

struct SlotEntry {
    slot: Slot,
    busy: bool,
    availability: Availability,
    created_at: DateTime<Utc>,
}

impl SlotEntry {
    fn snapshot(&self) -> SlotSnapshot {
        SlotSnapshot {
            id: self.slot.id(),
            kind: self.slot.kind().clone(),
            busy: self.busy,
            created_at: self.created_at.to_rfc3339(),
        }
    }
}

/// Outcome of a removal request.
#[derive(Debug)]
pub(crate) enum Removal {
    Removed(Slot),
    Busy,
    Missing,
}

#[derive(Default)]
pub(crate) struct SlotRegistry {
    slots: BTreeMap<SlotId, SlotEntry>,
    next_id: u64,
}

impl SlotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a context for `kind` and register it as a busy slot.
    ///
    /// Nothing is registered when the spawner fails.
    pub fn create(
        &mut self,
        kind: &WorkerKind,
        spawner: &dyn ContextSpawner,
    ) -> Result<Slot, SpawnError> {
        let context = spawner.spawn(kind)?;

        let id = SlotId::new(self.next_id);
        self.next_id += 1;

        let slot = Slot::new(id, kind.clone(), context);
        self.slots.insert(
            id,
            SlotEntry {
                slot: slot.clone(),
                busy: true,
                availability: Availability::pending(),
                created_at: Utc::now(),
            },
        );
        Ok(slot)
    }

    /// Mark the oldest idle slot of `kind` busy and return it.
    pub fn claim_idle(&mut self, kind: &WorkerKind) -> Option<Slot> {
        let id = self.idle_of_kind(kind)?;
        self.mark_busy(id)
    }

    pub fn mark_busy(&mut self, id: SlotId) -> Option<Slot> {
        let entry = self.slots.get_mut(&id)?;
        if entry.busy {
            tracing::error!(slot = %id, "Bug: attempted to claim a busy slot");
            debug_assert!(false, "slot claimed while busy");
            return None;
        }

        entry.busy = true;
        entry.availability = Availability::pending();
        Some(entry.slot.clone())
    }

    /// Mark a busy slot idle and resolve its availability signal.
    pub fn mark_available(&mut self, id: SlotId) -> bool {
        let Some(entry) = self.slots.get_mut(&id) else {
            tracing::error!(slot = %id, "Bug: released a slot that is not registered");
            debug_assert!(false, "released unknown slot");
            return false;
        };
        if !entry.busy {
            tracing::error!(slot = %id, "Bug: released a slot that is already idle");
            debug_assert!(false, "slot marked available while idle");
            return false;
        }

        entry.busy = false;
        entry.availability.resolve(id);
        true
    }

    /// Remove an idle slot and destroy its context. Busy slots are refused.
    pub fn remove(&mut self, id: SlotId) -> Removal {
        match self.slots.get(&id).map(|entry| entry.busy) {
            None => Removal::Missing,
            Some(true) => Removal::Busy,
            Some(false) => match self.slots.remove(&id) {
                Some(entry) => {
                    entry.slot.context().destroy();
                    Removal::Removed(entry.slot)
                }
                None => Removal::Missing,
            },
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn has_idle(&self, kind: &WorkerKind) -> bool {
        self.idle_of_kind(kind).is_some()
    }

    fn idle_of_kind(&self, kind: &WorkerKind) -> Option<SlotId> {
        self.slots
            .values()
            .find(|entry| !entry.busy && entry.slot.kind() == kind)
            .map(|entry| entry.slot.id())
    }

    /// Availability signals of every busy slot of `kind`.
    pub fn availability_of_kind(&self, kind: &WorkerKind) -> Vec<AvailabilitySignal> {
        self.slots
            .values()
            .filter(|entry| entry.busy && entry.slot.kind() == kind)
            .map(|entry| entry.availability.signal.clone())
            .collect()
    }

    /// Idle slot of `kind` that a termination request would remove.
    pub fn terminable(&self, kind: &WorkerKind, order: TerminateOrder) -> Option<SlotId> {
        let mut idle = self
            .slots
            .values()
            .filter(|entry| !entry.busy && entry.slot.kind() == kind)
            .map(|entry| entry.slot.id());

        match order {
            TerminateOrder::Oldest => idle.next(),
            TerminateOrder::Newest => idle.next_back(),
        }
    }

    pub fn snapshots(&self) -> Vec<SlotSnapshot> {
        self.slots.values().map(SlotEntry::snapshot).collect()
    }

    pub fn snapshots_of_kind(&self, kind: &WorkerKind) -> Vec<SlotSnapshot> {
        self.slots
            .values()
            .filter(|entry| entry.slot.kind() == kind)
            .map(SlotEntry::snapshot)
            .collect()
    }
}
