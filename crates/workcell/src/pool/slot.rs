//! Slot handles and the lease that holds one exclusively.

use std::sync::Arc;

use crate::context::{ExecutionContext, InvokeError};
use crate::kind::{SlotId, WorkerKind};

use super::WorkerPool;

/// One live execution context owned by the pool.
#[derive(Clone)]
pub struct Slot {
    id: SlotId,
    kind: WorkerKind,
    context: Arc<dyn ExecutionContext>,
}

impl Slot {
    pub(crate) fn new(id: SlotId, kind: WorkerKind, context: Arc<dyn ExecutionContext>) -> Self {
        Self { id, kind, context }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn kind(&self) -> &WorkerKind {
        &self.kind
    }

    pub(crate) fn context(&self) -> &Arc<dyn ExecutionContext> {
        &self.context
    }
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Exclusive hold on a busy slot.
///
/// On drop: the slot is marked idle and becomes available to the next
/// acquirer of its kind.
pub struct SlotLease {
    slot: Slot,
    pool: Arc<WorkerPool>,
}

impl SlotLease {
    pub(crate) fn new(slot: Slot, pool: Arc<WorkerPool>) -> Self {
        Self { slot, pool }
    }

    pub fn id(&self) -> SlotId {
        self.slot.id()
    }

    pub fn kind(&self) -> &WorkerKind {
        self.slot.kind()
    }

    /// Call an operation on the leased context.
    pub async fn invoke(
        &self,
        operation: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, InvokeError> {
        self.slot.context().invoke(operation, args).await
    }

    /// Return the slot to the pool now.
    pub fn release(self) {
        drop(self);
    }
}

impl std::fmt::Debug for SlotLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotLease").field("slot", &self.slot).finish()
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        self.pool.release_slot(self.slot.id());
    }
}
