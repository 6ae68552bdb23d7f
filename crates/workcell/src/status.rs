//! Point-in-time view of the pool, for logs and status endpoints.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::kind::{SlotId, WorkerKind};

/// Overall pool state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PoolStatus {
    /// No live slots
    Empty,
    /// A slot is idle or capacity remains
    Ready,
    /// At the ceiling with every slot busy
    Saturated,
}

impl PoolStatus {
    pub fn from_counts(ceiling: usize, live: usize, busy: usize) -> Self {
        if live == 0 {
            PoolStatus::Empty
        } else if live >= ceiling && busy >= live {
            PoolStatus::Saturated
        } else {
            PoolStatus::Ready
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SlotSnapshot {
    pub id: SlotId,
    pub kind: WorkerKind,
    pub busy: bool,
    /// When the slot was created (RFC 3339).
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub status: PoolStatus,
    pub ceiling: usize,
    pub live: usize,
    pub busy: usize,
    /// Waiting acquisitions per kind; kinds with none are omitted.
    pub waiting: BTreeMap<String, usize>,
    pub slots: Vec<SlotSnapshot>,
}

impl PoolSnapshot {
    pub(crate) fn new(
        ceiling: usize,
        slots: Vec<SlotSnapshot>,
        waiting: BTreeMap<String, usize>,
    ) -> Self {
        let live = slots.len();
        let busy = slots.iter().filter(|slot| slot.busy).count();
        Self {
            status: PoolStatus::from_counts(ceiling, live, busy),
            ceiling,
            live,
            busy,
            waiting,
            slots,
        }
    }

    pub fn idle(&self) -> usize {
        self.live - self.busy
    }

    pub fn is_saturated(&self) -> bool {
        self.status == PoolStatus::Saturated
    }
}
