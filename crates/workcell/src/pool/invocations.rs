//! Per-slot invocation counts and idle timers.
//!
//! The table belongs to the pool, so every runner that lands on a slot sees
//! the same counter and the same armed timer, whatever runner armed it.

use std::time::Duration;

use dashmap::DashMap;

use crate::kind::SlotId;
use crate::timer::IdleTimer;

#[derive(Debug, Default)]
pub(crate) struct InvocationCounter {
    pub count: usize,
    pub timer: IdleTimer,
}

impl InvocationCounter {
    /// Disarm the idle timer and count one more invocation.
    pub fn begin(&mut self) {
        self.timer.stop();
        self.count += 1;
    }

    /// Count one invocation out. True when none are left.
    pub fn finish(&mut self) -> bool {
        self.count = self.count.saturating_sub(1);
        self.count == 0
    }
}

#[derive(Debug, Default)]
pub(crate) struct InvocationTable {
    counters: DashMap<SlotId, InvocationCounter>,
}

impl InvocationTable {
    pub fn begin(&self, id: SlotId) {
        self.counters.entry(id).or_default().begin();
    }

    /// Count an invocation on `id` out. When it was the last one and `idle`
    /// is set, `on_idle` runs after that long unless `begin` comes first.
    pub fn finish<F>(&self, id: SlotId, idle: Option<Duration>, on_idle: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(mut counter) = self.counters.get_mut(&id) else {
            return;
        };
        if !counter.finish() {
            return;
        }
        if let Some(idle) = idle {
            counter.timer.start(idle, on_idle);
            tracing::debug!(slot = %id, ?idle, "Idle timer armed");
        }
    }

    pub fn count(&self, id: SlotId) -> usize {
        self.counters.get(&id).map_or(0, |counter| counter.count)
    }

    #[cfg(test)]
    pub fn is_armed(&self, id: SlotId) -> bool {
        self.counters
            .get(&id)
            .is_some_and(|counter| counter.timer.is_armed())
    }

    /// Drop `id`'s counter and disarm its timer. Called once the slot is gone.
    pub fn forget(&self, id: SlotId) {
        self.counters.remove(&id);
    }
}
