//! Admission control for the worker pool.
//!
//! An acquisition is served in one of three ways, checked in order under the
//! pool lock:
//!
//! 1. reuse an idle slot of the same kind (only if no one of that kind is
//!    already waiting),
//! 2. create a new slot (only if nobody of any kind is waiting and the pool is
//!    below its ceiling),
//! 3. join the kind's wait queue.
//!
//! Each non-empty wait queue is served by one fulfillment task. It hands its
//! head ticket either a released slot of the same kind or, when capacity
//! opens up and its head is the oldest waiter overall, a freshly created slot.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::sync::watch;

use crate::context::{ContextSpawner, SpawnError};
use crate::kind::{SlotId, WorkerKind};
use crate::status::{PoolSnapshot, SlotSnapshot};

use super::InvocationTable;
use super::queue::{self, WaitQueue, WaitTicket};
use super::registry::{Removal, SlotRegistry};
use super::slot::{Slot, SlotLease};

/// Environment variable overriding the detected logical processor count.
pub const LOGICAL_PROCESSORS_ENV: &str = "WORKCELL_LOGICAL_PROCESSORS";

/// Maximum live slots for a host reporting `reported` logical processors.
///
/// One processor is left for the coordinating thread. A report of zero means
/// the count is unknown and is treated as two.
pub fn ceiling_for(reported: usize) -> usize {
    let reported = if reported == 0 { 2 } else { reported };
    (reported - 1).max(1)
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Logical processor count; detected from the host when unset.
    pub logical_processors: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let logical_processors = std::env::var(LOGICAL_PROCESSORS_ENV)
            .ok()
            .and_then(|value| value.trim().parse().ok());
        Self { logical_processors }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_logical_processors(mut self, count: usize) -> Self {
        self.logical_processors = Some(count);
        self
    }

    pub fn ceiling(&self) -> usize {
        ceiling_for(self.logical_processors.unwrap_or_else(num_cpus::get))
    }
}

/// Which idle slot a termination request removes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TerminateOrder {
    #[default]
    Oldest,
    Newest,
}

impl From<&str> for TerminateOrder {
    fn from(order: &str) -> Self {
        if order.eq_ignore_ascii_case("oldest") {
            TerminateOrder::Oldest
        } else {
            TerminateOrder::Newest
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("no idle slot of kind {kind} to terminate")]
    NothingToTerminate { kind: WorkerKind },
    #[error("wait queue closed before a slot was granted")]
    QueueClosed,
}

struct PoolState {
    registry: SlotRegistry,
    queue: WaitQueue,
}

/// Bounded, kind-aware pool of execution contexts.
pub struct WorkerPool {
    state: StdMutex<PoolState>,
    /// Bumped whenever capacity may have opened up for a waiting kind.
    opened: watch::Sender<u64>,
    invocations: InvocationTable,
    ceiling: usize,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Arc<Self> {
        let ceiling = config.ceiling();
        tracing::info!(ceiling, "Worker pool created");

        let (opened, _) = watch::channel(0);
        Arc::new(Self {
            state: StdMutex::new(PoolState {
                registry: SlotRegistry::new(),
                queue: WaitQueue::new(),
            }),
            opened,
            invocations: InvocationTable::default(),
            ceiling,
        })
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Pool state mutex poisoned - recovering");
            poisoned.into_inner()
        })
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Invocation counts and idle timers, shared by every runner on this pool.
    pub(crate) fn invocations(&self) -> &InvocationTable {
        &self.invocations
    }

    /// Number of live slots, busy or idle.
    pub fn live(&self) -> usize {
        self.state().registry.len()
    }

    /// Number of acquisitions of `kind` waiting for a slot.
    pub fn waiting(&self, kind: &WorkerKind) -> usize {
        self.state().queue.waiting(kind)
    }

    pub fn slots(&self) -> Vec<SlotSnapshot> {
        self.state().registry.snapshots()
    }

    pub fn slots_of_kind(&self, kind: &WorkerKind) -> Vec<SlotSnapshot> {
        self.state().registry.snapshots_of_kind(kind)
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.state();
        PoolSnapshot::new(
            self.ceiling,
            state.registry.snapshots(),
            state.queue.counts(),
        )
    }

    /// Obtain exclusive use of a slot of `kind`.
    ///
    /// Resolves once a slot is granted. `spawner` is used if a new context
    /// has to be created for this request, including after it has queued.
    /// Dropping the returned future before it
    /// resolves withdraws the request.
    pub async fn acquire(
        self: &Arc<Self>,
        kind: &WorkerKind,
        spawner: Arc<dyn ContextSpawner>,
    ) -> Result<SlotLease, PoolError> {
        let pending = {
            let mut state = self.state();

            if !state.queue.has_waiters(kind)
                && let Some(slot) = state.registry.claim_idle(kind)
            {
                tracing::debug!(slot = %slot.id(), %kind, "Reusing idle slot");
                return Ok(SlotLease::new(slot, Arc::clone(self)));
            }

            if state.queue.is_empty() && state.registry.len() < self.ceiling {
                let slot = state.registry.create(kind, spawner.as_ref())?;
                tracing::info!(
                    slot = %slot.id(),
                    %kind,
                    live = state.registry.len(),
                    ceiling = self.ceiling,
                    "Created slot"
                );
                return Ok(SlotLease::new(slot, Arc::clone(self)));
            }

            let (pending, opened) = state.queue.enqueue(kind, spawner);
            tracing::debug!(
                %kind,
                waiting = state.queue.waiting(kind),
                live = state.registry.len(),
                "No slot available, queueing"
            );
            if opened {
                tokio::spawn(queue::fulfill(Arc::clone(self), kind.clone()));
            }
            pending
        };

        pending.wait().await
    }

    /// Wait until `kind`'s head ticket can be granted and pop it.
    ///
    /// Returns `None` once the queue has drained; the queue is retired under
    /// the same lock so a later acquisition opens a fresh one.
    pub(super) async fn wait_for_availability(
        self: &Arc<Self>,
        kind: &WorkerKind,
    ) -> Option<(WaitTicket, Result<SlotLease, PoolError>)> {
        loop {
            // Subscribe before checking so a signal sent in between is seen.
            let mut opened = self.opened.subscribe();

            let (signals, abandoned) = {
                let mut state = self.state();

                let (pruned, head) = state.queue.prune(kind);
                if pruned > 0 {
                    self.nudge_waiters(&state);
                }
                let Some(abandoned) = head else {
                    state.queue.retire(kind);
                    return None;
                };

                if let Some((ticket, grant)) = self.grant_head(&mut state, kind) {
                    self.nudge_waiters(&state);
                    let grant = grant.map(|slot| SlotLease::new(slot, Arc::clone(self)));
                    return Some((ticket, grant));
                }

                (state.registry.availability_of_kind(kind), abandoned)
            };

            let mut released: FuturesUnordered<_> = signals.into_iter().collect();
            tokio::select! {
                biased;
                Some(_) = released.next() => {}
                _ = opened.changed() => {}
                _ = abandoned.cancelled() => {}
            }
        }
    }

    /// Pop and serve `kind`'s head ticket if a slot can be had right now.
    ///
    /// A new context is spawned with the spawner the ticket was queued with.
    fn grant_head(
        &self,
        state: &mut PoolState,
        kind: &WorkerKind,
    ) -> Option<(WaitTicket, Result<Slot, PoolError>)> {
        let reuse = state.registry.has_idle(kind);
        let create = !reuse
            && state.registry.len() < self.ceiling
            && state.queue.oldest_kind() == Some(kind);
        if !reuse && !create {
            return None;
        }

        let ticket = state.queue.pop(kind)?;
        let grant = match state.registry.claim_idle(kind) {
            Some(slot) => {
                tracing::debug!(slot = %slot.id(), %kind, "Handing released slot to waiter");
                Ok(slot)
            }
            None => match state.registry.create(kind, ticket.spawner()) {
                Ok(slot) => {
                    tracing::info!(
                        slot = %slot.id(),
                        %kind,
                        live = state.registry.len(),
                        ceiling = self.ceiling,
                        "Created slot for waiter"
                    );
                    Ok(slot)
                }
                Err(e) => {
                    tracing::warn!(%kind, error = %e, "Failed to spawn context for waiter");
                    Err(PoolError::from(e))
                }
            },
        };
        Some((ticket, grant))
    }

    /// Wake other kinds' fulfillers if capacity is free and someone waits.
    fn nudge_waiters(&self, state: &PoolState) {
        if !state.queue.is_empty() && state.registry.len() < self.ceiling {
            self.signal_opened();
        }
    }

    fn signal_opened(&self) {
        self.opened.send_modify(|n| *n = n.wrapping_add(1));
    }

    /// Mark a busy slot idle. Called when its lease is dropped.
    pub(crate) fn release_slot(&self, id: SlotId) {
        if self.state().registry.mark_available(id) {
            tracing::debug!(slot = %id, "Slot released");
        }
    }

    /// Remove an idle slot and destroy its context.
    ///
    /// Returns false if the slot is busy or no longer registered.
    pub fn remove(&self, id: SlotId) -> bool {
        let (removal, live) = {
            let mut state = self.state();
            let removal = state.registry.remove(id);
            (removal, state.registry.len())
        };

        match removal {
            Removal::Removed(slot) => {
                self.invocations.forget(id);
                tracing::info!(slot = %id, kind = %slot.kind(), live, "Removed slot");
                self.signal_opened();
                true
            }
            Removal::Busy => {
                tracing::debug!(slot = %id, "Slot busy, not removing");
                false
            }
            Removal::Missing => false,
        }
    }

    /// Remove one idle slot of `kind`, picked by `order`.
    pub fn terminate(&self, kind: &WorkerKind, order: TerminateOrder) -> Result<SlotId, PoolError> {
        let removed = {
            let mut state = self.state();
            state
                .registry
                .terminable(kind, order)
                .map(|id| (id, state.registry.remove(id)))
        };

        match removed {
            Some((id, Removal::Removed(_))) => {
                self.invocations.forget(id);
                tracing::info!(slot = %id, %kind, ?order, "Terminated slot");
                self.signal_opened();
                Ok(id)
            }
            _ => {
                tracing::warn!(%kind, ?order, "No idle slot to terminate");
                Err(PoolError::NothingToTerminate { kind: kind.clone() })
            }
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("ceiling", &self.ceiling)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::PoolStatus;
    use crate::testing::{MockSpawner, settle};
    use std::sync::Mutex;

    fn pool(logical_processors: usize) -> Arc<WorkerPool> {
        WorkerPool::new(PoolConfig::new().with_logical_processors(logical_processors))
    }

    #[test]
    fn ceiling_leaves_one_processor() {
        assert_eq!(ceiling_for(0), 1);
        assert_eq!(ceiling_for(1), 1);
        assert_eq!(ceiling_for(2), 1);
        assert_eq!(ceiling_for(4), 3);
        assert_eq!(ceiling_for(16), 15);
        assert!(PoolConfig { logical_processors: None }.ceiling() >= 1);
    }

    #[test]
    fn terminate_order_parses_loosely() {
        assert_eq!(TerminateOrder::from("oldest"), TerminateOrder::Oldest);
        assert_eq!(TerminateOrder::from("OLDEST"), TerminateOrder::Oldest);
        assert_eq!(TerminateOrder::from("newest"), TerminateOrder::Newest);
        assert_eq!(TerminateOrder::from("whatever"), TerminateOrder::Newest);
        assert_eq!(TerminateOrder::default(), TerminateOrder::Oldest);
    }

    #[tokio::test]
    async fn creates_up_to_ceiling_then_queues() {
        let pool = pool(3);
        let spawner = MockSpawner::new();
        let kind = WorkerKind::from("a");

        let first = pool.acquire(&kind, spawner.clone()).await.unwrap();
        let second = pool.acquire(&kind, spawner.clone()).await.unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(pool.snapshot().status, PoolStatus::Saturated);

        let waiter = tokio::spawn({
            let pool = Arc::clone(&pool);
            let spawner = spawner.clone();
            let kind = kind.clone();
            async move { pool.acquire(&kind, spawner).await.map(|lease| lease.id()) }
        });
        settle(|| pool.waiting(&kind) == 1).await;

        drop(second);
        let granted = waiter.await.unwrap().unwrap();
        assert_eq!(granted, SlotId::new(1));
        assert_eq!(spawner.spawned(), 2);
        assert_eq!(pool.waiting(&kind), 0);
    }

    #[tokio::test]
    async fn waiters_of_one_kind_are_served_in_order() {
        let pool = pool(2);
        let spawner = MockSpawner::new();
        let kind = WorkerKind::from("a");
        let order = Arc::new(Mutex::new(Vec::new()));

        let held = pool.acquire(&kind, spawner.clone()).await.unwrap();

        let mut waiters = Vec::new();
        for (i, label) in ["A", "B", "C"].into_iter().enumerate() {
            waiters.push(tokio::spawn({
                let pool = Arc::clone(&pool);
                let spawner = spawner.clone();
                let kind = kind.clone();
                let order = Arc::clone(&order);
                async move {
                    let lease = pool.acquire(&kind, spawner).await.unwrap();
                    order.lock().unwrap().push(label);
                    drop(lease);
                }
            }));
            settle(|| pool.waiting(&kind) == i + 1).await;
        }

        drop(held);
        for waiter in waiters {
            waiter.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), ["A", "B", "C"]);
        assert_eq!(spawner.spawned(), 1);
    }

    #[tokio::test]
    async fn removing_a_slot_hands_capacity_to_another_kind() {
        let pool = pool(2);
        let spawner = MockSpawner::new();
        let x = WorkerKind::from("x");
        let y = WorkerKind::from("y");

        let lease = pool.acquire(&x, spawner.clone()).await.unwrap();
        let x_slot = lease.id();

        let waiter = tokio::spawn({
            let pool = Arc::clone(&pool);
            let spawner = spawner.clone();
            let y = y.clone();
            async move { pool.acquire(&y, spawner).await.map(|lease| lease.kind().clone()) }
        });
        settle(|| pool.waiting(&y) == 1).await;

        // An idle slot of another kind is not reused.
        drop(lease);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(pool.waiting(&y), 1);
        assert_eq!(pool.live(), 1);

        assert!(pool.remove(x_slot));
        assert_eq!(waiter.await.unwrap().unwrap(), y);
        assert_eq!(spawner.spawned(), 2);
        assert_eq!(spawner.destroyed(), 1);
        assert_eq!(pool.live(), 1);
    }

    #[tokio::test]
    async fn own_kind_reuse_ignores_other_waiters() {
        let pool = pool(2);
        let spawner = MockSpawner::new();
        let x = WorkerKind::from("x");
        let y = WorkerKind::from("y");

        let lease = pool.acquire(&x, spawner.clone()).await.unwrap();
        let x_slot = lease.id();
        drop(lease);

        let _queued = tokio::spawn({
            let pool = Arc::clone(&pool);
            let spawner = spawner.clone();
            let y = y.clone();
            async move { pool.acquire(&y, spawner).await.map(|lease| lease.id()) }
        });
        settle(|| pool.waiting(&y) == 1).await;

        let reused = pool.acquire(&x, spawner.clone()).await.unwrap();
        assert_eq!(reused.id(), x_slot);
        assert_eq!(spawner.spawned(), 1);
    }

    #[tokio::test]
    async fn queued_waiters_spawn_with_their_own_spawner() {
        let pool = pool(2);
        let holder = MockSpawner::new();
        let broken = MockSpawner::failing();
        let healthy = MockSpawner::new();
        let x = WorkerKind::from("x");
        let y = WorkerKind::from("y");

        let lease = pool.acquire(&x, holder.clone()).await.unwrap();
        let x_slot = lease.id();

        let mut waiters = Vec::new();
        for (i, spawner) in [broken.clone(), healthy.clone()].into_iter().enumerate() {
            waiters.push(tokio::spawn({
                let pool = Arc::clone(&pool);
                let y = y.clone();
                async move { pool.acquire(&y, spawner).await.map(|lease| lease.id()) }
            }));
            settle(|| pool.waiting(&y) == i + 1).await;
        }

        drop(lease);
        assert!(pool.remove(x_slot));

        let mut outcomes = Vec::new();
        for waiter in waiters {
            outcomes.push(waiter.await.unwrap());
        }
        assert!(matches!(outcomes[0], Err(PoolError::Spawn(_))));
        assert!(outcomes[1].is_ok());
        assert_eq!(healthy.spawned(), 1);
        assert_eq!(healthy.kinds(), [y]);
        assert_eq!(holder.spawned(), 1);
    }

    #[tokio::test]
    async fn failed_spawn_leaves_no_slot() {
        let pool = pool(3);
        let spawner = MockSpawner::failing();
        let kind = WorkerKind::from("a");

        let err = pool.acquire(&kind, spawner.clone()).await.unwrap_err();
        assert!(matches!(err, PoolError::Spawn(_)));
        assert_eq!(pool.live(), 0);

        spawner.set_failing(false);
        let lease = pool.acquire(&kind, spawner.clone()).await.unwrap();
        assert_eq!(lease.id(), SlotId::new(0));
    }

    #[tokio::test]
    async fn failed_spawn_reaches_the_waiter() {
        let pool = pool(2);
        let healthy = MockSpawner::new();
        let broken = MockSpawner::failing();
        let x = WorkerKind::from("x");
        let y = WorkerKind::from("y");

        let lease = pool.acquire(&x, healthy.clone()).await.unwrap();
        let x_slot = lease.id();

        let waiter = tokio::spawn({
            let pool = Arc::clone(&pool);
            let broken = broken.clone();
            let y = y.clone();
            async move { pool.acquire(&y, broken).await.map(|lease| lease.id()) }
        });
        settle(|| pool.waiting(&y) == 1).await;

        drop(lease);
        assert!(pool.remove(x_slot));

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, PoolError::Spawn(_)));
        assert_eq!(pool.live(), 0);
        assert_eq!(pool.snapshot().status, PoolStatus::Empty);
    }

    #[tokio::test]
    async fn abandoned_waiter_is_skipped() {
        let pool = pool(2);
        let spawner = MockSpawner::new();
        let kind = WorkerKind::from("a");

        let lease = pool.acquire(&kind, spawner.clone()).await.unwrap();
        let id = lease.id();

        let waiter = tokio::spawn({
            let pool = Arc::clone(&pool);
            let spawner = spawner.clone();
            let kind = kind.clone();
            async move { pool.acquire(&kind, spawner).await.map(|lease| lease.id()) }
        });
        settle(|| pool.waiting(&kind) == 1).await;

        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());
        assert_eq!(pool.waiting(&kind), 0);

        drop(lease);
        settle(|| !pool.slots()[0].busy).await;

        let again = pool.acquire(&kind, spawner.clone()).await.unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(spawner.spawned(), 1);
    }

    #[tokio::test]
    async fn remove_refuses_busy_slot() {
        let pool = pool(3);
        let spawner = MockSpawner::new();
        let lease = pool
            .acquire(&WorkerKind::from("a"), spawner.clone())
            .await
            .unwrap();

        assert!(!pool.remove(lease.id()));
        let id = lease.id();
        drop(lease);
        assert!(pool.remove(id));
        assert!(!pool.remove(id));
        assert_eq!(spawner.destroyed(), 1);
    }

    #[tokio::test]
    async fn terminate_picks_oldest_or_newest_idle_slot() {
        let pool = pool(4);
        let spawner = MockSpawner::new();
        let kind = WorkerKind::from("b");

        let leases = vec![
            pool.acquire(&kind, spawner.clone()).await.unwrap(),
            pool.acquire(&kind, spawner.clone()).await.unwrap(),
            pool.acquire(&kind, spawner.clone()).await.unwrap(),
        ];

        let err = pool.terminate(&kind, TerminateOrder::Oldest).unwrap_err();
        assert!(matches!(err, PoolError::NothingToTerminate { .. }));

        drop(leases);
        assert_eq!(pool.terminate(&kind, TerminateOrder::Oldest).unwrap(), SlotId::new(0));
        assert_eq!(pool.terminate(&kind, TerminateOrder::Newest).unwrap(), SlotId::new(2));
        assert_eq!(pool.live(), 1);
        assert_eq!(spawner.destroyed(), 2);

        let err = pool
            .terminate(&WorkerKind::from("other"), TerminateOrder::Oldest)
            .unwrap_err();
        assert_eq!(err.to_string(), "no idle slot of kind other to terminate");
    }

    #[tokio::test]
    async fn snapshot_reports_waiters() {
        let pool = pool(2);
        let spawner = MockSpawner::new();
        let kind = WorkerKind::from("a");

        let _lease = pool.acquire(&kind, spawner.clone()).await.unwrap();
        let _waiter = tokio::spawn({
            let pool = Arc::clone(&pool);
            let spawner = spawner.clone();
            let kind = kind.clone();
            async move { pool.acquire(&kind, spawner).await.map(|lease| lease.id()) }
        });
        settle(|| pool.waiting(&kind) == 1).await;

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.status, PoolStatus::Saturated);
        assert_eq!(snapshot.live, 1);
        assert_eq!(snapshot.busy, 1);
        assert_eq!(snapshot.waiting.get("a"), Some(&1));
    }
}
