//! Per-kind FIFO of acquisitions waiting for a slot.
//!
//! A kind's queue exists exactly while a fulfillment task is serving it:
//! `enqueue` reports when a fresh queue was opened (the caller starts the
//! task), and the task retires the queue once it drains.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::context::ContextSpawner;
use crate::kind::WorkerKind;

use super::slot::SlotLease;
use super::{PoolError, WorkerPool};

pub(crate) type Grant = Result<SlotLease, PoolError>;

/// Queue-side half of a waiting acquisition.
pub(crate) struct WaitTicket {
    seq: u64,
    grant: oneshot::Sender<Grant>,
    abandoned: CancellationToken,
    spawner: Arc<dyn ContextSpawner>,
}

impl WaitTicket {
    /// Spawner to use if this waiter is served with a new context.
    pub fn spawner(&self) -> &dyn ContextSpawner {
        self.spawner.as_ref()
    }

    fn is_live(&self) -> bool {
        !self.abandoned.is_cancelled() && !self.grant.is_closed()
    }

    /// Hand the outcome to the waiter. A lease the waiter can no longer
    /// receive is dropped here, which returns its slot to the pool.
    pub fn fulfill(self, grant: Grant) {
        if let Err(Ok(lease)) = self.grant.send(grant) {
            tracing::warn!(slot = %lease.id(), "Waiter left before its grant; releasing slot");
        }
    }
}

/// Caller-side half of a waiting acquisition.
///
/// Dropping it before the grant arrives marks the ticket abandoned.
pub(crate) struct PendingTicket {
    grant: oneshot::Receiver<Grant>,
    abandon_on_drop: DropGuard,
}

impl PendingTicket {
    pub async fn wait(self) -> Grant {
        let Self {
            grant,
            abandon_on_drop,
        } = self;

        let received = grant.await;
        abandon_on_drop.disarm();
        match received {
            Ok(grant) => grant,
            Err(_) => Err(PoolError::QueueClosed),
        }
    }
}

#[derive(Default)]
pub(crate) struct WaitQueue {
    queues: HashMap<WorkerKind, VecDeque<WaitTicket>>,
    next_seq: u64,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a ticket for `kind`. The flag is true when this opened the
    /// kind's queue and a fulfillment task must be started.
    pub fn enqueue(
        &mut self,
        kind: &WorkerKind,
        spawner: Arc<dyn ContextSpawner>,
    ) -> (PendingTicket, bool) {
        let (tx, rx) = oneshot::channel();
        let abandoned = CancellationToken::new();
        let ticket = WaitTicket {
            seq: self.next_seq,
            grant: tx,
            abandoned: abandoned.clone(),
            spawner,
        };
        self.next_seq += 1;

        let opened = !self.queues.contains_key(kind);
        self.queues.entry(kind.clone()).or_default().push_back(ticket);

        let pending = PendingTicket {
            grant: rx,
            abandon_on_drop: abandoned.drop_guard(),
        };
        (pending, opened)
    }

    /// True when no live ticket of any kind is waiting.
    pub fn is_empty(&self) -> bool {
        !self.queues.values().flatten().any(WaitTicket::is_live)
    }

    pub fn has_waiters(&self, kind: &WorkerKind) -> bool {
        self.waiting(kind) > 0
    }

    pub fn waiting(&self, kind: &WorkerKind) -> usize {
        self.queues
            .get(kind)
            .map_or(0, |queue| queue.iter().filter(|t| t.is_live()).count())
    }

    /// Drop abandoned tickets from the head of `kind`'s queue.
    ///
    /// Returns how many were dropped and the live head's abandonment token.
    pub fn prune(&mut self, kind: &WorkerKind) -> (usize, Option<CancellationToken>) {
        let Some(queue) = self.queues.get_mut(kind) else {
            return (0, None);
        };

        let mut pruned = 0;
        while queue.front().is_some_and(|ticket| !ticket.is_live()) {
            queue.pop_front();
            pruned += 1;
        }
        if pruned > 0 {
            tracing::debug!(%kind, pruned, "Dropped abandoned wait tickets");
        }

        let head = queue.front().map(|ticket| ticket.abandoned.clone());
        (pruned, head)
    }

    /// Kind whose first live ticket has waited longest across all kinds.
    pub fn oldest_kind(&self) -> Option<&WorkerKind> {
        self.queues
            .iter()
            .filter_map(|(kind, queue)| {
                queue
                    .iter()
                    .find(|ticket| ticket.is_live())
                    .map(|ticket| (ticket.seq, kind))
            })
            .min_by_key(|(seq, _)| *seq)
            .map(|(_, kind)| kind)
    }

    pub fn pop(&mut self, kind: &WorkerKind) -> Option<WaitTicket> {
        self.queues.get_mut(kind)?.pop_front()
    }

    /// Remove `kind`'s queue if it holds no tickets.
    pub fn retire(&mut self, kind: &WorkerKind) -> bool {
        if self.queues.get(kind).is_some_and(VecDeque::is_empty) {
            self.queues.remove(kind);
            return true;
        }
        false
    }

    /// Live waiters per kind, for status reporting.
    pub fn counts(&self) -> BTreeMap<String, usize> {
        self.queues
            .keys()
            .map(|kind| (kind.to_string(), self.waiting(kind)))
            .filter(|(_, waiting)| *waiting > 0)
            .collect()
    }
}

/// Serve `kind`'s queue in order until it drains.
pub(super) async fn fulfill(pool: Arc<WorkerPool>, kind: WorkerKind) {
    tracing::debug!(%kind, "Wait queue opened");
    while let Some((ticket, grant)) = pool.wait_for_availability(&kind).await {
        ticket.fulfill(grant);
    }
    tracing::debug!(%kind, "Wait queue drained");
}
