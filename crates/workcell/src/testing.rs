//! Test doubles for execution contexts.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::context::{ContextSpawner, ExecutionContext, InvokeError, SpawnError};
use crate::kind::WorkerKind;

#[derive(Default)]
struct Counters {
    spawned: AtomicUsize,
    destroyed: AtomicUsize,
    max_live: AtomicUsize,
    /// Most invocations ever observed in flight on a single context.
    max_overlap: AtomicUsize,
}

/// Spawner that records what the pool does with its contexts.
///
/// Contexts understand `echo` (returns the args), `whoami` (returns the
/// context serial), `sleep` (sleeps `args[0]` ms, then returns the serial)
/// and `fail` (always fails).
#[derive(Default)]
pub(crate) struct MockSpawner {
    counters: Arc<Counters>,
    failing: AtomicBool,
    kinds: Mutex<Vec<WorkerKind>>,
}

impl MockSpawner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let spawner = Self::new();
        spawner.set_failing(true);
        spawner
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn spawned(&self) -> usize {
        self.counters.spawned.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.counters.destroyed.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.counters.max_live.load(Ordering::SeqCst)
    }

    pub fn max_overlap(&self) -> usize {
        self.counters.max_overlap.load(Ordering::SeqCst)
    }

    /// Kinds in spawn order.
    pub fn kinds(&self) -> Vec<WorkerKind> {
        self.kinds.lock().unwrap().clone()
    }
}

impl ContextSpawner for MockSpawner {
    fn spawn(&self, kind: &WorkerKind) -> Result<Arc<dyn ExecutionContext>, SpawnError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SpawnError::Other("mock spawner refused".to_string()));
        }

        let serial = self.counters.spawned.fetch_add(1, Ordering::SeqCst);
        let live = serial + 1 - self.counters.destroyed.load(Ordering::SeqCst);
        self.counters.max_live.fetch_max(live, Ordering::SeqCst);
        self.kinds.lock().unwrap().push(kind.clone());

        Ok(Arc::new(MockContext {
            serial,
            counters: Arc::clone(&self.counters),
            in_flight: Arc::new(AtomicUsize::new(0)),
            destroyed: AtomicBool::new(false),
        }))
    }
}

struct MockContext {
    serial: usize,
    counters: Arc<Counters>,
    in_flight: Arc<AtomicUsize>,
    destroyed: AtomicBool,
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ExecutionContext for MockContext {
    async fn invoke(&self, operation: &str, args: Vec<Value>) -> Result<Value, InvokeError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(InvokeError::Disconnected);
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_overlap.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(Arc::clone(&self.in_flight));

        match operation {
            "echo" => Ok(Value::Array(args)),
            "whoami" => Ok(json!(self.serial)),
            "sleep" => {
                let ms = args.first().and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!(self.serial))
            }
            "fail" => Err(InvokeError::Failed("mock failure".to_string())),
            other => Err(InvokeError::UnknownOperation(other.to_string())),
        }
    }

    fn destroy(&self) {
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            self.counters.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Yield to other tasks until `condition` holds.
///
/// Does not advance a paused clock: the calling task never goes idle.
pub(crate) async fn settle(mut condition: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached after 1000 yields");
}
