//! Caller-facing runner: runs operations on pooled contexts of one kind.
//!
//! - Per-slot invocation counts, kept by the pool so runners sharing a kind
//!   share them
//! - Idle teardown: a slot whose count drops to zero is removed from the pool
//!   after `RunnerConfig::idle`, unless another invocation lands on it first.
//!   The runner whose invocation ended last sets the delay
//! - Dedicated mode (`concurrence = false`): one private context, outside the
//!   pool, shared by every call

use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;

use crate::context::{ContextSpawner, ExecutionContext, InvokeError};
use crate::kind::{SlotId, WorkerKind};
use crate::pool::{InvocationCounter, PoolError, TerminateOrder, WorkerPool};

/// Environment variable overriding the default idle duration, in milliseconds.
pub const IDLE_MS_ENV: &str = "WORKCELL_IDLE_MS";

const DEFAULT_IDLE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// How long a slot may sit unused before it is removed.
    pub idle: Duration,
    pub terminate_after_idle: bool,
    /// Run on pooled slots (true) or on one dedicated context (false).
    pub concurrence: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            idle: idle_from_env(std::env::var(IDLE_MS_ENV).ok().as_deref()),
            terminate_after_idle: true,
            concurrence: true,
        }
    }
}

impl RunnerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_idle(mut self, idle: Duration) -> Self {
        self.idle = idle;
        self
    }

    pub fn with_terminate_after_idle(mut self, enabled: bool) -> Self {
        self.terminate_after_idle = enabled;
        self
    }

    pub fn with_concurrence(mut self, enabled: bool) -> Self {
        self.concurrence = enabled;
        self
    }
}

fn idle_from_env(value: Option<&str>) -> Duration {
    value
        .and_then(|ms| ms.trim().parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_IDLE)
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("`{operation}` failed: {source}")]
    Invoke {
        operation: String,
        #[source]
        source: InvokeError,
    },
}

struct DedicatedContext {
    generation: u64,
    context: Arc<dyn ExecutionContext>,
    counter: InvocationCounter,
}

#[derive(Default)]
struct Dedicated {
    current: Option<DedicatedContext>,
    generations: u64,
}

fn lock_dedicated(dedicated: &StdMutex<Dedicated>) -> MutexGuard<'_, Dedicated> {
    dedicated.lock().unwrap_or_else(|poisoned| {
        tracing::error!("Dedicated context mutex poisoned - recovering");
        poisoned.into_inner()
    })
}

/// Runs operations for one worker kind.
pub struct Runner {
    pool: Arc<WorkerPool>,
    kind: WorkerKind,
    spawner: Arc<dyn ContextSpawner>,
    config: RunnerConfig,
    dedicated: Arc<StdMutex<Dedicated>>,
}

impl Runner {
    /// Create a runner with a kind of its own.
    pub fn new(
        pool: Arc<WorkerPool>,
        spawner: Arc<dyn ContextSpawner>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            pool,
            kind: WorkerKind::unique(),
            spawner,
            config,
            dedicated: Arc::new(StdMutex::new(Dedicated::default())),
        }
    }

    /// Share slots with every runner using the same kind.
    pub fn with_kind(mut self, kind: WorkerKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn kind(&self) -> &WorkerKind {
        &self.kind
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Invocations currently running on this runner's kind, counting those
    /// of other runners sharing it.
    pub fn in_flight(&self) -> usize {
        let invocations = self.pool.invocations();
        let pooled: usize = self
            .pool
            .slots_of_kind(&self.kind)
            .iter()
            .map(|slot| invocations.count(slot.id))
            .sum();
        let dedicated = lock_dedicated(&self.dedicated)
            .current
            .as_ref()
            .map_or(0, |current| current.counter.count);
        pooled + dedicated
    }

    /// Run `operation` with `args` on a context of this runner's kind.
    pub async fn run(&self, operation: &str, args: Vec<Value>) -> Result<Value, RunError> {
        if !self.config.concurrence {
            return self.run_dedicated(operation, args).await;
        }

        let lease = self
            .pool
            .acquire(&self.kind, Arc::clone(&self.spawner))
            .await?;
        // Dropped before the lease: the idle timer is armed, then the slot is released.
        let _invocation = self.begin(lease.id());

        tracing::trace!(slot = %lease.id(), kind = %self.kind, %operation, "Invoking");
        lease
            .invoke(operation, args)
            .await
            .map_err(|source| RunError::Invoke {
                operation: operation.to_string(),
                source,
            })
    }

    fn begin(&self, id: SlotId) -> InvocationGuard<'_> {
        self.pool.invocations().begin(id);
        InvocationGuard { runner: self, id }
    }

    fn finish(&self, id: SlotId) {
        let idle = self.config.terminate_after_idle.then_some(self.config.idle);
        let pool = Arc::downgrade(&self.pool);
        self.pool.invocations().finish(id, idle, move || {
            if let Some(pool) = pool.upgrade()
                && pool.remove(id)
            {
                tracing::debug!(slot = %id, "Idle slot shut down");
            }
        });
    }

    async fn run_dedicated(&self, operation: &str, args: Vec<Value>) -> Result<Value, RunError> {
        let (context, generation) = self.begin_dedicated()?;
        let _invocation = DedicatedGuard {
            runner: self,
            generation,
        };

        context
            .invoke(operation, args)
            .await
            .map_err(|source| RunError::Invoke {
                operation: operation.to_string(),
                source,
            })
    }

    fn begin_dedicated(&self) -> Result<(Arc<dyn ExecutionContext>, u64), PoolError> {
        let mut dedicated = lock_dedicated(&self.dedicated);
        let state = &mut *dedicated;

        let current = match state.current.take() {
            Some(current) => current,
            None => {
                let context = self.spawner.spawn(&self.kind)?;
                state.generations += 1;
                tracing::info!(kind = %self.kind, generation = state.generations, "Spawned dedicated context");
                DedicatedContext {
                    generation: state.generations,
                    context,
                    counter: InvocationCounter::default(),
                }
            }
        };

        let current = state.current.insert(current);
        current.counter.begin();
        Ok((Arc::clone(&current.context), current.generation))
    }

    fn finish_dedicated(&self, generation: u64) {
        let mut dedicated = lock_dedicated(&self.dedicated);
        let Some(current) = dedicated
            .current
            .as_mut()
            .filter(|current| current.generation == generation)
        else {
            return;
        };

        if !current.counter.finish() || !self.config.terminate_after_idle {
            return;
        }

        let slot = Arc::clone(&self.dedicated);
        current.counter.timer.start(self.config.idle, move || {
            let expired = {
                let mut dedicated = lock_dedicated(&slot);
                let idle = dedicated.current.as_ref().is_some_and(|current| {
                    current.generation == generation && current.counter.count == 0
                });
                if idle { dedicated.current.take() } else { None }
            };
            if let Some(expired) = expired {
                expired.context.destroy();
                tracing::debug!(generation, "Idle dedicated context shut down");
            }
        });
    }

    /// Remove one idle context of this runner's kind.
    ///
    /// In pooled mode `order` picks among idle slots. In dedicated mode the
    /// private context is destroyed if nothing is running on it.
    pub fn terminate(&self, order: TerminateOrder) -> Result<(), PoolError> {
        if !self.config.concurrence {
            return self.terminate_dedicated();
        }

        self.pool.terminate(&self.kind, order)?;
        Ok(())
    }

    fn terminate_dedicated(&self) -> Result<(), PoolError> {
        let expired = {
            let mut dedicated = lock_dedicated(&self.dedicated);
            let idle = dedicated
                .current
                .as_ref()
                .is_some_and(|current| current.counter.count == 0);
            if idle { dedicated.current.take() } else { None }
        };

        match expired {
            Some(expired) => {
                expired.context.destroy();
                tracing::info!(kind = %self.kind, "Terminated dedicated context");
                Ok(())
            }
            None => Err(PoolError::NothingToTerminate {
                kind: self.kind.clone(),
            }),
        }
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("kind", &self.kind)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Ends a pooled invocation on drop, including when the caller gives up.
struct InvocationGuard<'a> {
    runner: &'a Runner,
    id: SlotId,
}

impl Drop for InvocationGuard<'_> {
    fn drop(&mut self) {
        self.runner.finish(self.id);
    }
}

struct DedicatedGuard<'a> {
    runner: &'a Runner,
    generation: u64,
}

impl Drop for DedicatedGuard<'_> {
    fn drop(&mut self) {
        self.runner.finish_dedicated(self.generation);
    }
}
