//! workcell: bounded, kind-aware pool of reusable parallel execution contexts.

mod status;
mod timer;

pub mod context;
pub mod kind;
pub mod pool;
pub mod runner;
pub mod telemetry;
pub mod thread;

#[cfg(test)]
mod testing;

pub use context::{ContextSpawner, ExecutionContext, InvokeError, SpawnError};
pub use kind::{SlotId, WorkerKind};
pub use pool::{PoolConfig, PoolError, SlotLease, TerminateOrder, WorkerPool, ceiling_for};
pub use runner::{RunError, Runner, RunnerConfig};
pub use status::{PoolSnapshot, PoolStatus, SlotSnapshot};
pub use telemetry::init_tracing;
pub use thread::{Operations, ThreadSpawner};
pub use timer::{IdleTimer, TimerState};
