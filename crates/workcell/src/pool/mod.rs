//! Kind-aware pool of execution contexts.
//!
//! - `registry`: live slots, their busy flags and availability signals
//! - `queue`: per-kind FIFO of waiting acquisitions and the task serving it
//! - `scheduler`: the pool itself (reuse, create, or queue)
//! - `invocations`: per-slot invocation counts and idle timers
//! - `slot`: slot handles and the lease that returns a slot on drop
//!
//! All pool state sits behind one mutex that is never held across an await.

mod invocations;
mod queue;
mod registry;
mod scheduler;
mod slot;

pub use scheduler::{
    LOGICAL_PROCESSORS_ENV, PoolConfig, PoolError, TerminateOrder, WorkerPool, ceiling_for,
};
pub use slot::SlotLease;

pub(crate) use invocations::{InvocationCounter, InvocationTable};
