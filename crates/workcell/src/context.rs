//! Execution contexts and the spawners that create them.
//!
//! The pool never looks inside a context: it only spawns one per slot, hands
//! it to the lease holder for `invoke`, and calls `destroy` when the slot is
//! removed.

use std::sync::Arc;

use async_trait::async_trait;

use crate::kind::WorkerKind;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn execution context: {0}")]
    Io(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvokeError {
    #[error("operation `{0}` is not defined")]
    UnknownOperation(String),
    #[error("operation failed: {0}")]
    Failed(String),
    #[error("execution context disconnected")]
    Disconnected,
}

/// A parallel execution context with a remote-callable interface.
#[async_trait]
pub trait ExecutionContext: Send + Sync {
    /// Call `operation` with `args` and wait for its result.
    async fn invoke(
        &self,
        operation: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, InvokeError>;

    /// Best-effort teardown. Must not block.
    fn destroy(&self);
}

/// Extension point for different execution context strategies.
pub trait ContextSpawner: Send + Sync {
    fn spawn(&self, kind: &WorkerKind) -> Result<Arc<dyn ExecutionContext>, SpawnError>;
}

impl<F> ContextSpawner for F
where
    F: Fn(&WorkerKind) -> Result<Arc<dyn ExecutionContext>, SpawnError> + Send + Sync,
{
    fn spawn(&self, kind: &WorkerKind) -> Result<Arc<dyn ExecutionContext>, SpawnError> {
        self(kind)
    }
}
