//! Thread-backed execution contexts.
//!
//! Each context owns one OS thread that drains a job channel and dispatches
//! every job to a shared table of named operations. Replies travel back over
//! a oneshot channel, so callers await them like any other remote call.
//!
//! Operation failures and panics are reported to the caller; the thread keeps
//! serving. `destroy` closes the job channel and the thread exits once its
//! current job is done.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::context::{ContextSpawner, ExecutionContext, InvokeError, SpawnError};
use crate::kind::WorkerKind;

type Operation = dyn Fn(Vec<Value>) -> anyhow::Result<Value> + Send + Sync;

/// Table of operations a thread-backed context can run, by name.
#[derive(Clone, Default)]
pub struct Operations {
    table: HashMap<String, Arc<Operation>>,
}

impl Operations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<F>(mut self, name: impl Into<String>, operation: F) -> Self
    where
        F: Fn(Vec<Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.table.insert(name.into(), Arc::new(operation));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.contains_key(name)
    }

    fn dispatch(&self, name: &str, args: Vec<Value>) -> Result<Value, InvokeError> {
        let Some(operation) = self.table.get(name) else {
            return Err(InvokeError::UnknownOperation(name.to_string()));
        };

        match std::panic::catch_unwind(AssertUnwindSafe(|| operation(args))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(InvokeError::Failed(format!("{e:#}"))),
            Err(_) => {
                tracing::error!(operation = %name, "Operation panicked");
                Err(InvokeError::Failed(format!("operation `{name}` panicked")))
            }
        }
    }
}

struct Job {
    operation: String,
    args: Vec<Value>,
    reply: oneshot::Sender<Result<Value, InvokeError>>,
}

/// Spawns one dedicated OS thread per execution context.
pub struct ThreadSpawner {
    operations: Arc<Operations>,
    spawned: AtomicU64,
}

impl ThreadSpawner {
    pub fn new(operations: Operations) -> Self {
        Self {
            operations: Arc::new(operations),
            spawned: AtomicU64::new(0),
        }
    }

    /// Number of contexts spawned so far.
    pub fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::Acquire)
    }
}

impl ContextSpawner for ThreadSpawner {
    fn spawn(&self, kind: &WorkerKind) -> Result<Arc<dyn ExecutionContext>, SpawnError> {
        let serial = self.spawned.fetch_add(1, Ordering::AcqRel);
        let name = format!("workcell-{kind}-{serial}");
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel::<Job>();
        let operations = Arc::clone(&self.operations);

        std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || serve_jobs(jobs_rx, operations))?;

        tracing::debug!(thread = %name, "Spawned execution context thread");

        Ok(Arc::new(ThreadContext {
            name,
            jobs: StdMutex::new(Some(jobs_tx)),
        }))
    }
}

fn serve_jobs(mut jobs: mpsc::UnboundedReceiver<Job>, operations: Arc<Operations>) {
    while let Some(job) = jobs.blocking_recv() {
        let result = operations.dispatch(&job.operation, job.args);
        if job.reply.send(result).is_err() {
            tracing::debug!(operation = %job.operation, "Caller went away before reply");
        }
    }
    tracing::debug!("Execution context thread exiting");
}

/// Handle to one thread-backed context.
pub struct ThreadContext {
    name: String,
    jobs: StdMutex<Option<mpsc::UnboundedSender<Job>>>,
}

#[async_trait]
impl ExecutionContext for ThreadContext {
    async fn invoke(&self, operation: &str, args: Vec<Value>) -> Result<Value, InvokeError> {
        let sender = self
            .jobs
            .lock()
            .ok()
            .and_then(|jobs| jobs.clone())
            .ok_or(InvokeError::Disconnected)?;

        let (reply, response) = oneshot::channel();
        sender
            .send(Job {
                operation: operation.to_string(),
                args,
                reply,
            })
            .map_err(|_| InvokeError::Disconnected)?;

        response.await.map_err(|_| InvokeError::Disconnected)?
    }

    fn destroy(&self) {
        if let Ok(mut jobs) = self.jobs.lock()
            && jobs.take().is_some()
        {
            tracing::debug!(thread = %self.name, "Closing execution context");
        }
    }
}
