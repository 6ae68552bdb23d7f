//! Identifiers for workload kinds and pool slots.

use std::sync::Arc;

use serde::{Serialize, Serializer};

/// Workload category that a slot is specialized for.
///
/// Slots of the same kind are interchangeable; slots of different kinds are
/// never handed to each other's callers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerKind(Arc<str>);

impl WorkerKind {
    pub fn new(name: impl Into<String>) -> Self {
        Self(Arc::from(name.into()))
    }

    /// A kind no other caller can collide with.
    ///
    /// UUID v4 keeps runners created from the same spawner from sharing slots.
    pub fn unique() -> Self {
        Self::new(format!("kind-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WorkerKind {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for WorkerKind {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for WorkerKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// Ordinal identifier of a slot.
///
/// Assigned in creation order by the pool and never reused, so a lower id is
/// always an older slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SlotId(u64);

impl SlotId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
