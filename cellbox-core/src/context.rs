//! Producer context identity.
//!
//! A producer context is the expensive, long-lived runtime object a producer
//! function reads from (a world, a generator, a loaded region set). The
//! engine never inspects it; it only needs a stable identity for batching
//! and key scoping, and a way to derive a coordinate's namespace.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::key::{Coord, Namespace};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a producer context.
///
/// Contexts are compared by identity, not value: two contexts with equal
/// contents still get distinct ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextId(u64);

impl ContextId {
    /// Allocates a process-unique id.
    pub fn fresh() -> Self {
        Self(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wraps an id assigned by the embedding application.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw id.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// External object supplying the state a producer function needs.
pub trait ProducerContext: Send + Sync + 'static {
    /// Stable identity of this context for its whole lifetime.
    fn context_id(&self) -> ContextId;

    /// Canonical namespace of the cells this context produces.
    fn namespace(&self) -> Namespace;

    /// Builds a coordinate in this context's namespace.
    fn coord(&self, x: i32, z: i32) -> Coord {
        Coord::new(self.namespace(), x, z)
    }
}
