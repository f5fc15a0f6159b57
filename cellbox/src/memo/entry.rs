use std::time::Duration;

use tokio::time::Instant;

/// Observable state of a memo key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Nothing usable is recorded.
    Absent,
    /// A computation holds the key's claim.
    InFlight,
    /// A fresh artifact is available.
    Ready,
    /// The last computation failed and its backoff has not elapsed.
    Failed,
}

/// Stored state of a memo key. `Absent` is never stored.
#[derive(Debug, Clone)]
pub(super) enum Entry<A> {
    InFlight {
        claim: u64,
        since: Instant,
    },
    Ready {
        artifact: A,
        inserted_at: Instant,
        last_access: Instant,
        size_hint: usize,
    },
    Failed {
        retry_at: Instant,
    },
}

impl<A> Entry<A> {
    /// State as seen by a lookup at `now` for a kind with time-to-live
    /// `ttl`. Expired `Ready` and elapsed `Failed` read as `Absent`.
    pub(super) fn state(&self, now: Instant, ttl: Duration) -> EntryState {
        match self {
            Entry::InFlight { .. } => EntryState::InFlight,
            Entry::Ready { inserted_at, .. } if now.saturating_duration_since(*inserted_at) < ttl => {
                EntryState::Ready
            }
            Entry::Failed { retry_at } if now < *retry_at => EntryState::Failed,
            _ => EntryState::Absent,
        }
    }

    /// Whether a prune pass may drop this entry.
    pub(super) fn is_stale(&self, now: Instant, ttl: Duration) -> bool {
        self.state(now, ttl) == EntryState::Absent
    }

    /// Size estimate of a `Ready` artifact.
    pub(super) fn ready_size(&self) -> Option<usize> {
        match self {
            Entry::Ready { size_hint, .. } => Some(*size_hint),
            _ => None,
        }
    }

    pub(super) fn holds_claim(&self, id: u64) -> bool {
        matches!(self, Entry::InFlight { claim, .. } if *claim == id)
    }
}
