//! Host feedback signals.
//!
//! The engine adapts to the host it runs inside. Two read-only signals are
//! consumed:
//!
//! - [`HostFeedback`] - smoothed step duration plus a coarse memory signal
//! - [`AcceleratorGate`] - an optional capacity check for an external
//!   accelerator resource that decides whether an artifact may be held in
//!   memory at all
//!
//! [`ManualFeedback`] is a settable implementation for embedding code that
//! samples the host itself, and for tests.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live load signals from the host.
pub trait HostFeedback: Send + Sync {
    /// Smoothed duration of one host step, in milliseconds.
    fn smoothed_tick_ms(&self) -> f64;

    /// Coarse memory usage in `0.0..=1.0`, where `1.0` is the host's ceiling.
    fn memory_pressure(&self) -> f64 {
        0.0
    }
}

/// Feedback for a host that never reports load.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdleHost;

impl HostFeedback for IdleHost {
    fn smoothed_tick_ms(&self) -> f64 {
        0.0
    }
}

/// Feedback whose values are pushed by the embedding application.
#[derive(Debug, Default)]
pub struct ManualFeedback {
    tick_ms: AtomicU64,
    memory: AtomicU64,
}

impl ManualFeedback {
    /// Creates feedback reporting an idle host.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the latest smoothed step duration.
    pub fn set_tick_ms(&self, tick_ms: f64) {
        self.tick_ms.store(tick_ms.max(0.0).to_bits(), Ordering::Relaxed);
    }

    /// Records the latest memory usage fraction.
    pub fn set_memory_pressure(&self, fraction: f64) {
        self.memory
            .store(fraction.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }
}

impl HostFeedback for ManualFeedback {
    fn smoothed_tick_ms(&self) -> f64 {
        f64::from_bits(self.tick_ms.load(Ordering::Relaxed))
    }

    fn memory_pressure(&self) -> f64 {
        f64::from_bits(self.memory.load(Ordering::Relaxed))
    }
}

/// Outcome of an accelerator capacity check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Admission {
    /// Whether the artifact may be held in memory.
    pub accepted: bool,
    /// Current utilization of the accelerator resource in `0.0..=1.0`.
    pub utilization: f32,
}

impl Admission {
    /// An accepting admission at the given utilization.
    pub fn accept(utilization: f32) -> Self {
        Self {
            accepted: true,
            utilization,
        }
    }

    /// A rejecting admission at the given utilization.
    pub fn reject(utilization: f32) -> Self {
        Self {
            accepted: false,
            utilization,
        }
    }
}

/// Capacity check for an external accelerator resource.
pub trait AcceleratorGate: Send + Sync {
    /// Decides whether an artifact of roughly `bytes` bytes may be cached in
    /// memory.
    fn admit(&self, bytes: usize) -> Admission;
}
