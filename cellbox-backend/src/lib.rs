#![warn(missing_docs)]
//! Persistent-tier contract for cellbox.
//!
//! If you want to back the engine with your own storage, you are in the
//! right place: implement [`PersistentStore`] over any local key-value or
//! file-backed medium. Keys arrive already sanitized as [`DiskKey`]s and
//! values as opaque blobs produced by [`ArtifactFormat`].

mod error;
pub mod format;
mod key;
mod store;

use std::fmt;

pub use error::{FormatError, StoreError};
pub use format::{ArtifactFormat, Decoded};
pub use key::DiskKey;
pub use store::{PersistentStore, StoreResult};

use smol_str::SmolStr;

/// Status of a delete.
#[derive(Debug, PartialEq, Eq)]
pub enum DeleteStatus {
    /// Record successfully deleted.
    Deleted(u32),
    /// Record already missing.
    Missing,
}

/// Label identifying a persistent store in logs and stats.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct StoreLabel(SmolStr);

impl StoreLabel {
    /// Creates a new label.
    #[inline]
    pub fn new(s: impl Into<SmolStr>) -> Self {
        Self(s.into())
    }

    /// Creates a label from a static string (no allocation).
    #[inline]
    pub const fn new_static(s: &'static str) -> Self {
        Self(SmolStr::new_static(s))
    }

    /// Returns the label as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoreLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for StoreLabel {
    #[inline]
    fn from(s: &str) -> Self {
        Self(SmolStr::new(s))
    }
}

impl From<String> for StoreLabel {
    #[inline]
    fn from(s: String) -> Self {
        Self(SmolStr::from(s))
    }
}
