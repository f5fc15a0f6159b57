#![warn(missing_docs)]
//! # cellbox-core
//!
//! Core types for the cellbox adaptive compute cache.
//!
//! This crate holds the value types every other cellbox crate agrees on:
//!
//! - **Keys** ([`CellKey`], [`Kind`], [`Coord`], [`Namespace`]) - canonical,
//!   cheap-to-clone identifiers of per-cell artifacts
//! - **Contexts** ([`ProducerContext`], [`ContextId`]) - identity-compared
//!   owners of producer state
//! - **Artifacts** ([`Artifact`]) - the computed values being cached
//! - **Host feedback** ([`HostFeedback`], [`AcceleratorGate`]) - the live
//!   signals the engine adapts to

pub mod artifact;
pub mod context;
pub mod feedback;
pub mod key;

pub use artifact::Artifact;
pub use context::{ContextId, ProducerContext};
pub use feedback::{AcceleratorGate, Admission, HostFeedback, IdleHost, ManualFeedback};
pub use key::{CellKey, Coord, DEFAULT_DOMAIN, Kind, Namespace};
#[doc(hidden)]
pub use smol_str::SmolStr;

/// Raw byte data used for serialized artifacts.
/// Using `Bytes` provides cheap cloning via reference counting.
pub type Raw = bytes::Bytes;
