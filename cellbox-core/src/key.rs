//! Cell key types and construction.
//!
//! This module provides the value types that identify a cacheable artifact:
//!
//! - [`Kind`] - Which artifact family a key belongs to (one cache group per kind)
//! - [`Namespace`] - Canonical dimension identifier scoping a coordinate
//! - [`Coord`] - A signed `(x, z)` cell position inside a namespace
//! - [`CellKey`] - The full `(kind, context, coord)` key
//!
//! ## Canonical Form
//!
//! Namespaces are normalized on construction: surrounding whitespace is
//! trimmed, ASCII letters are lowercased, and a bare path without a domain
//! gets the default domain `world`. Two spellings of the same dimension
//! therefore always produce equal keys.
//!
//! ```
//! use cellbox_core::{Coord, Namespace};
//!
//! assert_eq!(Namespace::new(" Nether "), Namespace::new("world:nether"));
//!
//! let origin = Coord::new("overworld", 33, -17);
//! assert_eq!(origin.offset(1, 1), Coord::new("world:overworld", 34, -16));
//! assert_eq!(origin.region(4), Coord::new("overworld", 2, -2));
//! ```
//!
//! ## Display
//!
//! Keys render as `{kind}@{namespace}[{x},{z}]#{context}`, e.g.
//! `heightmap@world:overworld[3,-7]#12`.

use std::fmt;

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::context::ContextId;

/// Domain assigned to namespaces written without one.
pub const DEFAULT_DOMAIN: &str = "world";

/// Artifact family identifier.
///
/// Every kind owns an independent cache group with its own TTL and entry
/// cap. Short kind names (≤23 bytes) are stored inline without allocation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Kind(SmolStr);

impl Kind {
    /// Creates a new kind.
    #[inline]
    pub fn new(name: impl Into<SmolStr>) -> Self {
        Self(name.into())
    }

    /// Creates a kind from a static string (no allocation).
    #[inline]
    pub const fn new_static(name: &'static str) -> Self {
        Self(SmolStr::new_static(name))
    }

    /// Returns the kind as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for Kind {
    #[inline]
    fn from(s: &str) -> Self {
        Self(SmolStr::new(s))
    }
}

impl From<String> for Kind {
    #[inline]
    fn from(s: String) -> Self {
        Self(SmolStr::from(s))
    }
}

impl AsRef<str> for Kind {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Canonical dimension identifier.
///
/// Always of the form `domain:path`, lowercase, without surrounding
/// whitespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Namespace(SmolStr);

impl Namespace {
    /// Normalizes `raw` into its canonical form.
    pub fn new(raw: impl AsRef<str>) -> Self {
        let trimmed = raw.as_ref().trim();
        let needs_lowering = trimmed.bytes().any(|b| b.is_ascii_uppercase());
        let has_domain = trimmed.contains(':');

        if !needs_lowering && has_domain {
            return Self(SmolStr::new(trimmed));
        }

        let lowered = if needs_lowering {
            trimmed.to_ascii_lowercase()
        } else {
            trimmed.to_owned()
        };

        if has_domain {
            Self(SmolStr::from(lowered))
        } else {
            Self(SmolStr::from(format!("{DEFAULT_DOMAIN}:{lowered}")))
        }
    }

    /// Returns the canonical string.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the domain part (before `:`).
    pub fn domain(&self) -> &str {
        self.0.split_once(':').map_or(DEFAULT_DOMAIN, |(domain, _)| domain)
    }

    /// Returns the path part (after `:`).
    pub fn path(&self) -> &str {
        self.0.split_once(':').map_or(self.0.as_str(), |(_, path)| path)
    }
}

impl<'de> Deserialize<'de> for Namespace {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = SmolStr::deserialize(deserializer)?;
        Ok(Namespace::new(raw))
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for Namespace {
    fn from(s: &str) -> Self {
        Namespace::new(s)
    }
}

/// A cell position scoped to a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coord {
    namespace: Namespace,
    x: i32,
    z: i32,
}

impl Coord {
    /// Creates a coordinate, normalizing the namespace.
    pub fn new(namespace: impl Into<Namespace>, x: i32, z: i32) -> Self {
        Self {
            namespace: namespace.into(),
            x,
            z,
        }
    }

    /// Namespace this coordinate lives in.
    #[inline]
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// X position.
    #[inline]
    pub fn x(&self) -> i32 {
        self.x
    }

    /// Z position.
    #[inline]
    pub fn z(&self) -> i32 {
        self.z
    }

    /// Coordinate shifted by `(dx, dz)` in the same namespace.
    pub fn offset(&self, dx: i32, dz: i32) -> Self {
        Self {
            namespace: self.namespace.clone(),
            x: self.x.wrapping_add(dx),
            z: self.z.wrapping_add(dz),
        }
    }

    /// Coordinate of the region containing this cell, where a region spans
    /// `2^shift` cells per axis. Negative positions round toward negative
    /// infinity.
    pub fn region(&self, shift: u32) -> Self {
        let shift = shift.min(31);
        Self {
            namespace: self.namespace.clone(),
            x: self.x >> shift,
            z: self.z >> shift,
        }
    }

    /// Whether this coordinate lies in the `width × depth` rectangle whose
    /// lowest corner is `origin`. Coordinates in other namespaces never match.
    pub fn within(&self, origin: &Coord, width: u32, depth: u32) -> bool {
        if self.namespace != origin.namespace {
            return false;
        }
        let dx = i64::from(self.x) - i64::from(origin.x);
        let dz = i64::from(self.z) - i64::from(origin.z);
        (0..i64::from(width)).contains(&dx) && (0..i64::from(depth)).contains(&dz)
    }
}

impl fmt::Display for Coord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{},{}]", self.namespace, self.x, self.z)
    }
}

/// Key identifying one cacheable artifact.
///
/// Compared by value: two keys built from equal parts are equal regardless
/// of how the coordinate was derived.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CellKey {
    kind: Kind,
    context: ContextId,
    coord: Coord,
}

impl CellKey {
    /// Creates a new key.
    pub fn new(kind: impl Into<Kind>, context: ContextId, coord: Coord) -> Self {
        Self {
            kind: kind.into(),
            context,
            coord,
        }
    }

    /// Artifact family.
    #[inline]
    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    /// Owning producer context.
    #[inline]
    pub fn context(&self) -> ContextId {
        self.context
    }

    /// Spatial coordinate.
    #[inline]
    pub fn coord(&self) -> &Coord {
        &self.coord
    }

    /// Same kind and context, different coordinate.
    pub fn with_coord(&self, coord: Coord) -> Self {
        Self {
            kind: self.kind.clone(),
            context: self.context,
            coord,
        }
    }

    /// Same context and coordinate, different kind.
    pub fn with_kind(&self, kind: impl Into<Kind>) -> Self {
        Self {
            kind: kind.into(),
            context: self.context,
            coord: self.coord.clone(),
        }
    }
}

impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}#{}", self.kind, self.coord, self.context)
    }
}
