//! Persistent-tier keys.
//!
//! A [`DiskKey`] is a sanitized string derived from `(kind, namespace, x, z)`.
//! Context identity is not part of it: contexts are runtime objects and do
//! not survive a restart, while persisted artifacts do.
//!
//! ASCII letters, digits, `.` and `-` are kept; every other byte becomes `_`
//! followed by two hex digits, so distinct cells never share a disk key.
//!
//! | Cell key | Disk key |
//! |----------|----------|
//! | `heightmap@world:overworld[3,-7]#12` | `heightmap/world_3aoverworld/3_-7` |
//! | `Biome Map@mod:deep caves[0,0]#1` | `Biome_20Map/mod_3adeep_20caves/0_0` |

use std::fmt;

use cellbox_core::{CellKey, Kind, Namespace};
use smol_str::SmolStr;

/// Sanitized persistent-tier key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DiskKey(SmolStr);

impl DiskKey {
    /// Builds the disk key for a cell key.
    pub fn from_cell(key: &CellKey) -> Self {
        let coord = key.coord();
        Self::from_parts(key.kind(), coord.namespace(), coord.x(), coord.z())
    }

    /// Builds a disk key from its parts.
    pub fn from_parts(kind: &Kind, namespace: &Namespace, x: i32, z: i32) -> Self {
        let mut out = String::with_capacity(kind.as_str().len() + namespace.as_str().len() + 16);
        push_sanitized(&mut out, kind.as_str());
        out.push('/');
        push_sanitized(&mut out, namespace.as_str());
        out.push('/');
        out.push_str(&x.to_string());
        out.push('_');
        out.push_str(&z.to_string());
        Self(SmolStr::from(out))
    }

    /// Returns the key as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the key bytes, as stored.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl From<&CellKey> for DiskKey {
    fn from(key: &CellKey) -> Self {
        Self::from_cell(key)
    }
}

impl fmt::Display for DiskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Keeps `[A-Za-z0-9.-]` and escapes every other byte as `_xx`.
fn push_sanitized(out: &mut String, raw: &str) {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    for byte in raw.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'-' => out.push(char::from(byte)),
            _ => {
                out.push('_');
                out.push(char::from(HEX[usize::from(byte >> 4)]));
                out.push(char::from(HEX[usize::from(byte & 0x0f)]));
            }
        }
    }
}
