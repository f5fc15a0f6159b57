//! The artifact trait.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// An expensive, immutable computed value associated with a key.
///
/// Artifacts are cloned out of the cache on every hit, so large artifacts
/// should wrap their payload in an `Arc`. They must be serializable so the
/// persistent tier can hold them.
pub trait Artifact: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Approximate in-memory footprint in bytes, used for budget accounting.
    fn size_hint(&self) -> usize {
        std::mem::size_of::<Self>()
    }
}

impl Artifact for Vec<u8> {
    fn size_hint(&self) -> usize {
        std::mem::size_of::<Self>() + self.len()
    }
}

impl Artifact for String {
    fn size_hint(&self) -> usize {
        std::mem::size_of::<Self>() + self.len()
    }
}

macro_rules! fixed_size_artifact {
    ($($ty:ty),*) => {
        $(impl Artifact for $ty {})*
    };
}

fixed_size_artifact!(u32, u64, i32, i64, f32, f64);
