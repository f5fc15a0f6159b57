#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod backend;
mod error;

pub use backend::{FeOxDbStore, FeOxDbStoreBuilder};
pub use error::FeOxDbError;
