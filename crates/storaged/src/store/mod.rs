//! On-disk storage engine.
//!
//! A [`Store`] is one root directory holding files in a `XX/XX` bucket
//! tree. A [`StoreGroup`] is a tier (hot or cold): several stores sharing
//! one file-handle namespace, with new files placed round-robin across the
//! stores that still have room.

pub mod common;
pub mod disk;
pub mod group;

pub use common::ScanEntry;
pub use disk::{Store, Target};
pub use group::StoreGroup;
