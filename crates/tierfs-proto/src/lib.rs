//! # tierfs-proto
//!
//! Protocol types, constants, and data structures for the tierfs
//! distributed file store.
//!
//! This crate defines the frame header codec, command ids, status codes,
//! payload messages and the error type shared by the master, storage
//! nodes and clients.

pub mod command;
pub mod constants;
pub mod defaults;
pub mod error;
pub mod frame;
pub mod msg;
pub mod node;

// Re-export commonly used types at the crate root
pub use command::Command;
pub use error::{FsError, FsResult};
pub use frame::{Frame, FrameHeader, FrameKind};
pub use node::{Role, StorageNode};
