//! # tierfs-core
//!
//! Core shared library for the tierfs distributed file store.
//! Provides the framed, multiplexed connection every role speaks, the
//! acceptor that hands out handshaken connections, the per-connection
//! serve loop, a connection registry and client helpers.

pub mod acceptor;
pub mod client;
pub mod connection;
pub mod handler;
pub mod net;
pub mod registry;

pub use acceptor::Acceptor;
pub use connection::{Connection, ConnectionConfig};
pub use handler::{serve, ConnectionHandler};
pub use registry::ConnRegistry;
