//! `replica_server`
//!
//! Authoritative host for a replication world:
//! - UDP transport implementing `Connection` per peer
//! - `Hello`/`Welcome` handshake on the control channel
//! - Replication frames forwarded to the world inbox
//!
//! The world itself runs on a `TimedThread`; this crate only moves bytes.

pub mod demo;
pub mod server;

pub use server::ReplicaServer;
