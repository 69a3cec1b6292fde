//! `replica_shared`
//!
//! Network entity replication core shared by servers and clients.
//!
//! Design goals:
//! - One world per host, driven by one fixed-period thread, no internal locks.
//! - Transport-agnostic: everything leaves through the `Connection` trait.
//! - Per (entity, peer) ordering; stale packets are dropped, never applied.
//! - No `unsafe`.

pub mod config;
pub mod entity;
pub mod error;
pub mod event;
pub mod interest;
pub mod math;
pub mod net;
pub mod replication;
pub mod role;
pub mod rpc;
pub mod serializer;
pub mod subscriber;
pub mod timed_thread;
pub mod world;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::config::*;
    pub use crate::entity::*;
    pub use crate::error::*;
    pub use crate::event::*;
    pub use crate::interest::*;
    pub use crate::math::*;
    pub use crate::net::*;
    pub use crate::replication::*;
    pub use crate::role::*;
    pub use crate::rpc::*;
    pub use crate::timed_thread::*;
    pub use crate::world::*;
}
