//! Replication notifications.
//!
//! A small typed event bus. The world pushes events while it applies inbound
//! packets; the simulation layer drains them between ticks.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
};

use crate::{entity::NetworkEntityId, net::ConnectionId, role::NetworkRole};

/// Properties of an entity were overwritten by an inbound packet.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyChanged {
    pub entity: NetworkEntityId,
    pub names: Vec<String>,
}

/// A proxy instance was created from a full-state record.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityReplicated {
    pub entity: NetworkEntityId,
    pub role: NetworkRole,
    pub connection: ConnectionId,
}

/// A proxy instance was torn down because its peer stopped replicating it.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRemoved {
    pub entity: NetworkEntityId,
    pub connection: ConnectionId,
}

/// Typed event bus.
#[derive(Default)]
pub struct EventBus {
    queues: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl EventBus {
    /// Pushes an event into the queue.
    pub fn push<E: 'static + Send + Sync>(&mut self, e: E) {
        let q = self
            .queues
            .entry(TypeId::of::<E>())
            .or_insert_with(|| Box::new(Vec::<E>::new()));
        if let Some(q) = q.downcast_mut::<Vec<E>>() {
            q.push(e);
        }
    }

    /// Drains all queued events of a type.
    pub fn drain<E: 'static + Send + Sync>(&mut self) -> Vec<E> {
        self.queues
            .remove(&TypeId::of::<E>())
            .and_then(|boxed| boxed.downcast::<Vec<E>>().ok())
            .map(|boxed| *boxed)
            .unwrap_or_default()
    }

    /// Number of queued events of a type.
    pub fn len<E: 'static + Send + Sync>(&self) -> usize {
        self.queues
            .get(&TypeId::of::<E>())
            .and_then(|boxed| boxed.downcast_ref::<Vec<E>>())
            .map_or(0, Vec::len)
    }
}
