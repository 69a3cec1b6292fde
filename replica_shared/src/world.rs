//! Replication world.
//!
//! Owns every piece of replication state for one host: entities, interest,
//! RPC queues and one [`EntityReplicationManager`] per connection. The world
//! is driven by a single thread (usually a [`TimedThread`]); other threads
//! reach it only through a [`WorldHandle`], whose commands are drained at the
//! start of each tick.
//!
//! [`TimedThread`]: crate::timed_thread::TimedThread

use std::{collections::BTreeMap, time::Duration};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    config::ReplicationConfig,
    entity::{EntityStore, EntityTypeId, NetworkEntity, NetworkEntityId},
    error::{ReplicationError, ReplicationResult},
    event::{EntityRemoved, EventBus},
    interest::InterestManager,
    net::{Connection, ConnectionId},
    replication::{EntityReplicationManager, PacketReport, ReplicationMode},
    role::NetworkRole,
    rpc::{RpcDispatcher, RpcEnvelope, RpcInvocation, RpcRoute},
    subscriber::TimeMs,
    timed_thread::TimedTask,
};

/// Control-plane input for a world.
pub enum WorldCommand {
    Connect {
        connection: Box<dyn Connection>,
        mode: ReplicationMode,
    },
    Disconnect(ConnectionId),
    Inbound {
        connection: ConnectionId,
        frame: Bytes,
    },
    /// Arbitrary mutation, run on the tick thread.
    Run(Box<dyn FnOnce(&mut ReplicationWorld) + Send>),
}

/// Cloneable sender side of a world's inbox.
#[derive(Clone)]
pub struct WorldHandle {
    tx: mpsc::UnboundedSender<WorldCommand>,
}

impl WorldHandle {
    pub fn send(&self, cmd: WorldCommand) -> anyhow::Result<()> {
        self.tx
            .send(cmd)
            .map_err(|_| anyhow::anyhow!("replication world has shut down"))
    }

    pub fn connect(&self, connection: Box<dyn Connection>, mode: ReplicationMode) -> anyhow::Result<()> {
        self.send(WorldCommand::Connect { connection, mode })
    }

    pub fn disconnect(&self, connection: ConnectionId) -> anyhow::Result<()> {
        self.send(WorldCommand::Disconnect(connection))
    }

    pub fn inbound(&self, connection: ConnectionId, frame: Bytes) -> anyhow::Result<()> {
        self.send(WorldCommand::Inbound { connection, frame })
    }

    pub fn run<F>(&self, f: F) -> anyhow::Result<()>
    where
        F: FnOnce(&mut ReplicationWorld) + Send + 'static,
    {
        self.send(WorldCommand::Run(Box::new(f)))
    }
}

/// Per-tick simulation hook, run after inbound traffic and before sending.
pub type System = Box<dyn FnMut(&mut ReplicationWorld, Duration) + Send>;

struct ConnectionSlot {
    conn: Box<dyn Connection>,
    manager: EntityReplicationManager,
}

struct Subscribers<'a>(&'a BTreeMap<ConnectionId, ConnectionSlot>);

impl RpcRoute for Subscribers<'_> {
    fn subscribers(&self, entity: NetworkEntityId) -> Vec<(ConnectionId, NetworkRole)> {
        self.0
            .iter()
            .filter_map(|(id, slot)| slot.manager.remote_role(entity).map(|role| (*id, role)))
            .collect()
    }
}

pub struct ReplicationWorld {
    config: ReplicationConfig,
    frame_time_ms: TimeMs,
    tick_count: u64,
    entities: EntityStore,
    interest: InterestManager,
    rpcs: RpcDispatcher,
    events: EventBus,
    connections: BTreeMap<ConnectionId, ConnectionSlot>,
    inbox: mpsc::UnboundedReceiver<WorldCommand>,
    handle: WorldHandle,
    systems: Vec<System>,
    flagged: Vec<ConnectionId>,
}

impl ReplicationWorld {
    pub fn new(config: ReplicationConfig) -> (Self, WorldHandle) {
        let (tx, inbox) = mpsc::unbounded_channel();
        let handle = WorldHandle { tx };
        let rpcs = RpcDispatcher::new(config.max_queued_rpcs_per_connection, config.resend_timeout_ms);
        let entities = EntityStore::with_host(config.host_id);
        let world = Self {
            config,
            frame_time_ms: 0,
            tick_count: 0,
            entities,
            interest: InterestManager::new(),
            rpcs,
            events: EventBus::default(),
            connections: BTreeMap::new(),
            inbox,
            handle: handle.clone(),
            systems: Vec::new(),
            flagged: Vec::new(),
        };
        (world, handle)
    }

    pub fn handle(&self) -> WorldHandle {
        self.handle.clone()
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// World clock in milliseconds. Advanced by `tick`, or set explicitly.
    pub fn frame_time_ms(&self) -> TimeMs {
        self.frame_time_ms
    }

    pub fn set_frame_time_ms(&mut self, now_ms: TimeMs) {
        self.frame_time_ms = now_ms;
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn entities(&self) -> &EntityStore {
        &self.entities
    }

    pub fn entity(&self, id: NetworkEntityId) -> Option<&NetworkEntity> {
        self.entities.get(id)
    }

    pub fn entity_mut(&mut self, id: NetworkEntityId) -> Option<&mut NetworkEntity> {
        self.entities.get_mut(id)
    }

    pub fn interest(&self) -> &InterestManager {
        &self.interest
    }

    pub fn interest_mut(&mut self) -> &mut InterestManager {
        &mut self.interest
    }

    pub fn events_mut(&mut self) -> &mut EventBus {
        &mut self.events
    }

    pub fn drain_events<E: 'static + Send + Sync>(&mut self) -> Vec<E> {
        self.events.drain::<E>()
    }

    pub fn add_system<F>(&mut self, system: F)
    where
        F: FnMut(&mut ReplicationWorld, Duration) + Send + 'static,
    {
        self.systems.push(Box::new(system));
    }

    /// Spawns an entity owned by this host.
    pub fn spawn_entity(&mut self, entity_type: EntityTypeId) -> NetworkEntityId {
        let id = self.entities.spawn(entity_type, NetworkRole::Authority);
        debug!(entity = ?id, ?entity_type, "entity spawned");
        id
    }

    /// Removes an entity and its interest attributes. Subscribers notice on
    /// the next tick.
    pub fn destroy_entity(&mut self, id: NetworkEntityId) -> bool {
        let removed = self.entities.remove(id).is_some();
        if removed {
            self.interest.forget_entity(id);
            debug!(entity = ?id, "entity destroyed");
        }
        removed
    }

    pub fn register_rpc_handler<F>(&mut self, entity_type: EntityTypeId, name: impl Into<String>, handler: F)
    where
        F: FnMut(&mut NetworkEntity, &RpcInvocation<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        self.rpcs.register_handler(entity_type, name, handler);
    }

    /// Queues an RPC from the local instance of its entity.
    pub fn queue_rpc(&mut self, envelope: RpcEnvelope) -> ReplicationResult<Vec<ConnectionId>> {
        let entity = self
            .entities
            .get(envelope.entity_id)
            .ok_or(ReplicationError::EntityNotFound(envelope.entity_id))?;
        let route = Subscribers(&self.connections);
        self.rpcs.queue(envelope, entity, &route)
    }

    pub fn pending_rpcs(&self, connection: ConnectionId) -> usize {
        self.rpcs.pending_for(connection)
    }

    pub fn add_connection(&mut self, conn: Box<dyn Connection>, mode: ReplicationMode) -> ConnectionId {
        let id = conn.id();
        let manager = EntityReplicationManager::new(id, mode, &self.config);
        if self
            .connections
            .insert(id, ConnectionSlot { conn, manager })
            .is_some()
        {
            warn!(connection = ?id, "connection replaced");
        }
        info!(connection = ?id, ?mode, "connection added");
        id
    }

    /// Drops a connection with everything it owned on this host.
    pub fn remove_connection(&mut self, id: ConnectionId) -> bool {
        let Some(slot) = self.connections.remove(&id) else {
            return false;
        };
        self.rpcs.forget_connection(id);
        self.interest.forget_peer(id);
        self.flagged.retain(|c| *c != id);

        for entity in slot.manager.inbound_entities() {
            let owned = self
                .entities
                .get(entity)
                .is_some_and(|e| e.authority_connection == Some(id));
            if owned {
                self.entities.remove(entity);
                self.events.push(EntityRemoved { entity, connection: id });
            }
        }
        for entity in self.entities.iter_mut() {
            if entity.controller == Some(id) {
                entity.controller = None;
            }
        }
        info!(connection = ?id, "connection removed");
        true
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    pub fn manager(&self, id: ConnectionId) -> Option<&EntityReplicationManager> {
        self.connections.get(&id).map(|slot| &slot.manager)
    }

    /// Connections that sent something warranting a disconnect since the
    /// last call. The world does not drop them by itself.
    pub fn take_flagged_connections(&mut self) -> Vec<ConnectionId> {
        std::mem::take(&mut self.flagged)
    }

    /// Applies one inbound frame from `connection`.
    pub fn handle_inbound(&mut self, connection: ConnectionId, frame: Bytes) -> ReplicationResult<PacketReport> {
        let now = self.frame_time_ms;
        let slot = self
            .connections
            .get_mut(&connection)
            .ok_or(ReplicationError::ConnectionNotFound(connection))?;
        let result = slot
            .manager
            .handle_packet(frame, now, &mut self.entities, &mut self.rpcs, &mut self.events);

        let flag = match &result {
            Ok(report) => report.flags_disconnect(),
            Err(e) => e.flags_disconnect(),
        };
        if flag && !self.flagged.contains(&connection) {
            warn!(?connection, "peer flagged for disconnect");
            self.flagged.push(connection);
        }
        result
    }

    /// Runs one world tick.
    pub fn tick(&mut self, delta: Duration) {
        self.frame_time_ms = self
            .frame_time_ms
            .saturating_add(delta.as_millis() as TimeMs);
        self.tick_count += 1;
        let now = self.frame_time_ms;

        self.drain_inbox();
        self.dispatch_orphans();

        let mut systems = std::mem::take(&mut self.systems);
        for system in systems.iter_mut() {
            system(self, delta);
        }
        // Keep anything a system registered while running.
        systems.append(&mut self.systems);
        self.systems = systems;

        self.interest.update();
        for (id, slot) in self.connections.iter_mut() {
            let peer = self.interest.peer_interest(*id);
            if let Err(e) = slot
                .manager
                .send_updates(now, &peer, &self.entities, &mut self.rpcs, &mut *slot.conn)
            {
                warn!(connection = ?id, error = %format!("{e:#}"), "replication send failed");
            }
        }
    }

    fn drain_inbox(&mut self) {
        while let Ok(cmd) = self.inbox.try_recv() {
            match cmd {
                WorldCommand::Connect { connection, mode } => {
                    self.add_connection(connection, mode);
                }
                WorldCommand::Disconnect(id) => {
                    self.remove_connection(id);
                }
                WorldCommand::Inbound { connection, frame } => {
                    if let Err(e) = self.handle_inbound(connection, frame) {
                        debug!(?connection, error = %e, "inbound frame rejected");
                    }
                }
                WorldCommand::Run(f) => f(self),
            }
        }
    }

    fn dispatch_orphans(&mut self) {
        let entities = &self.entities;
        let ready = self
            .rpcs
            .take_ready_orphans(self.frame_time_ms, |id| entities.contains(id));
        for orphan in ready {
            let Some(slot) = self.connections.get(&orphan.from) else {
                continue;
            };
            let Some(entity) = self.entities.get_mut(orphan.envelope.entity_id) else {
                continue;
            };
            let sender = slot.manager.sender_role(entity);
            if let Err(e) = self.rpcs.invoke(&orphan.envelope, orphan.from, sender, entity) {
                warn!(
                    entity = ?orphan.envelope.entity_id,
                    rpc = %orphan.envelope.name,
                    error = %e,
                    "orphaned rpc failed"
                );
            }
        }
    }
}

impl TimedTask for ReplicationWorld {
    fn on_update(&mut self, delta: Duration) {
        self.tick(delta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{net::LoopbackConnection, role::RpcDirection};

    #[test]
    fn queue_rpc_needs_a_local_entity() {
        let (mut world, _) = ReplicationWorld::new(ReplicationConfig::default());
        let err = world
            .queue_rpc(RpcEnvelope::new(NetworkEntityId(42), RpcDirection::AuthorityToClient, "x"))
            .unwrap_err();
        assert!(matches!(err, ReplicationError::EntityNotFound(_)));
    }

    #[test]
    fn inbound_from_unknown_connection() {
        let (mut world, _) = ReplicationWorld::new(ReplicationConfig::default());
        let err = world
            .handle_inbound(ConnectionId(9), Bytes::from_static(&[0, 0, 0, 1]))
            .unwrap_err();
        assert!(matches!(err, ReplicationError::ConnectionNotFound(_)));
    }

    #[test]
    fn handle_commands_run_on_next_tick() {
        let (mut world, handle) = ReplicationWorld::new(ReplicationConfig::default());
        let (conn, _rx) = LoopbackConnection::new(ConnectionId(3));
        handle
            .connect(Box::new(conn), ReplicationMode::ServerToClient)
            .unwrap();
        handle
            .run(|w| {
                w.spawn_entity(EntityTypeId(1));
            })
            .unwrap();
        assert!(world.connection_ids().is_empty());

        world.tick(Duration::from_millis(50));
        assert_eq!(world.connection_ids(), vec![ConnectionId(3)]);
        assert_eq!(world.entities().len(), 1);
        assert_eq!(world.frame_time_ms(), 50);
    }

    #[test]
    fn garbage_frame_flags_peer() {
        let (mut world, _) = ReplicationWorld::new(ReplicationConfig::default());
        let (conn, _rx) = LoopbackConnection::new(ConnectionId(4));
        world.add_connection(Box::new(conn), ReplicationMode::ServerToClient);
        assert!(world
            .handle_inbound(ConnectionId(4), Bytes::from_static(b"\0\0\0\x01{oops"))
            .is_err());
        assert_eq!(world.take_flagged_connections(), vec![ConnectionId(4)]);
        assert!(world.take_flagged_connections().is_empty());
    }

    #[test]
    fn systems_run_every_tick() {
        let (mut world, _) = ReplicationWorld::new(ReplicationConfig::default());
        let id = world.spawn_entity(EntityTypeId(1));
        world.add_system(move |w, _| {
            if let Some(e) = w.entity_mut(id) {
                let n = e.property("n").and_then(|v| v.as_int()).unwrap_or(0);
                e.set_property("n", crate::entity::PropertyValue::Int(n + 1));
            }
        });
        world.tick(Duration::ZERO);
        world.tick(Duration::ZERO);
        assert_eq!(
            world.entity(id).and_then(|e| e.property("n")).and_then(|v| v.as_int()),
            Some(2)
        );
    }
}
