//! RPC queueing and dispatch.
//!
//! Outbound RPCs are checked against the direction table, fanned out to the
//! connections whose remote copy may receive them and parked per connection
//! until the next tick drains them into a packet. Inbound RPCs are checked
//! again on the receiving host before the registered handler runs.

use std::collections::{BTreeMap, HashMap, VecDeque};

use tracing::{debug, info, warn};

use crate::{
    entity::{EntityTypeId, NetworkEntity, NetworkEntityId},
    error::{ReplicationError, ReplicationResult, RpcAction},
    net::{ConnectionId, EntryKind, PacketEntry},
    role::{NetworkRole, RpcDirection},
    subscriber::TimeMs,
};

#[derive(Debug, Clone, PartialEq)]
pub struct RpcEnvelope {
    pub entity_id: NetworkEntityId,
    pub direction: RpcDirection,
    pub name: String,
    pub payload: Vec<u8>,
    pub reliable: bool,
}

impl RpcEnvelope {
    /// Reliable RPC with an empty payload.
    pub fn new(entity_id: NetworkEntityId, direction: RpcDirection, name: impl Into<String>) -> Self {
        Self {
            entity_id,
            direction,
            name: name.into(),
            payload: Vec::new(),
            reliable: true,
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn unreliable(mut self) -> Self {
        self.reliable = false;
        self
    }

    pub fn to_entry(&self) -> PacketEntry {
        PacketEntry {
            entity_id: self.entity_id,
            kind: EntryKind::Rpc {
                direction: self.direction,
                name: self.name.clone(),
                reliable: self.reliable,
            },
            payload: self.payload.clone(),
        }
    }

    pub fn from_entry(entry: &PacketEntry) -> Option<Self> {
        match &entry.kind {
            EntryKind::Rpc {
                direction,
                name,
                reliable,
            } => Some(Self {
                entity_id: entry.entity_id,
                direction: *direction,
                name: name.clone(),
                payload: entry.payload.clone(),
                reliable: *reliable,
            }),
            _ => None,
        }
    }
}

/// What a handler sees besides the target entity.
#[derive(Debug)]
pub struct RpcInvocation<'a> {
    pub envelope: &'a RpcEnvelope,
    pub from: ConnectionId,
}

pub type RpcHandler =
    Box<dyn FnMut(&mut NetworkEntity, &RpcInvocation<'_>) -> anyhow::Result<()> + Send>;

/// Where an entity's RPCs can go.
pub trait RpcRoute {
    /// Connections holding a live copy of `entity`, with the role of that copy.
    fn subscribers(&self, entity: NetworkEntityId) -> Vec<(ConnectionId, NetworkRole)>;
}

/// An inbound RPC waiting for its entity to appear.
#[derive(Debug, Clone)]
pub struct OrphanedRpc {
    pub envelope: RpcEnvelope,
    pub from: ConnectionId,
    pub deadline_ms: TimeMs,
}

#[derive(Default)]
struct ConnectionQueue {
    // Entities in the order they first got an RPC queued.
    order: Vec<NetworkEntityId>,
    per_entity: HashMap<NetworkEntityId, VecDeque<RpcEnvelope>>,
    len: usize,
}

impl ConnectionQueue {
    fn push(&mut self, envelope: RpcEnvelope) {
        let id = envelope.entity_id;
        let q = self.per_entity.entry(id).or_insert_with(|| {
            self.order.push(id);
            VecDeque::new()
        });
        q.push_back(envelope);
        self.len += 1;
    }

    fn drain(mut self) -> Vec<RpcEnvelope> {
        let mut out = Vec::with_capacity(self.len);
        for entity in self.order {
            if let Some(q) = self.per_entity.remove(&entity) {
                out.extend(q);
            }
        }
        out
    }
}

pub struct RpcDispatcher {
    handlers: HashMap<(EntityTypeId, String), RpcHandler>,
    queues: BTreeMap<ConnectionId, ConnectionQueue>,
    orphans: Vec<OrphanedRpc>,
    max_queued_per_connection: usize,
    resend_timeout_ms: TimeMs,
}

impl RpcDispatcher {
    pub fn new(max_queued_per_connection: usize, resend_timeout_ms: TimeMs) -> Self {
        Self {
            handlers: HashMap::new(),
            queues: BTreeMap::new(),
            orphans: Vec::new(),
            max_queued_per_connection,
            resend_timeout_ms,
        }
    }

    /// Registers (or replaces) the handler for `name` on `entity_type`.
    pub fn register_handler<F>(&mut self, entity_type: EntityTypeId, name: impl Into<String>, handler: F)
    where
        F: FnMut(&mut NetworkEntity, &RpcInvocation<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        self.handlers
            .insert((entity_type, name.into()), Box::new(handler));
    }

    /// Queues an RPC sent by the local instance `entity`. Returns the
    /// connections it was queued for; nothing is queued on error.
    pub fn queue(
        &mut self,
        envelope: RpcEnvelope,
        entity: &NetworkEntity,
        route: &dyn RpcRoute,
    ) -> ReplicationResult<Vec<ConnectionId>> {
        let direction = envelope.direction;
        if !direction.can_send(entity.role) {
            warn!(
                entity = ?entity.id,
                ?direction,
                role = %entity.role,
                rpc = %envelope.name,
                "rpc queue refused: role may not send"
            );
            return Err(ReplicationError::RoleViolation {
                entity: entity.id,
                direction,
                role: entity.role,
                action: RpcAction::Queue,
            });
        }

        let destinations: Vec<ConnectionId> = if direction.targets_authority() {
            entity.authority_connection.into_iter().collect()
        } else {
            route
                .subscribers(entity.id)
                .into_iter()
                .filter(|(_, remote_role)| direction.can_receive(*remote_role))
                .map(|(conn, _)| conn)
                .collect()
        };

        for conn in &destinations {
            let pending = self.queues.get(conn).map_or(0, |q| q.len);
            if pending >= self.max_queued_per_connection {
                return Err(ReplicationError::RpcQueueFull {
                    connection: *conn,
                    limit: self.max_queued_per_connection,
                });
            }
        }

        if destinations.is_empty() {
            debug!(entity = ?entity.id, rpc = %envelope.name, ?direction, "rpc has no receivers");
        }
        for conn in &destinations {
            self.queues
                .entry(*conn)
                .or_default()
                .push(envelope.clone());
        }
        Ok(destinations)
    }

    /// Takes every RPC queued for `connection`, FIFO per entity and entities
    /// in the order they were first queued.
    pub fn drain_for(&mut self, connection: ConnectionId) -> Vec<RpcEnvelope> {
        self.queues
            .remove(&connection)
            .map(ConnectionQueue::drain)
            .unwrap_or_default()
    }

    pub fn pending_for(&self, connection: ConnectionId) -> usize {
        self.queues.get(&connection).map_or(0, |q| q.len)
    }

    /// Runs the handler for an inbound RPC.
    ///
    /// `sender_role` is the role the invoking connection holds for this
    /// entity as seen from here. At most once; never retried on failure.
    pub fn invoke(
        &mut self,
        envelope: &RpcEnvelope,
        from: ConnectionId,
        sender_role: NetworkRole,
        entity: &mut NetworkEntity,
    ) -> ReplicationResult<()> {
        let direction = envelope.direction;
        if !direction.can_receive(entity.role) {
            warn!(
                entity = ?entity.id,
                ?direction,
                role = %entity.role,
                rpc = %envelope.name,
                ?from,
                "rpc invoke refused: local role may not receive"
            );
            return Err(ReplicationError::RoleViolation {
                entity: entity.id,
                direction,
                role: entity.role,
                action: RpcAction::Invoke,
            });
        }
        if !direction.can_send(sender_role) {
            warn!(
                entity = ?entity.id,
                ?direction,
                role = %sender_role,
                rpc = %envelope.name,
                ?from,
                "rpc invoke refused: sender may not send"
            );
            return Err(ReplicationError::RoleViolation {
                entity: entity.id,
                direction,
                role: sender_role,
                action: RpcAction::Send,
            });
        }

        let handler = self
            .handlers
            .get_mut(&(entity.entity_type, envelope.name.clone()))
            .ok_or_else(|| ReplicationError::HandlerNotFound {
                entity_type: entity.entity_type,
                name: envelope.name.clone(),
            })?;

        let call = RpcInvocation { envelope, from };
        handler(entity, &call).map_err(|source| ReplicationError::HandlerFailed {
            name: envelope.name.clone(),
            source,
        })
    }

    /// Parks an RPC whose entity does not exist here yet. At most
    /// `max_queued_per_connection` are held per sender; returns false when
    /// the RPC was dropped instead.
    pub fn hold_orphan(&mut self, envelope: RpcEnvelope, from: ConnectionId, now_ms: TimeMs) -> bool {
        let held = self.orphans.iter().filter(|o| o.from == from).count();
        if held >= self.max_queued_per_connection {
            warn!(
                entity = ?envelope.entity_id,
                rpc = %envelope.name,
                ?from,
                limit = self.max_queued_per_connection,
                "orphaned rpc limit reached; dropping"
            );
            return false;
        }
        debug!(entity = ?envelope.entity_id, rpc = %envelope.name, ?from, "holding orphaned rpc");
        self.orphans.push(OrphanedRpc {
            envelope,
            from,
            deadline_ms: now_ms.saturating_add(self.resend_timeout_ms),
        });
        true
    }

    /// Orphans currently held from `from`.
    pub fn orphans_from(&self, from: ConnectionId) -> usize {
        self.orphans.iter().filter(|o| o.from == from).count()
    }

    /// Returns held RPCs whose entity now exists, in arrival order, and drops
    /// the ones past their deadline.
    pub fn take_ready_orphans(
        &mut self,
        now_ms: TimeMs,
        exists: impl Fn(NetworkEntityId) -> bool,
    ) -> Vec<OrphanedRpc> {
        let mut ready = Vec::new();
        let mut kept = Vec::new();
        for orphan in std::mem::take(&mut self.orphans) {
            if exists(orphan.envelope.entity_id) {
                ready.push(orphan);
            } else if now_ms > orphan.deadline_ms {
                info!(
                    entity = ?orphan.envelope.entity_id,
                    rpc = %orphan.envelope.name,
                    from = ?orphan.from,
                    "dropping orphaned rpc"
                );
            } else {
                kept.push(orphan);
            }
        }
        self.orphans = kept;
        ready
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    /// Drops everything queued for or held from `connection`.
    pub fn forget_connection(&mut self, connection: ConnectionId) {
        if let Some(q) = self.queues.remove(&connection) {
            if q.len > 0 {
                warn!(?connection, dropped = q.len, "discarding queued rpcs");
            }
        }
        self.orphans.retain(|o| o.from != connection);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Peers(Vec<(ConnectionId, NetworkRole)>);

    impl RpcRoute for Peers {
        fn subscribers(&self, _entity: NetworkEntityId) -> Vec<(ConnectionId, NetworkRole)> {
            self.0.clone()
        }
    }

    const TYPE: EntityTypeId = EntityTypeId(3);

    fn authority() -> NetworkEntity {
        NetworkEntity::new(NetworkEntityId(1), TYPE, NetworkRole::Authority)
    }

    fn peers() -> Peers {
        Peers(vec![
            (ConnectionId(1), NetworkRole::Client),
            (ConnectionId(2), NetworkRole::Autonomous),
            (ConnectionId(3), NetworkRole::Server),
        ])
    }

    #[test]
    fn client_cannot_send_authority_to_client() {
        let mut rpcs = RpcDispatcher::new(16, 100);
        let client = NetworkEntity::new(NetworkEntityId(1), TYPE, NetworkRole::Client);
        let err = rpcs
            .queue(
                RpcEnvelope::new(client.id, RpcDirection::AuthorityToClient, "boom"),
                &client,
                &peers(),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            ReplicationError::RoleViolation {
                action: RpcAction::Queue,
                role: NetworkRole::Client,
                ..
            }
        ));
        assert_eq!(rpcs.pending_for(ConnectionId(1)), 0);
    }

    #[test]
    fn authority_to_client_reaches_client_side_copies() {
        let mut rpcs = RpcDispatcher::new(16, 100);
        let ent = authority();
        let sent = rpcs
            .queue(RpcEnvelope::new(ent.id, RpcDirection::AuthorityToClient, "ping"), &ent, &peers())
            .unwrap();
        assert_eq!(sent, vec![ConnectionId(1), ConnectionId(2)]);

        let sent = rpcs
            .queue(RpcEnvelope::new(ent.id, RpcDirection::AuthorityToAutonomous, "own"), &ent, &peers())
            .unwrap();
        assert_eq!(sent, vec![ConnectionId(2)]);
        assert_eq!(rpcs.pending_for(ConnectionId(2)), 2);
        assert_eq!(rpcs.pending_for(ConnectionId(3)), 0);
    }

    #[test]
    fn to_authority_goes_to_authority_connection_only() {
        let mut rpcs = RpcDispatcher::new(16, 100);
        let mut ent = NetworkEntity::new(NetworkEntityId(9), TYPE, NetworkRole::Autonomous);
        ent.authority_connection = Some(ConnectionId(7));
        let sent = rpcs
            .queue(RpcEnvelope::new(ent.id, RpcDirection::AutonomousToAuthority, "jump"), &ent, &peers())
            .unwrap();
        assert_eq!(sent, vec![ConnectionId(7)]);
    }

    #[test]
    fn drain_is_fifo_per_entity_in_assignment_order() {
        let mut rpcs = RpcDispatcher::new(16, 100);
        let a = authority();
        let b = NetworkEntity::new(NetworkEntityId(2), TYPE, NetworkRole::Authority);
        let only = Peers(vec![(ConnectionId(1), NetworkRole::Client)]);
        for (ent, name) in [(&b, "b1"), (&a, "a1"), (&b, "b2"), (&a, "a2")] {
            rpcs.queue(RpcEnvelope::new(ent.id, RpcDirection::AuthorityToClient, name), ent, &only)
                .unwrap();
        }
        let names: Vec<_> = rpcs
            .drain_for(ConnectionId(1))
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["b1", "b2", "a1", "a2"]);
        assert!(rpcs.drain_for(ConnectionId(1)).is_empty());
    }

    #[test]
    fn full_queue_rejects_without_partial_fanout() {
        let mut rpcs = RpcDispatcher::new(1, 100);
        let ent = authority();
        let one = Peers(vec![(ConnectionId(1), NetworkRole::Client)]);
        rpcs.queue(RpcEnvelope::new(ent.id, RpcDirection::AuthorityToClient, "x"), &ent, &one)
            .unwrap();
        let err = rpcs
            .queue(RpcEnvelope::new(ent.id, RpcDirection::AuthorityToClient, "y"), &ent, &peers())
            .unwrap_err();
        assert!(matches!(err, ReplicationError::RpcQueueFull { limit: 1, .. }));
        assert_eq!(rpcs.pending_for(ConnectionId(2)), 0);
    }

    #[test]
    fn invoke_runs_registered_handler() {
        let mut rpcs = RpcDispatcher::new(16, 100);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        rpcs.register_handler(TYPE, "jump", move |ent, call| {
            sink.lock().unwrap().push((ent.id, call.from, call.envelope.payload.clone()));
            Ok(())
        });

        let mut ent = authority();
        let env = RpcEnvelope::new(ent.id, RpcDirection::AutonomousToAuthority, "jump").with_payload(vec![1]);
        rpcs.invoke(&env, ConnectionId(4), NetworkRole::Autonomous, &mut ent)
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![(ent.id, ConnectionId(4), vec![1])]);
    }

    #[test]
    fn invoke_checks_both_sides_of_the_table() {
        let mut rpcs = RpcDispatcher::new(16, 100);
        rpcs.register_handler(TYPE, "jump", |_, _| Ok(()));
        let env = RpcEnvelope::new(NetworkEntityId(1), RpcDirection::AutonomousToAuthority, "jump");

        // Receiver is not the authority.
        let mut proxy = NetworkEntity::new(NetworkEntityId(1), TYPE, NetworkRole::Client);
        let err = rpcs
            .invoke(&env, ConnectionId(1), NetworkRole::Autonomous, &mut proxy)
            .unwrap_err();
        assert!(matches!(err, ReplicationError::RoleViolation { action: RpcAction::Invoke, .. }));

        // Sender does not control the entity.
        let mut ent = authority();
        let err = rpcs
            .invoke(&env, ConnectionId(1), NetworkRole::Client, &mut ent)
            .unwrap_err();
        assert!(matches!(
            err,
            ReplicationError::RoleViolation {
                role: NetworkRole::Client,
                action: RpcAction::Send,
                ..
            }
        ));
        assert!(err.to_string().contains("may not send"));
    }

    #[test]
    fn invoke_reports_missing_and_failing_handlers() {
        let mut rpcs = RpcDispatcher::new(16, 100);
        let mut ent = authority();
        let env = RpcEnvelope::new(ent.id, RpcDirection::ServerToAuthority, "sync");
        let err = rpcs
            .invoke(&env, ConnectionId(1), NetworkRole::Server, &mut ent)
            .unwrap_err();
        assert!(matches!(err, ReplicationError::HandlerNotFound { .. }));

        rpcs.register_handler(TYPE, "sync", |_, _| anyhow::bail!("nope"));
        let err = rpcs
            .invoke(&env, ConnectionId(1), NetworkRole::Server, &mut ent)
            .unwrap_err();
        assert!(matches!(err, ReplicationError::HandlerFailed { .. }));
        assert!(!err.flags_disconnect());
    }

    #[test]
    fn orphans_wait_for_entity_until_deadline() {
        let mut rpcs = RpcDispatcher::new(16, 100);
        let env = |id| RpcEnvelope::new(NetworkEntityId(id), RpcDirection::AuthorityToClient, "hi");
        rpcs.hold_orphan(env(1), ConnectionId(1), 1_000);
        rpcs.hold_orphan(env(2), ConnectionId(1), 1_000);

        let ready = rpcs.take_ready_orphans(1_050, |id| id == NetworkEntityId(1));
        assert_eq!(ready.len(), 1);
        assert_eq!(rpcs.orphan_count(), 1);

        // Exactly at the deadline it is still held.
        assert!(rpcs.take_ready_orphans(1_100, |_| false).is_empty());
        assert_eq!(rpcs.orphan_count(), 1);
        assert!(rpcs.take_ready_orphans(1_101, |_| false).is_empty());
        assert_eq!(rpcs.orphan_count(), 0);
    }

    #[test]
    fn orphans_are_capped_per_sender() {
        let mut rpcs = RpcDispatcher::new(4, 100);
        let env = |id| RpcEnvelope::new(NetworkEntityId(id), RpcDirection::AuthorityToClient, "hi");
        for id in 0..1_000 {
            rpcs.hold_orphan(env(id), ConnectionId(1), 0);
        }
        assert_eq!(rpcs.orphans_from(ConnectionId(1)), 4);
        assert!(!rpcs.hold_orphan(env(5_000), ConnectionId(1), 0));

        // Another sender has its own budget.
        assert!(rpcs.hold_orphan(env(1), ConnectionId(2), 0));
        assert_eq!(rpcs.orphan_count(), 5);

        // Expiry frees the budget again.
        rpcs.take_ready_orphans(101, |_| false);
        assert!(rpcs.hold_orphan(env(1), ConnectionId(1), 101));
    }
}
