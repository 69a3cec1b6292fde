//! Per-connection replication.
//!
//! One [`EntityReplicationManager`] exists per connection. Outbound, it turns
//! interest changes into subscribers and each tick packs full states, diffs,
//! deletes and queued RPCs into at most one packet. Inbound, it validates and
//! applies the peer's packets through per-entity [`PropertySubscriber`] gates.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Context;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::{
    config::ReplicationConfig,
    entity::{EntityStore, EntityTypeId, NetworkEntity, NetworkEntityId, PropertyDiff, PropertyValue},
    error::{ReplicationError, ReplicationResult},
    event::{EntityRemoved, EntityReplicated, EventBus},
    interest::PeerInterest,
    net::{
        decode_frame, decode_packet, encode_packet, Connection, ConnectionId, EntryKind, PacketEntry,
        PacketId, ReplicationPacket,
    },
    role::NetworkRole,
    rpc::{RpcDispatcher, RpcEnvelope},
    serializer::{ReadSerializer, WriteSerializer},
    subscriber::{PropertySubscriber, TimeMs},
};

/// Trust relationship of one connection, seen from this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationMode {
    /// We are the server; the peer is a client.
    ServerToClient,
    /// We are a client; the peer is the server.
    ClientToServer,
    /// Both ends are trusted servers.
    ServerToServer,
}

impl ReplicationMode {
    /// Whether property records and deletes from the peer may be applied.
    pub fn trusts_remote_state(self) -> bool {
        !matches!(self, ReplicationMode::ServerToClient)
    }

    /// Whether this host publishes entities to the peer.
    pub fn publishes(self) -> bool {
        !matches!(self, ReplicationMode::ClientToServer)
    }

    /// Role the peer's copy of a locally owned `entity` has.
    pub fn remote_role(self, entity: &NetworkEntity, connection: ConnectionId) -> NetworkRole {
        match self {
            ReplicationMode::ServerToServer => NetworkRole::Server,
            ReplicationMode::ClientToServer => NetworkRole::Authority,
            ReplicationMode::ServerToClient if entity.controller == Some(connection) => {
                NetworkRole::Autonomous
            }
            ReplicationMode::ServerToClient => NetworkRole::Client,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// We publish the entity to the peer.
    Outbound,
    /// The peer publishes the entity to us.
    Inbound,
}

#[derive(Debug)]
struct EntityReplicator {
    origin: Origin,
    remote_role: NetworkRole,
    subscriber: PropertySubscriber,
    /// Property values as last packed for the peer.
    sent: BTreeMap<String, PropertyValue>,
    needs_full: bool,
    sent_full: bool,
    delete_pending: bool,
}

impl EntityReplicator {
    fn outbound(entity: NetworkEntityId, connection: ConnectionId, remote_role: NetworkRole) -> Self {
        Self {
            origin: Origin::Outbound,
            remote_role,
            subscriber: PropertySubscriber::new(entity, connection),
            sent: BTreeMap::new(),
            needs_full: true,
            sent_full: false,
            delete_pending: false,
        }
    }

    fn inbound(entity: NetworkEntityId, connection: ConnectionId) -> Self {
        Self {
            origin: Origin::Inbound,
            remote_role: NetworkRole::Authority,
            subscriber: PropertySubscriber::new(entity, connection),
            sent: BTreeMap::new(),
            needs_full: false,
            sent_full: false,
            delete_pending: false,
        }
    }

    fn is_live(&self) -> bool {
        !self.subscriber.is_deleting()
    }
}

/// Outcome of one inbound packet.
#[derive(Debug)]
pub struct PacketReport {
    pub packet_id: PacketId,
    pub applied: usize,
    pub dropped: usize,
    /// RPCs parked until their entity shows up.
    pub held: usize,
    pub errors: Vec<ReplicationError>,
}

impl PacketReport {
    fn new(packet_id: PacketId) -> Self {
        Self {
            packet_id,
            applied: 0,
            dropped: 0,
            held: 0,
            errors: Vec::new(),
        }
    }

    /// Whether any entry warrants dropping the peer.
    pub fn flags_disconnect(&self) -> bool {
        self.errors.iter().any(ReplicationError::flags_disconnect)
    }
}

enum EntryOutcome {
    Applied,
    Dropped,
    Held,
}

pub struct EntityReplicationManager {
    connection: ConnectionId,
    mode: ReplicationMode,
    resend_timeout_ms: TimeMs,
    max_payload_bytes: usize,
    replicators: BTreeMap<NetworkEntityId, EntityReplicator>,
    pending_resets: BTreeSet<NetworkEntityId>,
    // Where record packing resumes after a tick ran out of budget.
    resume_after: Option<NetworkEntityId>,
}

impl EntityReplicationManager {
    pub fn new(connection: ConnectionId, mode: ReplicationMode, config: &ReplicationConfig) -> Self {
        Self {
            connection,
            mode,
            resend_timeout_ms: config.resend_timeout_ms,
            max_payload_bytes: config.max_payload_bytes,
            replicators: BTreeMap::new(),
            pending_resets: BTreeSet::new(),
            resume_after: None,
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn mode(&self) -> ReplicationMode {
        self.mode
    }

    pub fn subscriber(&self, entity: NetworkEntityId) -> Option<&PropertySubscriber> {
        self.replicators.get(&entity).map(|r| &r.subscriber)
    }

    /// Role of the peer's copy, for entities we are actively publishing.
    pub fn remote_role(&self, entity: NetworkEntityId) -> Option<NetworkRole> {
        self.replicators
            .get(&entity)
            .filter(|r| r.origin == Origin::Outbound && r.is_live())
            .map(|r| r.remote_role)
    }

    pub fn is_replicating(&self, entity: NetworkEntityId) -> bool {
        self.remote_role(entity).is_some()
    }

    pub fn replicator_count(&self) -> usize {
        self.replicators.len()
    }

    /// Entities the peer publishes to us.
    pub fn inbound_entities(&self) -> Vec<NetworkEntityId> {
        self.replicators
            .iter()
            .filter(|(_, r)| r.origin == Origin::Inbound)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Asks the peer to resend `entity` in full on the next tick.
    pub fn request_reset(&mut self, entity: NetworkEntityId) {
        self.pending_resets.insert(entity);
    }

    /// Role the connection holds for `entity` when it sends us an RPC.
    pub fn sender_role(&self, entity: &NetworkEntity) -> NetworkRole {
        if entity.authority_connection == Some(self.connection) {
            NetworkRole::Authority
        } else {
            self.mode.remote_role(entity, self.connection)
        }
    }

    /// Runs one outbound tick and sends at most one packet.
    pub fn send_updates(
        &mut self,
        now_ms: TimeMs,
        interest: &PeerInterest,
        entities: &EntityStore,
        rpcs: &mut RpcDispatcher,
        conn: &mut dyn Connection,
    ) -> anyhow::Result<Option<PacketId>> {
        // Removals first: deletion wins over creation inside one tick.
        for id in &interest.removed {
            self.begin_delete(*id, now_ms);
        }
        for id in &interest.added {
            if interest.removed.contains(id) {
                continue;
            }
            self.on_interest_gained(*id, entities);
        }

        let destroyed: Vec<NetworkEntityId> = self
            .replicators
            .iter()
            .filter(|(id, r)| r.origin == Origin::Outbound && r.is_live() && !entities.contains(**id))
            .map(|(id, _)| *id)
            .collect();
        for id in destroyed {
            self.begin_delete(id, now_ms);
        }

        let connection = self.connection;
        self.replicators.retain(|id, r| {
            let keep = !r.subscriber.is_deleted(now_ms);
            if !keep {
                debug!(entity = ?id, ?connection, "subscriber removed");
            }
            keep
        });

        let mut packet = ReplicationPacket::default();
        for id in std::mem::take(&mut self.pending_resets) {
            packet.entries.push(PacketEntry {
                entity_id: id,
                kind: EntryKind::Reset,
                payload: Vec::new(),
            });
        }
        for (id, rep) in self.replicators.iter_mut() {
            if rep.delete_pending {
                rep.delete_pending = false;
                packet.entries.push(PacketEntry {
                    entity_id: *id,
                    kind: EntryKind::Delete,
                    payload: Vec::new(),
                });
            }
        }
        self.pack_records(entities, &mut packet);

        for envelope in rpcs.drain_for(connection) {
            let live = self
                .replicators
                .get(&envelope.entity_id)
                .is_some_and(EntityReplicator::is_live);
            if live {
                packet.entries.push(envelope.to_entry());
            } else {
                debug!(
                    entity = ?envelope.entity_id,
                    rpc = %envelope.name,
                    ?connection,
                    "dropping rpc for entity without a live subscriber"
                );
            }
        }

        if packet.is_empty() {
            return Ok(None);
        }
        let reliability = packet.reliability();
        let body = encode_packet(&packet)?;
        let packet_id = conn
            .send(body, reliability)
            .with_context(|| format!("send replication packet to {connection:?}"))?;
        trace!(
            ?connection,
            packet = packet_id.0,
            entries = packet.entries.len(),
            ?reliability,
            "replication packet sent"
        );
        Ok(Some(packet_id))
    }

    fn on_interest_gained(&mut self, id: NetworkEntityId, entities: &EntityStore) {
        let connection = self.connection;
        if !self.mode.publishes() {
            trace!(entity = ?id, ?connection, "interest ignored on a client connection");
            return;
        }
        let Some(entity) = entities.get(id) else {
            debug!(entity = ?id, ?connection, "interest gained for a destroyed entity");
            return;
        };
        match self.replicators.get_mut(&id) {
            Some(rep) if rep.origin == Origin::Outbound => {
                if rep.subscriber.is_deleting() {
                    rep.subscriber.clear_deleting();
                    rep.sent.clear();
                    rep.needs_full = true;
                    rep.delete_pending = false;
                    debug!(entity = ?id, ?connection, "subscriber revived");
                }
            }
            Some(_) => {
                debug!(entity = ?id, ?connection, "entity is published by this peer; interest ignored");
            }
            None => {
                let role = self.mode.remote_role(entity, connection);
                debug!(entity = ?id, ?connection, %role, "subscriber added");
                self.replicators
                    .insert(id, EntityReplicator::outbound(id, connection, role));
            }
        }
    }

    fn begin_delete(&mut self, id: NetworkEntityId, now_ms: TimeMs) {
        let Some(rep) = self.replicators.get_mut(&id) else {
            return;
        };
        if rep.origin != Origin::Outbound || !rep.is_live() {
            return;
        }
        rep.subscriber.set_deleting(now_ms, self.resend_timeout_ms);
        // A peer that never got a full state has nothing to tear down.
        rep.delete_pending = rep.sent_full;
        debug!(entity = ?id, connection = ?self.connection, "subscriber deleting");
    }

    fn pack_records(&mut self, entities: &EntityStore, packet: &mut ReplicationPacket) {
        let mut ids: Vec<NetworkEntityId> = self
            .replicators
            .iter()
            .filter(|(_, r)| r.origin == Origin::Outbound && r.is_live())
            .map(|(id, _)| *id)
            .collect();
        if let Some(after) = self.resume_after {
            let split = ids.partition_point(|id| *id <= after);
            ids.rotate_left(split);
        }

        let mut used = 0usize;
        let mut last_admitted = None;
        let mut deferred = false;
        for id in ids {
            let (Some(entity), Some(rep)) = (entities.get(id), self.replicators.get_mut(&id)) else {
                continue;
            };

            let role = self.mode.remote_role(entity, self.connection);
            if role != rep.remote_role {
                debug!(entity = ?id, from = %rep.remote_role, to = %role, "remote role changed");
                rep.remote_role = role;
                rep.needs_full = true;
            }

            let full = rep.needs_full;
            let mut diff = if full {
                entity.full_state()
            } else {
                entity.diff_against(&rep.sent)
            };
            if !full && diff.is_empty() {
                continue;
            }
            let Some(payload) = encode_diff(&mut diff) else {
                debug!(entity = ?id, "property diff rejected by serializer");
                continue;
            };

            let entry = PacketEntry {
                entity_id: id,
                kind: EntryKind::PropertyDiff {
                    full,
                    role: rep.remote_role,
                    entity_type: entity.entity_type,
                },
                payload: payload.to_vec(),
            };
            let size = entry.estimated_size();
            if last_admitted.is_some() && used + size > self.max_payload_bytes {
                deferred = true;
                break;
            }
            used += size;
            last_admitted = Some(id);

            if full {
                rep.sent = entity.properties().clone();
                rep.needs_full = false;
                rep.sent_full = true;
            } else {
                rep.sent.extend(diff.changes);
            }
            packet.entries.push(entry);
        }

        if deferred {
            debug!(connection = ?self.connection, used, "payload budget reached; records deferred");
        }
        self.resume_after = if deferred { last_admitted } else { None };
    }

    /// Validates and applies one inbound frame.
    ///
    /// A frame that fails to decode is rejected whole. Otherwise entries are
    /// applied in order and per-entry failures land in the report.
    pub fn handle_packet(
        &mut self,
        frame: Bytes,
        now_ms: TimeMs,
        entities: &mut EntityStore,
        rpcs: &mut RpcDispatcher,
        events: &mut EventBus,
    ) -> ReplicationResult<PacketReport> {
        let (packet_id, body) = decode_frame(frame)?;
        let packet = decode_packet(&body)?;

        let mut diffs = Vec::with_capacity(packet.entries.len());
        for entry in &packet.entries {
            let diff = match entry.kind {
                EntryKind::PropertyDiff { .. } => decode_diff(&entry.payload).ok_or_else(|| {
                    ReplicationError::SerializationFailure(format!(
                        "invalid property payload for {:?}",
                        entry.entity_id
                    ))
                })?,
                _ => PropertyDiff::default(),
            };
            diffs.push(diff);
        }

        let mut report = PacketReport::new(packet_id);
        for (entry, diff) in packet.entries.iter().zip(diffs) {
            let id = entry.entity_id;
            let outcome = match &entry.kind {
                EntryKind::PropertyDiff {
                    full,
                    role,
                    entity_type,
                } => self.apply_record(packet_id, id, *full, *role, *entity_type, &diff, entities, events),
                EntryKind::Delete => self.apply_delete(packet_id, id, now_ms, entities, events),
                EntryKind::Reset => Ok(self.apply_reset(id)),
                EntryKind::Rpc { .. } => self.apply_rpc(entry, now_ms, entities, rpcs),
            };
            match outcome {
                Ok(EntryOutcome::Applied) => report.applied += 1,
                Ok(EntryOutcome::Dropped) => report.dropped += 1,
                Ok(EntryOutcome::Held) => report.held += 1,
                Err(e) => {
                    if e.flags_disconnect() {
                        warn!(connection = ?self.connection, entity = ?id, error = %e, "entry rejected");
                    } else {
                        debug!(connection = ?self.connection, entity = ?id, error = %e, "entry rejected");
                    }
                    report.dropped += 1;
                    report.errors.push(e);
                }
            }
        }
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_record(
        &mut self,
        packet_id: PacketId,
        id: NetworkEntityId,
        full: bool,
        role: NetworkRole,
        entity_type: EntityTypeId,
        diff: &PropertyDiff,
        entities: &mut EntityStore,
        events: &mut EventBus,
    ) -> ReplicationResult<EntryOutcome> {
        let connection = self.connection;
        if !self.mode.trusts_remote_state() {
            return Err(ReplicationError::UntrustedUpdate { entity: id, connection });
        }

        match self.replicators.get_mut(&id) {
            Some(rep) if rep.origin == Origin::Outbound => {
                Err(ReplicationError::UntrustedUpdate { entity: id, connection })
            }
            Some(rep) => {
                if !rep.subscriber.is_packet_id_valid(packet_id) {
                    trace!(entity = ?id, packet = packet_id.0, "stale record dropped");
                    return Ok(EntryOutcome::Dropped);
                }
                if full {
                    rep.subscriber.clear_deleting();
                    if !entities.contains(id) {
                        entities.insert(proxy(id, entity_type, role, connection));
                        events.push(EntityReplicated {
                            entity: id,
                            role,
                            connection,
                        });
                    }
                }
                let Some(entity) = entities.get_mut(id) else {
                    return Ok(EntryOutcome::Dropped);
                };
                if full {
                    entity.role = role;
                }
                let applied = rep
                    .subscriber
                    .handle_property_change_message(packet_id, diff, true, entity, events);
                Ok(if applied {
                    EntryOutcome::Applied
                } else {
                    EntryOutcome::Dropped
                })
            }
            None if full => {
                match entities.get(id) {
                    Some(existing) if existing.authority_connection != Some(connection) => {
                        return Err(ReplicationError::UntrustedUpdate { entity: id, connection });
                    }
                    Some(_) => {}
                    None => {
                        entities.insert(proxy(id, entity_type, role, connection));
                        events.push(EntityReplicated {
                            entity: id,
                            role,
                            connection,
                        });
                    }
                }
                let entity = entities
                    .get_mut(id)
                    .ok_or(ReplicationError::EntityNotFound(id))?;
                let mut rep = EntityReplicator::inbound(id, connection);
                rep.subscriber
                    .handle_property_change_message(packet_id, diff, false, entity, events);
                debug!(entity = ?id, ?connection, %role, "entity replicated from peer");
                self.replicators.insert(id, rep);
                Ok(EntryOutcome::Applied)
            }
            None => {
                self.pending_resets.insert(id);
                Err(ReplicationError::SubscriberNotFound { entity: id, connection })
            }
        }
    }

    fn apply_delete(
        &mut self,
        packet_id: PacketId,
        id: NetworkEntityId,
        now_ms: TimeMs,
        entities: &mut EntityStore,
        events: &mut EventBus,
    ) -> ReplicationResult<EntryOutcome> {
        let connection = self.connection;
        if !self.mode.trusts_remote_state() {
            return Err(ReplicationError::UntrustedUpdate { entity: id, connection });
        }
        let Some(rep) = self
            .replicators
            .get_mut(&id)
            .filter(|r| r.origin == Origin::Inbound)
        else {
            return Ok(EntryOutcome::Dropped);
        };
        if !rep.subscriber.accept_packet_id(packet_id) {
            return Ok(EntryOutcome::Dropped);
        }
        rep.subscriber.set_deleting(now_ms, self.resend_timeout_ms);
        if entities.remove(id).is_some() {
            debug!(entity = ?id, ?connection, "entity removed by peer");
            events.push(EntityRemoved { entity: id, connection });
        }
        Ok(EntryOutcome::Applied)
    }

    fn apply_reset(&mut self, id: NetworkEntityId) -> EntryOutcome {
        match self.replicators.get_mut(&id) {
            Some(rep) if rep.origin == Origin::Outbound && rep.is_live() => {
                debug!(entity = ?id, connection = ?self.connection, "peer requested full state");
                rep.needs_full = true;
                EntryOutcome::Applied
            }
            _ => EntryOutcome::Dropped,
        }
    }

    fn apply_rpc(
        &mut self,
        entry: &PacketEntry,
        now_ms: TimeMs,
        entities: &mut EntityStore,
        rpcs: &mut RpcDispatcher,
    ) -> ReplicationResult<EntryOutcome> {
        let Some(envelope) = RpcEnvelope::from_entry(entry) else {
            return Ok(EntryOutcome::Dropped);
        };
        match entities.get_mut(envelope.entity_id) {
            Some(entity) => {
                let sender = self.sender_role(entity);
                rpcs.invoke(&envelope, self.connection, sender, entity)?;
                Ok(EntryOutcome::Applied)
            }
            None => Ok(if rpcs.hold_orphan(envelope, self.connection, now_ms) {
                EntryOutcome::Held
            } else {
                EntryOutcome::Dropped
            }),
        }
    }
}

fn proxy(
    id: NetworkEntityId,
    entity_type: EntityTypeId,
    role: NetworkRole,
    authority: ConnectionId,
) -> NetworkEntity {
    let mut entity = NetworkEntity::new(id, entity_type, role);
    entity.authority_connection = Some(authority);
    entity
}

fn encode_diff(diff: &mut PropertyDiff) -> Option<Bytes> {
    let mut w = WriteSerializer::new();
    if !diff.serialize(&mut w) {
        return None;
    }
    w.finish()
}

fn decode_diff(payload: &[u8]) -> Option<PropertyDiff> {
    let mut r = ReadSerializer::new(Bytes::copy_from_slice(payload));
    let mut diff = PropertyDiff::default();
    (diff.serialize(&mut r) && r.remaining() == 0).then_some(diff)
}
