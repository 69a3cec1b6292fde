//! Per (entity, peer) inbound gate and removal timer.
//!
//! A subscriber accepts a packet only if its id is strictly greater than the
//! last one it applied. Once deleting it stops being a send target but keeps
//! rejecting stale packets until the grace period runs out, which is what
//! keeps a late update from resurrecting a removed entity.

use crate::{
    entity::{NetworkEntity, NetworkEntityId, PropertyDiff},
    event::{EventBus, PropertyChanged},
    net::{ConnectionId, PacketId},
};

/// Milliseconds of world time.
pub type TimeMs = u64;

#[derive(Debug, Clone)]
pub struct PropertySubscriber {
    entity: NetworkEntityId,
    connection: ConnectionId,
    last_received_packet_id: Option<PacketId>,
    marked_for_removal_at_ms: Option<TimeMs>,
}

impl PropertySubscriber {
    pub fn new(entity: NetworkEntityId, connection: ConnectionId) -> Self {
        Self {
            entity,
            connection,
            last_received_packet_id: None,
            marked_for_removal_at_ms: None,
        }
    }

    pub fn entity(&self) -> NetworkEntityId {
        self.entity
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn last_received_packet_id(&self) -> Option<PacketId> {
        self.last_received_packet_id
    }

    pub fn is_packet_id_valid(&self, id: PacketId) -> bool {
        self.last_received_packet_id.map_or(true, |last| id > last)
    }

    /// Advances the gate without a payload. Returns false for stale ids.
    pub fn accept_packet_id(&mut self, id: PacketId) -> bool {
        if !self.is_packet_id_valid(id) {
            return false;
        }
        self.last_received_packet_id = Some(id);
        true
    }

    /// Applies `diff` to `entity` if `id` is newer than anything applied so
    /// far. Stale or duplicate packets return false and change nothing.
    pub fn handle_property_change_message(
        &mut self,
        id: PacketId,
        diff: &PropertyDiff,
        notify_changes: bool,
        entity: &mut NetworkEntity,
        events: &mut EventBus,
    ) -> bool {
        if !self.accept_packet_id(id) {
            tracing::trace!(
                entity = ?self.entity,
                packet = id.0,
                last = ?self.last_received_packet_id,
                "stale property update dropped"
            );
            return false;
        }

        let changed = entity.apply_diff(diff);
        if notify_changes && !changed.is_empty() {
            events.push(PropertyChanged {
                entity: self.entity,
                names: changed,
            });
        }
        true
    }

    /// Schedules removal at `now + resend_timeout`. Never moves an existing
    /// mark earlier.
    pub fn set_deleting(&mut self, now_ms: TimeMs, resend_timeout_ms: TimeMs) {
        let target = now_ms.saturating_add(resend_timeout_ms);
        self.marked_for_removal_at_ms = Some(match self.marked_for_removal_at_ms {
            Some(current) => current.max(target),
            None => target,
        });
    }

    /// Interest came back before eviction.
    pub fn clear_deleting(&mut self) {
        self.marked_for_removal_at_ms = None;
    }

    pub fn marked_for_removal_at_ms(&self) -> Option<TimeMs> {
        self.marked_for_removal_at_ms
    }

    pub fn is_deleting(&self) -> bool {
        self.marked_for_removal_at_ms.is_some()
    }

    pub fn is_deleted(&self, now_ms: TimeMs) -> bool {
        self.marked_for_removal_at_ms
            .map_or(false, |mark| now_ms > mark)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        entity::{EntityTypeId, PropertyValue},
        role::NetworkRole,
    };

    fn fixture() -> (PropertySubscriber, NetworkEntity, EventBus) {
        let id = NetworkEntityId(5);
        (
            PropertySubscriber::new(id, ConnectionId(1)),
            NetworkEntity::new(id, EntityTypeId(1), NetworkRole::Client),
            EventBus::default(),
        )
    }

    fn hp(v: i64) -> PropertyDiff {
        PropertyDiff {
            changes: vec![("hp".to_string(), PropertyValue::Int(v))],
        }
    }

    #[test]
    fn first_packet_is_always_valid() {
        let (sub, _, _) = fixture();
        assert!(sub.is_packet_id_valid(PacketId(1)));
        assert!(sub.last_received_packet_id().is_none());
    }

    #[test]
    fn in_order_then_stale() {
        let (mut sub, mut ent, mut bus) = fixture();
        assert!(sub.handle_property_change_message(PacketId(3), &hp(30), true, &mut ent, &mut bus));
        assert!(sub.handle_property_change_message(PacketId(9), &hp(90), true, &mut ent, &mut bus));
        // Older packet arriving late is a no-op.
        assert!(!sub.handle_property_change_message(PacketId(3), &hp(30), true, &mut ent, &mut bus));
        assert_eq!(sub.last_received_packet_id(), Some(PacketId(9)));
        assert_eq!(ent.property("hp"), Some(&PropertyValue::Int(90)));
    }

    #[test]
    fn reversed_order_keeps_newest() {
        let (mut sub, mut ent, mut bus) = fixture();
        assert!(sub.handle_property_change_message(PacketId(9), &hp(90), false, &mut ent, &mut bus));
        assert!(!sub.handle_property_change_message(PacketId(3), &hp(30), false, &mut ent, &mut bus));
        assert_eq!(sub.last_received_packet_id(), Some(PacketId(9)));
        assert_eq!(ent.property("hp"), Some(&PropertyValue::Int(90)));
    }

    #[test]
    fn duplicate_is_rejected() {
        let (mut sub, mut ent, mut bus) = fixture();
        assert!(sub.handle_property_change_message(PacketId(4), &hp(1), false, &mut ent, &mut bus));
        assert!(!sub.handle_property_change_message(PacketId(4), &hp(2), false, &mut ent, &mut bus));
        assert_eq!(ent.property("hp"), Some(&PropertyValue::Int(1)));
    }

    #[test]
    fn notifications_only_when_requested_and_changed() {
        let (mut sub, mut ent, mut bus) = fixture();
        sub.handle_property_change_message(PacketId(1), &hp(1), false, &mut ent, &mut bus);
        assert_eq!(bus.len::<PropertyChanged>(), 0);
        sub.handle_property_change_message(PacketId(2), &hp(1), true, &mut ent, &mut bus);
        assert_eq!(bus.len::<PropertyChanged>(), 0);
        sub.handle_property_change_message(PacketId(3), &hp(2), true, &mut ent, &mut bus);
        assert_eq!(bus.drain::<PropertyChanged>()[0].names, vec!["hp".to_string()]);
    }

    #[test]
    fn deleted_only_after_grace_period() {
        let (mut sub, _, _) = fixture();
        sub.set_deleting(1_000, 200);
        assert!(sub.is_deleting());
        assert!(!sub.is_deleted(1_000));
        assert!(!sub.is_deleted(1_200));
        assert!(sub.is_deleted(1_201));
    }

    #[test]
    fn earlier_mark_does_not_shorten_window() {
        let (mut sub, _, _) = fixture();
        sub.set_deleting(1_000, 200);
        sub.set_deleting(500, 100);
        assert_eq!(sub.marked_for_removal_at_ms(), Some(1_200));
        sub.set_deleting(1_100, 200);
        assert_eq!(sub.marked_for_removal_at_ms(), Some(1_300));
    }

    #[test]
    fn zero_time_mark_still_counts_as_deleting() {
        let (mut sub, _, _) = fixture();
        sub.set_deleting(0, 0);
        assert!(sub.is_deleting());
        assert!(!sub.is_deleted(0));
        assert!(sub.is_deleted(1));
    }

    #[test]
    fn clear_deleting_revives() {
        let (mut sub, _, _) = fixture();
        sub.set_deleting(10, 10);
        sub.clear_deleting();
        assert!(!sub.is_deleting());
        assert!(!sub.is_deleted(u64::MAX));
    }
}
