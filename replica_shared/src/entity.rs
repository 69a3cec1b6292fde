//! Replicated entities.
//!
//! An entity is a bag of named properties plus its network identity. The
//! store keeps entities in id order so iteration (and therefore packet
//! contents) is stable from run to run.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{math::Vec3, net::ConnectionId, role::NetworkRole, serializer::Serializer};

/// Opaque, globally unique entity id. Never reused.
///
/// The top 16 bits name the host that spawned the entity, so hosts with
/// distinct host ids never hand out the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetworkEntityId(pub u64);

const HOST_SHIFT: u32 = 48;
const LOCAL_MASK: u64 = (1 << HOST_SHIFT) - 1;

impl NetworkEntityId {
    pub fn from_parts(host: u16, local: u64) -> Self {
        Self((u64::from(host) << HOST_SHIFT) | (local & LOCAL_MASK))
    }

    /// Host id of the spawning world.
    pub fn host(self) -> u16 {
        (self.0 >> HOST_SHIFT) as u16
    }

    pub fn local(self) -> u64 {
        self.0 & LOCAL_MASK
    }
}

/// Entity type, used to look up RPC handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityTypeId(pub u32);

/// Upper bound on properties carried by one diff.
pub const MAX_DIFF_ENTRIES: u32 = 1024;

/// A replicated property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f32),
    Vec3(Vec3),
    Text(String),
}

impl PropertyValue {
    fn tag(&self) -> u8 {
        match self {
            PropertyValue::Bool(_) => 0,
            PropertyValue::Int(_) => 1,
            PropertyValue::Float(_) => 2,
            PropertyValue::Vec3(_) => 3,
            PropertyValue::Text(_) => 4,
        }
    }

    fn empty_for_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => PropertyValue::Bool(false),
            1 => PropertyValue::Int(0),
            2 => PropertyValue::Float(0.0),
            3 => PropertyValue::Vec3(Vec3::ZERO),
            4 => PropertyValue::Text(String::new()),
            _ => return None,
        })
    }

    fn serialize_value(&mut self, s: &mut dyn Serializer, name: &str) -> bool {
        match self {
            PropertyValue::Bool(v) => s.serialize_bool(v, name),
            PropertyValue::Int(v) => s.serialize_i64(v, name),
            PropertyValue::Float(v) => s.serialize_f32(v, name),
            PropertyValue::Vec3(v) => s.serialize_vec3(v, name),
            PropertyValue::Text(v) => s.serialize_string(v, name),
        }
    }

    pub fn as_vec3(&self) -> Option<Vec3> {
        match self {
            PropertyValue::Vec3(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

/// Set of property writes, in name order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyDiff {
    pub changes: Vec<(String, PropertyValue)>,
}

impl PropertyDiff {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Reads or writes the diff depending on the serializer's mode.
    pub fn serialize(&mut self, s: &mut dyn Serializer) -> bool {
        let mut count = self.changes.len() as u32;
        if !s.serialize_u32(&mut count, "count") {
            return false;
        }
        if count > MAX_DIFF_ENTRIES {
            return false;
        }

        match s.mode() {
            crate::serializer::SerializerMode::Write => {
                for (name, value) in self.changes.iter_mut() {
                    let mut tag = value.tag();
                    if !(s.serialize_string(name, "name")
                        && s.serialize_u8(&mut tag, "tag")
                        && value.serialize_value(s, name))
                    {
                        return false;
                    }
                }
            }
            crate::serializer::SerializerMode::Read => {
                self.changes.clear();
                for _ in 0..count {
                    let mut name = String::new();
                    let mut tag = 0u8;
                    if !(s.serialize_string(&mut name, "name") && s.serialize_u8(&mut tag, "tag")) {
                        return false;
                    }
                    let Some(mut value) = PropertyValue::empty_for_tag(tag) else {
                        return false;
                    };
                    if !value.serialize_value(s, &name) {
                        return false;
                    }
                    self.changes.push((name, value));
                }
            }
        }
        s.is_valid()
    }
}

/// One replicated entity instance on this host.
#[derive(Debug, Clone)]
pub struct NetworkEntity {
    pub id: NetworkEntityId,
    pub entity_type: EntityTypeId,
    pub role: NetworkRole,
    /// On the Authority host: the peer that controls this entity, if any.
    pub controller: Option<ConnectionId>,
    /// On a proxy host: the connection the Authority instance lives behind.
    pub authority_connection: Option<ConnectionId>,
    properties: BTreeMap<String, PropertyValue>,
}

impl NetworkEntity {
    pub fn new(id: NetworkEntityId, entity_type: EntityTypeId, role: NetworkRole) -> Self {
        Self {
            id,
            entity_type,
            role,
            controller: None,
            authority_connection: None,
            properties: BTreeMap::new(),
        }
    }

    /// Writes a property. Returns true if the stored value changed.
    pub fn set_property(&mut self, name: &str, value: PropertyValue) -> bool {
        match self.properties.get(name) {
            Some(old) if *old == value => false,
            _ => {
                self.properties.insert(name.to_string(), value);
                true
            }
        }
    }

    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    pub fn properties(&self) -> &BTreeMap<String, PropertyValue> {
        &self.properties
    }

    /// Applies a received diff, returning the names whose value changed.
    pub fn apply_diff(&mut self, diff: &PropertyDiff) -> Vec<String> {
        let mut changed = Vec::new();
        for (name, value) in &diff.changes {
            if self.set_property(name, value.clone()) {
                changed.push(name.clone());
            }
        }
        changed
    }

    /// Every property, as a diff against nothing.
    pub fn full_state(&self) -> PropertyDiff {
        PropertyDiff {
            changes: self
                .properties
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Properties that differ from `baseline`.
    pub fn diff_against(&self, baseline: &BTreeMap<String, PropertyValue>) -> PropertyDiff {
        PropertyDiff {
            changes: self
                .properties
                .iter()
                .filter(|(k, v)| baseline.get(*k) != Some(*v))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

/// Entities known to one world.
#[derive(Debug, Default)]
pub struct EntityStore {
    host_id: u16,
    next_id: u64,
    entities: BTreeMap<NetworkEntityId, NetworkEntity>,
}

impl EntityStore {
    /// Store whose spawned ids carry `host_id` in their high bits.
    pub fn with_host(host_id: u16) -> Self {
        Self {
            host_id,
            ..Default::default()
        }
    }

    pub fn host_id(&self) -> u16 {
        self.host_id
    }

    /// Creates a locally owned entity with a fresh id.
    pub fn spawn(&mut self, entity_type: EntityTypeId, role: NetworkRole) -> NetworkEntityId {
        self.next_id += 1;
        let id = NetworkEntityId::from_parts(self.host_id, self.next_id);
        self.entities
            .insert(id, NetworkEntity::new(id, entity_type, role));
        id
    }

    /// Inserts an instance whose id may have been assigned by another host.
    pub fn insert(&mut self, entity: NetworkEntity) {
        // Keep local allocation clear of ids already carrying our host id.
        if entity.id.host() == self.host_id {
            self.next_id = self.next_id.max(entity.id.local());
        }
        self.entities.insert(entity.id, entity);
    }

    pub fn get(&self, id: NetworkEntityId) -> Option<&NetworkEntity> {
        self.entities.get(&id)
    }

    pub fn get_mut(&mut self, id: NetworkEntityId) -> Option<&mut NetworkEntity> {
        self.entities.get_mut(&id)
    }

    pub fn remove(&mut self, id: NetworkEntityId) -> Option<NetworkEntity> {
        self.entities.remove(&id)
    }

    pub fn contains(&self, id: NetworkEntityId) -> bool {
        self.entities.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NetworkEntity> {
        self.entities.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut NetworkEntity> {
        self.entities.values_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::{ReadSerializer, WriteSerializer};

    #[test]
    fn spawned_ids_are_never_reused() {
        let mut store = EntityStore::default();
        let a = store.spawn(EntityTypeId(1), NetworkRole::Authority);
        store.remove(a);
        let b = store.spawn(EntityTypeId(1), NetworkRole::Authority);
        assert_ne!(a, b);
    }

    #[test]
    fn inserted_remote_ids_push_local_allocation_forward() {
        let mut store = EntityStore::default();
        store.insert(NetworkEntity::new(NetworkEntityId(40), EntityTypeId(1), NetworkRole::Client));
        let local = store.spawn(EntityTypeId(1), NetworkRole::Authority);
        assert_eq!(local, NetworkEntityId(41));
    }

    #[test]
    fn hosts_allocate_disjoint_ids() {
        let mut a = EntityStore::with_host(1);
        let mut b = EntityStore::with_host(2);
        let from_a = a.spawn(EntityTypeId(1), NetworkRole::Authority);
        let from_b = b.spawn(EntityTypeId(1), NetworkRole::Authority);
        assert_ne!(from_a, from_b);
        assert_eq!(from_a.host(), 1);
        assert_eq!(from_b.host(), 2);
        assert_eq!(from_a.local(), from_b.local());

        // A foreign id does not move this host's counter.
        a.insert(NetworkEntity::new(
            NetworkEntityId::from_parts(2, 900),
            EntityTypeId(1),
            NetworkRole::Server,
        ));
        let next = a.spawn(EntityTypeId(1), NetworkRole::Authority);
        assert_eq!(next, NetworkEntityId::from_parts(1, 2));
    }

    #[test]
    fn diff_only_contains_changed_properties() {
        let mut e = NetworkEntity::new(NetworkEntityId(1), EntityTypeId(1), NetworkRole::Authority);
        e.set_property("hp", PropertyValue::Int(100));
        e.set_property("pos", PropertyValue::Vec3(Vec3::ZERO));
        let baseline = e.properties().clone();

        assert!(e.diff_against(&baseline).is_empty());
        e.set_property("hp", PropertyValue::Int(90));
        let diff = e.diff_against(&baseline);
        assert_eq!(diff.changes, vec![("hp".to_string(), PropertyValue::Int(90))]);
    }

    #[test]
    fn diff_with_unknown_tag_is_rejected() {
        let mut diff = PropertyDiff {
            changes: vec![("hp".to_string(), PropertyValue::Int(1))],
        };
        let mut w = WriteSerializer::new();
        assert!(diff.serialize(&mut w));
        let mut raw = w.finish().unwrap().to_vec();
        // count(4) + len(2) + "hp"(2) => tag byte
        raw[8] = 9;

        let mut back = PropertyDiff::default();
        assert!(!back.serialize(&mut ReadSerializer::new(raw)));
    }

    #[test]
    fn apply_diff_reports_only_real_changes() {
        let mut e = NetworkEntity::new(NetworkEntityId(1), EntityTypeId(1), NetworkRole::Client);
        e.set_property("name", PropertyValue::Text("crate".into()));
        let diff = PropertyDiff {
            changes: vec![
                ("name".to_string(), PropertyValue::Text("crate".into())),
                ("open".to_string(), PropertyValue::Bool(true)),
            ],
        };
        assert_eq!(e.apply_diff(&diff), vec!["open".to_string()]);
    }
}
