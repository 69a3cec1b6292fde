//! Interest management.
//!
//! Rules handlers decide which peer cares about which entity. Each handler is
//! incremental: `update()` returns only what changed since its own previous
//! update. The [`InterestManager`] merges handlers with union semantics (a
//! pair is of interest while any registered handler matches it) and exposes
//! the net per-tick `{ gained, lost }` result.

use std::{
    any::Any,
    collections::{BTreeMap, HashMap, HashSet},
};

use tracing::{debug, warn};

use crate::{
    entity::NetworkEntityId,
    math::{Aabb, Vec3},
    net::ConnectionId,
};

/// "This peer currently cares about this entity."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterestRecord {
    pub peer: ConnectionId,
    pub entity: NetworkEntityId,
}

impl InterestRecord {
    pub fn new(peer: ConnectionId, entity: NetworkEntityId) -> Self {
        Self { peer, entity }
    }
}

/// Interest changes, sorted by (peer, entity).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InterestDelta {
    pub gained: Vec<InterestRecord>,
    pub lost: Vec<InterestRecord>,
}

impl InterestDelta {
    pub fn is_empty(&self) -> bool {
        self.gained.is_empty() && self.lost.is_empty()
    }
}

/// Interest changes for one peer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeerInterest {
    pub added: Vec<NetworkEntityId>,
    pub removed: Vec<NetworkEntityId>,
}

impl PeerInterest {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// A source of interest matches.
pub trait RulesHandler: Send {
    fn name(&self) -> &str;

    /// Matches gained and lost since the previous call.
    fn update(&mut self) -> InterestDelta;

    /// Every pair this handler currently matches.
    fn current_matches(&self) -> Vec<InterestRecord>;

    /// Drops every attribute bound to `entity`.
    fn forget_entity(&mut self, entity: NetworkEntityId);

    /// Drops every rule bound to `peer`.
    fn forget_peer(&mut self, peer: ConnectionId);

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RulesHandlerId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Unregistered,
    Registered,
}

/// Merges all registered handlers into one per-tick interest delta.
#[derive(Default)]
pub struct InterestManager {
    next_handler_id: u32,
    // Registration order is evaluation order.
    handlers: Vec<(RulesHandlerId, Box<dyn RulesHandler>)>,
    pending_lost: Vec<InterestRecord>,
    match_counts: HashMap<InterestRecord, u32>,
    last_result: InterestDelta,
    by_peer: BTreeMap<ConnectionId, PeerInterest>,
    updates: u64,
}

impl InterestManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler; its matches count from the next `update()`.
    pub fn on_rules_handler_registered(&mut self, handler: Box<dyn RulesHandler>) -> RulesHandlerId {
        self.next_handler_id += 1;
        let id = RulesHandlerId(self.next_handler_id);
        debug!(handler = handler.name(), id = id.0, "interest handler registered");
        self.handlers.push((id, handler));
        id
    }

    /// Unregisters a handler. Everything it matched is reported lost on the
    /// next `update()`, unless another handler still matches it.
    pub fn on_rules_handler_unregistered(&mut self, id: RulesHandlerId) -> Option<Box<dyn RulesHandler>> {
        let pos = self.handlers.iter().position(|(hid, _)| *hid == id)?;
        let (_, handler) = self.handlers.remove(pos);
        let matches = handler.current_matches();
        debug!(
            handler = handler.name(),
            id = id.0,
            matches = matches.len(),
            "interest handler unregistered"
        );
        self.pending_lost.extend(matches);
        Some(handler)
    }

    pub fn handler_state(&self, id: RulesHandlerId) -> HandlerState {
        if self.handlers.iter().any(|(hid, _)| *hid == id) {
            HandlerState::Registered
        } else {
            HandlerState::Unregistered
        }
    }

    /// Typed access to a registered handler, e.g. to edit its rules.
    pub fn handler_mut<T: RulesHandler + 'static>(&mut self, id: RulesHandlerId) -> Option<&mut T> {
        self.handlers
            .iter_mut()
            .find(|(hid, _)| *hid == id)
            .and_then(|(_, h)| h.as_any_mut().downcast_mut::<T>())
    }

    pub fn forget_entity(&mut self, entity: NetworkEntityId) {
        for (_, h) in self.handlers.iter_mut() {
            h.forget_entity(entity);
        }
    }

    pub fn forget_peer(&mut self, peer: ConnectionId) {
        for (_, h) in self.handlers.iter_mut() {
            h.forget_peer(peer);
        }
    }

    /// Evaluates every registered handler once. Call once per tick.
    pub fn update(&mut self) -> &InterestDelta {
        // Presence of each touched pair before this update.
        let mut before: BTreeMap<InterestRecord, bool> = BTreeMap::new();

        for record in std::mem::take(&mut self.pending_lost) {
            self.apply(record, false, &mut before);
        }
        for i in 0..self.handlers.len() {
            let delta = self.handlers[i].1.update();
            for record in delta.lost {
                self.apply(record, false, &mut before);
            }
            for record in delta.gained {
                self.apply(record, true, &mut before);
            }
        }

        let mut result = InterestDelta::default();
        for (record, was_present) in before {
            let is_present = self.match_counts.contains_key(&record);
            match (was_present, is_present) {
                (false, true) => result.gained.push(record),
                (true, false) => result.lost.push(record),
                _ => {}
            }
        }

        self.by_peer.clear();
        for r in &result.gained {
            self.by_peer.entry(r.peer).or_default().added.push(r.entity);
        }
        for r in &result.lost {
            self.by_peer.entry(r.peer).or_default().removed.push(r.entity);
        }

        self.updates += 1;
        self.last_result = result;
        &self.last_result
    }

    fn apply(&mut self, record: InterestRecord, gained: bool, before: &mut BTreeMap<InterestRecord, bool>) {
        let present = self.match_counts.contains_key(&record);
        before.entry(record).or_insert(present);

        if gained {
            *self.match_counts.entry(record).or_insert(0) += 1;
            return;
        }
        match self.match_counts.get_mut(&record) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.match_counts.remove(&record);
            }
            None => warn!(?record, "interest lost for a pair that was never gained"),
        }
    }

    /// Result of the most recent `update()`.
    pub fn last_result(&self) -> &InterestDelta {
        &self.last_result
    }

    /// The most recent result restricted to one peer.
    pub fn peer_interest(&self, peer: ConnectionId) -> PeerInterest {
        self.by_peer.get(&peer).cloned().unwrap_or_default()
    }

    pub fn is_interested(&self, peer: ConnectionId, entity: NetworkEntityId) -> bool {
        self.match_counts
            .contains_key(&InterestRecord::new(peer, entity))
    }

    /// Number of `update()` calls so far.
    pub fn update_count(&self) -> u64 {
        self.updates
    }
}

/// Incremental rule/attribute matcher shared by the concrete handlers.
///
/// Rules belong to peers, attributes to entities. Only dirty rules and
/// attributes are re-evaluated on `update()`.
pub struct IncrementalMatcher<R, A> {
    rules: HashMap<ConnectionId, R>,
    attributes: HashMap<NetworkEntityId, A>,
    dirty_rules: HashSet<ConnectionId>,
    dirty_attributes: HashSet<NetworkEntityId>,
    matches: HashSet<InterestRecord>,
    predicate: fn(&R, &A) -> bool,
}

impl<R, A> IncrementalMatcher<R, A> {
    pub fn new(predicate: fn(&R, &A) -> bool) -> Self {
        Self {
            rules: HashMap::new(),
            attributes: HashMap::new(),
            dirty_rules: HashSet::new(),
            dirty_attributes: HashSet::new(),
            matches: HashSet::new(),
            predicate,
        }
    }

    pub fn set_rule(&mut self, peer: ConnectionId, rule: R) {
        self.rules.insert(peer, rule);
        self.dirty_rules.insert(peer);
    }

    pub fn remove_rule(&mut self, peer: ConnectionId) {
        if self.rules.remove(&peer).is_some() {
            self.dirty_rules.insert(peer);
        }
    }

    pub fn set_attribute(&mut self, entity: NetworkEntityId, attribute: A) {
        self.attributes.insert(entity, attribute);
        self.dirty_attributes.insert(entity);
    }

    pub fn remove_attribute(&mut self, entity: NetworkEntityId) {
        if self.attributes.remove(&entity).is_some() {
            self.dirty_attributes.insert(entity);
        }
    }

    pub fn rule(&self, peer: ConnectionId) -> Option<&R> {
        self.rules.get(&peer)
    }

    pub fn attribute(&self, entity: NetworkEntityId) -> Option<&A> {
        self.attributes.get(&entity)
    }

    pub fn update(&mut self) -> InterestDelta {
        let mut delta = InterestDelta::default();

        let mut dirty_rules: Vec<_> = self.dirty_rules.drain().collect();
        dirty_rules.sort();
        for peer in dirty_rules {
            match self.rules.get(&peer) {
                Some(rule) => {
                    for (entity, attr) in &self.attributes {
                        let wanted = (self.predicate)(rule, attr);
                        reconcile(&mut self.matches, &mut delta, InterestRecord::new(peer, *entity), wanted);
                    }
                }
                None => {
                    self.matches.retain(|r| {
                        let keep = r.peer != peer;
                        if !keep {
                            delta.lost.push(*r);
                        }
                        keep
                    });
                }
            }
        }

        let mut dirty_attributes: Vec<_> = self.dirty_attributes.drain().collect();
        dirty_attributes.sort();
        for entity in dirty_attributes {
            match self.attributes.get(&entity) {
                Some(attr) => {
                    for (peer, rule) in &self.rules {
                        let wanted = (self.predicate)(rule, attr);
                        reconcile(&mut self.matches, &mut delta, InterestRecord::new(*peer, entity), wanted);
                    }
                }
                None => {
                    self.matches.retain(|r| {
                        let keep = r.entity != entity;
                        if !keep {
                            delta.lost.push(*r);
                        }
                        keep
                    });
                }
            }
        }

        delta.gained.sort();
        delta.lost.sort();
        delta
    }

    pub fn current_matches(&self) -> Vec<InterestRecord> {
        let mut all: Vec<_> = self.matches.iter().copied().collect();
        all.sort();
        all
    }
}

fn reconcile(
    matches: &mut HashSet<InterestRecord>,
    delta: &mut InterestDelta,
    record: InterestRecord,
    wanted: bool,
) {
    if wanted {
        if matches.insert(record) {
            delta.gained.push(record);
        }
    } else if matches.remove(&record) {
        delta.lost.push(record);
    }
}

/// Peer rule mask AND entity attribute mask must be non-zero.
pub struct BitmaskInterestHandler {
    inner: IncrementalMatcher<u32, u32>,
}

impl Default for BitmaskInterestHandler {
    fn default() -> Self {
        Self {
            inner: IncrementalMatcher::new(|rule, attr| rule & attr != 0),
        }
    }
}

impl BitmaskInterestHandler {
    pub fn set_rule(&mut self, peer: ConnectionId, mask: u32) {
        self.inner.set_rule(peer, mask);
    }

    pub fn remove_rule(&mut self, peer: ConnectionId) {
        self.inner.remove_rule(peer);
    }

    pub fn set_attribute(&mut self, entity: NetworkEntityId, mask: u32) {
        self.inner.set_attribute(entity, mask);
    }

    pub fn remove_attribute(&mut self, entity: NetworkEntityId) {
        self.inner.remove_attribute(entity);
    }
}

impl RulesHandler for BitmaskInterestHandler {
    fn name(&self) -> &str {
        "bitmask"
    }

    fn update(&mut self) -> InterestDelta {
        self.inner.update()
    }

    fn current_matches(&self) -> Vec<InterestRecord> {
        self.inner.current_matches()
    }

    fn forget_entity(&mut self, entity: NetworkEntityId) {
        self.inner.remove_attribute(entity);
    }

    fn forget_peer(&mut self, peer: ConnectionId) {
        self.inner.remove_rule(peer);
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Entity position must lie inside the peer's box.
pub struct ProximityInterestHandler {
    inner: IncrementalMatcher<Aabb, Vec3>,
}

impl Default for ProximityInterestHandler {
    fn default() -> Self {
        Self {
            inner: IncrementalMatcher::new(|area, pos| area.contains(*pos)),
        }
    }
}

impl ProximityInterestHandler {
    pub fn set_rule(&mut self, peer: ConnectionId, area: Aabb) {
        self.inner.set_rule(peer, area);
    }

    pub fn remove_rule(&mut self, peer: ConnectionId) {
        self.inner.remove_rule(peer);
    }

    pub fn set_position(&mut self, entity: NetworkEntityId, position: Vec3) {
        // Unchanged positions stay clean.
        if self.inner.attribute(entity) != Some(&position) {
            self.inner.set_attribute(entity, position);
        }
    }

    pub fn remove_position(&mut self, entity: NetworkEntityId) {
        self.inner.remove_attribute(entity);
    }
}

impl RulesHandler for ProximityInterestHandler {
    fn name(&self) -> &str {
        "proximity"
    }

    fn update(&mut self) -> InterestDelta {
        self.inner.update()
    }

    fn current_matches(&self) -> Vec<InterestRecord> {
        self.inner.current_matches()
    }

    fn forget_entity(&mut self, entity: NetworkEntityId) {
        self.inner.remove_attribute(entity);
    }

    fn forget_peer(&mut self, peer: ConnectionId) {
        self.inner.remove_rule(peer);
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
