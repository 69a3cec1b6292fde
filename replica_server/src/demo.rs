//! Demo content for the standalone server: entities that drift around so
//! connected peers have a steady stream of diffs to receive. Every connected
//! peer controls one free drifter and may `nudge` it.

use std::time::Duration;

use rand::Rng;
use replica_shared::{
    entity::{EntityTypeId, NetworkEntity, NetworkEntityId, PropertyValue},
    interest::{BitmaskInterestHandler, RulesHandlerId},
    math::Vec3,
    rpc::RpcInvocation,
    serializer::{ReadSerializer, Serializer},
    world::ReplicationWorld,
};
use tracing::info;

pub const DRIFTER: EntityTypeId = EntityTypeId(1);

/// Attribute mask every demo entity carries.
pub const INTEREST_MASK: u32 = 1;

/// Spawns `count` drifters and the systems that move them and hand them out.
pub fn populate(world: &mut ReplicationWorld, interest: RulesHandlerId, count: usize) -> Vec<NetworkEntityId> {
    let mut rng = rand::thread_rng();
    let mut spawned = Vec::with_capacity(count);
    for i in 0..count {
        let id = world.spawn_entity(DRIFTER);
        let pos = Vec3::new(rng.gen_range(-50.0..50.0), 0.0, rng.gen_range(-50.0..50.0));
        if let Some(e) = world.entity_mut(id) {
            e.set_property("name", PropertyValue::Text(format!("drifter-{i}")));
            e.set_property("pos", PropertyValue::Vec3(pos));
        }
        spawned.push(id);
    }

    if let Some(h) = world
        .interest_mut()
        .handler_mut::<BitmaskInterestHandler>(interest)
    {
        for id in &spawned {
            h.set_attribute(*id, INTEREST_MASK);
        }
    }

    world.register_rpc_handler(DRIFTER, "nudge", nudge);
    let ids = spawned.clone();
    world.add_system(move |w, delta| {
        hand_out_drifters(w, &ids);
        drift(w, &ids, delta);
    });

    info!(count, "demo entities spawned");
    spawned
}

/// Gives each connected peer that controls no drifter the first free one.
/// Peers beyond the drifter count only observe.
fn hand_out_drifters(world: &mut ReplicationWorld, ids: &[NetworkEntityId]) {
    for peer in world.connection_ids() {
        let controls_one = ids
            .iter()
            .any(|id| world.entity(*id).is_some_and(|e| e.controller == Some(peer)));
        if controls_one {
            continue;
        }
        let free = ids
            .iter()
            .copied()
            .find(|id| world.entity(*id).is_some_and(|e| e.controller.is_none()));
        let Some(free) = free else {
            return;
        };
        if let Some(e) = world.entity_mut(free) {
            e.controller = Some(peer);
        }
        info!(connection = ?peer, entity = ?free, "drifter handed to peer");
    }
}

fn drift(world: &mut ReplicationWorld, ids: &[NetworkEntityId], delta: Duration) {
    let mut rng = rand::thread_rng();
    let dt = delta.as_secs_f32();
    for id in ids {
        let Some(e) = world.entity_mut(*id) else {
            continue;
        };
        let pos = e
            .property("pos")
            .and_then(PropertyValue::as_vec3)
            .unwrap_or(Vec3::ZERO);
        let velocity = Vec3::new(rng.gen_range(-1.0..1.0), 0.0, rng.gen_range(-1.0..1.0));
        e.set_property("pos", PropertyValue::Vec3(pos.add(velocity.scale(dt))));
    }
}

/// Moves the entity by the `Vec3` in the payload.
fn nudge(entity: &mut NetworkEntity, call: &RpcInvocation<'_>) -> anyhow::Result<()> {
    let mut r = ReadSerializer::new(call.envelope.payload.clone());
    let mut by = Vec3::ZERO;
    anyhow::ensure!(r.serialize_vec3(&mut by, "by"), "malformed nudge payload");

    let pos = entity
        .property("pos")
        .and_then(PropertyValue::as_vec3)
        .unwrap_or(Vec3::ZERO);
    entity.set_property("pos", PropertyValue::Vec3(pos.add(by)));
    Ok(())
}
