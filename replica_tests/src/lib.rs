//! In-process harness: one server world and any number of client worlds wired
//! together with loopback connections. Frames are collected, not delivered,
//! so tests can drop, reorder or replay them.

use std::time::Duration;

use replica_shared::{
    config::ReplicationConfig,
    entity::{EntityTypeId, NetworkEntityId, PropertyValue},
    error::ReplicationResult,
    interest::{BitmaskInterestHandler, RulesHandlerId},
    net::{decode_frame, decode_packet, ConnectionId, LoopbackConnection, ReplicationPacket, SentFrame},
    replication::{PacketReport, ReplicationMode},
    subscriber::TimeMs,
    world::ReplicationWorld,
};
use tokio::sync::mpsc::UnboundedReceiver;

pub const UNIT: EntityTypeId = EntityTypeId(1);

/// Mask every harness peer subscribes to.
pub const DEFAULT_MASK: u32 = 1;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

pub struct ClientPeer {
    pub world: ReplicationWorld,
    /// Id of this client's connection inside the server world.
    pub server_side: ConnectionId,
    /// Id of the server connection inside this client's world.
    pub client_side: ConnectionId,
    to_client: UnboundedReceiver<SentFrame>,
    to_server: UnboundedReceiver<SentFrame>,
}

pub struct Loopback {
    pub server: ReplicationWorld,
    pub interest: RulesHandlerId,
    pub clients: Vec<ClientPeer>,
    config: ReplicationConfig,
}

impl Loopback {
    pub fn new(config: ReplicationConfig) -> Self {
        let (mut server, _) = ReplicationWorld::new(config.clone());
        let interest = server
            .interest_mut()
            .on_rules_handler_registered(Box::<BitmaskInterestHandler>::default());
        Self {
            server,
            interest,
            clients: Vec::new(),
            config,
        }
    }

    /// Server plus one client subscribed with [`DEFAULT_MASK`].
    pub fn with_client(config: ReplicationConfig) -> Self {
        let mut lb = Self::new(config);
        lb.add_client(DEFAULT_MASK);
        lb
    }

    /// Connects a new client world. Returns its index in `clients`.
    pub fn add_client(&mut self, mask: u32) -> usize {
        let server_side = ConnectionId::new_unique();
        let client_side = ConnectionId::new_unique();
        let (to_client_conn, to_client) = LoopbackConnection::new(server_side);
        let (to_server_conn, to_server) = LoopbackConnection::new(client_side);

        self.server
            .add_connection(Box::new(to_client_conn), ReplicationMode::ServerToClient);
        self.bitmask().set_rule(server_side, mask);

        let (mut world, _) = ReplicationWorld::new(self.config.clone());
        world.add_connection(Box::new(to_server_conn), ReplicationMode::ClientToServer);

        self.clients.push(ClientPeer {
            world,
            server_side,
            client_side,
            to_client,
            to_server,
        });
        self.clients.len() - 1
    }

    pub fn bitmask(&mut self) -> &mut BitmaskInterestHandler {
        let id = self.interest;
        match self
            .server
            .interest_mut()
            .handler_mut::<BitmaskInterestHandler>(id)
        {
            Some(h) => h,
            None => panic!("bitmask handler is registered in new()"),
        }
    }

    /// Spawns a server entity with an `hp` property, visible to [`DEFAULT_MASK`].
    pub fn spawn(&mut self, hp: i64) -> NetworkEntityId {
        let id = self.server.spawn_entity(UNIT);
        if let Some(e) = self.server.entity_mut(id) {
            e.set_property("hp", PropertyValue::Int(hp));
        }
        self.bitmask().set_attribute(id, DEFAULT_MASK);
        id
    }

    pub fn set_hp(&mut self, id: NetworkEntityId, hp: i64) {
        if let Some(e) = self.server.entity_mut(id) {
            e.set_property("hp", PropertyValue::Int(hp));
        }
    }

    /// Ticks the server at `now` and returns what it sent to client `idx`.
    pub fn server_tick(&mut self, now: TimeMs, idx: usize) -> Vec<SentFrame> {
        self.server.set_frame_time_ms(now);
        self.server.tick(Duration::ZERO);
        collect(&mut self.clients[idx].to_client)
    }

    /// Ticks the server at `now` and returns what it sent to every client.
    pub fn server_tick_all(&mut self, now: TimeMs) -> Vec<Vec<SentFrame>> {
        self.server.set_frame_time_ms(now);
        self.server.tick(Duration::ZERO);
        self.clients
            .iter_mut()
            .map(|c| collect(&mut c.to_client))
            .collect()
    }

    pub fn client_tick(&mut self, now: TimeMs, idx: usize) -> Vec<SentFrame> {
        let client = &mut self.clients[idx];
        client.world.set_frame_time_ms(now);
        client.world.tick(Duration::ZERO);
        collect(&mut client.to_server)
    }

    pub fn deliver_to_client(
        &mut self,
        idx: usize,
        frames: Vec<SentFrame>,
    ) -> Vec<ReplicationResult<PacketReport>> {
        let client = &mut self.clients[idx];
        let from = client.client_side;
        frames
            .into_iter()
            .map(|f| client.world.handle_inbound(from, f.frame))
            .collect()
    }

    pub fn deliver_to_server(
        &mut self,
        idx: usize,
        frames: Vec<SentFrame>,
    ) -> Vec<ReplicationResult<PacketReport>> {
        let from = self.clients[idx].server_side;
        frames
            .into_iter()
            .map(|f| self.server.handle_inbound(from, f.frame))
            .collect()
    }

    /// Server tick, delivery, client tick, delivery, for client 0.
    pub fn step(&mut self, now: TimeMs) {
        let down = self.server_tick(now, 0);
        self.deliver_to_client(0, down);
        let up = self.client_tick(now, 0);
        self.deliver_to_server(0, up);
    }

    pub fn client(&self, idx: usize) -> &ReplicationWorld {
        &self.clients[idx].world
    }

    pub fn client_mut(&mut self, idx: usize) -> &mut ReplicationWorld {
        &mut self.clients[idx].world
    }
}

/// Takes every frame captured on `rx` so far.
pub fn collect(rx: &mut UnboundedReceiver<SentFrame>) -> Vec<SentFrame> {
    let mut frames = Vec::new();
    while let Ok(f) = rx.try_recv() {
        frames.push(f);
    }
    frames
}

/// Decodes a captured frame. Panics on malformed input.
pub fn decode(frame: &SentFrame) -> ReplicationPacket {
    let (_, body) = match decode_frame(frame.frame.clone()) {
        Ok(parts) => parts,
        Err(e) => panic!("bad frame: {e}"),
    };
    match decode_packet(&body) {
        Ok(p) => p,
        Err(e) => panic!("bad packet: {e}"),
    }
}
