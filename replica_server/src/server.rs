//! UDP transport for a replication world.
//!
//! One socket serves every peer. The first byte of each datagram selects the
//! channel: control messages run the `Hello`/`Welcome` handshake, replication
//! frames are forwarded to the world inbox tagged with the sender's
//! connection id. Outbound datagrams go through a single send task so the
//! tick thread never touches the socket.
//!
//! Peers the world flags for misbehaviour are removed on the tick thread and
//! reported back here, where the address mapping is dropped and the peer is
//! told with a `Disconnect`.
//!
//! Frames are sent as plain datagrams; the reliability a packet asks for is
//! not enforced here.

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};

use anyhow::Context;
use bytes::Bytes;
use replica_shared::{
    config::ReplicationConfig,
    interest::{BitmaskInterestHandler, RulesHandlerId},
    net::{
        decode_datagram, encode_datagram, encode_frame, Connection, ConnectionId, Datagram, NetMsg,
        PacketId, PacketIdCounter, Reliability, PROTOCOL_VERSION,
    },
    replication::ReplicationMode,
    world::WorldHandle,
};
use tokio::{net::UdpSocket, sync::mpsc};
use tracing::{debug, info, trace, warn};

/// Largest datagram we accept.
const MAX_DATAGRAM: usize = 64 * 1024;

type Outbound = mpsc::UnboundedSender<(SocketAddr, Bytes)>;

/// [`Connection`] for one UDP peer.
pub struct UdpConnection {
    id: ConnectionId,
    peer: SocketAddr,
    packet_ids: PacketIdCounter,
    tx: Outbound,
}

impl UdpConnection {
    fn new(id: ConnectionId, peer: SocketAddr, tx: Outbound) -> Self {
        Self {
            id,
            peer,
            packet_ids: PacketIdCounter::default(),
            tx,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl Connection for UdpConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send(&mut self, body: Bytes, reliability: Reliability) -> anyhow::Result<PacketId> {
        let packet_id = self.packet_ids.next_id();
        let datagram = encode_datagram(&Datagram::Replication(encode_frame(packet_id, &body)))?;
        trace!(connection = ?self.id, packet = packet_id.0, ?reliability, len = datagram.len(), "udp send");
        self.tx
            .send((self.peer, datagram))
            .map_err(|_| anyhow::anyhow!("udp send task has stopped"))?;
        Ok(packet_id)
    }
}

/// Accepts peers and feeds their traffic into a world.
pub struct ReplicaServer {
    pub cfg: ReplicationConfig,
    socket: Arc<UdpSocket>,
    world: WorldHandle,
    peers: HashMap<SocketAddr, ConnectionId>,
    outbound: Outbound,
    interest: RulesHandlerId,
    interest_mask: u32,
    evicted: mpsc::UnboundedReceiver<ConnectionId>,
}

/// What woke the receive loop.
enum Wake {
    Datagram(usize, SocketAddr),
    Evicted(ConnectionId),
}

impl ReplicaServer {
    /// Binds `cfg.server_addr`. New peers get a rule with `interest_mask` on
    /// the bitmask handler registered as `interest`.
    pub async fn bind(
        cfg: ReplicationConfig,
        world: WorldHandle,
        interest: RulesHandlerId,
        interest_mask: u32,
    ) -> anyhow::Result<Self> {
        let addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        let socket = Arc::new(UdpSocket::bind(addr).await.context("udp bind")?);

        let (outbound, mut rx) = mpsc::unbounded_channel::<(SocketAddr, Bytes)>();
        let send_socket = socket.clone();
        tokio::spawn(async move {
            while let Some((to, datagram)) = rx.recv().await {
                if let Err(e) = send_socket.send_to(&datagram, to).await {
                    warn!(%to, error = %e, "udp send failed");
                }
            }
        });

        // Flagged peers leave the world on its own thread; we only hear the id.
        let (evict_tx, evicted) = mpsc::unbounded_channel();
        world.run(move |w| {
            w.add_system(move |w, _| {
                for id in w.take_flagged_connections() {
                    warn!(connection = ?id, "dropping misbehaving peer");
                    w.remove_connection(id);
                    if evict_tx.send(id).is_err() {
                        debug!(connection = ?id, "server gone; eviction not reported");
                    }
                }
            });
        })?;

        Ok(Self {
            cfg,
            socket,
            world,
            peers: HashMap::new(),
            outbound,
            interest,
            interest_mask,
            evicted,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.socket.local_addr().context("udp local_addr")
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Serves datagrams until the socket fails.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            self.recv_once(&mut buf).await?;
        }
    }

    /// Handles one datagram or one eviction reported by the world.
    /// Malformed input is logged, not returned.
    pub async fn recv_once(&mut self, buf: &mut [u8]) -> anyhow::Result<()> {
        let socket = self.socket.clone();
        let wake = tokio::select! {
            res = socket.recv_from(buf) => {
                let (n, from) = res.context("udp recv")?;
                Wake::Datagram(n, from)
            }
            Some(id) = self.evicted.recv() => Wake::Evicted(id),
        };
        match wake {
            Wake::Datagram(n, from) => {
                let raw = Bytes::copy_from_slice(&buf[..n]);
                if let Err(e) = self.handle_datagram(from, raw) {
                    debug!(%from, error = %format!("{e:#}"), "datagram dropped");
                }
                Ok(())
            }
            Wake::Evicted(id) => self.on_evicted(id),
        }
    }

    fn on_evicted(&mut self, id: ConnectionId) -> anyhow::Result<()> {
        let Some(addr) = self
            .peers
            .iter()
            .find_map(|(addr, conn)| (*conn == id).then_some(*addr))
        else {
            return Ok(());
        };
        self.peers.remove(&addr);
        info!(connection = ?id, %addr, "peer evicted");
        self.send_control(
            addr,
            NetMsg::Disconnect {
                reason: "protocol violation".to_string(),
            },
        )
    }

    fn handle_datagram(&mut self, from: SocketAddr, raw: Bytes) -> anyhow::Result<()> {
        match decode_datagram(raw)? {
            Datagram::Control(NetMsg::Hello { protocol }) if protocol == PROTOCOL_VERSION => {
                self.on_hello(from)
            }
            Datagram::Control(NetMsg::Hello { protocol }) => {
                warn!(%from, protocol, expected = PROTOCOL_VERSION, "protocol mismatch");
                self.send_control(
                    from,
                    NetMsg::Disconnect {
                        reason: format!("protocol {protocol} unsupported"),
                    },
                )
            }
            Datagram::Control(NetMsg::Disconnect { reason }) => {
                if let Some(id) = self.peers.remove(&from) {
                    info!(connection = ?id, %from, %reason, "peer disconnected");
                    self.world.disconnect(id)?;
                }
                Ok(())
            }
            Datagram::Control(other) => {
                debug!(%from, ?other, "unexpected control message");
                Ok(())
            }
            Datagram::Replication(frame) => match self.peers.get(&from) {
                Some(id) => self.world.inbound(*id, frame),
                None => {
                    debug!(%from, "replication frame from unknown peer");
                    Ok(())
                }
            },
        }
    }

    fn on_hello(&mut self, from: SocketAddr) -> anyhow::Result<()> {
        // A repeated Hello means our Welcome was lost.
        if let Some(id) = self.peers.get(&from).copied() {
            return self.send_control(from, NetMsg::Welcome { connection_id: id });
        }

        let id = ConnectionId::new_unique();
        let conn = UdpConnection::new(id, from, self.outbound.clone());
        self.world
            .connect(Box::new(conn), ReplicationMode::ServerToClient)?;

        let handler = self.interest;
        let mask = self.interest_mask;
        self.world.run(move |w| {
            match w
                .interest_mut()
                .handler_mut::<BitmaskInterestHandler>(handler)
            {
                Some(h) => h.set_rule(id, mask),
                None => warn!(?handler, "bitmask interest handler missing"),
            }
        })?;

        self.peers.insert(from, id);
        info!(connection = ?id, %from, "peer connected");
        self.send_control(from, NetMsg::Welcome { connection_id: id })
    }

    fn send_control(&self, to: SocketAddr, msg: NetMsg) -> anyhow::Result<()> {
        let datagram = encode_datagram(&Datagram::Control(msg))?;
        self.outbound
            .send((to, datagram))
            .map_err(|_| anyhow::anyhow!("udp send task has stopped"))
    }
}

/// Helper for tests: bind to an ephemeral localhost port.
pub async fn bind_ephemeral(
    world: WorldHandle,
    interest: RulesHandlerId,
    interest_mask: u32,
) -> anyhow::Result<(ReplicaServer, ReplicationConfig)> {
    let mut cfg = ReplicationConfig {
        server_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).to_string(),
        ..Default::default()
    };
    let server = ReplicaServer::bind(cfg.clone(), world, interest, interest_mask).await?;
    cfg.server_addr = server.local_addr()?.to_string();
    Ok((server, cfg))
}
