//! Networking primitives.
//!
//! The core never touches sockets. It sends through the [`Connection`]
//! capability, which frames a body with the connection's next [`PacketId`],
//! and it receives frames handed in by whatever transport owns the socket.
//!
//! Layout on the wire:
//! - frame: `u32 packet id (big endian) ++ body`
//! - body: JSON [`ReplicationPacket`]
//! - datagram (transports that multiplex control traffic): `u8 channel ++ ...`

use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Context;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{
    entity::{EntityTypeId, NetworkEntityId},
    error::{ReplicationError, ReplicationResult},
    role::{NetworkRole, RpcDirection},
};

/// Protocol version for compatibility checks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Datagram channel carrying [`NetMsg`] control messages.
pub const CHANNEL_CONTROL: u8 = 0;
/// Datagram channel carrying replication frames.
pub const CHANNEL_REPLICATION: u8 = 1;

/// Rough per-entry framing cost used for payload budgeting.
pub const ENTRY_OVERHEAD_BYTES: usize = 48;

static NEXT_CONNECTION_ID: AtomicU32 = AtomicU32::new(1);

/// Identifies one remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u32);

impl ConnectionId {
    pub fn new_unique() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Per-connection send sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PacketId(pub u32);

/// Hands out packet ids for one connection, starting at 1.
#[derive(Debug)]
pub struct PacketIdCounter {
    next: u32,
}

impl Default for PacketIdCounter {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl PacketIdCounter {
    pub fn next_id(&mut self) -> PacketId {
        let id = PacketId(self.next);
        self.next = self.next.wrapping_add(1).max(1);
        id
    }

    /// Id the next call to [`next_id`](Self::next_id) returns.
    pub fn peek(&self) -> PacketId {
        PacketId(self.next)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reliability {
    Unreliable,
    Reliable,
}

/// Transport capability consumed by the core.
pub trait Connection: Send {
    fn id(&self) -> ConnectionId;

    /// Frames `body` with the next packet id and hands it to the transport.
    fn send(&mut self, body: Bytes, reliability: Reliability) -> anyhow::Result<PacketId>;
}

/// What one packet entry carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Property record. `full` records carry every property and the role the
    /// receiver should instantiate.
    PropertyDiff {
        full: bool,
        role: NetworkRole,
        entity_type: EntityTypeId,
    },
    Rpc {
        direction: RpcDirection,
        name: String,
        reliable: bool,
    },
    /// The sender stopped replicating this entity.
    Delete,
    /// The sender lost track of this entity and asks for a full state.
    Reset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketEntry {
    pub entity_id: NetworkEntityId,
    pub kind: EntryKind,
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl PacketEntry {
    pub fn estimated_size(&self) -> usize {
        ENTRY_OVERHEAD_BYTES + self.payload.len() * 4
    }
}

/// Body of one replication frame. Entries are processed in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicationPacket {
    pub entries: Vec<PacketEntry>,
}

impl ReplicationPacket {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn property_records(&self) -> impl Iterator<Item = &PacketEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(e.kind, EntryKind::PropertyDiff { .. }))
    }

    pub fn rpc_entries(&self) -> impl Iterator<Item = &PacketEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(e.kind, EntryKind::Rpc { .. }))
    }

    /// Reliability the transport should use for this packet.
    pub fn reliability(&self) -> Reliability {
        let needs_reliable = self.entries.iter().any(|e| match &e.kind {
            EntryKind::PropertyDiff { full, .. } => *full,
            EntryKind::Rpc { reliable, .. } => *reliable,
            EntryKind::Delete | EntryKind::Reset => true,
        });
        if needs_reliable {
            Reliability::Reliable
        } else {
            Reliability::Unreliable
        }
    }
}

pub fn encode_packet(packet: &ReplicationPacket) -> anyhow::Result<Bytes> {
    let body = serde_json::to_vec(packet).context("serialize replication packet")?;
    Ok(Bytes::from(body))
}

pub fn decode_packet(body: &[u8]) -> ReplicationResult<ReplicationPacket> {
    serde_json::from_slice(body).map_err(|e| ReplicationError::SerializationFailure(e.to_string()))
}

pub fn encode_frame(packet_id: PacketId, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + body.len());
    buf.put_u32(packet_id.0);
    buf.extend_from_slice(body);
    buf.freeze()
}

pub fn decode_frame(mut frame: Bytes) -> ReplicationResult<(PacketId, Bytes)> {
    if frame.remaining() < 4 {
        return Err(ReplicationError::SerializationFailure(format!(
            "frame too short ({} bytes)",
            frame.len()
        )));
    }
    let id = frame.get_u32();
    Ok((PacketId(id), frame))
}

/// Control-plane message for transports that need a handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum NetMsg {
    Hello { protocol: u32 },
    Welcome { connection_id: ConnectionId },
    Disconnect { reason: String },
}

/// Datagram as seen by a multiplexing transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Datagram {
    Control(NetMsg),
    Replication(Bytes),
}

pub fn encode_datagram(datagram: &Datagram) -> anyhow::Result<Bytes> {
    let mut buf = BytesMut::new();
    match datagram {
        Datagram::Control(msg) => {
            buf.put_u8(CHANNEL_CONTROL);
            buf.extend_from_slice(&serde_json::to_vec(msg).context("serialize control msg")?);
        }
        Datagram::Replication(frame) => {
            buf.put_u8(CHANNEL_REPLICATION);
            buf.extend_from_slice(frame);
        }
    }
    Ok(buf.freeze())
}

pub fn decode_datagram(mut raw: Bytes) -> anyhow::Result<Datagram> {
    anyhow::ensure!(raw.has_remaining(), "empty datagram");
    match raw.get_u8() {
        CHANNEL_CONTROL => {
            let msg = serde_json::from_slice(&raw).context("deserialize control msg")?;
            Ok(Datagram::Control(msg))
        }
        CHANNEL_REPLICATION => Ok(Datagram::Replication(raw)),
        other => anyhow::bail!("unknown datagram channel {other}"),
    }
}

/// Frame produced by a [`LoopbackConnection`].
#[derive(Debug, Clone)]
pub struct SentFrame {
    pub connection: ConnectionId,
    pub reliability: Reliability,
    pub frame: Bytes,
}

/// In-process connection that pushes frames onto a channel. Used to wire two
/// worlds together in one process and by tests.
pub struct LoopbackConnection {
    id: ConnectionId,
    packet_ids: PacketIdCounter,
    tx: mpsc::UnboundedSender<SentFrame>,
}

impl LoopbackConnection {
    pub fn new(id: ConnectionId) -> (Self, mpsc::UnboundedReceiver<SentFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id,
                packet_ids: PacketIdCounter::default(),
                tx,
            },
            rx,
        )
    }
}

impl Connection for LoopbackConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send(&mut self, body: Bytes, reliability: Reliability) -> anyhow::Result<PacketId> {
        let packet_id = self.packet_ids.next_id();
        self.tx
            .send(SentFrame {
                connection: self.id,
                reliability,
                frame: encode_frame(packet_id, &body),
            })
            .map_err(|_| anyhow::anyhow!("loopback peer for {:?} closed", self.id))?;
        Ok(packet_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_ids_start_at_one_and_increase() {
        let mut ids = PacketIdCounter::default();
        assert_eq!(ids.next_id(), PacketId(1));
        assert_eq!(ids.next_id(), PacketId(2));
        assert_eq!(ids.peek(), PacketId(3));
    }

    #[test]
    fn short_frame_is_a_serialization_failure() {
        let err = decode_frame(Bytes::from_static(&[0, 1])).unwrap_err();
        assert!(matches!(err, ReplicationError::SerializationFailure(_)));
    }

    #[test]
    fn garbage_body_is_a_serialization_failure() {
        let err = decode_packet(b"{not json").unwrap_err();
        assert!(err.flags_disconnect());
    }

    #[test]
    fn loopback_stamps_sequential_ids() {
        let (mut conn, mut rx) = LoopbackConnection::new(ConnectionId(7));
        let body = encode_packet(&ReplicationPacket::default()).unwrap();
        assert_eq!(conn.send(body.clone(), Reliability::Unreliable).unwrap(), PacketId(1));
        assert_eq!(conn.send(body, Reliability::Reliable).unwrap(), PacketId(2));

        let first = rx.try_recv().unwrap();
        let (id, body) = decode_frame(first.frame).unwrap();
        assert_eq!(id, PacketId(1));
        assert!(decode_packet(&body).unwrap().is_empty());
        assert_eq!(rx.try_recv().unwrap().reliability, Reliability::Reliable);
    }

    #[test]
    fn control_datagram_roundtrip() {
        let msg = Datagram::Control(NetMsg::Hello {
            protocol: PROTOCOL_VERSION,
        });
        let raw = encode_datagram(&msg).unwrap();
        assert_eq!(raw[0], CHANNEL_CONTROL);
        assert_eq!(decode_datagram(raw).unwrap(), msg);
    }

    #[test]
    fn packet_with_only_diffs_is_unreliable() {
        let packet = ReplicationPacket {
            entries: vec![PacketEntry {
                entity_id: NetworkEntityId(1),
                kind: EntryKind::PropertyDiff {
                    full: false,
                    role: NetworkRole::Client,
                    entity_type: EntityTypeId(1),
                },
                payload: vec![0; 4],
            }],
        };
        assert_eq!(packet.reliability(), Reliability::Unreliable);
    }
}
