//! Socket-level tests: a raw UDP client handshakes with the server, receives
//! replication frames and gets evicted when it misbehaves.

use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use replica_server::server::bind_ephemeral;
use replica_shared::{
    config::ReplicationConfig,
    entity::PropertyValue,
    interest::BitmaskInterestHandler,
    net::{
        decode_datagram, decode_frame, decode_packet, encode_datagram, encode_frame, ConnectionId,
        Datagram, EntryKind, NetMsg, PacketId, PROTOCOL_VERSION,
    },
    role::NetworkRole,
    timed_thread::TimedThread,
    world::ReplicationWorld,
};
use replica_tests::{init_tracing, DEFAULT_MASK, UNIT};
use tokio::{net::UdpSocket, time::timeout};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hello_then_full_state_over_udp() -> anyhow::Result<()> {
    init_tracing();

    let cfg = ReplicationConfig {
        tick_ms: 10,
        ..Default::default()
    };
    let (mut world, handle) = ReplicationWorld::new(cfg.clone());
    let interest = world
        .interest_mut()
        .on_rules_handler_registered(Box::<BitmaskInterestHandler>::default());
    let entity = world.spawn_entity(UNIT);
    if let Some(e) = world.entity_mut(entity) {
        e.set_property("hp", PropertyValue::Int(7));
    }
    world
        .interest_mut()
        .handler_mut::<BitmaskInterestHandler>(interest)
        .context("bitmask handler")?
        .set_attribute(entity, DEFAULT_MASK);

    let (server, server_cfg) = bind_ephemeral(handle, interest, DEFAULT_MASK).await?;
    let server_task = tokio::spawn(server.run());

    let mut worker = TimedThread::new("replication", cfg.tick_period(), world);
    worker.start()?;

    let client = UdpSocket::bind("127.0.0.1:0").await?;
    client.connect(server_cfg.server_addr.as_str()).await?;
    let hello = encode_datagram(&Datagram::Control(NetMsg::Hello {
        protocol: PROTOCOL_VERSION,
    }))?;
    client.send(&hello).await?;

    // Welcome and the first replication frame may arrive in either order.
    let mut welcomed = false;
    let mut full_state = None;
    let mut buf = vec![0u8; 64 * 1024];
    while !(welcomed && full_state.is_some()) {
        let n = timeout(Duration::from_secs(2), client.recv(&mut buf))
            .await
            .context("timed out waiting for server")??;
        match decode_datagram(Bytes::copy_from_slice(&buf[..n]))? {
            Datagram::Control(NetMsg::Welcome { .. }) => welcomed = true,
            Datagram::Control(other) => anyhow::bail!("unexpected control message {other:?}"),
            Datagram::Replication(frame) => {
                let (_, body) = decode_frame(frame)?;
                full_state = Some(decode_packet(&body)?);
            }
        }
    }

    worker.stop();
    worker.join()?;
    server_task.abort();

    let packet = full_state.context("replication frame")?;
    let first = &packet.entries[0];
    assert_eq!(first.entity_id, entity);
    assert_eq!(
        first.kind,
        EntryKind::PropertyDiff {
            full: true,
            role: NetworkRole::Client,
            entity_type: UNIT,
        }
    );

    let world = worker.task().context("world returned after join")?;
    assert_eq!(world.connection_ids().len(), 1);
    Ok(())
}

#[tokio::test]
async fn wrong_protocol_is_refused() -> anyhow::Result<()> {
    init_tracing();
    let (mut world, handle) = ReplicationWorld::new(ReplicationConfig::default());
    let interest = world
        .interest_mut()
        .on_rules_handler_registered(Box::<BitmaskInterestHandler>::default());

    let (mut server, server_cfg) = bind_ephemeral(handle, interest, DEFAULT_MASK).await?;
    let client = UdpSocket::bind("127.0.0.1:0").await?;
    client.connect(server_cfg.server_addr.as_str()).await?;
    client
        .send(&encode_datagram(&Datagram::Control(NetMsg::Hello {
            protocol: PROTOCOL_VERSION + 1,
        }))?)
        .await?;

    let mut buf = vec![0u8; 64 * 1024];
    server.recv_once(&mut buf).await?;
    assert_eq!(server.peer_count(), 0);

    let n = timeout(Duration::from_secs(2), client.recv(&mut buf))
        .await
        .context("timed out waiting for reply")??;
    let reply = decode_datagram(Bytes::copy_from_slice(&buf[..n]))?;
    assert!(matches!(reply, Datagram::Control(NetMsg::Disconnect { .. })));

    // Nothing reached the world.
    world.tick(Duration::ZERO);
    assert!(world.connection_ids().is_empty());
    Ok(())
}

/// Waits for the next control message, skipping replication frames.
async fn next_control(client: &UdpSocket, buf: &mut [u8]) -> anyhow::Result<NetMsg> {
    loop {
        let n = timeout(Duration::from_secs(2), client.recv(buf))
            .await
            .context("timed out waiting for server")??;
        if let Datagram::Control(msg) = decode_datagram(Bytes::copy_from_slice(&buf[..n]))? {
            return Ok(msg);
        }
    }
}

async fn hello(client: &UdpSocket, buf: &mut [u8]) -> anyhow::Result<ConnectionId> {
    client
        .send(&encode_datagram(&Datagram::Control(NetMsg::Hello {
            protocol: PROTOCOL_VERSION,
        }))?)
        .await?;
    match next_control(client, buf).await? {
        NetMsg::Welcome { connection_id } => Ok(connection_id),
        other => anyhow::bail!("expected Welcome, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn flagged_peer_is_evicted_and_can_rejoin() -> anyhow::Result<()> {
    init_tracing();

    let cfg = ReplicationConfig {
        tick_ms: 10,
        ..Default::default()
    };
    let (mut world, handle) = ReplicationWorld::new(cfg.clone());
    let interest = world
        .interest_mut()
        .on_rules_handler_registered(Box::<BitmaskInterestHandler>::default());

    let (server, server_cfg) = bind_ephemeral(handle, interest, DEFAULT_MASK).await?;
    let server_task = tokio::spawn(server.run());
    let mut worker = TimedThread::new("replication", cfg.tick_period(), world);
    worker.start()?;

    let client = UdpSocket::bind("127.0.0.1:0").await?;
    client.connect(server_cfg.server_addr.as_str()).await?;
    let mut buf = vec![0u8; 64 * 1024];
    let first = hello(&client, &mut buf).await?;

    // A frame whose body is not a packet flags the peer.
    let junk = encode_frame(PacketId(1), b"not a packet");
    client
        .send(&encode_datagram(&Datagram::Replication(junk))?)
        .await?;
    let reply = next_control(&client, &mut buf).await?;
    assert!(matches!(reply, NetMsg::Disconnect { .. }), "got {reply:?}");

    // The stale mapping is gone, so a new Hello is a new connection.
    let second = hello(&client, &mut buf).await?;
    assert_ne!(first, second);

    tokio::time::sleep(Duration::from_millis(50)).await;
    worker.stop();
    worker.join()?;
    server_task.abort();

    let world = worker.task().context("world returned after join")?;
    assert_eq!(world.connection_ids(), vec![second]);
    Ok(())
}
