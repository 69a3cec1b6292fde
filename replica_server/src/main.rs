//! Standalone replication server.
//!
//! Usage:
//!   cargo run -p replica_server -- [--config replica.json] [--addr 127.0.0.1:40000]
//!       [--tick-ms 50] [--resend-timeout-ms 500] [--entities 8] [--host-id 0]
//!
//! Peers connect with a `Hello` datagram and from then on receive every demo
//! entity: full state first, diffs as the entities drift. Each peer is handed
//! control of one free drifter, which it can `nudge`.

use std::env;

use anyhow::Context;
use replica_server::{demo, server::ReplicaServer};
use replica_shared::{
    config::ReplicationConfig, interest::BitmaskInterestHandler, timed_thread::TimedThread,
    world::ReplicationWorld,
};
use tracing::{info, warn};

struct Args {
    cfg: ReplicationConfig,
    entities: usize,
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = env::args().collect();

    // The config file is the base; flags override it.
    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => {
            let path = &args[i + 1];
            let text = std::fs::read_to_string(path).with_context(|| format!("read config {path}"))?;
            ReplicationConfig::from_json_str(&text).with_context(|| format!("parse config {path}"))?
        }
        _ => ReplicationConfig::default(),
    };
    let mut entities = 8;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--tick-ms" if i + 1 < args.len() => {
                cfg.tick_ms = args[i + 1].parse().unwrap_or(cfg.tick_ms);
                i += 2;
            }
            "--resend-timeout-ms" if i + 1 < args.len() => {
                cfg.resend_timeout_ms = args[i + 1].parse().unwrap_or(cfg.resend_timeout_ms);
                i += 2;
            }
            "--host-id" if i + 1 < args.len() => {
                cfg.host_id = args[i + 1].parse().unwrap_or(cfg.host_id);
                i += 2;
            }
            "--entities" if i + 1 < args.len() => {
                entities = args[i + 1].parse().unwrap_or(entities);
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(Args { cfg, entities })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let Args { cfg, entities } = parse_args()?;
    info!(
        addr = %cfg.server_addr,
        tick_ms = cfg.tick_ms,
        resend_timeout_ms = cfg.resend_timeout_ms,
        host_id = cfg.host_id,
        "Starting replica server"
    );

    let (mut world, handle) = ReplicationWorld::new(cfg.clone());
    let interest = world
        .interest_mut()
        .on_rules_handler_registered(Box::<BitmaskInterestHandler>::default());
    demo::populate(&mut world, interest, entities);

    let server = ReplicaServer::bind(cfg.clone(), handle, interest, demo::INTEREST_MASK)
        .await
        .context("create server")?;
    info!(local = %server.local_addr()?, "Server listening");

    let mut ticker = TimedThread::new("replication", cfg.tick_period(), world);
    ticker.start()?;
    let stats = ticker.stats();

    tokio::select! {
        res = server.run() => {
            if let Err(e) = res {
                warn!(error = %format!("{e:#}"), "server loop failed");
            }
        }
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    ticker.stop();
    ticker.join()?;
    info!(
        ticks = stats.ticks(),
        overruns = stats.overruns(),
        "Server stopped"
    );
    Ok(())
}
