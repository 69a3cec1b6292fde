//! Timing behaviour of `TimedThread` against real clocks.

use std::{
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use replica_shared::{
    config::ReplicationConfig,
    timed_thread::{TimedTask, TimedThread},
    world::ReplicationWorld,
};
use replica_tests::{init_tracing, UNIT};

/// Update that always takes longer than the period.
struct Slow {
    work: Duration,
    starts: Arc<Mutex<Vec<Instant>>>,
}

impl TimedTask for Slow {
    fn on_update(&mut self, _delta: Duration) {
        self.starts.lock().unwrap().push(Instant::now());
        thread::sleep(self.work);
    }
}

#[test]
fn overrun_reports_bleed_without_catch_up() -> anyhow::Result<()> {
    init_tracing();
    let starts = Arc::new(Mutex::new(Vec::new()));
    let mut worker = TimedThread::new(
        "slow",
        Duration::from_millis(50),
        Slow {
            work: Duration::from_millis(70),
            starts: starts.clone(),
        },
    );
    let stats = worker.stats();

    let began = Instant::now();
    worker.start()?;
    thread::sleep(Duration::from_millis(400));
    worker.stop();
    worker.join()?;
    let ran_for = began.elapsed();

    assert!(stats.overruns() >= 1);
    assert!(stats.last_bleed() >= Duration::from_millis(20));

    let starts = starts.lock().unwrap();
    assert!(starts.len() >= 2);
    for pair in starts.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(70));
    }
    // Missed periods are not replayed.
    let max_ticks = ran_for.as_millis() as usize / 70 + 1;
    assert!(starts.len() <= max_ticks, "{} ticks in {ran_for:?}", starts.len());
    assert_eq!(stats.ticks() as usize, starts.len());
    Ok(())
}

#[test]
fn world_applies_handle_commands_between_ticks() -> anyhow::Result<()> {
    init_tracing();
    let (world, handle) = ReplicationWorld::new(ReplicationConfig::default());
    let mut worker = TimedThread::new("replication", Duration::from_millis(10), world);

    worker.start()?;
    handle.run(|w| {
        w.spawn_entity(UNIT);
    })?;
    thread::sleep(Duration::from_millis(100));
    worker.stop();
    worker.join()?;

    let world = worker.task().context("task returned after join")?;
    assert_eq!(world.entities().len(), 1);
    assert!(world.tick_count() >= 1);
    assert!(world.frame_time_ms() >= 10);
    Ok(())
}

#[test]
fn second_start_fails_while_running() -> anyhow::Result<()> {
    init_tracing();
    let (world, _handle) = ReplicationWorld::new(ReplicationConfig::default());
    let mut worker = TimedThread::new("replication", Duration::from_millis(10), world);

    worker.start()?;
    assert!(worker.start().is_err());
    worker.stop();
    worker.join()?;
    assert!(!worker.is_running());
    Ok(())
}
