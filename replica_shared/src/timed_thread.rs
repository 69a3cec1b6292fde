//! Fixed-period worker thread.
//!
//! Each iteration calls [`TimedTask::on_update`] with the configured period,
//! then sleeps for whatever is left of it. An update that overruns the period
//! is reported as a bleed and the next iteration starts immediately; missed
//! ticks are never replayed. `stop()` lets the current iteration finish.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::Context;
use tracing::{debug, warn};

/// Work driven by a [`TimedThread`].
pub trait TimedTask: Send + 'static {
    fn on_update(&mut self, delta: Duration);
}

/// Counters shared with the worker.
#[derive(Debug, Default)]
pub struct TimedThreadStats {
    ticks: AtomicU64,
    overruns: AtomicU64,
    last_bleed_ms: AtomicU64,
}

impl TimedThreadStats {
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    pub fn last_bleed(&self) -> Duration {
        Duration::from_millis(self.last_bleed_ms.load(Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickPlan {
    pub sleep: Duration,
    pub bleed: Option<Duration>,
}

/// How long to sleep after an update that took `elapsed`.
pub fn schedule_next(period: Duration, elapsed: Duration) -> TickPlan {
    if elapsed > period {
        TickPlan {
            sleep: Duration::ZERO,
            bleed: Some(elapsed - period),
        }
    } else {
        TickPlan {
            sleep: period - elapsed,
            bleed: None,
        }
    }
}

pub struct TimedThread<T: TimedTask> {
    name: String,
    period: Duration,
    task: Option<T>,
    running: Arc<AtomicBool>,
    stats: Arc<TimedThreadStats>,
    handle: Option<JoinHandle<T>>,
}

impl<T: TimedTask> TimedThread<T> {
    pub fn new(name: impl Into<String>, period: Duration, task: T) -> Self {
        Self {
            name: name.into(),
            period,
            task: Some(task),
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(TimedThreadStats::default()),
            handle: None,
        }
    }

    /// Spawns the worker. Fails if it is already running.
    pub fn start(&mut self) -> anyhow::Result<()> {
        anyhow::ensure!(self.handle.is_none(), "timed thread '{}' already running", self.name);
        let mut task = self
            .task
            .take()
            .with_context(|| format!("timed thread '{}' has no task", self.name))?;

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let stats = self.stats.clone();
        let period = self.period;
        let name = self.name.clone();

        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                debug!(thread = %name, period_ms = period.as_millis() as u64, "timed thread started");
                // The stop flag is checked after each iteration, so every
                // start runs at least one update.
                loop {
                    let started = Instant::now();
                    task.on_update(period);
                    let plan = schedule_next(period, started.elapsed());

                    stats.ticks.fetch_add(1, Ordering::Relaxed);
                    if let Some(bleed) = plan.bleed {
                        let bleed_ms = bleed.as_millis() as u64;
                        stats.overruns.fetch_add(1, Ordering::Relaxed);
                        stats.last_bleed_ms.store(bleed_ms, Ordering::Relaxed);
                        warn!(thread = %name, bleed_ms, "tick bled");
                    }
                    if !plan.sleep.is_zero() {
                        thread::sleep(plan.sleep);
                    }
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                }
                debug!(thread = %name, "timed thread stopped");
                task
            })
            .with_context(|| format!("spawn timed thread '{}'", self.name))?;

        self.handle = Some(handle);
        Ok(())
    }

    /// Asks the worker to exit after the current iteration.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Waits for the worker to exit. No-op if it is not running.
    pub fn join(&mut self) -> anyhow::Result<()> {
        if let Some(handle) = self.handle.take() {
            let task = handle
                .join()
                .map_err(|_| anyhow::anyhow!("timed thread '{}' panicked", self.name))?;
            self.task = Some(task);
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn stats(&self) -> Arc<TimedThreadStats> {
        self.stats.clone()
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// The task, available while the worker is not running.
    pub fn task(&self) -> Option<&T> {
        self.task.as_ref()
    }

    pub fn task_mut(&mut self) -> Option<&mut T> {
        self.task.as_mut()
    }

    pub fn into_task(mut self) -> Option<T> {
        self.task.take()
    }
}

impl<T: TimedTask> Drop for TimedThread<T> {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if self.running.load(Ordering::SeqCst) {
            if !thread::panicking() {
                panic!("timed thread '{}' dropped while running", self.name);
            }
            return;
        }
        // Stopped but not joined.
        let _ = handle.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter(u32);

    impl TimedTask for Counter {
        fn on_update(&mut self, _delta: Duration) {
            self.0 += 1;
        }
    }

    #[test]
    fn overrun_reports_bleed_and_skips_sleep() {
        let plan = schedule_next(Duration::from_millis(50), Duration::from_millis(70));
        assert_eq!(plan.sleep, Duration::ZERO);
        assert_eq!(plan.bleed, Some(Duration::from_millis(20)));
    }

    #[test]
    fn fast_update_sleeps_the_remainder() {
        let plan = schedule_next(Duration::from_millis(50), Duration::from_millis(10));
        assert_eq!(plan.sleep, Duration::from_millis(40));
        assert_eq!(plan.bleed, None);

        let exact = schedule_next(Duration::from_millis(50), Duration::from_millis(50));
        assert_eq!(exact.sleep, Duration::ZERO);
        assert_eq!(exact.bleed, None);
    }

    #[test]
    fn start_twice_is_an_error_and_join_is_idempotent() {
        let mut t = TimedThread::new("counter", Duration::from_millis(1), Counter(0));
        t.start().unwrap();
        assert!(t.start().is_err());
        t.stop();
        t.join().unwrap();
        t.join().unwrap();
        assert!(!t.is_running());
        assert!(t.task().unwrap().0 >= 1);
    }

    #[test]
    fn immediate_stop_still_runs_one_update() {
        for _ in 0..20 {
            let mut t = TimedThread::new("blink", Duration::from_millis(1), Counter(0));
            t.start().unwrap();
            t.stop();
            t.join().unwrap();
            assert!(t.task().unwrap().0 >= 1);
            assert_eq!(t.stats().ticks(), u64::from(t.task().unwrap().0));
        }
    }

    #[test]
    #[should_panic(expected = "dropped while running")]
    fn dropping_running_thread_panics() {
        struct StopOnUnwind(Arc<AtomicBool>);
        impl Drop for StopOnUnwind {
            fn drop(&mut self) {
                self.0.store(false, Ordering::SeqCst);
            }
        }

        let mut t = TimedThread::new("leaky", Duration::from_millis(5), Counter(0));
        let _stop = StopOnUnwind(t.running.clone());
        t.start().unwrap();
        drop(t);
    }
}
