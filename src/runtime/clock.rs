//! Tick-driven checkpoint countdown and heartbeat liveness tracking.
//!
//! Both count monitoring-loop ticks rather than reading the wall clock, so
//! hibernation or a user changing the clock cannot make them jump.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Countdown to the next checkpoint opportunity.
#[derive(Debug)]
pub struct CheckpointClock {
    time_until_checkpoint: AtomicU64,
    ready_to_checkpoint: AtomicBool,
    configured_period: AtomicU64,
    app_minimum: AtomicU64,
}

impl CheckpointClock {
    /// Start a countdown of `configured_period` seconds.
    #[must_use]
    pub fn new(configured_period: u64) -> Self {
        Self {
            time_until_checkpoint: AtomicU64::new(configured_period),
            ready_to_checkpoint: AtomicBool::new(false),
            configured_period: AtomicU64::new(configured_period),
            app_minimum: AtomicU64::new(0),
        }
    }

    /// Seconds left before the next checkpoint opportunity.
    #[must_use]
    pub fn time_until_checkpoint(&self) -> u64 {
        self.time_until_checkpoint.load(Ordering::Acquire)
    }

    /// Whether the countdown has reached zero and not been reset since.
    #[must_use]
    pub fn ready_to_checkpoint(&self) -> bool {
        self.ready_to_checkpoint.load(Ordering::Acquire)
    }

    /// Period used after each completed checkpoint.
    #[must_use]
    pub fn effective_period(&self) -> u64 {
        self.configured_period
            .load(Ordering::Relaxed)
            .max(self.app_minimum.load(Ordering::Relaxed))
    }

    /// The application's own lower bound on the checkpoint period.
    pub fn set_app_minimum(&self, seconds: u64) {
        self.app_minimum.store(seconds, Ordering::Relaxed);
    }

    /// Advance by one second; latch readiness when the countdown hits zero.
    pub fn tick_second(&self) {
        let previous = self
            .time_until_checkpoint
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| Some(t.saturating_sub(1)))
            .unwrap_or(0);
        if previous <= 1 {
            self.ready_to_checkpoint.store(true, Ordering::Release);
        }
    }

    /// Clear readiness and restart the countdown from the effective period.
    pub fn reset(&self) {
        self.ready_to_checkpoint.store(false, Ordering::Release);
        self.time_until_checkpoint
            .store(self.effective_period(), Ordering::Release);
    }
}

/// Monotonic tick counter and the tick at which silence becomes fatal.
#[derive(Debug)]
pub struct HeartbeatTracker {
    interrupt_count: AtomicU64,
    running_ticks: AtomicU64,
    giveup_tick: AtomicU64,
    giveup_ticks: u64,
}

impl HeartbeatTracker {
    /// Tracker that gives up after `giveup_ticks` silent ticks.
    #[must_use]
    pub fn new(giveup_ticks: u64) -> Self {
        Self {
            interrupt_count: AtomicU64::new(0),
            running_ticks: AtomicU64::new(0),
            giveup_tick: AtomicU64::new(giveup_ticks),
            giveup_ticks,
        }
    }

    /// Ticks since start, suspended or not.
    #[must_use]
    pub fn interrupt_count(&self) -> u64 {
        self.interrupt_count.load(Ordering::Acquire)
    }

    /// Ticks spent not suspended.
    #[must_use]
    pub fn running_ticks(&self) -> u64 {
        self.running_ticks.load(Ordering::Acquire)
    }

    /// Tick value past which a missing heartbeat is fatal.
    #[must_use]
    pub fn giveup_tick(&self) -> u64 {
        self.giveup_tick.load(Ordering::Acquire)
    }

    /// Count one tick. Returns the new interrupt count.
    pub fn advance(&self, running: bool) -> u64 {
        if running {
            self.running_ticks.fetch_add(1, Ordering::AcqRel);
        }
        self.interrupt_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// A heartbeat arrived: push the give-up point forward.
    pub fn record_heartbeat(&self) {
        self.giveup_tick
            .store(self.interrupt_count() + self.giveup_ticks, Ordering::Release);
    }

    /// Whether the give-up point has been passed.
    #[must_use]
    pub fn is_lost(&self) -> bool {
        self.giveup_tick() < self.interrupt_count()
    }
}
