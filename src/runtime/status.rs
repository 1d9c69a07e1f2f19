//! Process-wide status flags written by the monitoring loop.
//!
//! Each field is its own atomic; readers may see a momentarily stale value
//! but never a torn one. No invariant spans two fields.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;

/// `f64` stored in an `AtomicU64` by bit pattern.
#[derive(Debug, Default)]
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    /// New cell holding `value`.
    #[must_use]
    pub fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    /// Current value.
    #[must_use]
    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    /// Replace the value.
    pub fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// Live status owned by one runtime instance.
#[derive(Debug, Default)]
pub struct RuntimeStatus {
    suspended: AtomicBool,
    quit_requested: AtomicBool,
    abort_requested: AtomicBool,
    no_heartbeat: AtomicBool,
    network_suspended: AtomicBool,
    reread_config_requested: AtomicBool,
    working_set_size: AtomicF64,
    max_working_set_size: AtomicF64,
}

/// Copy of [`RuntimeStatus`] at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StatusSnapshot {
    /// The client asked the application to stop making progress.
    pub suspended: bool,
    /// A quit was applied.
    pub quit_requested: bool,
    /// An abort was applied.
    pub abort_requested: bool,
    /// The heartbeat was lost.
    pub no_heartbeat: bool,
    /// The client suspended network activity.
    pub network_suspended: bool,
    /// The client asked the application to re-read its configuration.
    pub reread_config_requested: bool,
    /// Working set size hint in bytes.
    pub working_set_size: f64,
    /// Maximum working set size in bytes.
    pub max_working_set_size: f64,
}

impl RuntimeStatus {
    /// Snapshot every field.
    #[must_use]
    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            suspended: self.is_suspended(),
            quit_requested: self.quit_requested.load(Ordering::Acquire),
            abort_requested: self.abort_requested.load(Ordering::Acquire),
            no_heartbeat: self.no_heartbeat.load(Ordering::Acquire),
            network_suspended: self.network_suspended.load(Ordering::Acquire),
            reread_config_requested: self.reread_config_requested.load(Ordering::Acquire),
            working_set_size: self.working_set_size.load(),
            max_working_set_size: self.max_working_set_size.load(),
        }
    }

    /// Whether the application is suspended.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    pub(crate) fn set_suspended(&self, value: bool) {
        self.suspended.store(value, Ordering::Release);
    }

    pub(crate) fn set_quit_requested(&self) {
        self.quit_requested.store(true, Ordering::Release);
    }

    pub(crate) fn set_abort_requested(&self) {
        self.abort_requested.store(true, Ordering::Release);
    }

    /// Mark the heartbeat lost. Returns `false` if it already was.
    pub(crate) fn mark_no_heartbeat(&self) -> bool {
        !self.no_heartbeat.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn set_network_suspended(&self, value: bool) {
        self.network_suspended.store(value, Ordering::Release);
    }

    pub(crate) fn set_reread_config(&self) {
        self.reread_config_requested.store(true, Ordering::Release);
    }

    /// Consume a pending re-read request.
    pub(crate) fn take_reread_config(&self) -> bool {
        self.reread_config_requested.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn set_working_set(&self, current: Option<f64>, max: Option<f64>) {
        if let Some(current) = current {
            self.working_set_size.store(current);
        }
        if let Some(max) = max {
            self.max_working_set_size.store(max);
        }
    }
}
