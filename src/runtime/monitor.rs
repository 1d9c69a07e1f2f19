//! Periodic monitoring loop.
//!
//! Work is split into two tiers. [`FastTier`] is what a timer or signal
//! delivery may touch: it only bumps atomics. [`MonitorLoop::tick`] is the
//! slow tier that drains channels, drives the lifecycle and sends status.
//! On unix both tiers run on the dedicated monitor thread, which owns a
//! current-thread tokio runtime; nothing is delivered from a signal handler.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{PoisonError, TryLockError};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::lifecycle::ExitReason;
use super::RuntimeContext;
use crate::wire::{ControlMessage, Heartbeat, HAVE_TRICKLE_DOWN};

/// Allocation-free state touched by interrupt delivery.
#[derive(Debug, Default)]
pub struct FastTier {
    pending_ticks: AtomicU64,
    exit_requested: AtomicBool,
}

impl FastTier {
    /// Record one timer delivery. Safe to call from a signal handler.
    pub fn on_interrupt(&self) {
        self.pending_ticks.fetch_add(1, Ordering::AcqRel);
    }

    /// Claim all recorded deliveries.
    pub fn take_pending(&self) -> u64 {
        self.pending_ticks.swap(0, Ordering::AcqRel)
    }

    /// Ask the slow tier to stop after its current tick.
    pub fn request_exit(&self) {
        self.exit_requested.store(true, Ordering::Release);
    }

    /// Whether an exit was requested.
    #[must_use]
    pub fn exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::Acquire)
    }
}

/// Slow tier bound to one runtime context.
pub struct MonitorLoop<'a> {
    ctx: &'a RuntimeContext,
    ticks_per_second: u64,
}

impl<'a> MonitorLoop<'a> {
    /// Loop over `ctx`.
    #[must_use]
    pub fn new(ctx: &'a RuntimeContext) -> Self {
        Self {
            ctx,
            ticks_per_second: ctx.config.ticks_per_second().max(1),
        }
    }

    /// Run every tick the fast tier recorded. A panicking tick is logged and
    /// the remaining work of that tick is skipped.
    pub fn drain(&self) -> u64 {
        let pending = self.ctx.fast.take_pending();
        for _ in 0..pending {
            if panic::catch_unwind(AssertUnwindSafe(|| self.tick())).is_err() {
                error!("monitor tick panicked; skipping");
            }
        }
        pending
    }

    /// One tick of the loop.
    pub fn tick(&self) {
        let ctx = self.ctx;
        let count = ctx.heartbeat.advance(!ctx.status.is_suspended());

        self.drain_heartbeat();
        self.drain_process_control();
        self.drain_trickle_down();
        self.drain_graphics();

        let lost = self.check_heartbeat();

        if count % self.ticks_per_second == 0 {
            if !ctx.status.is_suspended() {
                ctx.clock.tick_second();
            }
            if ctx.options.send_status_msgs && !lost {
                let report = ctx.current_report();
                let _ = ctx.send_status(&report);
            }
        }

        ctx.flush_trickle_up();
        self.run_callback();
        trace!(count, "tick");
    }

    fn drain_heartbeat(&self) {
        let ctx = self.ctx;
        let Some(channels) = &ctx.channels else {
            return;
        };
        let Some(msg) = channels.heartbeat.receive() else {
            return;
        };
        if let Some(beat) = Heartbeat::parse(&msg) {
            ctx.heartbeat.record_heartbeat();
            ctx.status
                .set_working_set(beat.working_set_size, beat.max_working_set_size);
            ctx.status.set_network_suspended(beat.network_suspended);
        }
    }

    fn drain_process_control(&self) {
        let ctx = self.ctx;
        if !ctx.options.handle_process_control {
            return;
        }
        let Some(msg) = ctx.channels.as_ref().and_then(|c| c.process_control.receive()) else {
            return;
        };
        for request in ControlMessage::parse(&msg) {
            debug!(?request, "process control");
            match request {
                ControlMessage::Suspend => ctx.lifecycle.request_suspend(&ctx.status),
                ControlMessage::Resume => ctx.lifecycle.request_resume(&ctx.status),
                ControlMessage::Quit => ctx.lifecycle.request_quit(ExitReason::Quit, &ctx.status),
                ControlMessage::Abort => ctx.lifecycle.request_abort(&ctx.status),
                ControlMessage::RereadConfig => ctx.status.set_reread_config(),
            }
        }
    }

    fn drain_trickle_down(&self) {
        let ctx = self.ctx;
        if !ctx.options.handle_trickle_down {
            return;
        }
        if let Some(msg) = ctx.channels.as_ref().and_then(|c| c.trickle_down.receive()) {
            if msg.contains(HAVE_TRICKLE_DOWN) {
                ctx.trickle_down_pending.store(true, Ordering::Release);
            }
        }
    }

    fn drain_graphics(&self) {
        let ctx = self.ctx;
        if !ctx.options.handle_graphics {
            return;
        }
        if let Some(msg) = ctx.channels.as_ref().and_then(|c| c.graphics.receive()) {
            *ctx.graphics_request
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(msg);
        }
    }

    /// Returns whether the heartbeat is (now or already) lost.
    fn check_heartbeat(&self) -> bool {
        let ctx = self.ctx;
        if !ctx.options.check_heartbeat || ctx.channels.is_none() {
            return false;
        }
        if !ctx.heartbeat.is_lost() {
            return false;
        }
        if ctx.status.mark_no_heartbeat() {
            warn!(
                tick = ctx.heartbeat.interrupt_count(),
                giveup = ctx.heartbeat.giveup_tick(),
                "no heartbeat from client; quitting"
            );
            ctx.lifecycle.request_quit(ExitReason::HeartbeatLost, &ctx.status);
        }
        true
    }

    fn run_callback(&self) {
        let ctx = self.ctx;
        let mut guard = match ctx.callback.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return,
        };
        if let Some(callback) = guard.as_mut() {
            callback(ctx);
        }
    }
}

/// Body of the monitor thread: tick until cancelled or asked to exit.
pub(crate) fn run(ctx: &RuntimeContext, cancel: &CancellationToken) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(%err, "cannot build monitor runtime");
            return;
        }
    };

    let monitor = MonitorLoop::new(ctx);
    runtime.block_on(async {
        let mut interval = tokio::time::interval(ctx.config.tick_period());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("monitor loop cancelled");
                    break;
                }
                _ = interval.tick() => {
                    ctx.fast.on_interrupt();
                    monitor.drain();
                    if ctx.fast.exit_requested() {
                        debug!("monitor loop exit requested");
                        break;
                    }
                }
            }
        }
    });
}
