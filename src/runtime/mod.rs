//! In-process runtime for a hosted computation.
//!
//! A [`RuntimeContext`] is built once per process and shared by reference
//! between the computation and the monitoring loop. The loop owns the
//! status flags; the computation owns the critical-section depth, the
//! checkpoint acknowledgements and its progress figures.
//!
//! ```no_run
//! use gridvisor::config::RuntimeConfig;
//! use gridvisor::runtime::{RuntimeContext, RuntimeOptions};
//!
//! let ctx = RuntimeContext::init(RuntimeConfig::default(), RuntimeOptions::default())?;
//! ctx.start_monitor()?;
//! for step in 0..1000 {
//!     if ctx.wait_while_suspended().is_break() {
//!         break;
//!     }
//!     // ... one unit of work ...
//!     if ctx.time_to_checkpoint() {
//!         // ... write state ...
//!         ctx.checkpoint_completed();
//!     }
//!     ctx.set_fraction_done(f64::from(step) / 1000.0);
//! }
//! ctx.finish(0, None)?;
//! # Ok::<(), gridvisor::AppError>(())
//! ```

use std::ops::ControlFlow;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{AppChannels, Segment};
use crate::config::RuntimeConfig;
use crate::wire::{StatusReport, HAVE_NEW_TRICKLE_UP};
use crate::{AppError, Result};

pub mod clock;
pub mod lifecycle;
pub mod lock;
pub mod markers;
pub mod monitor;
pub mod status;

pub use clock::{CheckpointClock, HeartbeatTracker};
pub use lifecycle::{AbortHook, ExitHook, ExitReason, LifecycleState, EXIT_ABORTED_BY_CLIENT};
pub use lock::InstanceLock;
pub use monitor::{FastTier, MonitorLoop};
pub use status::{AtomicF64, RuntimeStatus, StatusSnapshot};

use lifecycle::Lifecycle;

/// Behaviour switches for a runtime instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct RuntimeOptions {
    /// Quit when the heartbeat goes silent.
    pub check_heartbeat: bool,
    /// Act on suspend/resume/quit/abort messages.
    pub handle_process_control: bool,
    /// Let the loop send status reports every second.
    pub send_status_msgs: bool,
    /// Quit/abort run the exit hook instead of only flagging status.
    pub direct_process_action: bool,
    /// Watch the trickle-down channel.
    pub handle_trickle_down: bool,
    /// Watch the graphics channel.
    pub handle_graphics: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            check_heartbeat: true,
            handle_process_control: true,
            send_status_msgs: true,
            direct_process_action: true,
            handle_trickle_down: true,
            handle_graphics: false,
        }
    }
}

impl RuntimeOptions {
    /// Options for a supervisor that forwards control to child processes
    /// and reports its own aggregated status.
    #[must_use]
    pub fn supervisor() -> Self {
        Self {
            send_status_msgs: false,
            direct_process_action: false,
            ..Self::default()
        }
    }
}

/// Figures reported by the computation.
#[derive(Debug, Default)]
struct Progress {
    fraction_done: AtomicF64,
    checkpoint_cpu_time: AtomicF64,
    /// Last CPU figure passed to `report_app_status`.
    reported_cpu_time: AtomicF64,
    bytes_sent: AtomicF64,
    bytes_received: AtomicF64,
    has_byte_counts: AtomicBool,
    want_network: AtomicBool,
}

type Callback = Box<dyn FnMut(&RuntimeContext) + Send>;

/// Process-wide runtime state.
pub struct RuntimeContext {
    config: RuntimeConfig,
    options: RuntimeOptions,
    channels: Option<AppChannels>,
    status: RuntimeStatus,
    clock: CheckpointClock,
    heartbeat: HeartbeatTracker,
    lifecycle: Lifecycle,
    fast: FastTier,
    progress: Progress,
    checkpoint_section_open: AtomicBool,
    trickle_up_pending: AtomicBool,
    trickle_down_pending: AtomicBool,
    graphics_request: Mutex<Option<String>>,
    callback: Mutex<Option<Callback>>,
    cancel: CancellationToken,
    monitor: Mutex<Option<JoinHandle<()>>>,
    started: Instant,
    _lock: Option<InstanceLock>,
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("options", &self.options)
            .field("standalone", &self.channels.is_none())
            .field("status", &self.status.snapshot())
            .field("lifecycle", &self.lifecycle)
            .finish_non_exhaustive()
    }
}

impl RuntimeContext {
    /// Take the slot's instance lock and attach to the client's segment.
    ///
    /// A missing segment file means there is no client: the runtime runs
    /// standalone, never loses its heartbeat and never sends status.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Lock` if another instance holds the slot, or
    /// `AppError::Channel` if the segment exists but cannot be attached.
    pub fn init(config: RuntimeConfig, options: RuntimeOptions) -> Result<Arc<Self>> {
        let lock = InstanceLock::acquire(config.lock_path(), config.lock_retry())?;
        let shmem = config.shmem_path();
        let channels = if shmem.exists() {
            let segment = Segment::attach(&shmem)?;
            info!(path = %shmem.display(), "attached to client segment");
            Some(AppChannels::new(&segment))
        } else {
            info!("no client segment; running standalone");
            None
        };
        let mut ctx = Self::build(config, options, channels);
        ctx._lock = Some(lock);
        Ok(Arc::new(ctx))
    }

    /// Build a context over explicit channels without taking the lock.
    #[must_use]
    pub fn with_channels(
        config: RuntimeConfig,
        options: RuntimeOptions,
        channels: Option<AppChannels>,
    ) -> Arc<Self> {
        Arc::new(Self::build(config, options, channels))
    }

    fn build(config: RuntimeConfig, options: RuntimeOptions, channels: Option<AppChannels>) -> Self {
        Self {
            clock: CheckpointClock::new(config.checkpoint_period_seconds),
            heartbeat: HeartbeatTracker::new(config.giveup_ticks()),
            lifecycle: Lifecycle::new(options.direct_process_action),
            config,
            options,
            channels,
            status: RuntimeStatus::default(),
            fast: FastTier::default(),
            progress: Progress::default(),
            checkpoint_section_open: AtomicBool::new(false),
            trickle_up_pending: AtomicBool::new(false),
            trickle_down_pending: AtomicBool::new(false),
            graphics_request: Mutex::new(None),
            callback: Mutex::new(None),
            cancel: CancellationToken::new(),
            monitor: Mutex::new(None),
            started: Instant::now(),
            _lock: None,
        }
    }

    /// Spawn the monitoring loop on its own OS thread.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the thread cannot be spawned.
    pub fn start_monitor(self: &Arc<Self>) -> Result<()> {
        let mut slot = self.monitor.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Ok(());
        }
        let ctx = Arc::clone(self);
        let cancel = self.cancel.clone();
        let handle = thread::Builder::new()
            .name("gridvisor-monitor".into())
            .spawn(move || monitor::run(&ctx, &cancel))
            .map_err(|err| AppError::Io(format!("cannot spawn monitor thread: {err}")))?;
        *slot = Some(handle);
        Ok(())
    }

    /// Stop the monitoring loop and wait for it.
    pub fn stop_monitor(&self) {
        self.cancel.cancel();
        let handle = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("monitor thread panicked");
            }
        }
    }

    /// Loaded configuration.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Active options.
    #[must_use]
    pub fn options(&self) -> RuntimeOptions {
        self.options
    }

    /// Whether there is no client segment.
    #[must_use]
    pub fn is_standalone(&self) -> bool {
        self.channels.is_none()
    }

    /// Application-side channels, if attached.
    #[must_use]
    pub fn channels(&self) -> Option<&AppChannels> {
        self.channels.as_ref()
    }

    /// Snapshot of the status flags.
    #[must_use]
    pub fn status(&self) -> StatusSnapshot {
        self.status.snapshot()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn lifecycle_state(&self) -> LifecycleState {
        self.lifecycle.state(&self.status)
    }

    /// Applied exit reason, if a quit or abort went through.
    #[must_use]
    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.lifecycle.exit_reason()
    }

    /// Checkpoint countdown.
    #[must_use]
    pub fn checkpoint_clock(&self) -> &CheckpointClock {
        &self.clock
    }

    /// Heartbeat and tick counters.
    #[must_use]
    pub fn heartbeat(&self) -> &HeartbeatTracker {
        &self.heartbeat
    }

    /// Allocation-free tier fed by timer delivery.
    #[must_use]
    pub fn fast_tier(&self) -> &FastTier {
        &self.fast
    }

    /// Replace the action taken on quit/abort in direct mode.
    pub fn set_exit_hook(&self, hook: ExitHook) {
        self.lifecycle.set_exit_hook(hook);
    }

    /// Install a diagnostic capture run before an abort.
    pub fn set_abort_hook(&self, hook: AbortHook) {
        self.lifecycle.set_abort_hook(hook);
    }

    /// Register a callback invoked at the end of every tick.
    pub fn register_callback(&self, callback: impl FnMut(&RuntimeContext) + Send + 'static) {
        *self.callback.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(callback));
    }

    // ── Critical sections and checkpoints ────────────────

    /// Defer suspend/quit/abort until the matching leave.
    pub fn enter_critical_section(&self) {
        self.lifecycle.enter();
    }

    /// Leave a critical section, applying deferred requests at depth zero.
    pub fn leave_critical_section(&self) {
        self.lifecycle.leave(&self.status);
    }

    /// Current critical-section depth.
    #[must_use]
    pub fn critical_section_depth(&self) -> u32 {
        self.lifecycle.depth()
    }

    /// Whether it is time to checkpoint. A `true` answer opens a critical
    /// section that [`checkpoint_completed`](Self::checkpoint_completed)
    /// closes.
    #[must_use]
    pub fn time_to_checkpoint(&self) -> bool {
        if !self.clock.ready_to_checkpoint() {
            return false;
        }
        if !self.checkpoint_section_open.swap(true, Ordering::AcqRel) {
            self.lifecycle.enter();
        }
        true
    }

    /// The application finished writing a checkpoint.
    pub fn checkpoint_completed(&self) {
        self.progress.checkpoint_cpu_time.store(self.cpu_time());
        self.clock.reset();
        if self.checkpoint_section_open.swap(false, Ordering::AcqRel) {
            self.lifecycle.leave(&self.status);
        }
        debug!(next_in = self.clock.time_until_checkpoint(), "checkpoint completed");
    }

    /// The application's own lower bound on the checkpoint period.
    pub fn set_min_checkpoint_period(&self, seconds: u64) {
        self.clock.set_app_minimum(seconds);
    }

    // ── Progress and status ──────────────────────────────

    /// Record estimated completion in `[0, 1]`.
    pub fn set_fraction_done(&self, fraction: f64) {
        self.progress.fraction_done.store(fraction.clamp(0.0, 1.0));
    }

    /// Last recorded completion.
    #[must_use]
    pub fn fraction_done(&self) -> f64 {
        self.progress.fraction_done.load()
    }

    /// Running (non-suspended) seconds, from the tick counter.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn elapsed_time(&self) -> f64 {
        self.heartbeat.running_ticks() as f64 * self.config.tick_period().as_secs_f64()
    }

    /// CPU seconds used by this process.
    #[must_use]
    pub fn cpu_time(&self) -> f64 {
        #[cfg(unix)]
        {
            crate::process::self_cpu_seconds()
        }
        #[cfg(not(unix))]
        {
            self.started.elapsed().as_secs_f64()
        }
    }

    /// Wall seconds since the context was built.
    #[must_use]
    pub fn wall_time(&self) -> Duration {
        self.started.elapsed()
    }

    /// Record network byte counters for the next status report.
    pub fn set_bytes_transferred(&self, sent: f64, received: f64) {
        self.progress.bytes_sent.store(sent);
        self.progress.bytes_received.store(received);
        self.progress.has_byte_counts.store(true, Ordering::Release);
    }

    /// Ask the client for network access.
    pub fn need_network(&self) {
        self.progress.want_network.store(true, Ordering::Release);
    }

    /// Network access no longer needed.
    pub fn network_done(&self) {
        self.progress.want_network.store(false, Ordering::Release);
    }

    /// Whether the client currently allows network activity.
    #[must_use]
    pub fn network_available(&self) -> bool {
        !self.status.snapshot().network_suspended
    }

    /// Consume a pending "re-read configuration" request.
    #[must_use]
    pub fn take_reread_config(&self) -> bool {
        self.status.take_reread_config()
    }

    /// Most recent graphics request from the client.
    #[must_use]
    pub fn graphics_request(&self) -> Option<String> {
        self.graphics_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Status report built from the current figures. The CPU figure never
    /// drops below what an explicit report already claimed.
    #[must_use]
    pub fn current_report(&self) -> StatusReport {
        let counters = self.progress.has_byte_counts.load(Ordering::Acquire);
        StatusReport {
            current_cpu_time: self
                .cpu_time()
                .max(self.progress.reported_cpu_time.load()),
            checkpoint_cpu_time: self.progress.checkpoint_cpu_time.load(),
            fraction_done: self.fraction_done(),
            elapsed_time: self.elapsed_time(),
            bytes_sent: counters.then(|| self.progress.bytes_sent.load()),
            bytes_received: counters.then(|| self.progress.bytes_received.load()),
            want_network: self.progress.want_network.load(Ordering::Acquire),
        }
    }

    /// Send an explicit status report, e.g. a supervisor reporting its
    /// children's CPU time. Returns `false` if the slot is still occupied
    /// or there is no client.
    #[must_use]
    pub fn report_app_status(&self, cpu_time: f64, checkpoint_cpu_time: f64, fraction: f64) -> bool {
        self.set_fraction_done(fraction);
        self.progress.checkpoint_cpu_time.store(checkpoint_cpu_time);
        self.progress.reported_cpu_time.store(cpu_time);
        let report = StatusReport {
            current_cpu_time: cpu_time,
            checkpoint_cpu_time,
            ..self.current_report()
        };
        self.send_status(&report)
    }

    pub(crate) fn send_status(&self, report: &StatusReport) -> bool {
        let Some(channels) = &self.channels else {
            return false;
        };
        let sent = channels.app_status.send(&report.to_message());
        if !sent {
            debug!("status slot busy; dropping report");
        }
        sent
    }

    // ── Trickle messages ─────────────────────────────────

    /// Write a trickle-up file and flag it to the client on a later tick.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the file cannot be written.
    pub fn send_trickle_up(&self, variety: &str, text: &str) -> Result<()> {
        let path = markers::write_trickle_up(&self.config.slot_dir, variety, text)?;
        debug!(path = %path.display(), "trickle-up written");
        self.trickle_up_pending.store(true, Ordering::Release);
        Ok(())
    }

    /// Collect trickle-down messages the client announced.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the slot directory cannot be listed.
    pub fn take_trickle_down(&self) -> Result<Vec<String>> {
        if !self.trickle_down_pending.swap(false, Ordering::AcqRel) {
            return Ok(Vec::new());
        }
        markers::take_trickle_down(&self.config.slot_dir)
    }

    fn flush_trickle_up(&self) {
        if !self.trickle_up_pending.load(Ordering::Acquire) {
            return;
        }
        if let Some(channels) = &self.channels {
            if channels.trickle_up.send(HAVE_NEW_TRICKLE_UP) {
                self.trickle_up_pending.store(false, Ordering::Release);
            }
        }
    }

    // ── Suspension and exit ──────────────────────────────

    /// Cooperative suspension point. Blocks while suspended; breaks with the
    /// exit reason once a quit or abort has been applied.
    pub fn wait_while_suspended(&self) -> ControlFlow<ExitReason> {
        loop {
            if let Some(reason) = self.lifecycle.exit_reason() {
                return ControlFlow::Break(reason);
            }
            if !self.status.is_suspended() {
                return ControlFlow::Continue(());
            }
            thread::sleep(self.config.tick_period());
        }
    }

    /// Stop the loop, send a final report at fraction 1.0 and write the
    /// finish marker. The caller exits with `status` afterwards.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the finish marker cannot be written.
    pub fn finish(&self, status: i32, message: Option<&str>) -> Result<()> {
        self.stop_monitor();
        if status == 0 {
            self.set_fraction_done(1.0);
        }
        if self.channels.is_some() {
            let report = self.current_report();
            let deadline = Instant::now() + Duration::from_secs(1);
            while !self.send_status(&report) && Instant::now() < deadline {
                thread::sleep(self.config.tick_period());
            }
        }
        markers::write_finish_marker(&self.config.slot_dir, status, message)
    }

    /// Ask the client to restart the job later; the caller exits with 0.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the marker cannot be written.
    pub fn request_temporary_exit(&self, delay: Duration, reason: &str) -> Result<()> {
        markers::request_temporary_exit(&self.config.slot_dir, delay, reason)
    }

    fn slot_dir(&self) -> &Path {
        &self.config.slot_dir
    }
}

impl Drop for RuntimeContext {
    fn drop(&mut self) {
        self.cancel.cancel();
        debug!(slot = %self.slot_dir().display(), "runtime context dropped");
    }
}
