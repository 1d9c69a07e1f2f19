//! Suspend/quit/abort state machine with critical-section deferral.
//!
//! Requests arriving while the critical-section depth is above zero are
//! latched. Whoever observes the depth at zero afterwards (the computation
//! leaving its last section, or the loop re-checking right after latching)
//! claims each latch with a `swap`, so a deferred request is applied exactly
//! once no matter how many duplicates arrived.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use tracing::{error, info, warn};

use super::status::RuntimeStatus;

/// Exit code reported after an abort request.
pub const EXIT_ABORTED_BY_CLIENT: i32 = 194;

/// Observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Making progress.
    Running,
    /// Suspended by the client.
    Suspended,
    /// Inside a critical section; control requests are deferred.
    CheckpointPending,
    /// Quit applied; exiting so the job can restart from its checkpoint.
    Quitting,
    /// Abort applied; exiting for good.
    Aborting,
}

/// Why the application is leaving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// The client sent `<quit/>`.
    Quit,
    /// No heartbeat for the give-up period.
    HeartbeatLost,
    /// The client sent `<abort/>`.
    Abort,
}

impl ExitReason {
    /// Process exit code for this reason.
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Quit | Self::HeartbeatLost => 0,
            Self::Abort => EXIT_ABORTED_BY_CLIENT,
        }
    }

    const fn encode(self) -> u8 {
        match self {
            Self::Quit => 1,
            Self::HeartbeatLost => 2,
            Self::Abort => 3,
        }
    }

    const fn decode(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Quit),
            2 => Some(Self::HeartbeatLost),
            3 => Some(Self::Abort),
            _ => None,
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Quit => f.write_str("quit requested"),
            Self::HeartbeatLost => f.write_str("heartbeat lost"),
            Self::Abort => f.write_str("abort requested"),
        }
    }
}

/// Action run when a quit or abort is applied with direct process action.
pub type ExitHook = Arc<dyn Fn(ExitReason) + Send + Sync>;

/// Best-effort diagnostic capture run before an abort takes effect.
pub type AbortHook = Arc<dyn Fn() + Send + Sync>;

fn default_exit_hook() -> ExitHook {
    Arc::new(|reason: ExitReason| {
        info!(%reason, code = reason.exit_code(), "exiting");
        std::process::exit(reason.exit_code());
    })
}

/// Lifecycle state machine.
pub struct Lifecycle {
    depth: AtomicU32,
    pending_suspend: AtomicBool,
    pending_quit: AtomicU8,
    pending_abort: AtomicBool,
    exit_reason: AtomicU8,
    direct_action: bool,
    exit_hook: RwLock<ExitHook>,
    abort_hook: RwLock<Option<AbortHook>>,
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("depth", &self.depth())
            .field("exit_reason", &self.exit_reason())
            .field("direct_action", &self.direct_action)
            .finish_non_exhaustive()
    }
}

impl Lifecycle {
    /// New machine. With `direct_action`, quit and abort run the exit hook;
    /// otherwise they only flag the status for an owner to act on.
    #[must_use]
    pub fn new(direct_action: bool) -> Self {
        Self {
            depth: AtomicU32::new(0),
            pending_suspend: AtomicBool::new(false),
            pending_quit: AtomicU8::new(0),
            pending_abort: AtomicBool::new(false),
            exit_reason: AtomicU8::new(0),
            direct_action,
            exit_hook: RwLock::new(default_exit_hook()),
            abort_hook: RwLock::new(None),
        }
    }

    /// Replace the exit action.
    pub fn set_exit_hook(&self, hook: ExitHook) {
        *self.exit_hook.write().unwrap_or_else(PoisonError::into_inner) = hook;
    }

    /// Install a diagnostic capture for aborts.
    pub fn set_abort_hook(&self, hook: AbortHook) {
        *self.abort_hook.write().unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    /// Current critical-section depth.
    #[must_use]
    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::Acquire)
    }

    /// Applied exit reason, if any.
    #[must_use]
    pub fn exit_reason(&self) -> Option<ExitReason> {
        ExitReason::decode(self.exit_reason.load(Ordering::Acquire))
    }

    /// Derived state.
    #[must_use]
    pub fn state(&self, status: &RuntimeStatus) -> LifecycleState {
        match self.exit_reason() {
            Some(ExitReason::Abort) => LifecycleState::Aborting,
            Some(_) => LifecycleState::Quitting,
            None if self.depth() > 0 => LifecycleState::CheckpointPending,
            None if status.is_suspended() => LifecycleState::Suspended,
            None => LifecycleState::Running,
        }
    }

    /// Enter a critical section.
    pub fn enter(&self) {
        self.depth.fetch_add(1, Ordering::AcqRel);
    }

    /// Leave a critical section; at depth zero apply latched requests.
    pub fn leave(&self, status: &RuntimeStatus) {
        let previous = self
            .depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| Some(d.saturating_sub(1)))
            .unwrap_or(0);
        if previous == 0 {
            warn!("leave_critical_section without matching enter");
        }
        if previous <= 1 {
            self.apply_pending(status);
        }
    }

    /// Suspend request from the client.
    pub fn request_suspend(&self, status: &RuntimeStatus) {
        if self.exit_reason().is_some() {
            return;
        }
        if self.depth() > 0 {
            self.pending_suspend.store(true, Ordering::Release);
            self.recheck(status);
        } else {
            apply_suspend(status);
        }
    }

    /// Resume request. Never deferred; also cancels a latched suspend.
    pub fn request_resume(&self, status: &RuntimeStatus) {
        self.pending_suspend.store(false, Ordering::Release);
        if status.is_suspended() {
            info!("resumed");
        }
        status.set_suspended(false);
    }

    /// Quit request, from the client or from heartbeat loss.
    pub fn request_quit(&self, reason: ExitReason, status: &RuntimeStatus) {
        if self.depth() > 0 {
            let _ = self.pending_quit.compare_exchange(
                0,
                reason.encode(),
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            self.recheck(status);
        } else {
            self.apply_quit(reason, status);
        }
    }

    /// Abort request from the client.
    pub fn request_abort(&self, status: &RuntimeStatus) {
        if self.depth() > 0 {
            self.pending_abort.store(true, Ordering::Release);
            self.recheck(status);
        } else {
            self.apply_abort(status);
        }
    }

    /// Close the race where the computation left its section between our
    /// depth check and the latch store.
    fn recheck(&self, status: &RuntimeStatus) {
        if self.depth() == 0 {
            self.apply_pending(status);
        }
    }

    fn apply_pending(&self, status: &RuntimeStatus) {
        if self.pending_abort.swap(false, Ordering::AcqRel) {
            self.pending_quit.store(0, Ordering::Release);
            self.pending_suspend.store(false, Ordering::Release);
            self.apply_abort(status);
            return;
        }
        if let Some(reason) = ExitReason::decode(self.pending_quit.swap(0, Ordering::AcqRel)) {
            self.pending_suspend.store(false, Ordering::Release);
            self.apply_quit(reason, status);
            return;
        }
        if self.pending_suspend.swap(false, Ordering::AcqRel) && self.exit_reason().is_none() {
            apply_suspend(status);
        }
    }

    fn apply_quit(&self, reason: ExitReason, status: &RuntimeStatus) {
        if self
            .exit_reason
            .compare_exchange(0, reason.encode(), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        info!(%reason, "quitting");
        status.set_quit_requested();
        if self.direct_action {
            self.run_exit_hook(reason);
        }
    }

    fn apply_abort(&self, status: &RuntimeStatus) {
        let previous = self
            .exit_reason
            .swap(ExitReason::Abort.encode(), Ordering::AcqRel);
        if previous == ExitReason::Abort.encode() {
            return;
        }
        error!("abort requested by client");
        status.set_abort_requested();
        let hook = self
            .abort_hook
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            hook();
        }
        if self.direct_action {
            self.run_exit_hook(ExitReason::Abort);
        }
    }

    fn run_exit_hook(&self, reason: ExitReason) {
        let hook = Arc::clone(&self.exit_hook.read().unwrap_or_else(PoisonError::into_inner));
        hook(reason);
    }
}

fn apply_suspend(status: &RuntimeStatus) {
    if !status.is_suspended() {
        info!("suspended");
    }
    status.set_suspended(true);
}
