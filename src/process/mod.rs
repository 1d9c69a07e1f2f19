//! Process-tree control: enumerate descendants, suspend, resume, kill.
//!
//! Two families implement [`ProcessControl`] with the same contract:
//!
//! - [`SignalControl`] (unix) works at process granularity and signals
//!   every target process.
//! - [`ThreadControl`] works at thread granularity over a [`ThreadTable`]:
//!   it walks a system-wide thread snapshot, keeps the threads owned by the
//!   target processes, and suspends each one except an excluded thread.
//!
//! Both only resume what they themselves suspended, and both treat a
//! failure on one target as a logged, per-target event.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::Result;

pub mod threads;
#[cfg(unix)]
pub mod unix;

pub use threads::{ThreadControl, ThreadEntry, ThreadTable};
#[cfg(unix)]
pub use unix::{is_alive, self_cpu_seconds, set_priority, SignalControl, SuspendSignal};

/// OS process identifier.
pub type Pid = i32;

/// OS thread identifier.
pub type Tid = u64;

/// Interval between liveness checks while waiting out a grace period.
pub const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One row of a process snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcEntry {
    /// Parent process.
    pub ppid: Pid,
    /// User + system CPU time in clock ticks, 0 where unknown.
    pub cpu_ticks: u64,
    /// CPU ticks of children this process has already reaped. Exited
    /// stages of a task only show up here.
    pub reaped_ticks: u64,
}

/// CPU figures for one process of a tree.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessUsage {
    /// Process id.
    pub pid: Pid,
    /// Parent process id.
    pub ppid: Pid,
    /// Own CPU seconds plus those of children it reaped.
    pub cpu_seconds: f64,
}

/// Point-in-time view of the process table.
#[derive(Debug, Clone, Default)]
pub struct ProcessSnapshot {
    entries: HashMap<Pid, ProcEntry>,
    ticks_per_second: u64,
}

impl ProcessSnapshot {
    /// Build a snapshot from `(pid, ppid)` pairs.
    #[must_use]
    pub fn from_pairs(pairs: impl IntoIterator<Item = (Pid, Pid)>) -> Self {
        Self {
            entries: pairs
                .into_iter()
                .map(|(pid, ppid)| {
                    let entry = ProcEntry {
                        ppid,
                        cpu_ticks: 0,
                        reaped_ticks: 0,
                    };
                    (pid, entry)
                })
                .collect(),
            ticks_per_second: 100,
        }
    }

    pub(crate) fn from_entries(entries: HashMap<Pid, ProcEntry>, ticks_per_second: u64) -> Self {
        Self {
            entries,
            ticks_per_second: ticks_per_second.max(1),
        }
    }

    /// Capture the current process table.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Process` if the table cannot be read.
    #[cfg(unix)]
    pub fn capture() -> Result<Self> {
        unix::capture_snapshot()
    }

    /// Whether `pid` was present when the snapshot was taken.
    #[must_use]
    pub fn contains(&self, pid: Pid) -> bool {
        self.entries.contains_key(&pid)
    }

    /// Transitive children of `pid`, excluding `pid` itself.
    ///
    /// A visited set guards against parent/child cycles in a torn snapshot.
    #[must_use]
    pub fn descendants(&self, pid: Pid) -> BTreeSet<Pid> {
        let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
        for (&child, entry) in &self.entries {
            if child != entry.ppid {
                children.entry(entry.ppid).or_default().push(child);
            }
        }

        let mut visited = BTreeSet::from([pid]);
        let mut found = BTreeSet::new();
        let mut queue = VecDeque::from([pid]);
        while let Some(parent) = queue.pop_front() {
            for &child in children.get(&parent).into_iter().flatten() {
                if visited.insert(child) {
                    found.insert(child);
                    queue.push_back(child);
                }
            }
        }
        found
    }

    /// Per-process CPU figures for `pid` and its descendants, by pid.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn tree_usage(&self, pid: Pid) -> Vec<ProcessUsage> {
        let mut pids: Vec<Pid> = std::iter::once(pid).chain(self.descendants(pid)).collect();
        pids.sort_unstable();
        pids.into_iter()
            .filter_map(|p| {
                let entry = self.entries.get(&p)?;
                Some(ProcessUsage {
                    pid: p,
                    ppid: entry.ppid,
                    cpu_seconds: (entry.cpu_ticks + entry.reaped_ticks) as f64
                        / self.ticks_per_second as f64,
                })
            })
            .collect()
    }

    /// CPU seconds of `pid` and all of its descendants, including
    /// children they have already reaped.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn tree_cpu_seconds(&self, pid: Pid) -> f64 {
        let ticks: u64 = std::iter::once(pid)
            .chain(self.descendants(pid))
            .filter_map(|p| self.entries.get(&p))
            .map(|entry| entry.cpu_ticks + entry.reaped_ticks)
            .sum();
        ticks as f64 / self.ticks_per_second as f64
    }
}

/// Uniform process-tree control.
pub trait ProcessControl: Send + Sync {
    /// Transitive children of `pid` from a fresh snapshot.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Process` if no snapshot can be taken.
    fn list_descendants(&self, pid: Pid) -> Result<BTreeSet<Pid>>;

    /// Suspend every process in `pids`, never touching `exclude`. Returns
    /// how many targets were newly suspended.
    fn suspend(&self, pids: &[Pid], exclude: Option<Tid>) -> usize;

    /// Resume targets this instance suspended. Anything else is a no-op.
    /// Returns how many targets were resumed.
    fn resume(&self, pids: &[Pid]) -> usize;

    /// Terminate `pid` and every descendant; with a grace period, ask
    /// nicely first and force whatever is left afterwards.
    fn kill_tree(&self, pid: Pid, grace: Option<Duration>);
}

/// Expand a root pid into `[root, descendants…]`, logging snapshot failure.
pub fn with_descendants(control: &dyn ProcessControl, pid: Pid) -> Vec<Pid> {
    let mut pids = vec![pid];
    match control.list_descendants(pid) {
        Ok(children) => pids.extend(children),
        Err(err) => warn!(pid, %err, "cannot enumerate descendants; acting on root only"),
    }
    pids
}

/// CPU seconds used by `pid`, its live descendants and whatever they reaped.
///
/// # Errors
///
/// Returns `AppError::Process` if no snapshot can be taken.
#[cfg(unix)]
pub fn tree_cpu_time(pid: Pid) -> Result<f64> {
    Ok(ProcessSnapshot::capture()?.tree_cpu_seconds(pid))
}

/// Log the process tree under `root` with CPU figures. Installed as the
/// abort hook so an aborted job leaves a trace of what was running.
#[cfg(unix)]
pub fn log_tree_usage(root: Pid) {
    match ProcessSnapshot::capture() {
        Ok(snapshot) => {
            for usage in snapshot.tree_usage(root) {
                tracing::error!(
                    pid = usage.pid,
                    ppid = usage.ppid,
                    cpu = usage.cpu_seconds,
                    "process at abort"
                );
            }
        }
        Err(err) => warn!(root, %err, "no process snapshot at abort"),
    }
    tracing::error!(cpu = self_cpu_seconds(), "supervisor cpu at abort");
}

/// Primitive operations a kill-tree pass needs from a platform.
pub(crate) trait Terminator {
    fn snapshot(&self) -> Result<ProcessSnapshot>;
    fn request_exit(&self, pid: Pid) -> Result<()>;
    fn force_exit(&self, pid: Pid) -> Result<()>;
    fn is_alive(&self, pid: Pid) -> bool;
}

/// Shared kill-tree algorithm.
///
/// Descendants are enumerated again after the grace period because the tree
/// may have spawned new children meanwhile; the first enumeration is kept
/// too, since children of an already-exited parent get re-parented away.
pub(crate) fn kill_tree_with<T: Terminator + ?Sized>(
    ops: &T,
    pid: Pid,
    grace: Option<Duration>,
    poll: Duration,
) -> BTreeSet<Pid> {
    let mut known: BTreeSet<Pid> = descendants_of(ops, pid);
    known.insert(pid);

    if let Some(grace) = grace {
        for &target in &known {
            if let Err(err) = ops.request_exit(target) {
                debug!(pid = target, %err, "cooperative exit request failed");
            }
        }
        let deadline = Instant::now() + grace;
        while known.iter().any(|&p| ops.is_alive(p)) && Instant::now() < deadline {
            thread::sleep(poll);
        }
    }

    known.extend(descendants_of(ops, pid));
    for &target in &known {
        if !ops.is_alive(target) {
            continue;
        }
        if let Err(err) = ops.force_exit(target) {
            warn!(pid = target, %err, "forced termination failed");
        }
    }
    known
}

fn descendants_of<T: Terminator + ?Sized>(ops: &T, pid: Pid) -> BTreeSet<Pid> {
    match ops.snapshot() {
        Ok(snapshot) => snapshot.descendants(pid),
        Err(err) => {
            warn!(pid, %err, "process snapshot failed");
            BTreeSet::new()
        }
    }
}
