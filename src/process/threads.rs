//! Thread-granularity process control.
//!
//! Platforms that can suspend individual threads (but not whole processes)
//! expose a [`ThreadTable`]; [`ThreadControl`] layers the shared contract on
//! top of it: filter a system-wide thread snapshot down to the target
//! processes, skip the excluded thread, and remember exactly which thread
//! ids were suspended so that a resume never wakes a thread someone else
//! stopped.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{kill_tree_with, Pid, ProcessControl, ProcessSnapshot, Terminator, Tid};
use super::EXIT_POLL_INTERVAL;
use crate::Result;

/// One thread in a system-wide snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadEntry {
    /// Thread id.
    pub tid: Tid,
    /// Owning process.
    pub pid: Pid,
}

/// Platform primitives for thread-granularity control.
pub trait ThreadTable: Send + Sync {
    /// Every thread in the system.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Process` if the snapshot fails.
    fn threads(&self) -> Result<Vec<ThreadEntry>>;

    /// Suspend one thread.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Process` if the thread cannot be opened or stopped.
    fn suspend_thread(&self, tid: Tid) -> Result<()>;

    /// Resume one thread.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Process` if the thread cannot be opened or resumed.
    fn resume_thread(&self, tid: Tid) -> Result<()>;

    /// Process table snapshot.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Process` if the snapshot fails.
    fn processes(&self) -> Result<ProcessSnapshot>;

    /// Ask a process to exit.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Process` if the request cannot be delivered.
    fn request_exit(&self, pid: Pid) -> Result<()>;

    /// Terminate a process unconditionally.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Process` if the process cannot be terminated.
    fn terminate(&self, pid: Pid) -> Result<()>;

    /// Whether the process still runs.
    fn is_alive(&self, pid: Pid) -> bool;
}

/// [`ProcessControl`] over a [`ThreadTable`].
#[derive(Debug)]
pub struct ThreadControl<T> {
    table: T,
    /// Suspended thread ids keyed by their owning process.
    suspended: Mutex<BTreeMap<Pid, BTreeSet<Tid>>>,
}

impl<T: ThreadTable> ThreadControl<T> {
    /// Wrap a platform thread table.
    #[must_use]
    pub fn new(table: T) -> Self {
        Self {
            table,
            suspended: Mutex::new(BTreeMap::new()),
        }
    }

    /// The wrapped table.
    #[must_use]
    pub fn table(&self) -> &T {
        &self.table
    }

    fn suspended(&self) -> MutexGuard<'_, BTreeMap<Pid, BTreeSet<Tid>>> {
        self.suspended.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Thread ids currently held suspended by this instance.
    #[must_use]
    pub fn suspended_threads(&self) -> BTreeSet<Tid> {
        self.suspended().values().flatten().copied().collect()
    }
}

impl<T: ThreadTable> ProcessControl for ThreadControl<T> {
    fn list_descendants(&self, pid: Pid) -> Result<BTreeSet<Pid>> {
        Ok(self.table.processes()?.descendants(pid))
    }

    fn suspend(&self, pids: &[Pid], exclude: Option<Tid>) -> usize {
        let threads = match self.table.threads() {
            Ok(threads) => threads,
            Err(err) => {
                warn!(%err, "thread snapshot failed; nothing suspended");
                return 0;
            }
        };
        let targets: BTreeSet<Pid> = pids.iter().copied().collect();
        let mut suspended = self.suspended();
        let mut touched = BTreeSet::new();

        for entry in threads {
            if !targets.contains(&entry.pid) || Some(entry.tid) == exclude {
                continue;
            }
            let held = suspended.entry(entry.pid).or_default();
            if held.contains(&entry.tid) {
                continue;
            }
            match self.table.suspend_thread(entry.tid) {
                Ok(()) => {
                    held.insert(entry.tid);
                    touched.insert(entry.pid);
                }
                Err(err) => warn!(pid = entry.pid, tid = entry.tid, %err, "failed to suspend thread"),
            }
        }
        suspended.retain(|_, tids| !tids.is_empty());
        touched.len()
    }

    fn resume(&self, pids: &[Pid]) -> usize {
        let mut suspended = self.suspended();
        let mut count = 0;
        for pid in pids {
            let Some(tids) = suspended.remove(pid) else {
                debug!(pid, "resume skipped; not suspended by us");
                continue;
            };
            for tid in tids {
                if let Err(err) = self.table.resume_thread(tid) {
                    warn!(pid, tid, %err, "failed to resume thread");
                }
            }
            count += 1;
        }
        count
    }

    fn kill_tree(&self, pid: Pid, grace: Option<Duration>) {
        let killed = kill_tree_with(&TableOps(&self.table), pid, grace, EXIT_POLL_INTERVAL);
        let mut suspended = self.suspended();
        for p in &killed {
            suspended.remove(p);
        }
        info!(pid, count = killed.len(), "process tree terminated");
    }
}

struct TableOps<'a, T>(&'a T);

impl<T: ThreadTable> Terminator for TableOps<'_, T> {
    fn snapshot(&self) -> Result<ProcessSnapshot> {
        self.0.processes()
    }

    fn request_exit(&self, pid: Pid) -> Result<()> {
        self.0.request_exit(pid)
    }

    fn force_exit(&self, pid: Pid) -> Result<()> {
        self.0.terminate(pid)
    }

    fn is_alive(&self, pid: Pid) -> bool {
        self.0.is_alive(pid)
    }
}
