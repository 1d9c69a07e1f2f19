//! Process-granularity control through POSIX signals.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{getpid, Pid as NixPid};
use tracing::{debug, info, warn};

use super::{kill_tree_with, Pid, ProcEntry, ProcessControl, ProcessSnapshot, Terminator, Tid};
use super::EXIT_POLL_INTERVAL;
use crate::{AppError, Result};

/// Signal used to stop a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SuspendSignal {
    /// `SIGSTOP`: cannot be caught.
    #[default]
    Stop,
    /// `SIGTSTP`: lets the target react before stopping.
    TerminalStop,
}

impl SuspendSignal {
    fn signal(self) -> Signal {
        match self {
            Self::Stop => Signal::SIGSTOP,
            Self::TerminalStop => Signal::SIGTSTP,
        }
    }
}

/// [`ProcessControl`] that signals whole processes.
#[derive(Debug, Default)]
pub struct SignalControl {
    suspend_signal: SuspendSignal,
    suspended: Mutex<BTreeSet<Pid>>,
}

impl SignalControl {
    /// Control using the given suspend signal.
    #[must_use]
    pub fn new(suspend_signal: SuspendSignal) -> Self {
        Self {
            suspend_signal,
            suspended: Mutex::new(BTreeSet::new()),
        }
    }

    fn suspended(&self) -> std::sync::MutexGuard<'_, BTreeSet<Pid>> {
        self.suspended
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Pids this instance currently holds suspended.
    #[must_use]
    pub fn suspended_pids(&self) -> BTreeSet<Pid> {
        self.suspended().clone()
    }
}

impl ProcessControl for SignalControl {
    fn list_descendants(&self, pid: Pid) -> Result<BTreeSet<Pid>> {
        Ok(ProcessSnapshot::capture()?.descendants(pid))
    }

    fn suspend(&self, pids: &[Pid], _exclude: Option<Tid>) -> usize {
        let me = getpid().as_raw();
        let mut suspended = self.suspended();
        let mut count = 0;
        for &pid in pids {
            if pid == me || suspended.contains(&pid) {
                continue;
            }
            match kill(NixPid::from_raw(pid), self.suspend_signal.signal()) {
                Ok(()) => {
                    suspended.insert(pid);
                    count += 1;
                }
                Err(err) => warn!(pid, %err, "failed to suspend process"),
            }
        }
        count
    }

    fn resume(&self, pids: &[Pid]) -> usize {
        let mut suspended = self.suspended();
        let mut count = 0;
        for &pid in pids {
            if !suspended.remove(&pid) {
                debug!(pid, "resume skipped; not suspended by us");
                continue;
            }
            match kill(NixPid::from_raw(pid), Signal::SIGCONT) {
                Ok(()) => count += 1,
                Err(err) => warn!(pid, %err, "failed to resume process"),
            }
        }
        count
    }

    fn kill_tree(&self, pid: Pid, grace: Option<Duration>) {
        let killed = kill_tree_with(&Signals, pid, grace, EXIT_POLL_INTERVAL);
        let mut suspended = self.suspended();
        for p in &killed {
            suspended.remove(p);
        }
        info!(pid, count = killed.len(), "process tree terminated");
    }
}

struct Signals;

impl Terminator for Signals {
    fn snapshot(&self) -> Result<ProcessSnapshot> {
        ProcessSnapshot::capture()
    }

    fn request_exit(&self, pid: Pid) -> Result<()> {
        let target = NixPid::from_raw(pid);
        kill(target, Signal::SIGTERM)?;
        // A stopped process cannot act on SIGTERM until continued.
        kill(target, Signal::SIGCONT)?;
        Ok(())
    }

    fn force_exit(&self, pid: Pid) -> Result<()> {
        match kill(NixPid::from_raw(pid), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn is_alive(&self, pid: Pid) -> bool {
        is_alive(pid)
    }
}

/// Whether `pid` exists and has not yet exited (zombies count as exited).
#[must_use]
pub fn is_alive(pid: Pid) -> bool {
    if kill(NixPid::from_raw(pid), None).is_err() {
        return false;
    }
    #[cfg(target_os = "linux")]
    {
        if let Ok(raw) = std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            return parse_stat(&raw).is_some_and(|stat| stat.state != 'Z');
        }
    }
    true
}

/// Fields of `/proc/<pid>/stat` this crate uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStat {
    /// Process id.
    pub pid: Pid,
    /// Single-letter state.
    pub state: char,
    /// Parent process id.
    pub ppid: Pid,
    /// User-mode CPU ticks.
    pub utime: u64,
    /// Kernel-mode CPU ticks.
    pub stime: u64,
    /// User-mode CPU ticks of reaped children.
    pub cutime: u64,
    /// Kernel-mode CPU ticks of reaped children.
    pub cstime: u64,
}

/// Parse one `/proc/<pid>/stat` line. The command name may itself contain
/// spaces and parentheses, so fields are located from the last `)`.
#[must_use]
pub fn parse_stat(raw: &str) -> Option<ProcStat> {
    let open = raw.find('(')?;
    let close = raw.rfind(')')?;
    let pid = raw[..open].trim().parse().ok()?;
    let fields: Vec<&str> = raw.get(close + 1..)?.split_whitespace().collect();
    Some(ProcStat {
        pid,
        state: fields.first()?.chars().next()?,
        ppid: fields.get(1)?.parse().ok()?,
        utime: fields.get(11)?.parse().ok()?,
        stime: fields.get(12)?.parse().ok()?,
        cutime: fields.get(13)?.parse().ok()?,
        cstime: fields.get(14)?.parse().ok()?,
    })
}

/// CPU seconds (user + system) consumed by the calling process.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn self_cpu_seconds() -> f64 {
    use nix::sys::resource::{getrusage, UsageWho};
    use nix::sys::time::TimeValLike;

    match getrusage(UsageWho::RUSAGE_SELF) {
        Ok(usage) => {
            let micros =
                usage.user_time().num_microseconds() + usage.system_time().num_microseconds();
            micros as f64 / 1e6
        }
        Err(err) => {
            debug!(%err, "getrusage failed");
            0.0
        }
    }
}

fn clock_ticks_per_second() -> u64 {
    nix::unistd::sysconf(nix::unistd::SysconfVar::CLK_TCK)
        .ok()
        .flatten()
        .and_then(|v| u64::try_from(v).ok())
        .unwrap_or(100)
}

#[cfg(target_os = "linux")]
pub(crate) fn capture_snapshot() -> Result<ProcessSnapshot> {
    let dir = std::fs::read_dir("/proc")
        .map_err(|err| AppError::Process(format!("cannot read /proc: {err}")))?;
    let mut entries = HashMap::new();
    for entry in dir.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|n| n.parse::<Pid>().ok()) else {
            continue;
        };
        // Processes exit between readdir and read; skip them silently.
        let Ok(raw) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        if let Some(stat) = parse_stat(&raw) {
            entries.insert(
                pid,
                ProcEntry {
                    ppid: stat.ppid,
                    cpu_ticks: stat.utime + stat.stime,
                    reaped_ticks: stat.cutime + stat.cstime,
                },
            );
        }
    }
    Ok(ProcessSnapshot::from_entries(entries, clock_ticks_per_second()))
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn capture_snapshot() -> Result<ProcessSnapshot> {
    let output = std::process::Command::new("ps")
        .args(["-A", "-o", "pid=", "-o", "ppid="])
        .output()
        .map_err(|err| AppError::Process(format!("cannot run ps: {err}")))?;
    let text = String::from_utf8_lossy(&output.stdout);
    let entries = text
        .lines()
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let pid = cols.next()?.parse().ok()?;
            let ppid = cols.next()?.parse().ok()?;
            let entry = ProcEntry {
                ppid,
                cpu_ticks: 0,
                reaped_ticks: 0,
            };
            Some((pid, entry))
        })
        .collect();
    Ok(ProcessSnapshot::from_entries(entries, clock_ticks_per_second()))
}

/// Map a job priority (1 lowest … 5 highest) to a nice value and apply it.
///
/// # Errors
///
/// Returns `AppError::Process` if the priority cannot be changed (raising
/// priority usually needs privileges).
pub fn set_priority(pid: Pid, level: u8) -> Result<()> {
    let nice: libc::c_int = match level {
        0 | 1 => 19,
        2 => 10,
        3 => 0,
        4 => -5,
        _ => -10,
    };
    let who = libc::id_t::try_from(pid)
        .map_err(|_| AppError::Process(format!("invalid pid {pid}")))?;
    if apply_nice(who, nice) != 0 {
        return Err(AppError::Process(format!(
            "setpriority({pid}, {nice}) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[allow(unsafe_code)]
fn apply_nice(who: libc::id_t, nice: libc::c_int) -> libc::c_int {
    // SAFETY: setpriority takes plain integers and touches no memory we own.
    unsafe { libc::setpriority(libc::PRIO_PROCESS, who, nice) }
}
