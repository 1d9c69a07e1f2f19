//! One launched task process and its accounting.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio::process::{Child, Command};
use tracing::{debug, info, info_span, warn};

use super::job::TaskSpec;
use super::macros::MacroContext;
use super::progress::parse_fraction_file;
use crate::process::{with_descendants, Pid, ProcessControl};
use crate::{AppError, Result};

/// Where a task is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Not launched yet.
    Pending,
    /// Process is running (possibly suspended).
    Running,
    /// Exited with status 0.
    Completed,
    /// Exited non-zero or could not be launched.
    Failed,
    /// Killed for exceeding its time limit; counts as done.
    KilledByTimeout,
}

/// Inputs shared by every launch.
#[derive(Debug, Clone, Copy)]
pub struct LaunchContext<'a> {
    /// Placeholder values.
    pub macros: &'a MacroContext,
    /// Arguments forwarded to tasks with `append_cmdline_args`.
    pub passthrough: &'a [String],
}

/// A running task.
#[derive(Debug)]
pub struct TaskProcess {
    spec: TaskSpec,
    exec_dir: Option<PathBuf>,
    child: Child,
    pid: Pid,
    state: TaskState,
    suspended: bool,
    running_time: Duration,
    last_poll: Instant,
    current_cpu_time: f64,
    checkpoint_mtime: Option<SystemTime>,
}

impl TaskProcess {
    /// Launch `spec` with placeholders substituted.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ChildFailed` if the process cannot be started, or
    /// `AppError::Io` if a redirect file cannot be opened.
    pub fn launch(spec: &TaskSpec, ctx: LaunchContext<'_>) -> Result<Self> {
        let span = info_span!("launch_task", task = %spec.application);
        let _guard = span.enter();

        let program = ctx.macros.substitute(&spec.application);
        let exec_dir = spec
            .exec_dir
            .as_deref()
            .map(|dir| PathBuf::from(ctx.macros.substitute(dir)));

        let mut args: Vec<String> = ctx
            .macros
            .substitute(&spec.command_line)
            .split_whitespace()
            .map(str::to_owned)
            .collect();
        if spec.append_cmdline_args {
            args.extend(ctx.passthrough.iter().cloned());
        }

        let mut cmd = Command::new(&program);
        cmd.args(&args).kill_on_drop(true);
        for (name, value) in &spec.env {
            cmd.env(name, ctx.macros.substitute(value));
        }
        if let Some(dir) = &exec_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(match &spec.stdin_filename {
            Some(name) => Stdio::from(open_input(&resolve(exec_dir.as_deref(), name))?),
            None => Stdio::null(),
        });
        if let Some(name) = &spec.stdout_filename {
            cmd.stdout(open_append(&resolve(exec_dir.as_deref(), name))?);
        }
        if let Some(name) = &spec.stderr_filename {
            cmd.stderr(open_append(&resolve(exec_dir.as_deref(), name))?);
        }

        let child = cmd.spawn().map_err(|err| {
            warn!(%err, program, "task launch failed");
            AppError::ChildFailed {
                task: spec.application.clone(),
                code: None,
            }
        })?;
        let pid = child
            .id()
            .and_then(|id| Pid::try_from(id).ok())
            .ok_or_else(|| AppError::ChildFailed {
                task: spec.application.clone(),
                code: None,
            })?;

        #[cfg(unix)]
        if let Some(level) = spec.priority {
            if let Err(err) = crate::process::set_priority(pid, level) {
                warn!(pid, level, %err, "cannot set task priority");
            }
        }

        info!(pid, program, args = args.len(), "task launched");
        let checkpoint_mtime = spec
            .checkpoint_filename
            .as_deref()
            .and_then(|name| modified(&resolve(exec_dir.as_deref(), name)));

        Ok(Self {
            spec: spec.clone(),
            exec_dir,
            child,
            pid,
            state: TaskState::Running,
            suspended: false,
            running_time: Duration::ZERO,
            last_poll: Instant::now(),
            current_cpu_time: 0.0,
            checkpoint_mtime,
        })
    }

    /// Task definition.
    #[must_use]
    pub fn spec(&self) -> &TaskSpec {
        &self.spec
    }

    /// Process id of the task's root process.
    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Whether the task is held suspended.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Running time, excluding time spent suspended.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.running_time
    }

    /// Last measured CPU seconds of the task tree.
    #[must_use]
    pub fn cpu_time(&self) -> f64 {
        self.current_cpu_time
    }

    /// Account wall time since the previous poll and re-measure CPU time.
    /// Call before [`try_exit`](Self::try_exit) so an exited-but-unreaped
    /// process is still measured.
    pub async fn update(&mut self) {
        let now = Instant::now();
        if !self.suspended {
            self.running_time += now.duration_since(self.last_poll);
        }
        self.last_poll = now;
        if let Some(cpu) = self.measure_cpu().await {
            self.current_cpu_time = self.current_cpu_time.max(cpu);
        }
    }

    #[cfg(unix)]
    async fn measure_cpu(&self) -> Option<f64> {
        let pid = self.pid;
        match tokio::task::spawn_blocking(move || crate::process::tree_cpu_time(pid)).await {
            Ok(Ok(cpu)) => Some(cpu),
            Ok(Err(err)) => {
                debug!(pid, %err, "cpu time unavailable");
                None
            }
            Err(err) => {
                warn!(pid, %err, "cpu sampling panicked");
                None
            }
        }
    }

    #[cfg(not(unix))]
    #[allow(clippy::unused_async)]
    async fn measure_cpu(&self) -> Option<f64> {
        Some(self.running_time.as_secs_f64())
    }

    /// Reap the process if it exited.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Process` if the status cannot be queried.
    pub fn try_exit(&mut self) -> Result<Option<ExitStatus>> {
        let status = self
            .child
            .try_wait()
            .map_err(|err| AppError::Process(format!("cannot poll pid {}: {err}", self.pid)))?;
        if let Some(status) = status {
            self.state = if status.success() {
                TaskState::Completed
            } else {
                TaskState::Failed
            };
            info!(pid = self.pid, %status, cpu = self.current_cpu_time, "task exited");
        }
        Ok(status)
    }

    /// Whether the running time passed the task's limit.
    #[must_use]
    pub fn time_limit_exceeded(&self) -> bool {
        self.spec
            .time_limit
            .is_some_and(|limit| self.running_time >= limit)
    }

    /// Self-reported fraction from the task's fraction-done file.
    #[must_use]
    pub fn reported_fraction(&self) -> Option<f64> {
        let name = self.spec.fraction_done_filename.as_deref()?;
        let raw = fs::read_to_string(resolve(self.exec_dir.as_deref(), name)).ok()?;
        parse_fraction_file(&raw)
    }

    /// Whether the task's checkpoint file changed since the last call.
    pub fn checkpoint_changed(&mut self) -> bool {
        let Some(name) = self.spec.checkpoint_filename.as_deref() else {
            return false;
        };
        let current = modified(&resolve(self.exec_dir.as_deref(), name));
        if current.is_some() && current != self.checkpoint_mtime {
            self.checkpoint_mtime = current;
            return true;
        }
        false
    }

    /// Suspend or resume the root (and its descendants if multi-process)
    /// off the async runtime, since enumeration walks the process table.
    async fn apply_to_tree(&self, control: &Arc<dyn ProcessControl>, stop: bool) -> usize {
        let pid = self.pid;
        let recurse = self.spec.multi_process;
        let control = Arc::clone(control);
        let job = tokio::task::spawn_blocking(move || {
            let targets = if recurse {
                with_descendants(control.as_ref(), pid)
            } else {
                vec![pid]
            };
            if stop {
                control.suspend(&targets, None)
            } else {
                control.resume(&targets)
            }
        });
        match job.await {
            Ok(count) => count,
            Err(err) => {
                warn!(pid, %err, "suspend/resume panicked");
                0
            }
        }
    }

    /// Stop the task (and its descendants if multi-process).
    pub async fn suspend(&mut self, control: &Arc<dyn ProcessControl>) {
        if self.suspended {
            return;
        }
        let count = self.apply_to_tree(control, true).await;
        debug!(pid = self.pid, count, "task suspended");
        self.suspended = true;
    }

    /// Continue a suspended task.
    pub async fn resume(&mut self, control: &Arc<dyn ProcessControl>) {
        if !self.suspended {
            return;
        }
        let count = self.apply_to_tree(control, false).await;
        debug!(pid = self.pid, count, "task resumed");
        self.suspended = false;
        self.last_poll = Instant::now();
    }

    /// Kill the task tree and reap the root process.
    pub async fn kill(&mut self, control: &Arc<dyn ProcessControl>, grace: Option<Duration>) {
        let pid = self.pid;
        let control = Arc::clone(control);
        if let Err(err) = tokio::task::spawn_blocking(move || control.kill_tree(pid, grace)).await {
            warn!(pid, %err, "kill task panicked");
        }
        if let Err(err) = self.child.wait().await {
            debug!(pid, %err, "cannot reap killed task");
        }
        self.suspended = false;
    }

    /// Mark the task as killed for its time limit.
    pub fn mark_timed_out(&mut self) {
        self.state = TaskState::KilledByTimeout;
    }
}

fn resolve(exec_dir: Option<&Path>, name: &str) -> PathBuf {
    match exec_dir {
        Some(dir) => dir.join(name),
        None => PathBuf::from(name),
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

fn open_input(path: &Path) -> Result<File> {
    File::open(path).map_err(|err| AppError::Io(format!("cannot open {}: {err}", path.display())))
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| AppError::Io(format!("cannot open {}: {err}", path.display())))
}
