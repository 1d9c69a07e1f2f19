//! Task supervisor: runs unmodified executables as one logical job.
//!
//! The supervisor is itself a hosted computation: it owns a
//! [`RuntimeContext`] whose status it forwards to the task process trees,
//! and it reports the aggregated CPU time and weighted fraction done back
//! over the context's status channel.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::archive::{self, Archiver, SortOrder};
use crate::process::ProcessControl;
use crate::runtime::{ExitReason, RuntimeContext};
use crate::{AppError, Result};

pub mod checkpoint;
pub mod job;
pub mod macros;
pub mod progress;
pub mod task;

pub use checkpoint::{CheckpointStore, SupervisorCheckpoint, CHECKPOINT_FILE};
pub use job::{JobDescription, TaskSpec, ZipOutput, DEFAULT_JOB_FILE};
pub use macros::MacroContext;
pub use progress::overall_fraction;
pub use task::{LaunchContext, TaskProcess, TaskState};

/// Exit code when a sequenced task fails.
pub const EXIT_CHILD_FAILED: i32 = 195;

/// Variety of the periodic CPU-time trickle-up message.
pub const CPU_TIME_TRICKLE: &str = "cpu_time";

/// Command-line driven knobs.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Value of `$NTHREADS`.
    pub nthreads: u32,
    /// Value of `$GPU_DEVICE_NUM`.
    pub gpu_device: Option<u32>,
    /// Send a CPU-time trickle-up at this period.
    pub trickle_period: Option<Duration>,
    /// Arguments appended for tasks with `append_cmdline_args`.
    pub passthrough: Vec<String>,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            nthreads: 1,
            gpu_device: None,
            trickle_period: None,
            passthrough: Vec::new(),
        }
    }
}

/// How a run ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every task finished.
    Completed,
    /// Stopped early by the client or by heartbeat loss.
    Stopped(ExitReason),
}

impl Outcome {
    /// Process exit code.
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Completed => 0,
            Self::Stopped(reason) => reason.exit_code(),
        }
    }
}

enum TaskEnd {
    Finished,
    Stopped(ExitReason),
}

/// Drives the task sequence.
pub struct Supervisor {
    ctx: Arc<RuntimeContext>,
    job: JobDescription,
    options: SupervisorOptions,
    control: Arc<dyn ProcessControl>,
    archiver: Arc<dyn Archiver>,
    store: CheckpointStore,
    macros: MacroContext,
    weights: Vec<f64>,
    committed: SupervisorCheckpoint,
    checkpoint_cpu_time: f64,
    daemons: Vec<TaskProcess>,
    last_trickle: Instant,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("tasks", &self.weights.len())
            .field("committed", &self.committed)
            .field("daemons", &self.daemons.len())
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Build a supervisor for `job` reporting through `ctx`.
    #[must_use]
    pub fn new(
        ctx: Arc<RuntimeContext>,
        job: JobDescription,
        options: SupervisorOptions,
        control: Arc<dyn ProcessControl>,
        archiver: Arc<dyn Archiver>,
    ) -> Self {
        let config = ctx.config();
        let macros = MacroContext {
            project_dir: config.project_dir.clone(),
            nthreads: options.nthreads,
            gpu_device: options.gpu_device,
            pwd: std::env::current_dir().unwrap_or_else(|_| config.slot_dir.clone()),
        };
        Self {
            store: CheckpointStore::new(&config.slot_dir),
            weights: job.weights(),
            macros,
            job,
            options,
            control,
            archiver,
            committed: SupervisorCheckpoint::default(),
            checkpoint_cpu_time: 0.0,
            daemons: Vec::new(),
            last_trickle: Instant::now(),
            ctx,
        }
    }

    /// Progress committed so far.
    #[must_use]
    pub fn committed(&self) -> SupervisorCheckpoint {
        self.committed
    }

    /// Run the job to completion, or until the client stops it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ChildFailed` if a sequenced task fails to launch
    /// or exits non-zero, and `AppError::Archive` / `AppError::Checkpoint`
    /// if input, output or checkpoint files cannot be handled.
    pub async fn run(&mut self) -> Result<Outcome> {
        let span = info_span!("supervisor", tasks = self.weights.len());
        self.run_inner().instrument(span).await
    }

    async fn run_inner(&mut self) -> Result<Outcome> {
        match self.store.load() {
            Some(checkpoint) => {
                info!(
                    tasks_completed = checkpoint.tasks_completed,
                    cpu = checkpoint.cumulative_cpu_time,
                    "resuming from checkpoint"
                );
                self.committed = checkpoint;
                self.checkpoint_cpu_time = checkpoint.cumulative_cpu_time;
            }
            None => self.unpack_inputs()?,
        }

        let result = match self.launch_daemons() {
            Ok(()) => self.run_sequence().await,
            Err(err) => Err(err),
        };
        self.kill_daemons().await;

        let outcome = result?;
        if outcome == Outcome::Completed {
            self.pack_outputs()?;
            info!(cpu = self.committed.cumulative_cpu_time, "all tasks completed");
        }
        Ok(outcome)
    }

    async fn run_sequence(&mut self) -> Result<Outcome> {
        let sequenced: Vec<TaskSpec> = self.job.sequenced().cloned().collect();
        for (index, spec) in sequenced.iter().enumerate() {
            if index < self.committed.tasks_completed {
                debug!(index, task = %spec.application, "already completed; skipping");
                continue;
            }
            self.report(index, 0.0, 0.0);

            let launch = LaunchContext {
                macros: &self.macros,
                passthrough: &self.options.passthrough,
            };
            let mut task = TaskProcess::launch(spec, launch)?;
            if let TaskEnd::Stopped(reason) = self.supervise(index, &mut task).await? {
                return Ok(Outcome::Stopped(reason));
            }

            self.committed.tasks_completed = index + 1;
            self.committed.cumulative_cpu_time += task.cpu_time();
            self.committed.cumulative_runtime += task.elapsed().as_secs_f64();
            self.checkpoint_cpu_time = self.committed.cumulative_cpu_time;
            self.store.save(&self.committed)?;
            self.report(index + 1, 0.0, 0.0);
            info!(
                index,
                task = %spec.application,
                state = ?task.state(),
                cpu = task.cpu_time(),
                "task done"
            );
        }
        Ok(Outcome::Completed)
    }

    async fn supervise(&mut self, index: usize, task: &mut TaskProcess) -> Result<TaskEnd> {
        let mut interval = tokio::time::interval(self.ctx.config().poll_period());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;

            let status = self.ctx.status();
            if status.abort_requested {
                warn!(pid = task.pid(), "abort requested; killing task");
                task.kill(&self.control, None).await;
                return Ok(TaskEnd::Stopped(ExitReason::Abort));
            }
            if status.quit_requested || status.no_heartbeat {
                let reason = self.ctx.exit_reason().unwrap_or(if status.no_heartbeat {
                    ExitReason::HeartbeatLost
                } else {
                    ExitReason::Quit
                });
                info!(pid = task.pid(), %reason, "stopping task");
                task.kill(&self.control, Some(self.ctx.config().kill_grace())).await;
                return Ok(TaskEnd::Stopped(reason));
            }
            self.forward_suspension(status.suspended, task).await;

            task.update().await;
            if let Some(exit) = task.try_exit()? {
                if exit.success() {
                    return Ok(TaskEnd::Finished);
                }
                return Err(AppError::ChildFailed {
                    task: task.spec().application.clone(),
                    code: exit.code(),
                });
            }

            if task.time_limit_exceeded() {
                info!(
                    pid = task.pid(),
                    elapsed = task.elapsed().as_secs_f64(),
                    "time limit reached; killing task"
                );
                task.kill(&self.control, None).await;
                task.mark_timed_out();
                return Ok(TaskEnd::Finished);
            }

            if task.checkpoint_changed() {
                self.task_checkpointed(task)?;
            }

            let fraction = task.reported_fraction().unwrap_or(0.0);
            self.report(index, fraction, task.cpu_time());
            self.maybe_trickle(task.cpu_time());
            self.drain_trickle_down();
        }
    }

    async fn forward_suspension(&mut self, suspended: bool, task: &mut TaskProcess) {
        let control = Arc::clone(&self.control);
        if suspended {
            task.suspend(&control).await;
            for daemon in &mut self.daemons {
                daemon.suspend(&control).await;
            }
        } else {
            task.resume(&control).await;
            for daemon in &mut self.daemons {
                daemon.resume(&control).await;
            }
        }
    }

    fn task_checkpointed(&mut self, task: &TaskProcess) -> Result<()> {
        let checkpoint = SupervisorCheckpoint {
            tasks_completed: self.committed.tasks_completed,
            cumulative_cpu_time: self.committed.cumulative_cpu_time + task.cpu_time(),
            cumulative_runtime: self.committed.cumulative_runtime + task.elapsed().as_secs_f64(),
        };
        self.store.save(&checkpoint)?;
        self.checkpoint_cpu_time = checkpoint.cumulative_cpu_time;
        debug!(pid = task.pid(), cpu = checkpoint.cumulative_cpu_time, "task checkpointed");
        Ok(())
    }

    fn report(&self, current: usize, fraction: f64, task_cpu: f64) {
        let overall = overall_fraction(&self.weights, current, fraction);
        let cpu = self.committed.cumulative_cpu_time + task_cpu;
        if !self.ctx.report_app_status(cpu, self.checkpoint_cpu_time, overall) {
            debug!(overall, "status not delivered");
        }
    }

    fn maybe_trickle(&mut self, task_cpu: f64) {
        let Some(period) = self.options.trickle_period else {
            return;
        };
        if self.last_trickle.elapsed() < period {
            return;
        }
        self.last_trickle = Instant::now();
        let cpu = self.committed.cumulative_cpu_time + task_cpu;
        let text = format!("<cpu_time>{cpu:.2}</cpu_time>");
        if let Err(err) = self.ctx.send_trickle_up(CPU_TIME_TRICKLE, &text) {
            warn!(%err, "cannot send cpu-time trickle");
        }
    }

    fn drain_trickle_down(&self) {
        match self.ctx.take_trickle_down() {
            Ok(messages) if !messages.is_empty() => {
                info!(count = messages.len(), "trickle-down messages received");
            }
            Ok(_) => {}
            Err(err) => warn!(%err, "cannot read trickle-down messages"),
        }
    }

    fn launch_daemons(&mut self) -> Result<()> {
        let daemons: Vec<TaskSpec> = self.job.daemons().cloned().collect();
        for spec in &daemons {
            let launch = LaunchContext {
                macros: &self.macros,
                passthrough: &self.options.passthrough,
            };
            let daemon = TaskProcess::launch(spec, launch)?;
            info!(pid = daemon.pid(), task = %spec.application, "daemon started");
            self.daemons.push(daemon);
        }
        Ok(())
    }

    async fn kill_daemons(&mut self) {
        for mut daemon in self.daemons.drain(..) {
            daemon.kill(&self.control, None).await;
        }
    }

    fn slot_path(&self, name: &str) -> PathBuf {
        self.ctx.config().slot_dir.join(name)
    }

    fn unpack_inputs(&self) -> Result<()> {
        let dest = &self.ctx.config().slot_dir;
        for name in &self.job.unzip_input {
            self.archiver.unpack(&self.slot_path(name), dest)?;
        }
        Ok(())
    }

    fn pack_outputs(&self) -> Result<()> {
        let Some(zip) = &self.job.zip_output else {
            return Ok(());
        };
        let slot = &self.ctx.config().slot_dir;
        let output = self.slot_path(&zip.zipfilename);
        let mut files = Vec::new();
        for pattern in &zip.patterns {
            let pattern = archive::anchored(pattern)?;
            files.extend(archive::list_matching(slot, &pattern, SortOrder::Ascending)?);
        }
        files.sort();
        files.dedup();
        files.retain(|path| path.file_name() != output.file_name());
        if files.is_empty() {
            warn!(
                archive = %output.display(),
                patterns = ?zip.patterns,
                "no output files matched; skipping archive"
            );
            return Ok(());
        }
        self.archiver.pack(&output, &files)
    }
}
