//! `gridvisor` — task supervisor binary.
//!
//! Reads the job description, attaches to the client's channels, runs the
//! task sequence and exits with a code the client understands.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use gridvisor::archive::CommandArchiver;
use gridvisor::process::ProcessControl;
use gridvisor::runtime::{markers, RuntimeContext, RuntimeOptions};
use gridvisor::supervisor::{
    JobDescription, Outcome, Supervisor, SupervisorOptions, DEFAULT_JOB_FILE, EXIT_CHILD_FAILED,
};
use gridvisor::{AppError, Result, RuntimeConfig};

/// `EX_CONFIG` from sysexits.h.
#[cfg(unix)]
const EXIT_CONFIG: i32 = 78;
#[cfg(not(unix))]
const EXIT_CONFIG: i32 = 1;

const TEMPORARY_EXIT_DELAY: Duration = Duration::from_secs(300);

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "gridvisor", about = "Run a job's tasks under client control", version, long_about = None)]
struct Cli {
    /// Job description file.
    #[arg(long, default_value = DEFAULT_JOB_FILE)]
    job: PathBuf,

    /// Optional TOML runtime configuration.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Value substituted for `$NTHREADS`.
    #[arg(long, default_value_t = 1)]
    nthreads: u32,

    /// Value substituted for `$GPU_DEVICE_NUM`.
    #[arg(long)]
    device: Option<u32>,

    /// Send a CPU-time trickle-up message every this many seconds.
    #[arg(long)]
    trickle: Option<u64>,

    /// Suspend tasks with SIGTSTP instead of SIGSTOP.
    #[arg(long = "use_alt_suspend_signal")]
    use_alt_suspend_signal: bool,

    /// Remaining arguments are appended to tasks that accept them.
    #[arg(
        long = "passthrough_child",
        num_args = 0..,
        allow_hyphen_values = true,
        value_name = "ARGS"
    )]
    passthrough_child: Vec<String>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() {
    let args = Cli::parse();
    if let Err(err) = init_tracing(args.log_format) {
        eprintln!("{err}");
        std::process::exit(EXIT_CONFIG);
    }
    info!("gridvisor bootstrap");

    let code = match run(args) {
        Ok(code) => code,
        Err(err) => {
            error!(%err, "supervisor failed");
            exit_code_for(&err)
        }
    };
    info!(code, "exiting");
    std::process::exit(code);
}

fn exit_code_for(err: &AppError) -> i32 {
    match err {
        AppError::Config(_) | AppError::Job(_) => EXIT_CONFIG,
        AppError::ChildFailed { .. } => EXIT_CHILD_FAILED,
        _ => 1,
    }
}

fn run(args: Cli) -> Result<i32> {
    // ── Load configuration ──────────────────────────────
    let config = match &args.config {
        Some(path) => RuntimeConfig::load_from_path(path)?,
        None => RuntimeConfig::default(),
    };

    let job = match load_job(&args.job, config.lock_retry()) {
        Ok(job) => job,
        Err(AppError::Io(msg)) => return temporary_exit(&config, &msg),
        Err(err) => return Err(err),
    };
    info!(
        tasks = job.sequenced().count(),
        daemons = job.daemons().count(),
        "job description loaded"
    );

    // ── Attach to the client ────────────────────────────
    let options = RuntimeOptions {
        handle_graphics: job.enable_graphics_support,
        ..RuntimeOptions::supervisor()
    };
    let ctx = match RuntimeContext::init(config.clone(), options) {
        Ok(ctx) => ctx,
        Err(AppError::Lock(msg)) => return temporary_exit(&config, &msg),
        Err(err) => return Err(err),
    };
    install_abort_capture(&ctx);
    ctx.start_monitor()?;

    let control = process_control(args.use_alt_suspend_signal)?;
    let supervisor_options = SupervisorOptions {
        nthreads: args.nthreads,
        gpu_device: args.device,
        trickle_period: args.trickle.filter(|s| *s > 0).map(Duration::from_secs),
        passthrough: args.passthrough_child,
    };
    let mut supervisor = Supervisor::new(
        Arc::clone(&ctx),
        job,
        supervisor_options,
        control,
        Arc::new(CommandArchiver::default()),
    );

    // ── Run the sequence ────────────────────────────────
    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(supervisor.run());

    match result {
        Ok(Outcome::Completed) => {
            ctx.finish(0, None)?;
            Ok(0)
        }
        Ok(outcome @ Outcome::Stopped(reason)) => {
            info!(%reason, "stopped before completion");
            ctx.stop_monitor();
            Ok(outcome.exit_code())
        }
        Err(err @ AppError::ChildFailed { .. }) => {
            let message = err.to_string();
            ctx.finish(EXIT_CHILD_FAILED, Some(&message))?;
            Err(err)
        }
        Err(err) => {
            ctx.stop_monitor();
            Err(err)
        }
    }
}

/// Read the job description, retrying once after `retry_wait` if the file
/// cannot be read.
fn load_job(path: &Path, retry_wait: Duration) -> Result<JobDescription> {
    match JobDescription::load(path) {
        Err(AppError::Io(msg)) => {
            warn!(path = %path.display(), %msg, ?retry_wait, "job file unreadable; retrying once");
            thread::sleep(retry_wait);
            JobDescription::load(path)
        }
        other => other,
    }
}

fn temporary_exit(config: &RuntimeConfig, reason: &str) -> Result<i32> {
    markers::request_temporary_exit(&config.slot_dir, TEMPORARY_EXIT_DELAY, reason)?;
    Ok(0)
}

#[cfg(unix)]
fn install_abort_capture(ctx: &RuntimeContext) {
    let root = nix::unistd::getpid().as_raw();
    ctx.set_abort_hook(Arc::new(move || gridvisor::process::log_tree_usage(root)));
}

#[cfg(not(unix))]
fn install_abort_capture(ctx: &RuntimeContext) {
    ctx.set_abort_hook(Arc::new(|| error!("abort requested; no process snapshot on this platform")));
}

#[cfg(unix)]
fn process_control(alt_signal: bool) -> Result<Arc<dyn ProcessControl>> {
    use gridvisor::process::{SignalControl, SuspendSignal};

    let signal = if alt_signal {
        SuspendSignal::TerminalStop
    } else {
        SuspendSignal::Stop
    };
    Ok(Arc::new(SignalControl::new(signal)))
}

#[cfg(not(unix))]
fn process_control(_alt_signal: bool) -> Result<Arc<dyn ProcessControl>> {
    Err(AppError::Config(
        "no process control backend for this platform".into(),
    ))
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
