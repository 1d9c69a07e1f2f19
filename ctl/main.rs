//! `gridvisor-ctl` — local stand-in for the controlling client.
//!
//! Creates the shared segment in a slot directory and plays the client's
//! side of the channel protocol: process-control requests, heartbeats and
//! reading status reports.

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};

use gridvisor::channel::{ClientChannels, Segment};
use gridvisor::wire::{
    ControlMessage, Heartbeat, StatusReport, HAVE_NEW_TRICKLE_UP, HAVE_TRICKLE_DOWN,
};
use gridvisor::{AppError, Result, RuntimeConfig};

#[derive(Debug, Parser)]
#[command(
    name = "gridvisor-ctl",
    about = "Drive a gridvisor application as its client would",
    version,
    long_about = None
)]
struct Cli {
    /// Optional TOML runtime configuration (for `slot_dir` and `shmem_file`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the slot directory.
    #[arg(long)]
    slot_dir: Option<PathBuf>,

    /// How long to wait for an occupied slot to drain.
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create (or reset) the shared segment.
    Create,

    /// Ask the application to suspend.
    Suspend,

    /// Ask the application to resume.
    Resume,

    /// Ask the application to quit so it can restart later.
    Quit,

    /// Ask the application to abort.
    Abort,

    /// Ask the application to re-read its configuration.
    Reread,

    /// Announce a trickle-down file.
    TrickleDown,

    /// Send heartbeats until interrupted or `--count` is reached.
    Heartbeat {
        /// Milliseconds between heartbeats.
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
        /// Stop after this many heartbeats.
        #[arg(long)]
        count: Option<u64>,
        /// Working set size hint in bytes.
        #[arg(long)]
        wss: Option<f64>,
        /// Flag network activity as suspended.
        #[arg(long)]
        network_suspended: bool,
    },

    /// Print the pending status report as JSON, if any.
    Status,

    /// Print every status report as JSON while pumping heartbeats.
    Watch {
        /// Milliseconds between polls.
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },
}

fn main() {
    let args = Cli::parse();
    if let Err(err) = run(&args) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run(args: &Cli) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => RuntimeConfig::load_from_path(path)?,
        None => RuntimeConfig::default(),
    };
    if let Some(dir) = &args.slot_dir {
        config.slot_dir.clone_from(dir);
    }
    let path = config.shmem_path();
    let timeout = Duration::from_millis(args.timeout_ms);

    if matches!(args.command, Command::Create) {
        Segment::create(&path)?;
        println!("{}", path.display());
        return Ok(());
    }

    let segment = Segment::attach(&path)?;
    let client = ClientChannels::new(&segment);

    match &args.command {
        Command::Create => Ok(()),
        Command::Suspend => send_control(&client, ControlMessage::Suspend, timeout),
        Command::Resume => send_control(&client, ControlMessage::Resume, timeout),
        Command::Quit => send_control(&client, ControlMessage::Quit, timeout),
        Command::Abort => send_control(&client, ControlMessage::Abort, timeout),
        Command::Reread => send_control(&client, ControlMessage::RereadConfig, timeout),
        Command::TrickleDown => {
            send_with_retry(|| client.trickle_down.send(HAVE_TRICKLE_DOWN), timeout)
        }
        Command::Heartbeat {
            interval_ms,
            count,
            wss,
            network_suspended,
        } => {
            let beat = Heartbeat {
                working_set_size: *wss,
                max_working_set_size: None,
                network_suspended: *network_suspended,
            }
            .to_message();
            let mut sent = 0_u64;
            while !count.is_some_and(|limit| sent >= limit) {
                if client.heartbeat.send(&beat) {
                    sent += 1;
                }
                thread::sleep(Duration::from_millis(*interval_ms));
            }
            Ok(())
        }
        Command::Status => {
            match client.app_status.receive() {
                Some(msg) => print_status(&msg)?,
                None => println!("null"),
            }
            Ok(())
        }
        Command::Watch { interval_ms } => watch(&client, Duration::from_millis(*interval_ms)),
    }
}

fn send_control(client: &ClientChannels, request: ControlMessage, timeout: Duration) -> Result<()> {
    send_with_retry(|| client.process_control.send(request.as_wire()), timeout)?;
    println!("OK");
    Ok(())
}

fn send_with_retry(mut send: impl FnMut() -> bool, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    while !send() {
        if Instant::now() >= deadline {
            return Err(AppError::Channel(
                "slot still occupied; is the application running?".into(),
            ));
        }
        thread::sleep(Duration::from_millis(50));
    }
    Ok(())
}

fn watch(client: &ClientChannels, interval: Duration) -> Result<()> {
    let beat = Heartbeat::default().to_message();
    loop {
        let _ = client.heartbeat.send(&beat);
        if let Some(msg) = client.app_status.receive() {
            print_status(&msg)?;
        }
        if client
            .trickle_up
            .receive()
            .is_some_and(|msg| msg.contains(HAVE_NEW_TRICKLE_UP))
        {
            println!("{}", serde_json::json!({ "trickle_up": true }));
        }
        thread::sleep(interval);
    }
}

fn print_status(msg: &str) -> Result<()> {
    let report = StatusReport::parse(msg);
    let json = serde_json::to_string(&report)
        .map_err(|err| AppError::Channel(format!("cannot encode status: {err}")))?;
    println!("{json}");
    Ok(())
}
