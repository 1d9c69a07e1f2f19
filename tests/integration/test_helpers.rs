//! Slot directories, shell task scripts and a client wired over a real
//! segment file.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use gridvisor::archive::Archiver;
use gridvisor::channel::{AppChannels, ClientChannels, Segment};
use gridvisor::process::{Pid, SignalControl, SuspendSignal};
use gridvisor::runtime::{RuntimeContext, RuntimeOptions};
use gridvisor::supervisor::{JobDescription, Supervisor, SupervisorOptions};
use gridvisor::{Result, RuntimeConfig};

/// Short poll and grace periods so tests finish quickly.
pub fn slot_config(slot: &Path) -> RuntimeConfig {
    RuntimeConfig {
        slot_dir: slot.to_path_buf(),
        project_dir: slot.to_path_buf(),
        poll_millis: 50,
        kill_grace_seconds: 1,
        lock_retry_seconds: 0,
        ..RuntimeConfig::default()
    }
}

/// Write an executable-by-`sh` script into `dir`.
pub fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    path
}

/// `<task>` running `script` under `/bin/sh` in the slot directory.
pub fn sh_task(slot: &Path, script: &Path, extra: &str) -> String {
    format!(
        "<task><application>/bin/sh</application>\
         <exec_dir>{}</exec_dir>\
         <command_line>{}</command_line>{extra}</task>",
        slot.display(),
        script.display()
    )
}

pub fn job(body: &str) -> JobDescription {
    JobDescription::parse(&format!("<job_desc>{body}</job_desc>")).unwrap()
}

/// Archiver that records calls instead of running `zip`.
#[derive(Debug, Default)]
pub struct RecordingArchiver {
    pub packed: Mutex<Vec<(PathBuf, Vec<PathBuf>)>>,
    pub unpacked: Mutex<Vec<PathBuf>>,
}

impl Archiver for RecordingArchiver {
    fn pack(&self, output: &Path, files: &[PathBuf]) -> Result<()> {
        self.packed
            .lock()
            .unwrap()
            .push((output.to_path_buf(), files.to_vec()));
        Ok(())
    }

    fn unpack(&self, archive: &Path, _dest: &Path) -> Result<()> {
        self.unpacked.lock().unwrap().push(archive.to_path_buf());
        Ok(())
    }
}

pub fn supervisor(
    ctx: &Arc<RuntimeContext>,
    job: JobDescription,
    options: SupervisorOptions,
    archiver: &Arc<RecordingArchiver>,
) -> Supervisor {
    Supervisor::new(
        Arc::clone(ctx),
        job,
        options,
        Arc::new(SignalControl::new(SuspendSignal::Stop)),
        Arc::clone(archiver) as Arc<dyn Archiver>,
    )
}

/// Context with no client.
pub fn standalone(slot: &Path) -> Arc<RuntimeContext> {
    RuntimeContext::with_channels(slot_config(slot), RuntimeOptions::supervisor(), None)
}

/// Context attached to a segment file the returned client created.
pub fn with_client(config: RuntimeConfig, options: RuntimeOptions) -> (Arc<RuntimeContext>, ClientChannels) {
    let client_side = Segment::create(config.shmem_path()).unwrap();
    let app_side = Segment::attach(config.shmem_path()).unwrap();
    let ctx = RuntimeContext::with_channels(config, options, Some(AppChannels::new(&app_side)));
    (ctx, ClientChannels::new(&client_side))
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    cond()
}

/// Keep trying to send until the slot frees up.
pub fn send_until(timeout: Duration, mut send: impl FnMut() -> bool) {
    assert!(wait_for(timeout, &mut send), "slot never drained");
}

/// Process state letter from `/proc/<pid>/stat`.
#[cfg(target_os = "linux")]
pub fn proc_state(pid: Pid) -> Option<char> {
    let raw = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    gridvisor::process::unix::parse_stat(&raw).map(|stat| stat.state)
}

/// Pid written by a task script, once it appears.
pub fn read_pid(path: &Path) -> Pid {
    assert!(
        wait_for(Duration::from_secs(5), || std::fs::read_to_string(path)
            .is_ok_and(|raw| raw.trim().parse::<Pid>().is_ok())),
        "pid file {} never written",
        path.display()
    );
    std::fs::read_to_string(path).unwrap().trim().parse().unwrap()
}
