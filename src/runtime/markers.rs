//! Marker and trickle files exchanged with the client through the slot
//! directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use crate::{AppError, Result};

/// Marker asking the client to restart the job later instead of now.
pub const TEMPORARY_EXIT_FILE: &str = "gridvisor_temporary_exit";

/// Marker recording that the application finished on purpose.
pub const FINISH_FILE: &str = "gridvisor_finish_called";

const TRICKLE_UP_PREFIX: &str = "trickle_up_";
const TRICKLE_DOWN_PREFIX: &str = "trickle_down_";

static TRICKLE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Write the temporary-exit marker. The caller then exits with status 0.
///
/// # Errors
///
/// Returns `AppError::Io` if the marker cannot be written.
pub fn request_temporary_exit(slot_dir: &Path, delay: Duration, reason: &str) -> Result<()> {
    let path = slot_dir.join(TEMPORARY_EXIT_FILE);
    fs::write(&path, format!("{}\n{reason}\n", delay.as_secs()))
        .map_err(|err| AppError::Io(format!("cannot write {}: {err}", path.display())))?;
    warn!(delay_secs = delay.as_secs(), reason, "temporary exit requested");
    Ok(())
}

/// Write the finish marker with the final status.
///
/// # Errors
///
/// Returns `AppError::Io` if the marker cannot be written.
pub fn write_finish_marker(slot_dir: &Path, status: i32, message: Option<&str>) -> Result<()> {
    let path = slot_dir.join(FINISH_FILE);
    let body = match message {
        Some(msg) => format!("{status}\n{msg}\n"),
        None => format!("{status}\n"),
    };
    fs::write(&path, body)
        .map_err(|err| AppError::Io(format!("cannot write {}: {err}", path.display())))?;
    info!(status, "finish marker written");
    Ok(())
}

/// Write a trickle-up file for `variety` and return its path.
///
/// # Errors
///
/// Returns `AppError::Io` if the file cannot be written.
pub fn write_trickle_up(slot_dir: &Path, variety: &str, text: &str) -> Result<PathBuf> {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs());
    let seq = TRICKLE_SEQ.fetch_add(1, Ordering::Relaxed);
    let path = slot_dir.join(format!("{TRICKLE_UP_PREFIX}{variety}_{stamp}_{seq}.xml"));
    fs::write(&path, format!("<variety>{variety}</variety>\n{text}\n"))
        .map_err(|err| AppError::Io(format!("cannot write {}: {err}", path.display())))?;
    Ok(path)
}

/// Read and remove every trickle-down file, oldest name first.
///
/// # Errors
///
/// Returns `AppError::Io` if the slot directory cannot be listed.
pub fn take_trickle_down(slot_dir: &Path) -> Result<Vec<String>> {
    let mut paths: Vec<PathBuf> = fs::read_dir(slot_dir)?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(TRICKLE_DOWN_PREFIX))
        })
        .collect();
    paths.sort();

    let mut messages = Vec::with_capacity(paths.len());
    for path in paths {
        match fs::read_to_string(&path) {
            Ok(body) => {
                messages.push(body);
                if let Err(err) = fs::remove_file(&path) {
                    warn!(path = %path.display(), %err, "cannot remove trickle-down file");
                }
            }
            Err(err) => warn!(path = %path.display(), %err, "cannot read trickle-down file"),
        }
    }
    Ok(messages)
}
