//! The supervisor's own checkpoint: how far through the sequence it got.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::{AppError, Result};

/// File name of the supervisor checkpoint inside the slot directory.
pub const CHECKPOINT_FILE: &str = "supervisor_checkpoint.txt";

/// Persisted sequence position.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SupervisorCheckpoint {
    /// Sequenced tasks fully completed.
    pub tasks_completed: usize,
    /// CPU seconds of all completed work.
    pub cumulative_cpu_time: f64,
    /// Running seconds of all completed work.
    pub cumulative_runtime: f64,
}

impl SupervisorCheckpoint {
    /// Parse `"<tasks> <cpu> <runtime>"`.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let mut fields = raw.split_whitespace();
        let checkpoint = Self {
            tasks_completed: fields.next()?.parse().ok()?,
            cumulative_cpu_time: fields.next()?.parse().ok()?,
            cumulative_runtime: fields.next()?.parse().ok()?,
        };
        (checkpoint.cumulative_cpu_time.is_finite() && checkpoint.cumulative_runtime.is_finite())
            .then_some(checkpoint)
    }

    /// On-disk form.
    #[must_use]
    pub fn to_line(&self) -> String {
        format!(
            "{} {:.6} {:.6}\n",
            self.tasks_completed, self.cumulative_cpu_time, self.cumulative_runtime
        )
    }
}

/// Reads and atomically rewrites the checkpoint file.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    /// Store for `slot_dir`.
    #[must_use]
    pub fn new(slot_dir: &Path) -> Self {
        Self {
            path: slot_dir.join(CHECKPOINT_FILE),
        }
    }

    /// Checkpoint file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the checkpoint. Absent or unparsable means "start over".
    #[must_use]
    pub fn load(&self) -> Option<SupervisorCheckpoint> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %self.path.display(), %err, "cannot read checkpoint; starting over");
                return None;
            }
        };
        let parsed = SupervisorCheckpoint::parse(&raw);
        if parsed.is_none() {
            warn!(path = %self.path.display(), "corrupt checkpoint; starting over");
        }
        parsed
    }

    /// Replace the checkpoint file atomically.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Checkpoint` if the file cannot be written or
    /// renamed into place.
    pub fn save(&self, checkpoint: &SupervisorCheckpoint) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir)
            .map_err(|err| AppError::Checkpoint(format!("cannot create temp file: {err}")))?;
        tmp.write_all(checkpoint.to_line().as_bytes())
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|err| AppError::Checkpoint(format!("cannot write checkpoint: {err}")))?;
        tmp.persist(&self.path)
            .map_err(|err| AppError::Checkpoint(format!("cannot persist checkpoint: {err}")))?;
        debug!(
            tasks_completed = checkpoint.tasks_completed,
            cpu = checkpoint.cumulative_cpu_time,
            "supervisor checkpoint written"
        );
        Ok(())
    }
}
