//! Runtime configuration parsing and validation.
//!
//! Every field has a default so a missing `--config` file is the same as
//! an empty one.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

fn default_dot() -> PathBuf {
    PathBuf::from(".")
}

fn default_shmem_file() -> String {
    "gridvisor_mmap".into()
}

fn default_lock_file() -> String {
    "gridvisor_lockfile".into()
}

fn default_tick_millis() -> u64 {
    100
}

fn default_heartbeat_giveup_seconds() -> u64 {
    30
}

fn default_checkpoint_period_seconds() -> u64 {
    300
}

fn default_lock_retry_seconds() -> u64 {
    35
}

fn default_kill_grace_seconds() -> u64 {
    5
}

fn default_poll_millis() -> u64 {
    1000
}

/// Runtime configuration parsed from an optional TOML file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Slot directory holding the shared segment, markers and checkpoints.
    #[serde(default = "default_dot")]
    pub slot_dir: PathBuf,
    /// Project directory substituted for `$PROJECT_DIR`.
    #[serde(default = "default_dot")]
    pub project_dir: PathBuf,
    /// Shared-memory segment file name, relative to `slot_dir`.
    #[serde(default = "default_shmem_file")]
    pub shmem_file: String,
    /// Single-instance guard file name, relative to `slot_dir`.
    #[serde(default = "default_lock_file")]
    pub lock_file: String,
    /// Monitoring loop tick period.
    #[serde(default = "default_tick_millis")]
    pub tick_millis: u64,
    /// Seconds without a heartbeat before the client is presumed gone.
    #[serde(default = "default_heartbeat_giveup_seconds")]
    pub heartbeat_giveup_seconds: u64,
    /// Seconds between checkpoint opportunities.
    #[serde(default = "default_checkpoint_period_seconds")]
    pub checkpoint_period_seconds: u64,
    /// Bounded wait before retrying a contended lock or unreadable file.
    #[serde(default = "default_lock_retry_seconds")]
    pub lock_retry_seconds: u64,
    /// Grace period between cooperative and forced task termination.
    #[serde(default = "default_kill_grace_seconds")]
    pub kill_grace_seconds: u64,
    /// Supervisor poll period.
    #[serde(default = "default_poll_millis")]
    pub poll_millis: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            slot_dir: default_dot(),
            project_dir: default_dot(),
            shmem_file: default_shmem_file(),
            lock_file: default_lock_file(),
            tick_millis: default_tick_millis(),
            heartbeat_giveup_seconds: default_heartbeat_giveup_seconds(),
            checkpoint_period_seconds: default_checkpoint_period_seconds(),
            lock_retry_seconds: default_lock_retry_seconds(),
            kill_grace_seconds: default_kill_grace_seconds(),
            poll_millis: default_poll_millis(),
        }
    }
}

impl RuntimeConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Monitoring loop tick period.
    #[must_use]
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_millis)
    }

    /// Number of ticks making up one second of running time.
    #[must_use]
    pub fn ticks_per_second(&self) -> u64 {
        1000 / self.tick_millis
    }

    /// Ticks without a heartbeat after which the client is presumed gone.
    #[must_use]
    pub fn giveup_ticks(&self) -> u64 {
        self.heartbeat_giveup_seconds * self.ticks_per_second()
    }

    /// Supervisor poll period.
    #[must_use]
    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.poll_millis)
    }

    /// Grace period for cooperative termination.
    #[must_use]
    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_seconds)
    }

    /// Bounded wait before a single retry of a failed acquisition.
    #[must_use]
    pub fn lock_retry(&self) -> Duration {
        Duration::from_secs(self.lock_retry_seconds)
    }

    /// Absolute-or-relative path of the shared segment file.
    #[must_use]
    pub fn shmem_path(&self) -> PathBuf {
        self.slot_dir.join(&self.shmem_file)
    }

    /// Path of the single-instance guard file.
    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.slot_dir.join(&self.lock_file)
    }

    fn validate(&self) -> Result<()> {
        if self.tick_millis == 0 || self.tick_millis > 1000 || 1000 % self.tick_millis != 0 {
            return Err(AppError::Config(
                "tick_millis must be between 1 and 1000 and divide 1000 evenly".into(),
            ));
        }
        if self.heartbeat_giveup_seconds == 0 {
            return Err(AppError::Config(
                "heartbeat_giveup_seconds must be greater than zero".into(),
            ));
        }
        if self.poll_millis == 0 {
            return Err(AppError::Config(
                "poll_millis must be greater than zero".into(),
            ));
        }
        if self.shmem_file.is_empty() || self.lock_file.is_empty() {
            return Err(AppError::Config(
                "shmem_file and lock_file must not be empty".into(),
            ));
        }
        Ok(())
    }
}
