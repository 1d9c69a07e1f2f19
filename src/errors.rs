//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// Shared-memory segment could not be created, attached or sized.
    Channel(String),
    /// Signalling, enumerating or inspecting a process failed.
    Process(String),
    /// Job description is malformed or references something unusable.
    Job(String),
    /// Supervisor checkpoint could not be written.
    Checkpoint(String),
    /// The single-instance guard file is held by someone else.
    Lock(String),
    /// Packing or unpacking an archive failed.
    Archive(String),
    /// A sequenced (non-daemon) task exited unsuccessfully.
    ChildFailed {
        /// Name of the application that failed.
        task: String,
        /// Raw exit code, `None` when terminated by a signal.
        code: Option<i32>,
    },
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Channel(msg) => write!(f, "channel: {msg}"),
            Self::Process(msg) => write!(f, "process: {msg}"),
            Self::Job(msg) => write!(f, "job: {msg}"),
            Self::Checkpoint(msg) => write!(f, "checkpoint: {msg}"),
            Self::Lock(msg) => write!(f, "lock: {msg}"),
            Self::Archive(msg) => write!(f, "archive: {msg}"),
            Self::ChildFailed { task, code } => match code {
                Some(code) => write!(f, "child failed: {task} exited with code {code}"),
                None => write!(f, "child failed: {task} terminated by signal"),
            },
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

#[cfg(unix)]
impl From<nix::errno::Errno> for AppError {
    fn from(err: nix::errno::Errno) -> Self {
        Self::Process(err.desc().to_owned())
    }
}
