//! `gridvisor`: runtime and task supervisor for long-running jobs hosted by
//! a volunteer-computing client.
//!
//! The [`runtime`] half is linked into a compute application and talks to
//! the controlling client over shared-memory [`channel`]s; the
//! [`supervisor`] half runs unmodified executables as a weighted task
//! sequence and forwards the same lifecycle to their process trees.

pub mod archive;
pub mod channel;
pub mod config;
pub mod errors;
pub mod process;
pub mod runtime;
pub mod supervisor;
pub mod wire;

pub use config::RuntimeConfig;
pub use errors::{AppError, Result};
