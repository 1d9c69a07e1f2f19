//! Archive collaborator used at sequence boundaries.
//!
//! [`CommandArchiver`] drives the system `zip`/`unzip` tools; anything
//! implementing [`Archiver`] can stand in for it.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::{AppError, Result};

/// Order of the file list returned by [`list_matching`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Directory order.
    None,
    /// Ascending by file name.
    #[default]
    Ascending,
    /// Descending by file name.
    Descending,
}

/// Compress and extract archives.
pub trait Archiver: Send + Sync {
    /// Pack `files` into `output`, replacing any existing archive.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Archive` on failure.
    fn pack(&self, output: &Path, files: &[PathBuf]) -> Result<()>;

    /// Extract `archive` into `dest`, overwriting existing files.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Archive` on failure.
    fn unpack(&self, archive: &Path, dest: &Path) -> Result<()>;
}

/// [`Archiver`] backed by the `zip` and `unzip` executables.
#[derive(Debug, Clone)]
pub struct CommandArchiver {
    zip: PathBuf,
    unzip: PathBuf,
}

impl Default for CommandArchiver {
    fn default() -> Self {
        Self {
            zip: PathBuf::from("zip"),
            unzip: PathBuf::from("unzip"),
        }
    }
}

impl CommandArchiver {
    /// Use explicit tool paths.
    #[must_use]
    pub fn new(zip: impl Into<PathBuf>, unzip: impl Into<PathBuf>) -> Self {
        Self {
            zip: zip.into(),
            unzip: unzip.into(),
        }
    }

    fn run(cmd: &mut Command, what: &str) -> Result<()> {
        let output = cmd
            .output()
            .map_err(|err| AppError::Archive(format!("{what}: cannot run: {err}")))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(AppError::Archive(format!(
                "{what}: {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

impl Archiver for CommandArchiver {
    fn pack(&self, output: &Path, files: &[PathBuf]) -> Result<()> {
        if files.is_empty() {
            warn!(archive = %output.display(), "nothing to pack");
            return Ok(());
        }
        if output.exists() {
            fs::remove_file(output)?;
        }
        Self::run(
            Command::new(&self.zip).arg("-q").arg("-j").arg(output).args(files),
            "zip",
        )?;
        info!(archive = %output.display(), files = files.len(), "archive packed");
        Ok(())
    }

    fn unpack(&self, archive: &Path, dest: &Path) -> Result<()> {
        Self::run(
            Command::new(&self.unzip)
                .arg("-o")
                .arg("-q")
                .arg(archive)
                .arg("-d")
                .arg(dest),
            "unzip",
        )?;
        info!(archive = %archive.display(), dest = %dest.display(), "archive unpacked");
        Ok(())
    }
}

/// Compile `pattern` so it must match a whole file name.
///
/// # Errors
///
/// Returns `AppError::Job` if the pattern is not a valid regular expression.
pub fn anchored(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{pattern})$"))
        .map_err(|err| AppError::Job(format!("bad file pattern {pattern:?}: {err}")))
}

/// Regular files in `dir` whose name matches `pattern`.
///
/// # Errors
///
/// Returns `AppError::Io` if `dir` cannot be listed.
pub fn list_matching(dir: &Path, pattern: &Regex, order: SortOrder) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .flatten()
        .filter(|entry| entry.file_type().is_ok_and(|kind| kind.is_file()))
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| pattern.is_match(name))
        })
        .map(|entry| entry.path())
        .collect();
    match order {
        SortOrder::None => {}
        SortOrder::Ascending => files.sort(),
        SortOrder::Descending => files.sort_by(|a, b| b.cmp(a)),
    }
    debug!(dir = %dir.display(), pattern = pattern.as_str(), count = files.len(), "listed files");
    Ok(files)
}
