//! Placeholder substitution in command lines, environment values and
//! working directories.

use std::path::PathBuf;

/// Values substituted for `$PROJECT_DIR`, `$NTHREADS`, `$GPU_DEVICE_NUM`
/// and `$PWD`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacroContext {
    /// Project directory of the job.
    pub project_dir: PathBuf,
    /// Thread count from `--nthreads`.
    pub nthreads: u32,
    /// GPU device index from `--device`, if any.
    pub gpu_device: Option<u32>,
    /// Supervisor working directory.
    pub pwd: PathBuf,
}

impl MacroContext {
    /// Replace every placeholder in `input`.
    ///
    /// `$GPU_DEVICE_NUM` is only replaced when a device was given; otherwise
    /// it is left as-is so the task sees the literal.
    #[must_use]
    pub fn substitute(&self, input: &str) -> String {
        let mut out = input
            .replace("$PROJECT_DIR", &self.project_dir.to_string_lossy())
            .replace("$NTHREADS", &self.nthreads.to_string())
            .replace("$PWD", &self.pwd.to_string_lossy());
        if let Some(device) = self.gpu_device {
            out = out.replace("$GPU_DEVICE_NUM", &device.to_string());
        }
        out
    }
}
