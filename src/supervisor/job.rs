//! Job description: the tag-delimited document listing the tasks to run.
//!
//! ```text
//! <job_desc>
//!     <unzip_input><zipfilename>input.zip</zipfilename></unzip_input>
//!     <task>
//!         <application>worker</application>
//!         <command_line>--threads $NTHREADS</command_line>
//!         <weight>3</weight>
//!     </task>
//!     <zip_output>
//!         <zipfilename>out.zip</zipfilename>
//!         <filename>result_.*</filename>
//!     </zip_output>
//! </job_desc>
//! ```

use std::path::Path;
use std::time::Duration;

use crate::wire::{parse_all, parse_flag, parse_str};
use crate::{AppError, Result};

/// Default job description file name.
pub const DEFAULT_JOB_FILE: &str = "job.xml";

/// One `<task>` entry.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
    /// Executable to run.
    pub application: String,
    /// Working directory for the process.
    pub exec_dir: Option<String>,
    /// `NAME=VALUE` overrides, in document order.
    pub env: Vec<(String, String)>,
    /// File to connect to stdin.
    pub stdin_filename: Option<String>,
    /// File stdout is appended to.
    pub stdout_filename: Option<String>,
    /// File stderr is appended to.
    pub stderr_filename: Option<String>,
    /// Argument string, split on whitespace after macro substitution.
    pub command_line: String,
    /// File whose modification marks a task checkpoint.
    pub checkpoint_filename: Option<String>,
    /// File the task writes its own fraction done to.
    pub fraction_done_filename: Option<String>,
    /// Relative contribution to overall progress.
    pub weight: f64,
    /// Launched once before the sequence and never waited for.
    pub daemon: bool,
    /// Suspend/resume must reach descendants too.
    pub multi_process: bool,
    /// Append the supervisor's passthrough arguments.
    pub append_cmdline_args: bool,
    /// Running time after which the task is killed and counted as done.
    pub time_limit: Option<Duration>,
    /// Scheduling priority, 1 (lowest) to 5 (highest).
    pub priority: Option<u8>,
}

impl TaskSpec {
    /// Parse the body of one `<task>` element.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Job` if the application is missing or a numeric
    /// field does not parse.
    pub fn parse(body: &str) -> Result<Self> {
        let application = parse_str(body, "application")
            .filter(|app| !app.is_empty())
            .ok_or_else(|| AppError::Job("task without <application>".into()))?
            .to_owned();

        let env = parse_all(body, "setenv")
            .into_iter()
            .map(|pair| {
                pair.split_once('=')
                    .map(|(k, v)| (k.trim().to_owned(), v.to_owned()))
                    .ok_or_else(|| AppError::Job(format!("setenv without '=': {pair}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let weight = match parse_str(body, "weight") {
            Some(raw) => raw
                .parse::<f64>()
                .ok()
                .filter(|w| w.is_finite() && *w >= 0.0)
                .ok_or_else(|| AppError::Job(format!("{application}: bad weight {raw:?}")))?,
            None => 1.0,
        };

        let time_limit = match parse_str(body, "time_limit") {
            Some(raw) => {
                let secs = raw
                    .parse::<f64>()
                    .ok()
                    .filter(|s| s.is_finite() && *s >= 0.0)
                    .ok_or_else(|| AppError::Job(format!("{application}: bad time_limit {raw:?}")))?;
                (secs > 0.0).then(|| Duration::from_secs_f64(secs))
            }
            None => None,
        };

        let priority = match parse_str(body, "priority") {
            Some(raw) => Some(
                raw.parse::<u8>()
                    .ok()
                    .filter(|p| (1..=5).contains(p))
                    .ok_or_else(|| AppError::Job(format!("{application}: bad priority {raw:?}")))?,
            ),
            None => None,
        };

        Ok(Self {
            exec_dir: optional(body, "exec_dir"),
            env,
            stdin_filename: optional(body, "stdin_filename"),
            stdout_filename: optional(body, "stdout_filename"),
            stderr_filename: optional(body, "stderr_filename"),
            command_line: parse_str(body, "command_line").unwrap_or_default().to_owned(),
            checkpoint_filename: optional(body, "checkpoint_filename"),
            fraction_done_filename: optional(body, "fraction_done_filename"),
            weight,
            daemon: parse_flag(body, "daemon"),
            multi_process: parse_flag(body, "multi_process"),
            append_cmdline_args: parse_flag(body, "append_cmdline_args"),
            time_limit,
            priority,
            application,
        })
    }
}

fn optional(body: &str, name: &str) -> Option<String> {
    parse_str(body, name)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

/// Archive packed after the last task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZipOutput {
    /// Archive to create.
    pub zipfilename: String,
    /// Regular expressions selecting the files to include.
    pub patterns: Vec<String>,
}

/// Parsed job description.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDescription {
    /// Every task in document order, daemons included.
    pub tasks: Vec<TaskSpec>,
    /// Archives to unpack before the first task.
    pub unzip_input: Vec<String>,
    /// Archive to pack after the last task.
    pub zip_output: Option<ZipOutput>,
    /// The client may ask for graphics; forward requests.
    pub enable_graphics_support: bool,
}

impl JobDescription {
    /// Parse a job description document.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Job` if there are no sequenced tasks or a task is
    /// malformed.
    pub fn parse(doc: &str) -> Result<Self> {
        let tasks = parse_all(doc, "task")
            .into_iter()
            .map(TaskSpec::parse)
            .collect::<Result<Vec<_>>>()?;
        if tasks.iter().all(|task| task.daemon) {
            return Err(AppError::Job("job description has no tasks".into()));
        }

        let unzip_input = parse_str(doc, "unzip_input")
            .map(|body| parse_all(body, "zipfilename").into_iter().map(str::to_owned).collect())
            .unwrap_or_default();

        let zip_output = parse_str(doc, "zip_output").and_then(|body| {
            let zipfilename = parse_str(body, "zipfilename")?.to_owned();
            let patterns = parse_all(body, "filename").into_iter().map(str::to_owned).collect();
            Some(ZipOutput {
                zipfilename,
                patterns,
            })
        });

        Ok(Self {
            tasks,
            unzip_input,
            zip_output,
            enable_graphics_support: parse_flag(doc, "enable_graphics_support"),
        })
    }

    /// Read and parse a job description file.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the file cannot be read, or `AppError::Job`
    /// if it does not parse.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let doc = std::fs::read_to_string(path)
            .map_err(|err| AppError::Io(format!("cannot read {}: {err}", path.display())))?;
        Self::parse(&doc)
    }

    /// Tasks run in sequence.
    pub fn sequenced(&self) -> impl Iterator<Item = &TaskSpec> {
        self.tasks.iter().filter(|task| !task.daemon)
    }

    /// Tasks run alongside the sequence.
    pub fn daemons(&self) -> impl Iterator<Item = &TaskSpec> {
        self.tasks.iter().filter(|task| task.daemon)
    }

    /// Sequenced task weights, in order.
    #[must_use]
    pub fn weights(&self) -> Vec<f64> {
        self.sequenced().map(|task| task.weight).collect()
    }
}
