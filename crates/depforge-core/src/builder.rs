//! Native build tool delegate.
//!
//! The pipeline talks to the build system through the [`Builder`] trait:
//! configure a source tree into a build directory, compile it, install it.
//! [`CMakeBuilder`] is the production implementation.
//!
//! ## Output handling
//!
//! By default each step's combined stdout/stderr goes to a log file beside
//! the build directory (`build/<name>/<version>.<step>.log`). When a step
//! fails, the last [`TAIL_LINES`] lines of that log are attached to the
//! error. In verbose mode output streams straight to the terminal instead.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use thiserror::Error;
use tracing::debug;

use crate::layout::append_suffix;

/// Lines of log output attached to a failed step.
pub const TAIL_LINES: usize = 20;

/// Failure of a builder step.
#[derive(Error, Debug)]
pub enum BuilderError {
    #[error("{program} not found on PATH")]
    ToolNotFound { program: String },

    #[error("Failed to execute {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{step} exited with code {code:?}\n{output}")]
    Failed {
        step: String,
        code: Option<i32>,
        /// Raw diagnostic output of the tool (log tail).
        output: String,
    },
}

impl BuilderError {
    /// Raw diagnostic output, empty when the tool never ran.
    pub fn output(&self) -> &str {
        match self {
            Self::Failed { output, .. } => output,
            _ => "",
        }
    }
}

/// Arguments for [`Builder::configure`].
#[derive(Debug, Clone, Copy)]
pub struct ConfigureRequest<'a> {
    pub source_dir: &'a Path,
    pub build_dir: &'a Path,
    pub install_prefix: &'a Path,
    /// Complete option list: baseline options followed by the target's own.
    pub options: &'a [String],
}

/// The external build tool capability used by the configure, compile and
/// install stages.
pub trait Builder: Send + Sync {
    /// Configure `source_dir` into `build_dir`.
    ///
    /// # Errors
    ///
    /// Returns a [`BuilderError`] carrying the tool's output on failure.
    fn configure(&self, request: &ConfigureRequest<'_>) -> Result<(), BuilderError>;

    /// Compile a configured build directory.
    ///
    /// # Errors
    ///
    /// Returns a [`BuilderError`] carrying the tool's output on failure.
    fn build(&self, build_dir: &Path, mode: &str) -> Result<(), BuilderError>;

    /// Install a compiled build directory into its configured prefix.
    ///
    /// # Errors
    ///
    /// Returns a [`BuilderError`] carrying the tool's output on failure.
    fn install(&self, build_dir: &Path, mode: &str) -> Result<(), BuilderError>;
}

/// Generator used when none is given: Xcode on macOS, Ninja elsewhere.
pub fn default_generator() -> &'static str {
    if cfg!(target_os = "macos") {
        "Xcode"
    } else {
        "Ninja"
    }
}

/// [`Builder`] that shells out to `cmake`.
#[derive(Debug, Clone)]
pub struct CMakeBuilder {
    program: String,
    generator: String,
    verbose: bool,
}

impl Default for CMakeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CMakeBuilder {
    pub fn new() -> Self {
        Self {
            program: "cmake".to_string(),
            generator: default_generator().to_string(),
            verbose: false,
        }
    }

    /// Stream tool output to the terminal instead of log files.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_generator(mut self, generator: impl Into<String>) -> Self {
        self.generator = generator.into();
        self
    }

    /// Use a different `cmake` executable (name on `PATH` or absolute path).
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Arguments for the configure step.
    pub fn configure_args(&self, request: &ConfigureRequest<'_>) -> Vec<String> {
        let mut args = vec![
            "-G".to_string(),
            self.generator.clone(),
            "-B".to_string(),
            request.build_dir.to_string_lossy().to_string(),
            "-S".to_string(),
            request.source_dir.to_string_lossy().to_string(),
        ];
        args.extend(request.options.iter().cloned());
        args
    }

    fn run(&self, step: &str, build_dir: &Path, args: &[String]) -> Result<(), BuilderError> {
        let program = which::which(&self.program).map_err(|_| BuilderError::ToolNotFound {
            program: self.program.clone(),
        })?;
        let spawn_err = |source| BuilderError::Spawn {
            program: self.program.clone(),
            source,
        };

        let mut cmd = Command::new(&program);
        cmd.args(args);
        debug!(step, ?args, "running {}", self.program);

        let log_path = step_log_path(build_dir, step);
        let status = if self.verbose {
            cmd.status().map_err(spawn_err)?
        } else {
            if let Some(parent) = log_path.parent() {
                std::fs::create_dir_all(parent).map_err(spawn_err)?;
            }
            let log_file = File::create(&log_path).map_err(spawn_err)?;
            let stderr = log_file.try_clone().map_err(spawn_err)?;
            cmd.stdout(Stdio::from(log_file))
                .stderr(Stdio::from(stderr))
                .status()
                .map_err(spawn_err)?
        };

        if status.success() {
            return Ok(());
        }

        let output = if self.verbose {
            String::new()
        } else {
            let tail = read_last_lines(&log_path, TAIL_LINES).unwrap_or_default();
            format!("{tail}\n\nFull log: {}", log_path.display())
        };
        Err(BuilderError::Failed {
            step: format!("{} {step}", self.program),
            code: status.code(),
            output,
        })
    }
}

impl Builder for CMakeBuilder {
    fn configure(&self, request: &ConfigureRequest<'_>) -> Result<(), BuilderError> {
        std::fs::create_dir_all(request.install_prefix).map_err(|source| BuilderError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        let args = self.configure_args(request);
        self.run("configure", request.build_dir, &args)
    }

    fn build(&self, build_dir: &Path, mode: &str) -> Result<(), BuilderError> {
        let args = [
            "--build".to_string(),
            build_dir.to_string_lossy().to_string(),
            "--config".to_string(),
            mode.to_string(),
        ];
        self.run("build", build_dir, &args)
    }

    fn install(&self, build_dir: &Path, mode: &str) -> Result<(), BuilderError> {
        let args = [
            "--install".to_string(),
            build_dir.to_string_lossy().to_string(),
            "--config".to_string(),
            mode.to_string(),
        ];
        self.run("install", build_dir, &args)
    }
}

/// Log file for one step: `<build_dir>.<step>.log`.
pub fn step_log_path(build_dir: &Path, step: &str) -> PathBuf {
    append_suffix(build_dir, &format!(".{step}.log"))
}

/// Read the last N lines from a file efficiently.
///
/// Seeks to near the end and reads a fixed-size tail buffer, so a multi-gigabyte
/// build log never gets loaded whole.
fn read_last_lines(path: &Path, n: usize) -> io::Result<String> {
    // ~400 lines at 40 chars each
    const TAIL_SIZE: u64 = 16 * 1024;

    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len();

    let seek_pos = file_len.saturating_sub(TAIL_SIZE);
    file.seek(SeekFrom::Start(seek_pos))?;

    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    let buffer = String::from_utf8_lossy(&bytes);

    // If we seeked mid-file, skip the first (partial) line
    let content = if seek_pos > 0 {
        buffer
            .find('\n')
            .map_or(buffer.as_ref(), |idx| &buffer[idx + 1..])
    } else {
        buffer.as_ref()
    };

    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(n);
    Ok(lines[start..].join("\n"))
}
