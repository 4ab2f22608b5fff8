//! Post-write validation.
//!
//! A [`Validator`] gates every write: when it rejects a patched file the
//! applier restores the pre-patch bytes. [`PhpLint`] runs `php -l` with a
//! bounded timeout.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Outcome of one validation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub passed: bool,
    /// Diagnostic text from the validator
    pub output: String,
}

impl ValidationReport {
    pub fn pass() -> Self {
        Self {
            passed: true,
            output: String::new(),
        }
    }

    pub fn fail(output: impl Into<String>) -> Self {
        Self {
            passed: false,
            output: output.into(),
        }
    }

    /// First non-empty diagnostic line, for record notes.
    pub fn summary(&self) -> &str {
        self.output
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or("")
    }
}

/// Validator failures. All of them mean "could not decide", never "invalid".
#[derive(Error, Debug)]
pub enum ValidatorError {
    #[error("cannot run {program}: {source}")]
    Unavailable {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} did not finish within {after:?}")]
    Timeout { program: String, after: Duration },

    #[error("I/O error while validating: {0}")]
    Io(#[from] std::io::Error),
}

/// Static check of a file on disk.
pub trait Validator: Send + Sync {
    fn validate(&self, path: &Path) -> Result<ValidationReport, ValidatorError>;
}

/// `php -l <file>`.
#[derive(Debug, Clone)]
pub struct PhpLint {
    program: PathBuf,
    timeout: Duration,
}

impl Default for PhpLint {
    fn default() -> Self {
        Self {
            program: PathBuf::from("php"),
            timeout: Duration::from_secs(20),
        }
    }
}

impl PhpLint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `PHP_BIN` when set, else `php` from `PATH`.
    pub fn from_env() -> Self {
        match std::env::var_os("PHP_BIN") {
            Some(program) if !program.is_empty() => Self::default().with_program(program),
            _ => Self::default(),
        }
    }

    #[must_use]
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn program_name(&self) -> String {
        self.program.display().to_string()
    }
}

impl Validator for PhpLint {
    fn validate(&self, path: &Path) -> Result<ValidationReport, ValidatorError> {
        let mut child = Command::new(&self.program)
            .arg("-l")
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ValidatorError::Unavailable {
                program: self.program_name(),
                source,
            })?;

        // Drain both pipes on their own threads so a chatty child cannot
        // block on a full pipe while we wait for it.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match wait_with_timeout(&mut child, self.timeout)? {
            Some(status) => status,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ValidatorError::Timeout {
                    program: self.program_name(),
                    after: self.timeout,
                });
            }
        };

        let mut output = stdout.join().unwrap_or_default();
        let err_output = stderr.join().unwrap_or_default();
        if !err_output.trim().is_empty() {
            if !output.is_empty() && !output.ends_with('\n') {
                output.push('\n');
            }
            output.push_str(&err_output);
        }

        tracing::debug!(file = %path.display(), success = status.success(), "php -l finished");
        Ok(ValidationReport {
            passed: status.success(),
            output,
        })
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(Duration::from_millis(20));
    }
}
