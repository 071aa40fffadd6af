/// Core types shared by every layer of the runner
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

/// Which limit a resource-limit termination was attributed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    CpuTime,
    Memory,
    Processes,
    FileSize,
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LimitKind::CpuTime => "cpu time",
            LimitKind::Memory => "memory",
            LimitKind::Processes => "process count",
            LimitKind::FileSize => "file size",
        };
        f.write_str(name)
    }
}

/// How a program's run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "limit", rename_all = "snake_case")]
pub enum Termination {
    /// Exited on its own with an exit code.
    Exited,
    /// Killed by a signal nobody in the runner sent.
    Signaled,
    /// Wall-clock deadline elapsed and the process group was killed.
    TimedOut,
    /// The caller cancelled the request.
    Cancelled,
    /// A configured resource limit was hit.
    ResourceLimit(LimitKind),
}

impl Termination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Termination::Exited => "exited",
            Termination::Signaled => "signaled",
            Termination::TimedOut => "timed_out",
            Termination::Cancelled => "cancelled",
            Termination::ResourceLimit(_) => "resource_limit",
        }
    }
}

/// Source stream of a captured chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// One run of bytes in arrival order. Offsets are implied by the order of
/// segments of the same stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSegment {
    pub stream: StreamKind,
    pub len: usize,
}

/// Everything observed about one process run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Arrival order of captured bytes across both streams.
    pub segments: Vec<OutputSegment>,
    /// `None` when the process did not exit normally.
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub termination: Termination,
    pub timed_out: bool,
    pub output_truncated: bool,
    /// Reader threads did not reach EOF before collection gave up.
    pub output_incomplete: bool,
    pub wall_time_ms: u64,
    pub cpu_time_ms: u64,
    pub memory_peak_bytes: u64,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.termination == Termination::Exited && self.exit_code == Some(0)
    }

    /// Shell-style status: the exit code, or 128 + signal number.
    pub fn status_code(&self) -> i32 {
        match (self.exit_code, self.signal) {
            (Some(code), _) => code,
            (None, Some(sig)) => 128 + sig,
            (None, None) => -1,
        }
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// stdout followed by stderr.
    pub fn combined_output(&self) -> String {
        let mut bytes = Vec::with_capacity(self.stdout.len() + self.stderr.len());
        bytes.extend_from_slice(&self.stdout);
        bytes.extend_from_slice(&self.stderr);
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Both streams merged in the order their bytes arrived.
    pub fn interleaved_output(&self) -> String {
        let mut merged = Vec::with_capacity(self.stdout.len() + self.stderr.len());
        let (mut out_at, mut err_at) = (0usize, 0usize);
        for segment in &self.segments {
            let (source, cursor) = match segment.stream {
                StreamKind::Stdout => (&self.stdout, &mut out_at),
                StreamKind::Stderr => (&self.stderr, &mut err_at),
            };
            let end = (*cursor + segment.len).min(source.len());
            merged.extend_from_slice(&source[*cursor..end]);
            *cursor = end;
        }
        merged.extend_from_slice(&self.stdout[out_at..]);
        merged.extend_from_slice(&self.stderr[err_at..]);
        String::from_utf8_lossy(&merged).into_owned()
    }
}

/// Error taxonomy surfaced to callers.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("resource error: {0}")]
    Resource(String),

    #[error("dependency installation failed: {message}")]
    Dependency {
        message: String,
        output: Option<Box<ExecutionResult>>,
    },

    #[error("compilation failed with status {}", output.status_code())]
    Compile { output: Box<ExecutionResult> },

    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
        transient: bool,
    },

    #[error("sandbox setup failed: {0}")]
    Sandbox(String),

    #[error("runner busy: {0}")]
    Busy(String),

    #[error("execution cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),
}

impl ExecutionError {
    /// Stable snake_case tag used in JSON reports and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionError::Validation(_) => "validation",
            ExecutionError::UnsupportedLanguage(_) => "unsupported_language",
            ExecutionError::Resource(_) => "resource",
            ExecutionError::Dependency { .. } => "dependency",
            ExecutionError::Compile { .. } => "compile",
            ExecutionError::Launch { .. } => "launch",
            ExecutionError::Sandbox(_) => "sandbox",
            ExecutionError::Busy(_) => "busy",
            ExecutionError::Cancelled => "cancelled",
            ExecutionError::Config(_) => "config",
        }
    }

    pub fn resource(context: impl fmt::Display, err: io::Error) -> Self {
        ExecutionError::Resource(format!("{context}: {err}"))
    }

    /// Build a launch error, classifying errno values worth one retry.
    pub fn launch(program: impl Into<String>, source: io::Error) -> Self {
        let transient = matches!(
            source.raw_os_error(),
            Some(libc::EAGAIN) | Some(libc::ENOMEM) | Some(libc::ETXTBSY) | Some(libc::EINTR)
        );
        ExecutionError::Launch {
            program: program.into(),
            source,
            transient,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ExecutionError::Launch { transient: true, .. })
    }

    /// Captured tool output attached to dependency and compile failures.
    pub fn captured_output(&self) -> Option<&ExecutionResult> {
        match self {
            ExecutionError::Dependency { output, .. } => output.as_deref(),
            ExecutionError::Compile { output } => Some(output),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ExecutionError>;
