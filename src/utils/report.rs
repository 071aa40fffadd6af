/// Stable JSON report and plain-text rendering of an execution outcome
use crate::config::types::{ExecutionError, ExecutionResult, Result, Termination};
use serde::{Deserialize, Serialize};

pub const REPORT_SCHEMA_VERSION: &str = "1";

/// Coarse outcome, stable across releases.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Ok,
    RuntimeError,
    TimedOut,
    LimitExceeded,
    Cancelled,
    Failed,
}

/// Output of a failed compiler or package-manager run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_output: Option<ToolOutput>,
}

/// Machine-readable view of one request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub schema_version: String,
    pub status: ReportStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination: Option<Termination>,
    pub timed_out: bool,
    pub output_truncated: bool,
    pub output_incomplete: bool,
    pub stdout: String,
    pub stderr: String,
    /// Both streams in arrival order.
    pub output: String,
    pub wall_time_ms: u64,
    pub cpu_time_ms: u64,
    pub memory_peak_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
}

impl ExecutionReport {
    pub fn from_outcome(outcome: &Result<ExecutionResult>) -> Self {
        match outcome {
            Ok(result) => Self::from_result(result),
            Err(err) => Self::from_error(err),
        }
    }

    fn from_result(result: &ExecutionResult) -> Self {
        let status = match result.termination {
            Termination::Exited if result.exit_code == Some(0) => ReportStatus::Ok,
            Termination::Exited | Termination::Signaled => ReportStatus::RuntimeError,
            Termination::TimedOut => ReportStatus::TimedOut,
            Termination::Cancelled => ReportStatus::Cancelled,
            Termination::ResourceLimit(_) => ReportStatus::LimitExceeded,
        };
        Self {
            schema_version: REPORT_SCHEMA_VERSION.to_string(),
            status,
            language: None,
            exit_code: result.exit_code,
            signal: result.signal,
            termination: Some(result.termination),
            timed_out: result.timed_out,
            output_truncated: result.output_truncated,
            output_incomplete: result.output_incomplete,
            stdout: result.stdout_lossy(),
            stderr: result.stderr_lossy(),
            output: result.interleaved_output(),
            wall_time_ms: result.wall_time_ms,
            cpu_time_ms: result.cpu_time_ms,
            memory_peak_bytes: result.memory_peak_bytes,
            error: None,
        }
    }

    fn from_error(err: &ExecutionError) -> Self {
        let status = match err {
            ExecutionError::Cancelled => ReportStatus::Cancelled,
            _ => ReportStatus::Failed,
        };
        let tool_output = err.captured_output().map(|out| ToolOutput {
            exit_code: out.exit_code,
            stdout: out.stdout_lossy(),
            stderr: out.stderr_lossy(),
        });
        Self {
            schema_version: REPORT_SCHEMA_VERSION.to_string(),
            status,
            language: None,
            exit_code: None,
            signal: None,
            termination: None,
            timed_out: false,
            output_truncated: false,
            output_incomplete: false,
            stdout: String::new(),
            stderr: String::new(),
            output: String::new(),
            wall_time_ms: 0,
            cpu_time_ms: 0,
            memory_peak_bytes: 0,
            error: Some(ErrorReport {
                kind: err.kind().to_string(),
                message: err.to_string(),
                tool_output,
            }),
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| ExecutionError::Config(format!("failed to serialize report: {e}")))
    }
}

/// The single text blob older callers expect: stdout then stderr for a
/// finished run, tool diagnostics for a failed build or install, the error
/// message otherwise.
pub fn render_legacy_text(outcome: &Result<ExecutionResult>) -> String {
    match outcome {
        Ok(result) => result.combined_output(),
        Err(ExecutionError::UnsupportedLanguage(language)) => {
            format!("Unsupported language: {language}")
        }
        Err(err) => match err.captured_output() {
            Some(output) => format!("{}\n{}", err, output.combined_output()),
            None => err.to_string(),
        },
    }
}

/// One-line note for runs that did not end on their own, `None` otherwise.
pub fn termination_note(result: &ExecutionResult) -> Option<String> {
    let mut note = match result.termination {
        Termination::TimedOut => format!("timed out after {}ms", result.wall_time_ms),
        Termination::ResourceLimit(kind) => format!("{kind} limit exceeded"),
        Termination::Cancelled => "cancelled".to_string(),
        Termination::Signaled => format!("killed by signal {}", result.signal.unwrap_or_default()),
        Termination::Exited => String::new(),
    };
    if result.output_truncated {
        if !note.is_empty() {
            note.push_str("; ");
        }
        note.push_str("output truncated");
    }
    (!note.is_empty()).then_some(note)
}
