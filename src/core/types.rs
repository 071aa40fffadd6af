use crate::judge::dependency::Dependency;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One request to run a program.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub language: String,
    pub source_code: String,
    pub dependencies: Vec<Dependency>,
    pub stdin: Option<Vec<u8>>,
}

impl ExecutionRequest {
    pub fn new(language: impl Into<String>, source_code: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            source_code: source_code.into(),
            dependencies: Vec::new(),
            stdin: None,
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<Dependency>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }
}

/// A fully resolved command line for the process runner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunCommand {
    pub argv: Vec<String>,
    pub working_dir: PathBuf,
    /// Added on top of the runner's base environment.
    pub env: Vec<(String, String)>,
    pub stdin: Option<Vec<u8>>,
}

impl RunCommand {
    pub fn new<I, S>(argv: I, working_dir: impl Into<PathBuf>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            working_dir: working_dir.into(),
            env: Vec::new(),
            stdin: None,
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or("")
    }
}

/// Per-run isolation choices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SandboxPolicy {
    /// Directory the program may write; also its HOME.
    pub workspace: PathBuf,
    /// Package managers need the network; user programs do not.
    pub allow_network: bool,
    /// Names the run's cgroup scope and tags log lines.
    pub label: String,
}

/// Cooperative cancellation shared between a caller and a running request.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_is_shared_between_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_run_command_builder() {
        let cmd = RunCommand::new(["python3", "main.py"], "/tmp/ws").env("A", "1");
        assert_eq!(cmd.program(), "python3");
        assert_eq!(cmd.env, vec![("A".to_string(), "1".to_string())]);
    }
}
