use crate::config::types::{ExecutionError, ExecutionResult, Result, Termination};
use crate::core::limits::ResourceLimits;
use crate::core::runner::ProcessRunner;
use crate::core::types::{CancellationToken, RunCommand, SandboxPolicy};
use crate::judge::dependency::Dependency;
use crate::safety::workspace::Workspace;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const MAX_LOCAL_DEPENDENCY_BYTES: u64 = 64 * 1024 * 1024;

/// Everything an adapter may touch while preparing a request.
pub struct PrepareContext<'a> {
    pub runner: &'a ProcessRunner,
    pub workspace: &'a Workspace,
    pub cancel: &'a CancellationToken,
    pub install_limits: ResourceLimits,
    pub compile_limits: ResourceLimits,
    pub local_roots: &'a [PathBuf],
}

impl PrepareContext<'_> {
    fn policy(&self, phase: &str, allow_network: bool) -> SandboxPolicy {
        SandboxPolicy {
            workspace: self.workspace.path().to_path_buf(),
            allow_network,
            label: format!("{}.{}", self.workspace.id(), phase),
        }
    }

    /// Run a package manager. Network access is allowed for this phase only.
    pub fn run_installer(&self, command: RunCommand) -> Result<()> {
        let program = command.program().to_string();
        let output = self
            .runner
            .run(&command, &self.install_limits, &self.policy("install", true), self.cancel)?;
        match output.termination {
            Termination::Cancelled => Err(ExecutionError::Cancelled),
            _ if output.success() => Ok(()),
            Termination::TimedOut => Err(ExecutionError::Dependency {
                message: format!("{program} timed out"),
                output: Some(Box::new(output)),
            }),
            _ => Err(ExecutionError::Dependency {
                message: format!("{program} exited with status {}", output.status_code()),
                output: Some(Box::new(output)),
            }),
        }
    }

    /// Run a compiler. A failed build becomes a compile error carrying its diagnostics.
    pub fn run_compiler(&self, command: RunCommand) -> Result<ExecutionResult> {
        let output = self
            .runner
            .run(&command, &self.compile_limits, &self.policy("compile", false), self.cancel)?;
        match output.termination {
            Termination::Cancelled => Err(ExecutionError::Cancelled),
            _ if output.success() => Ok(output),
            _ => Err(ExecutionError::Compile {
                output: Box::new(output),
            }),
        }
    }

    /// Copy an allow-listed local dependency into `dest`.
    pub fn stage_local(&self, source: &Path, dest: &Path) -> Result<PathBuf> {
        let canonical = source.canonicalize().map_err(|e| ExecutionError::Dependency {
            message: format!("local dependency {}: {}", source.display(), e),
            output: None,
        })?;
        if !self.local_roots.iter().any(|root| {
            root.canonicalize()
                .map(|root| canonical.starts_with(root))
                .unwrap_or(false)
        }) {
            return Err(ExecutionError::Dependency {
                message: format!("local dependency {} resolves outside the allowed roots", source.display()),
                output: None,
            });
        }
        let name = canonical.file_name().ok_or_else(|| ExecutionError::Dependency {
            message: format!("local dependency {} has no file name", source.display()),
            output: None,
        })?;
        let target = dest.join(name);
        copy_tree(&canonical, &target).map_err(|e| ExecutionError::Dependency {
            message: format!("failed to copy {}: {}", source.display(), e),
            output: None,
        })?;
        Ok(target)
    }
}

/// Copy a file or directory tree, skipping symlinks and capping total size.
fn copy_tree(source: &Path, target: &Path) -> io::Result<()> {
    let mut copied = 0u64;
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let destination = if relative.as_os_str().is_empty() {
            target.to_path_buf()
        } else {
            target.join(relative)
        };
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&destination)?;
        } else if file_type.is_file() {
            copied += entry.metadata().map_err(io::Error::from)?.len();
            if copied > MAX_LOCAL_DEPENDENCY_BYTES {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "local dependency exceeds the size cap",
                ));
            }
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &destination)?;
        }
    }
    Ok(())
}

/// Language adapter contract: how to lay out, prepare and launch one language.
pub trait LanguageAdapter: Send + Sync {
    /// Canonical identifier, e.g. `python`.
    fn language(&self) -> &'static str;

    fn aliases(&self) -> &'static [&'static str] {
        &[]
    }

    fn extension(&self) -> &'static str;

    /// Binaries that must be on PATH for this adapter to work.
    fn toolchain(&self) -> &'static [&'static str];

    fn source_file_name(&self, _source: &str) -> String {
        format!("main.{}", self.extension())
    }

    /// Write the program into the workspace.
    fn materialize(&self, workspace: &Workspace, source: &str) -> Result<PathBuf> {
        workspace.write_file(&self.source_file_name(source), source.as_bytes())
    }

    /// Install dependencies into the workspace.
    fn install_dependencies(&self, _ctx: &PrepareContext<'_>, deps: &[Dependency]) -> Result<()> {
        if !deps.is_empty() {
            log::warn!(
                "{} has no package manager; ignoring {} dependencies",
                self.language(),
                deps.len()
            );
        }
        Ok(())
    }

    /// Produce the command that runs the program, compiling first if needed.
    fn build_run_command(&self, ctx: &PrepareContext<'_>, source: &Path) -> Result<RunCommand>;

    /// Adjust run limits for runtimes with a large baseline footprint.
    fn run_limits(&self, limits: ResourceLimits) -> ResourceLimits {
        limits
    }
}
