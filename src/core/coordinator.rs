/// Request orchestration: validate, admit, prepare, run, clean up
///
/// Phase order for one request:
/// 1. validate (no I/O)
/// 2. resolve the language adapter
/// 3. take an admission slot
/// 4. acquire a workspace
/// 5. materialize source, install dependencies, build the run command
/// 6. run under the execution limits
/// 7. release the workspace, whatever happened above
use crate::config::settings::RunnerConfig;
use crate::config::types::{ExecutionError, ExecutionResult, Result};
use crate::config::validator::validate_config;
use crate::core::admission::AdmissionLimiter;
use crate::core::runner::ProcessRunner;
use crate::core::types::{CancellationToken, ExecutionRequest, SandboxPolicy};
use crate::judge::adapter::{LanguageAdapter, PrepareContext};
use crate::judge::registry::AdapterRegistry;
use crate::safety::workspace::{Workspace, WorkspaceManager};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use log::{info, warn};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Entry point for running requests. Safe to share across threads.
#[derive(Debug)]
pub struct ExecutionCoordinator {
    config: RunnerConfig,
    registry: AdapterRegistry,
    workspaces: WorkspaceManager,
    runner: ProcessRunner,
    admission: AdmissionLimiter,
}

impl ExecutionCoordinator {
    pub fn new(config: RunnerConfig) -> Result<Self> {
        Self::with_registry(config, AdapterRegistry::builtin())
    }

    /// Build a coordinator; configuration and sandbox problems fail here,
    /// not on the first request.
    pub fn with_registry(config: RunnerConfig, registry: AdapterRegistry) -> Result<Self> {
        validate_config(&config)?;
        let workspaces = WorkspaceManager::new(&config.scratch_root, config.min_free_bytes)?;
        let runner = ProcessRunner::new(&config.sandbox, workspaces.root())?;
        let admission = AdmissionLimiter::new(
            config.max_concurrent,
            config.max_queue,
            config.queue_wait(),
            config.overload_policy,
        );
        let isolation = runner.isolation();
        info!(
            "coordinator ready: root={} slots={} queue={} network_isolated={} fs_isolated={} pid_isolated={} cgroups={}",
            workspaces.root().display(),
            config.max_concurrent,
            config.max_queue,
            isolation.network,
            isolation.filesystem,
            isolation.processes,
            isolation.cgroups
        );
        Ok(Self {
            config,
            registry,
            workspaces,
            runner,
            admission,
        })
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    pub fn runner(&self) -> &ProcessRunner {
        &self.runner
    }

    pub fn in_flight(&self) -> usize {
        self.admission.in_flight()
    }

    pub fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        self.execute_with_cancel(request, &CancellationToken::new())
    }

    pub fn execute_with_cancel(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        self.validate(request)?;
        let adapter = self.registry.resolve(&request.language)?;

        let started = Instant::now();
        let _permit = self.admission.admit(cancel)?;
        let queued_ms = started.elapsed().as_millis();

        let mut workspace = self.workspaces.acquire()?;
        info!(
            "[{}] {} request admitted after {}ms ({} bytes, {} deps)",
            workspace.id(),
            adapter.language(),
            queued_ms,
            request.source_code.len(),
            request.dependencies.len()
        );

        let outcome = self.run_in_workspace(adapter.as_ref(), request, &workspace, cancel);
        match &outcome {
            Ok(result) => info!(
                "[{}] completed: {} status={} in {}ms",
                workspace.id(),
                result.termination.as_str(),
                result.status_code(),
                started.elapsed().as_millis()
            ),
            Err(e) => warn!("[{}] failed ({}): {}", workspace.id(), e.kind(), e),
        }

        if let Err(e) = workspace.release() {
            // Drop retries; the result still goes back to the caller.
            warn!("[{}] workspace cleanup failed: {}", workspace.id(), e);
        }
        outcome
    }

    fn validate(&self, request: &ExecutionRequest) -> Result<()> {
        if request.language.trim().is_empty() {
            return Err(ExecutionError::Validation("language is required".to_string()));
        }
        if request.source_code.len() > self.config.max_source_bytes {
            return Err(ExecutionError::Validation(format!(
                "source is {} bytes, limit is {}",
                request.source_code.len(),
                self.config.max_source_bytes
            )));
        }
        if request.source_code.contains('\0') {
            return Err(ExecutionError::Validation("source contains a NUL byte".to_string()));
        }
        if request.dependencies.len() > self.config.max_dependencies {
            return Err(ExecutionError::Validation(format!(
                "{} dependencies requested, limit is {}",
                request.dependencies.len(),
                self.config.max_dependencies
            )));
        }
        for dep in &request.dependencies {
            dep.check_format()?;
            dep.check_allowed(&self.config.local_dependency_roots)?;
        }
        if let Some(stdin) = &request.stdin {
            if stdin.len() > self.config.max_source_bytes {
                return Err(ExecutionError::Validation(format!(
                    "stdin is {} bytes, limit is {}",
                    stdin.len(),
                    self.config.max_source_bytes
                )));
            }
        }
        Ok(())
    }

    fn run_in_workspace(
        &self,
        adapter: &dyn LanguageAdapter,
        request: &ExecutionRequest,
        workspace: &Workspace,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let ctx = PrepareContext {
            runner: &self.runner,
            workspace,
            cancel,
            install_limits: self.config.install_limits(),
            compile_limits: self.config.compile_limits(),
            local_roots: &self.config.local_dependency_roots,
        };

        let source = adapter.materialize(workspace, &request.source_code)?;
        if !request.dependencies.is_empty() {
            adapter.install_dependencies(&ctx, &request.dependencies)?;
        }
        let mut command = adapter.build_run_command(&ctx, &source)?;
        command.stdin = request.stdin.clone();

        let limits = adapter.run_limits(self.config.execution_limits(adapter.language()));
        let policy = SandboxPolicy {
            workspace: workspace.path().to_path_buf(),
            allow_network: false,
            label: format!("{}.run", workspace.id()),
        };

        match self.runner.run(&command, &limits, &policy, cancel) {
            Err(e) if e.is_transient() => {
                warn!("[{}] transient launch failure, retrying once: {}", workspace.id(), e);
                thread::sleep(Duration::from_millis(50));
                self.runner.run(&command, &limits, &policy, cancel)
            }
            other => other,
        }
    }

    /// Run a request on its own thread. The handle can cancel or wait for it.
    pub fn spawn(self: &Arc<Self>, request: ExecutionRequest) -> ExecutionHandle {
        let cancel = CancellationToken::new();
        let (tx, rx) = bounded(1);
        let coordinator = Arc::clone(self);
        let token = cancel.clone();
        let thread = thread::spawn(move || {
            let outcome = coordinator.execute_with_cancel(&request, &token);
            let _ = tx.send(outcome);
        });
        ExecutionHandle {
            cancel,
            receiver: rx,
            thread: Some(thread),
        }
    }
}

/// A request running on a background thread.
#[derive(Debug)]
pub struct ExecutionHandle {
    cancel: CancellationToken,
    receiver: Receiver<Result<ExecutionResult>>,
    thread: Option<JoinHandle<()>>,
}

impl ExecutionHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Block until the request finishes.
    pub fn wait(mut self) -> Result<ExecutionResult> {
        let outcome = self.receiver.recv().unwrap_or_else(|_| Err(worker_died()));
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        outcome
    }

    /// Wait up to `timeout`; `None` if the request is still running.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<Result<ExecutionResult>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(outcome) => {
                if let Some(thread) = self.thread.take() {
                    let _ = thread.join();
                }
                Some(outcome)
            }
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(worker_died())),
        }
    }
}

fn worker_died() -> ExecutionError {
    ExecutionError::Resource("execution thread exited without a result".to_string())
}
