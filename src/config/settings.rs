/// Runner configuration loaded from JSON with per-field defaults
use crate::config::types::{ExecutionError, Result};
use crate::core::limits::ResourceLimits;
use crate::kernel::rootfs::DEFAULT_SYSTEM_PATHS;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const MIB: u64 = 1024 * 1024;
const NOBODY: u32 = 65534;

/// What happens to a request when every execution slot is busy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverloadPolicy {
    /// Wait in a bounded queue for up to `queue_wait_ms`.
    Queue,
    /// Fail immediately with a busy error.
    Reject,
}

/// Whether missing isolation primitives abort startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxMode {
    Strict,
    Permissive,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    pub cpu_time_ms: Option<u64>,
    pub memory_bytes: Option<u64>,
    pub max_processes: Option<u32>,
    pub max_open_files: Option<u64>,
    pub max_file_size_bytes: Option<u64>,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            cpu_time_ms: Some(10_000),
            memory_bytes: Some(256 * MIB),
            max_processes: Some(64),
            max_open_files: Some(64),
            max_file_size_bytes: Some(16 * MIB),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    pub mode: SandboxMode,
    /// Run programs in a fresh network namespace with only loopback.
    pub isolate_network: bool,
    /// Chroot into a minimal read-only root where the workspace is the only
    /// writable host directory.
    pub isolate_filesystem: bool,
    /// Fresh pid and IPC namespaces; nothing a program starts outlives it.
    pub isolate_processes: bool,
    /// Host directories bound read-only into the sandbox root.
    pub system_paths: Vec<PathBuf>,
    /// Identity programs run as when the runner itself is root.
    pub run_as_uid: u32,
    pub run_as_gid: u32,
    pub use_cgroups: bool,
    /// Parent cgroup v2 directory; per-run scopes are created below it.
    pub cgroup_root: Option<PathBuf>,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            mode: SandboxMode::Strict,
            isolate_network: true,
            isolate_filesystem: true,
            isolate_processes: true,
            system_paths: DEFAULT_SYSTEM_PATHS.iter().map(PathBuf::from).collect(),
            run_as_uid: NOBODY,
            run_as_gid: NOBODY,
            use_cgroups: true,
            cgroup_root: None,
        }
    }
}

/// Per-language overrides layered on top of the global limits.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LanguageOverrides {
    pub timeout_ms: Option<u64>,
    pub cpu_time_ms: Option<u64>,
    pub memory_bytes: Option<u64>,
    pub max_processes: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Parent directory of every workspace.
    pub scratch_root: PathBuf,
    pub timeout_ms: u64,
    /// Delay between SIGTERM and SIGKILL when a process group is stopped.
    pub kill_grace_ms: u64,
    /// Shared capture budget for stdout and stderr of one run.
    pub max_output_bytes: usize,
    pub max_concurrent: usize,
    pub max_queue: usize,
    pub queue_wait_ms: u64,
    pub overload_policy: OverloadPolicy,
    pub max_source_bytes: usize,
    pub max_dependencies: usize,
    pub install_timeout_ms: u64,
    pub compile_timeout_ms: u64,
    /// Acquiring a workspace fails when the scratch filesystem has less free space.
    pub min_free_bytes: u64,
    /// Directories that local-path dependencies may be copied from.
    pub local_dependency_roots: Vec<PathBuf>,
    pub limits: LimitSettings,
    pub sandbox: SandboxSettings,
    pub languages: HashMap<String, LanguageOverrides>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            scratch_root: default_scratch_root(),
            timeout_ms: 10_000,
            kill_grace_ms: 200,
            max_output_bytes: MIB as usize,
            max_concurrent: 4,
            max_queue: 16,
            queue_wait_ms: 5_000,
            overload_policy: OverloadPolicy::Queue,
            max_source_bytes: 512 * 1024,
            max_dependencies: 16,
            install_timeout_ms: 120_000,
            compile_timeout_ms: 30_000,
            min_free_bytes: 64 * MIB,
            local_dependency_roots: Vec::new(),
            limits: LimitSettings::default(),
            sandbox: SandboxSettings::default(),
            languages: HashMap::new(),
        }
    }
}

/// Per-user scratch directory under the system temp dir.
pub fn default_scratch_root() -> PathBuf {
    let euid = nix::unistd::geteuid();
    std::env::temp_dir().join(format!("coderunner-uid-{}", euid.as_raw()))
}

impl RunnerConfig {
    /// Reject nonsensical values; warnings are logged.
    pub fn validate(&self) -> Result<crate::config::validator::ValidationResult> {
        crate::config::validator::validate_config(self)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ExecutionError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            ExecutionError::Config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    pub fn language_overrides(&self, language: &str) -> Option<&LanguageOverrides> {
        self.languages.get(&language.to_ascii_lowercase())
    }

    /// Limits for the user program of `language`.
    pub fn execution_limits(&self, language: &str) -> ResourceLimits {
        let overrides = self.language_overrides(language).cloned().unwrap_or_default();
        let timeout = overrides.timeout_ms.unwrap_or(self.timeout_ms);
        ResourceLimits {
            wall_time: Duration::from_millis(timeout),
            cpu_time: overrides
                .cpu_time_ms
                .or(self.limits.cpu_time_ms)
                .map(Duration::from_millis),
            memory_bytes: overrides.memory_bytes.or(self.limits.memory_bytes),
            max_processes: overrides.max_processes.or(self.limits.max_processes),
            max_open_files: self.limits.max_open_files,
            max_file_size: self.limits.max_file_size_bytes,
            max_output_bytes: self.max_output_bytes,
            kill_grace: Duration::from_millis(self.kill_grace_ms),
        }
    }

    /// Limits for compiler invocations. Toolchains get more headroom than programs.
    pub fn compile_limits(&self) -> ResourceLimits {
        ResourceLimits {
            wall_time: Duration::from_millis(self.compile_timeout_ms),
            cpu_time: Some(Duration::from_millis(self.compile_timeout_ms)),
            memory_bytes: self.limits.memory_bytes.map(|m| m.max(1024 * MIB)),
            max_processes: self.limits.max_processes.map(|p| p.max(256)),
            max_open_files: self.limits.max_open_files.map(|n| n.max(1024)),
            max_file_size: self.limits.max_file_size_bytes.map(|n| n.max(256 * MIB)),
            max_output_bytes: self.max_output_bytes,
            kill_grace: Duration::from_millis(self.kill_grace_ms),
        }
    }

    /// Limits for package-manager runs.
    pub fn install_limits(&self) -> ResourceLimits {
        ResourceLimits {
            wall_time: Duration::from_millis(self.install_timeout_ms),
            cpu_time: None,
            memory_bytes: self.limits.memory_bytes.map(|m| m.max(1024 * MIB)),
            max_processes: self.limits.max_processes.map(|p| p.max(512)),
            max_open_files: self.limits.max_open_files.map(|n| n.max(4096)),
            max_file_size: self.limits.max_file_size_bytes.map(|n| n.max(512 * MIB)),
            max_output_bytes: self.max_output_bytes,
            kill_grace: Duration::from_millis(self.kill_grace_ms),
        }
    }

    pub fn queue_wait(&self) -> Duration {
        Duration::from_millis(self.queue_wait_ms)
    }
}
