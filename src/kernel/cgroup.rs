/// Per-run cgroup v2 scopes
///
/// Each run gets its own leaf cgroup carrying memory, pids and CPU accounting.
/// The child joins the scope from its pre-exec hook, so every descendant is
/// charged to it from the first instruction.
use crate::config::types::{ExecutionError, Result};
use crate::core::limits::ResourceLimits;
use std::ffi::CString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

const DEFAULT_ROOT: &str = "/sys/fs/cgroup/coderunner";

/// Handle on the parent cgroup below which run scopes are created.
#[derive(Debug)]
pub struct CgroupController {
    root: PathBuf,
}

impl CgroupController {
    /// Open (creating if needed) the parent cgroup and delegate controllers to it.
    pub fn open(root: Option<&Path>) -> Result<Self> {
        let root = root.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(DEFAULT_ROOT));
        let parent = root
            .parent()
            .ok_or_else(|| ExecutionError::Sandbox("cgroup root has no parent".to_string()))?;
        if !parent.join("cgroup.controllers").exists() {
            return Err(ExecutionError::Sandbox(format!(
                "{} is not on a cgroup v2 hierarchy",
                parent.display()
            )));
        }

        fs::create_dir_all(&root).map_err(|e| {
            ExecutionError::Sandbox(format!("failed to create cgroup {}: {}", root.display(), e))
        })?;

        let available = fs::read_to_string(root.join("cgroup.controllers")).unwrap_or_default();
        let wanted: Vec<&str> = ["memory", "pids", "cpu"]
            .into_iter()
            .filter(|c| available.split_whitespace().any(|a| a == *c))
            .collect();
        for controller in &wanted {
            let path = root.join("cgroup.subtree_control");
            if let Err(e) = fs::write(&path, format!("+{controller}")) {
                log::warn!("failed to enable {} controller under {}: {}", controller, root.display(), e);
            }
        }
        if !wanted.contains(&"memory") || !wanted.contains(&"pids") {
            return Err(ExecutionError::Sandbox(format!(
                "cgroup {} lacks the memory or pids controller",
                root.display()
            )));
        }

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a leaf scope for one run and write its limits.
    pub fn create_scope(&self, name: &str, limits: &ResourceLimits) -> Result<CgroupScope> {
        let path = self.root.join(name);
        fs::create_dir(&path).map_err(|e| {
            ExecutionError::Sandbox(format!("failed to create cgroup {}: {}", path.display(), e))
        })?;

        let procs = crate::kernel::namespace::path_cstring(&path.join("cgroup.procs"))?;
        let scope = CgroupScope {
            path,
            procs,
            removed: false,
        };

        if let Some(memory) = limits.memory_bytes {
            scope.write("memory.max", &memory.to_string())?;
            // No swap headroom beyond the limit.
            let _ = scope.write("memory.swap.max", "0");
            let _ = scope.write("memory.oom.group", "1");
        }
        if let Some(procs) = limits.max_processes {
            scope.write("pids.max", &procs.to_string())?;
        }
        Ok(scope)
    }

    /// Remove leftover scopes from earlier runs that crashed before cleanup.
    pub fn sweep(&self) -> usize {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return 0;
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                let _ = fs::write(entry.path().join("cgroup.kill"), "1");
                if remove_with_retry(&entry.path()).is_ok() {
                    removed += 1;
                }
            }
        }
        removed
    }
}

/// Path to a scope's `cgroup.procs`, prepared before fork.
#[derive(Clone, Debug)]
pub struct CgroupAttach {
    procs: CString,
}

impl CgroupAttach {
    /// Move the calling process into the scope.
    ///
    /// Only raw syscalls: this runs between fork and exec.
    pub fn join(&self) -> io::Result<()> {
        // SAFETY: plain open/write/close on a path we own.
        unsafe {
            let fd = libc::open(self.procs.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            let written = libc::write(fd, b"0".as_ptr() as *const libc::c_void, 1);
            let err = io::Error::last_os_error();
            libc::close(fd);
            if written != 1 {
                return Err(err);
            }
        }
        Ok(())
    }
}

/// Accounting snapshot read after a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CgroupUsage {
    pub cpu_usage_usec: u64,
    pub memory_peak_bytes: u64,
    pub oom_kills: u64,
    pub pids_max_events: u64,
}

/// A leaf cgroup owned by one run. Killed and removed on drop.
#[derive(Debug)]
pub struct CgroupScope {
    path: PathBuf,
    procs: CString,
    removed: bool,
}

impl CgroupScope {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Owned handle the child uses to join this scope before exec.
    pub fn attach_target(&self) -> CgroupAttach {
        CgroupAttach {
            procs: self.procs.clone(),
        }
    }

    fn write(&self, file: &str, value: &str) -> Result<()> {
        fs::write(self.path.join(file), value).map_err(|e| {
            ExecutionError::Sandbox(format!("failed to write {} = {}: {}", file, value, e))
        })
    }

    fn read_keyed(&self, file: &str, key: &str) -> u64 {
        fs::read_to_string(self.path.join(file))
            .ok()
            .and_then(|content| {
                content.lines().find_map(|line| {
                    let mut parts = line.split_whitespace();
                    (parts.next() == Some(key)).then(|| parts.next()?.parse().ok())?
                })
            })
            .unwrap_or(0)
    }

    fn read_value(&self, file: &str) -> Option<u64> {
        fs::read_to_string(self.path.join(file))
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    pub fn cpu_usage_usec(&self) -> u64 {
        self.read_keyed("cpu.stat", "usage_usec")
    }

    /// A fork was refused because `pids.max` was reached.
    pub fn pids_exhausted(&self) -> bool {
        self.read_keyed("pids.events", "max") > 0
    }

    pub fn usage(&self) -> CgroupUsage {
        CgroupUsage {
            cpu_usage_usec: self.cpu_usage_usec(),
            memory_peak_bytes: self
                .read_value("memory.peak")
                .or_else(|| self.read_value("memory.current"))
                .unwrap_or(0),
            oom_kills: self.read_keyed("memory.events", "oom_kill"),
            pids_max_events: self.read_keyed("pids.events", "max"),
        }
    }

    /// SIGKILL every process in the scope.
    pub fn kill(&self) {
        if fs::write(self.path.join("cgroup.kill"), "1").is_ok() {
            return;
        }
        // Kernels before 5.14 lack cgroup.kill.
        if let Ok(content) = fs::read_to_string(self.path.join("cgroup.procs")) {
            for pid in content.lines().filter_map(|l| l.trim().parse::<i32>().ok()) {
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(pid),
                    nix::sys::signal::Signal::SIGKILL,
                );
            }
        }
    }

    pub fn remove(&mut self) -> Result<()> {
        if self.removed {
            return Ok(());
        }
        self.kill();
        remove_with_retry(&self.path).map_err(|e| {
            ExecutionError::Sandbox(format!("failed to remove cgroup {}: {}", self.path.display(), e))
        })?;
        self.removed = true;
        Ok(())
    }
}

impl Drop for CgroupScope {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            log::warn!("{}", e);
        }
    }
}

/// rmdir fails with EBUSY until the last killed task is gone.
fn remove_with_retry(path: &Path) -> io::Result<()> {
    let mut last = None;
    for _ in 0..50 {
        match fs::remove_dir(path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => last = Some(e),
        }
        thread::sleep(Duration::from_millis(10));
    }
    Err(last.unwrap_or_else(|| io::Error::from(io::ErrorKind::Other)))
}
