/// Resource limits and their rlimit rendering for the pre-exec hook
use std::io;
use std::time::Duration;

/// Limits applied to one process run.
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceLimits {
    pub wall_time: Duration,
    pub cpu_time: Option<Duration>,
    pub memory_bytes: Option<u64>,
    pub max_processes: Option<u32>,
    pub max_open_files: Option<u64>,
    pub max_file_size: Option<u64>,
    pub max_output_bytes: usize,
    pub kill_grace: Duration,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            wall_time: Duration::from_secs(10),
            cpu_time: None,
            memory_bytes: None,
            max_processes: None,
            max_open_files: None,
            max_file_size: None,
            max_output_bytes: 1024 * 1024,
            kill_grace: Duration::from_millis(200),
        }
    }
}

impl ResourceLimits {
    /// Raise memory and process limits to at least the given floors.
    pub fn with_floors(mut self, memory_bytes: u64, max_processes: u32) -> Self {
        self.memory_bytes = self.memory_bytes.map(|m| m.max(memory_bytes));
        self.max_processes = self.max_processes.map(|p| p.max(max_processes));
        self
    }
}

const MAX_RLIMITS: usize = 6;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct RlimitEntry {
    resource: libc::__rlimit_resource_t,
    soft: libc::rlim_t,
    hard: libc::rlim_t,
}

/// Fixed-size rlimit table built in the parent and applied in the forked child.
///
/// Applying it allocates nothing, so it is safe to call from a `pre_exec` hook.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RlimitPlan {
    entries: [RlimitEntry; MAX_RLIMITS],
    len: usize,
    strict: bool,
}

impl RlimitPlan {
    /// `cgroup_enforced` drops the memory and process rlimits that a cgroup
    /// already covers more accurately.
    pub fn from_limits(limits: &ResourceLimits, cgroup_enforced: bool, strict: bool) -> Self {
        let mut plan = Self {
            entries: [RlimitEntry {
                resource: libc::RLIMIT_CORE,
                soft: 0,
                hard: 0,
            }; MAX_RLIMITS],
            len: 0,
            strict,
        };

        plan.push(libc::RLIMIT_CORE, 0, 0);
        if let Some(cpu) = limits.cpu_time {
            // Round up to whole seconds; SIGXCPU at soft, SIGKILL one second later.
            let secs = cpu.as_millis().div_ceil(1000).max(1) as u64;
            plan.push(libc::RLIMIT_CPU, secs, secs + 1);
        }
        if let Some(size) = limits.max_file_size {
            plan.push(libc::RLIMIT_FSIZE, size, size);
        }
        if let Some(files) = limits.max_open_files {
            plan.push(libc::RLIMIT_NOFILE, files, files);
        }
        if !cgroup_enforced {
            if let Some(memory) = limits.memory_bytes {
                plan.push(libc::RLIMIT_DATA, memory, memory);
            }
            if let Some(procs) = limits.max_processes {
                plan.push(libc::RLIMIT_NPROC, procs as u64, procs as u64);
            }
        }
        plan
    }

    fn push(&mut self, resource: libc::__rlimit_resource_t, soft: u64, hard: u64) {
        let (soft, hard) = clamp_to_current(resource, soft as libc::rlim_t, hard as libc::rlim_t);
        if self.len < MAX_RLIMITS {
            self.entries[self.len] = RlimitEntry { resource, soft, hard };
            self.len += 1;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, resource: libc::__rlimit_resource_t) -> bool {
        self.entries[..self.len].iter().any(|e| e.resource == resource)
    }

    /// Apply every entry to the calling process.
    ///
    /// Must only touch async-signal-safe calls: it runs between fork and exec.
    pub fn apply(&self) -> io::Result<()> {
        for entry in &self.entries[..self.len] {
            let limit = libc::rlimit {
                rlim_cur: entry.soft,
                rlim_max: entry.hard,
            };
            // SAFETY: setrlimit only reads the provided struct.
            let rc = unsafe { libc::setrlimit(entry.resource, &limit) };
            if rc != 0 && self.strict {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }
}

/// An unprivileged process cannot raise a hard limit, so never ask for more
/// than it already has.
fn clamp_to_current(
    resource: libc::__rlimit_resource_t,
    soft: libc::rlim_t,
    hard: libc::rlim_t,
) -> (libc::rlim_t, libc::rlim_t) {
    let mut current = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: getrlimit writes into the struct we own.
    let rc = unsafe { libc::getrlimit(resource, &mut current) };
    if rc != 0 || current.rlim_max == libc::RLIM_INFINITY {
        return (soft, hard);
    }
    let hard = hard.min(current.rlim_max);
    (soft.min(hard), hard)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_limits() -> ResourceLimits {
        ResourceLimits {
            cpu_time: Some(Duration::from_millis(1500)),
            memory_bytes: Some(64 * 1024 * 1024),
            max_processes: Some(16),
            max_open_files: Some(32),
            max_file_size: Some(1024 * 1024),
            ..ResourceLimits::default()
        }
    }

    #[test]
    fn test_plan_without_cgroup_includes_memory_and_nproc() {
        let plan = RlimitPlan::from_limits(&sample_limits(), false, true);
        assert!(plan.contains(libc::RLIMIT_CPU));
        assert!(plan.contains(libc::RLIMIT_DATA));
        assert!(plan.contains(libc::RLIMIT_NPROC));
        assert!(plan.contains(libc::RLIMIT_CORE));
    }

    #[test]
    fn test_plan_with_cgroup_leaves_memory_to_cgroup() {
        let plan = RlimitPlan::from_limits(&sample_limits(), true, true);
        assert!(!plan.contains(libc::RLIMIT_DATA));
        assert!(!plan.contains(libc::RLIMIT_NPROC));
        assert!(plan.contains(libc::RLIMIT_FSIZE));
    }

    #[test]
    fn test_cpu_limit_rounds_up_with_hard_margin() {
        let plan = RlimitPlan::from_limits(&sample_limits(), true, true);
        let cpu = plan.entries[..plan.len]
            .iter()
            .find(|e| e.resource == libc::RLIMIT_CPU)
            .copied()
            .expect("cpu entry");
        assert_eq!(cpu.soft, 2);
        assert_eq!(cpu.hard, 3);
    }

    #[test]
    fn test_floors_only_raise() {
        let limits = sample_limits().with_floors(32 * 1024 * 1024, 256);
        assert_eq!(limits.memory_bytes, Some(64 * 1024 * 1024));
        assert_eq!(limits.max_processes, Some(256));
    }
}
