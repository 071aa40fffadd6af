/// Process runner: spawn one sandboxed process, enforce limits, capture output
///
/// Lifecycle of a run:
/// 1. prepare isolation plan, cgroup scope and rlimits in the parent
/// 2. fork; the pre-exec hook joins the scope, starts a new session,
///    enters namespaces, builds the read-only root, drops root and applies
///    rlimits. With a pid namespace the forked process stays behind as a
///    relay for the program (see `kernel::pidns`)
/// 3. watchdog polls the leader every 10ms against the wall deadline,
///    cancellation and cgroup accounting
/// 4. on exit or kill, the whole process group is SIGKILLed, the leader is
///    reaped with `wait4`, and captured output is collected
use crate::config::settings::{SandboxMode, SandboxSettings};
use crate::config::types::{ExecutionError, ExecutionResult, LimitKind, Result, Termination};
use crate::core::limits::{ResourceLimits, RlimitPlan};
use crate::core::types::{CancellationToken, RunCommand, SandboxPolicy};
use crate::kernel::cgroup::{CgroupController, CgroupScope, CgroupUsage};
use crate::kernel::credentials::Credentials;
use crate::kernel::namespace::{self, IsolationPlan, NamespaceSupport};
use crate::kernel::rootfs::RootLayout;
use crate::kernel::signal::{kill_group, terminate_group};
use crate::utils::output::OutputCapture;
use log::{debug, info, warn};
use nix::unistd::Pid;
use std::io::{self, Write};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

static SCOPE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Which isolation layers are actually in force.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IsolationStatus {
    pub network: bool,
    pub filesystem: bool,
    pub processes: bool,
    pub cgroups: bool,
    /// Programs run as `run_as_uid` instead of the runner's root.
    pub privileges_dropped: bool,
}

/// Why the watchdog stopped a process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stop {
    Deadline,
    Cancelled,
    Limit(LimitKind),
}

/// Runs commands under the configured sandbox. Shared by all requests.
#[derive(Debug)]
pub struct ProcessRunner {
    settings: SandboxSettings,
    support: NamespaceSupport,
    root_layout: Option<RootLayout>,
    credentials: Option<Credentials>,
    cgroups: Option<CgroupController>,
    path_env: String,
}

impl ProcessRunner {
    /// Check what the kernel allows and set up the sandbox.
    ///
    /// In strict mode a missing isolation layer is fatal; in permissive
    /// mode it is logged and skipped.
    pub fn new(settings: &SandboxSettings, scratch_root: &Path) -> Result<Self> {
        let strict = settings.mode == SandboxMode::Strict;
        let support = if settings.isolate_network || settings.isolate_filesystem || settings.isolate_processes {
            namespace::detect_support(scratch_root)
        } else {
            NamespaceSupport::none()
        };
        debug!("namespace support: {:?}", support);

        let mut missing = Vec::new();
        if settings.isolate_network && !support.network {
            missing.push("network namespace");
        }
        if settings.isolate_filesystem && !support.mount {
            missing.push("mount namespace");
        }
        if settings.isolate_processes && !support.pid {
            missing.push("pid namespace");
        }

        let path_env = std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string());
        let root_layout = if settings.isolate_filesystem && support.mount {
            Some(RootLayout::detect(scratch_root, &settings.system_paths, &path_env)?)
        } else {
            None
        };
        let credentials = if !nix::unistd::geteuid().is_root() {
            None
        } else if root_layout.is_some() {
            Some(Credentials::new(settings.run_as_uid, settings.run_as_gid)?)
        } else {
            missing.push("privilege drop (running as root needs filesystem isolation)");
            None
        };

        let cgroups = if settings.use_cgroups {
            match CgroupController::open(settings.cgroup_root.as_deref()) {
                Ok(controller) => {
                    info!("cgroup limits enabled under {}", controller.root().display());
                    Some(controller)
                }
                Err(e) => {
                    debug!("cgroups unavailable: {}", e);
                    missing.push("cgroup v2 delegation");
                    None
                }
            }
        } else {
            None
        };

        if !missing.is_empty() {
            let message = format!("unavailable isolation: {}", missing.join(", "));
            if strict {
                return Err(ExecutionError::Sandbox(message));
            }
            warn!("{} (permissive mode, continuing)", message);
        }

        Ok(Self {
            settings: settings.clone(),
            support,
            root_layout,
            credentials,
            cgroups,
            path_env,
        })
    }

    pub fn isolation(&self) -> IsolationStatus {
        IsolationStatus {
            network: self.settings.isolate_network && self.support.network,
            filesystem: self.root_layout.is_some(),
            processes: self.processes(),
            cgroups: self.cgroups.is_some(),
            privileges_dropped: self.credentials.is_some(),
        }
    }

    pub fn cgroups(&self) -> Option<&CgroupController> {
        self.cgroups.as_ref()
    }

    fn processes(&self) -> bool {
        self.settings.isolate_processes && self.support.pid
    }

    fn strict(&self) -> bool {
        self.settings.mode == SandboxMode::Strict
    }

    fn create_scope(&self, policy: &SandboxPolicy, limits: &ResourceLimits) -> Result<Option<CgroupScope>> {
        let Some(controller) = &self.cgroups else {
            return Ok(None);
        };
        let name = format!("{}-{}", policy.label, SCOPE_COUNTER.fetch_add(1, Ordering::Relaxed));
        match controller.create_scope(&name, limits) {
            Ok(scope) => Ok(Some(scope)),
            Err(e) if self.strict() => Err(e),
            Err(e) => {
                warn!("[{}] running without cgroup limits: {}", policy.label, e);
                Ok(None)
            }
        }
    }

    /// Run `command` to completion under `limits`.
    ///
    /// Timeouts, cancellation and limit violations are reported in the
    /// returned result; only failures to start or supervise the process are
    /// errors.
    pub fn run(
        &self,
        command: &RunCommand,
        limits: &ResourceLimits,
        policy: &SandboxPolicy,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let program = command
            .argv
            .first()
            .ok_or_else(|| ExecutionError::Config("empty command line".to_string()))?;
        if cancel.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }

        let root = match &self.root_layout {
            Some(layout) => Some(layout.for_workspace(&policy.workspace, &command.working_dir, self.processes())?),
            None => None,
        };
        if let Some(credentials) = &self.credentials {
            credentials.hand_over(&policy.workspace)?;
        }
        let isolation = IsolationPlan::new(
            self.settings.isolate_network && self.support.network && !policy.allow_network,
            self.processes(),
            root,
            self.credentials,
        );
        let scope = self.create_scope(policy, limits)?;
        let rlimits = RlimitPlan::from_limits(limits, scope.is_some(), self.strict());
        let attach = scope.as_ref().map(CgroupScope::attach_target);

        let mut cmd = Command::new(program);
        cmd.args(&command.argv[1..])
            .current_dir(&command.working_dir)
            .env_clear()
            .env("PATH", &self.path_env)
            .env("HOME", &policy.workspace)
            .env("TMPDIR", policy.workspace.join("tmp"))
            .env("LANG", "C.UTF-8")
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if command.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // SAFETY: the hook only issues async-signal-safe syscalls on data
        // prepared above; it never allocates or takes locks.
        unsafe {
            cmd.pre_exec(move || {
                if libc::setsid() < 0 {
                    return Err(io::Error::last_os_error());
                }
                libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong, 0, 0, 0);
                if let Some(attach) = &attach {
                    attach.join()?;
                }
                if let Some(plan) = &isolation {
                    plan.apply()?;
                }
                rlimits.apply()?;
                libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0);
                libc::umask(0o077);
                Ok(())
            });
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ExecutionError::launch(program.clone(), e))?;
        let started = Instant::now();
        let pid = Pid::from_raw(child.id() as i32);
        debug!("[{}] spawned {} as pid {}", policy.label, program, pid);

        if let (Some(input), Some(mut stdin)) = (command.stdin.clone(), child.stdin.take()) {
            thread::spawn(move || {
                // The program may exit without reading; a broken pipe is fine.
                let _ = stdin.write_all(&input);
            });
        }
        let capture = OutputCapture::start(child.stdout.take(), child.stderr.take(), limits.max_output_bytes);

        let stop = match self.watch(pid, limits, scope.as_ref(), cancel, started, &policy.label) {
            Ok(stop) => stop,
            Err(e) => {
                kill_group(pid);
                let _ = reap(pid);
                return Err(e);
            }
        };

        // Descendants can outlive the leader.
        kill_group(pid);
        if let Some(scope) = &scope {
            scope.kill();
        }
        let (status, rusage) = reap(pid)?;
        let wall_time = started.elapsed();
        let output = capture.finish(limits.kill_grace + Duration::from_millis(500));
        let usage = scope.as_ref().map(CgroupScope::usage).unwrap_or_default();

        let cpu_time_ms = rusage_cpu_ms(&rusage).max(usage.cpu_usage_usec / 1000);
        let (exit_code, signal) = decode_status(status);
        let termination = classify(stop, signal, exit_code, &usage, limits, cpu_time_ms);

        let result = ExecutionResult {
            stdout: output.stdout,
            stderr: output.stderr,
            segments: output.segments,
            exit_code,
            signal,
            termination,
            timed_out: termination == Termination::TimedOut,
            output_truncated: output.truncated,
            output_incomplete: output.incomplete,
            wall_time_ms: wall_time.as_millis() as u64,
            cpu_time_ms,
            memory_peak_bytes: (rusage.ru_maxrss.max(0) as u64 * 1024).max(usage.memory_peak_bytes),
        };

        info!(
            "[{}] {} finished: {} exit={:?} signal={:?} wall={}ms cpu={}ms",
            policy.label,
            program,
            result.termination.as_str(),
            result.exit_code,
            result.signal,
            result.wall_time_ms,
            result.cpu_time_ms
        );
        Ok(result)
    }

    /// Poll until the leader exits; kill the group when a limit trips.
    fn watch(
        &self,
        pid: Pid,
        limits: &ResourceLimits,
        scope: Option<&CgroupScope>,
        cancel: &CancellationToken,
        started: Instant,
        label: &str,
    ) -> Result<Option<Stop>> {
        let cpu_limit_usec = limits.cpu_time.map(|d| d.as_micros() as u64);
        loop {
            if leader_exited(pid)? {
                return Ok(None);
            }

            let stop = if started.elapsed() >= limits.wall_time {
                Some(Stop::Deadline)
            } else if cancel.is_cancelled() {
                Some(Stop::Cancelled)
            } else if let Some(scope) = scope {
                if cpu_limit_usec.map_or(false, |limit| scope.cpu_usage_usec() >= limit) {
                    Some(Stop::Limit(LimitKind::CpuTime))
                } else if scope.pids_exhausted() {
                    Some(Stop::Limit(LimitKind::Processes))
                } else {
                    None
                }
            } else {
                None
            };

            if let Some(stop) = stop {
                let report = terminate_group(pid, limits.kill_grace, || leader_exited(pid).unwrap_or(true));
                if let Some(scope) = scope {
                    scope.kill();
                }
                info!(
                    "[{}] stopping pid {} ({:?}) after {}ms, escalated to SIGKILL: {}",
                    label,
                    pid,
                    stop,
                    started.elapsed().as_millis(),
                    report.kill_sent
                );
                return Ok(Some(stop));
            }

            thread::sleep(POLL_INTERVAL);
        }
    }
}

/// Has the leader exited? Leaves it unreaped so its pid stays reserved.
fn leader_exited(pid: Pid) -> Result<bool> {
    // SAFETY: siginfo_t is plain data; waitid fills it in.
    let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
    let rc = unsafe {
        libc::waitid(
            libc::P_PID,
            pid.as_raw() as libc::id_t,
            &mut info,
            libc::WEXITED | libc::WNOHANG | libc::WNOWAIT,
        )
    };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            return Ok(false);
        }
        return Err(ExecutionError::resource(format!("waitid({pid})"), err));
    }
    // SAFETY: si_pid is valid for WEXITED results; zero means still running.
    Ok(unsafe { info.si_pid() } != 0)
}

fn reap(pid: Pid) -> Result<(libc::c_int, libc::rusage)> {
    loop {
        let mut status: libc::c_int = 0;
        // SAFETY: rusage is plain data; wait4 fills it in.
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::wait4(pid.as_raw(), &mut status, 0, &mut usage) };
        if rc == pid.as_raw() {
            return Ok((status, usage));
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(ExecutionError::resource(format!("wait4({pid})"), err));
        }
    }
}

fn decode_status(status: libc::c_int) -> (Option<i32>, Option<i32>) {
    if libc::WIFEXITED(status) {
        (Some(libc::WEXITSTATUS(status)), None)
    } else if libc::WIFSIGNALED(status) {
        (None, Some(libc::WTERMSIG(status)))
    } else {
        (None, None)
    }
}

fn rusage_cpu_ms(usage: &libc::rusage) -> u64 {
    let to_ms = |tv: libc::timeval| tv.tv_sec.max(0) as u64 * 1000 + tv.tv_usec.max(0) as u64 / 1000;
    to_ms(usage.ru_utime) + to_ms(usage.ru_stime)
}

fn classify(
    stop: Option<Stop>,
    signal: Option<i32>,
    exit_code: Option<i32>,
    usage: &CgroupUsage,
    limits: &ResourceLimits,
    cpu_time_ms: u64,
) -> Termination {
    match stop {
        Some(Stop::Deadline) => return Termination::TimedOut,
        Some(Stop::Cancelled) => return Termination::Cancelled,
        Some(Stop::Limit(kind)) => return Termination::ResourceLimit(kind),
        None => {}
    }
    let cpu_exhausted = limits
        .cpu_time
        .map_or(false, |limit| cpu_time_ms >= limit.as_millis() as u64);
    match signal {
        Some(libc::SIGXCPU) => Termination::ResourceLimit(LimitKind::CpuTime),
        Some(libc::SIGXFSZ) => Termination::ResourceLimit(LimitKind::FileSize),
        Some(libc::SIGKILL) if usage.oom_kills > 0 => Termination::ResourceLimit(LimitKind::Memory),
        Some(libc::SIGKILL) if cpu_exhausted => Termination::ResourceLimit(LimitKind::CpuTime),
        Some(_) => Termination::Signaled,
        None if usage.oom_kills > 0 && exit_code != Some(0) => {
            Termination::ResourceLimit(LimitKind::Memory)
        }
        None => Termination::Exited,
    }
}
