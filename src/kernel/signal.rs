use log::info;
use nix::errno::Errno;
use nix::sys::signal::{self, killpg, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;
/// Process-group termination and async-safe shutdown signals
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Set by the SIGINT/SIGTERM handler.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);
static SIGNAL_RECEIVED: AtomicI32 = AtomicI32::new(0);

/// What `terminate_group` did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KillReport {
    pub term_sent: bool,
    pub kill_sent: bool,
    /// The group was already gone when termination started.
    pub already_gone: bool,
    pub waited_ms: u64,
}

/// SIGTERM the process group, give it `grace` to exit, then SIGKILL.
///
/// `leader_exited` is polled during the grace period so a group that stops
/// promptly is not waited on for the full delay.
pub fn terminate_group(pgid: Pid, grace: Duration, leader_exited: impl Fn() -> bool) -> KillReport {
    let mut report = KillReport::default();
    let start = Instant::now();

    match killpg(pgid, Signal::SIGTERM) {
        Ok(()) => report.term_sent = true,
        Err(Errno::ESRCH) => {
            report.already_gone = true;
            return report;
        }
        Err(e) => log::warn!("SIGTERM to group {} failed: {}", pgid, e),
    }

    let deadline = start + grace;
    while Instant::now() < deadline && !leader_exited() {
        thread::sleep(Duration::from_millis(5));
    }

    // Descendants may outlive the leader, so the group is always killed.
    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) => report.kill_sent = true,
        Err(Errno::ESRCH) => {}
        Err(e) => log::warn!("SIGKILL to group {} failed: {}", pgid, e),
    }

    report.waited_ms = start.elapsed().as_millis() as u64;
    report
}

/// SIGKILL whatever is left of a group. Missing groups are fine.
pub fn kill_group(pgid: Pid) {
    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => log::warn!("SIGKILL to group {} failed: {}", pgid, e),
    }
}

/// Installs SIGINT/SIGTERM handlers that only flip atomics.
pub struct ShutdownSignals;

impl ShutdownSignals {
    pub fn install() -> Result<Self, String> {
        let action = SigAction::new(
            SigHandler::Handler(Self::handle),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        // SAFETY: the handler only stores to atomics.
        unsafe {
            signal::sigaction(Signal::SIGINT, &action)
                .map_err(|e| format!("failed to install SIGINT handler: {e}"))?;
            signal::sigaction(Signal::SIGTERM, &action)
                .map_err(|e| format!("failed to install SIGTERM handler: {e}"))?;
        }
        info!("shutdown handlers installed (SIGINT, SIGTERM)");
        Ok(Self)
    }

    extern "C" fn handle(signal: libc::c_int) {
        SIGNAL_RECEIVED.store(signal, Ordering::SeqCst);
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_requested(&self) -> bool {
        SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
    }

    /// Signal number that requested shutdown, 0 if none.
    pub fn received(&self) -> i32 {
        SIGNAL_RECEIVED.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::CommandExt;
    use std::process::Command;

    fn spawn_group(script: &str) -> std::process::Child {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        // SAFETY: setsid is async-signal-safe.
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
        cmd.spawn().expect("spawn sh")
    }

    #[test]
    fn test_terminate_group_kills_stubborn_children() {
        let mut child = spawn_group("trap '' TERM; sleep 30 & wait");
        let pgid = Pid::from_raw(child.id() as i32);
        thread::sleep(Duration::from_millis(100));

        let report = terminate_group(pgid, Duration::from_millis(100), || false);
        assert!(report.term_sent);
        assert!(report.kill_sent);
        assert!(report.waited_ms >= 100);

        let status = child.wait().expect("wait");
        assert!(!status.success());
    }

    #[test]
    fn test_terminate_missing_group_is_noop() {
        let mut child = spawn_group("exit 0");
        let pgid = Pid::from_raw(child.id() as i32);
        child.wait().expect("wait");
        let report = terminate_group(pgid, Duration::from_millis(50), || true);
        assert!(report.already_gone);
        assert!(!report.kill_sent);
    }

    #[test]
    fn test_shutdown_flag_starts_clear() {
        let signals = ShutdownSignals::install().expect("install");
        assert_eq!(signals.received() != 0, signals.shutdown_requested());
    }
}
