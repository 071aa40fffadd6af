//! Process tree for a run inside its own pid namespace.
//!
//! After `unshare(CLONE_NEWPID)` the spawned process forks twice:
//!
//! ```text
//! relay (runner's pid namespace, the pid the watchdog sees)
//!   └─ init (pid 1 of the new namespace)
//!        └─ program
//! ```
//!
//! init reaps every child and reports the program's wait status to the
//! relay over a pipe, then exits. The kernel kills whatever is still alive in
//! the namespace at that point, including processes that called `setsid`.
//! The relay exits with the same code, or dies from the same signal, so the
//! runner classifies the run as if it had spawned the program directly.

use std::io;
use std::os::unix::io::RawFd;

const SYS_CLOSE_RANGE: libc::c_long = 436;

/// Fork the namespace's init. Returns in init with the status pipe; the
/// calling process turns into the relay and never returns.
///
/// # Safety
/// Must run in a single-threaded child after `unshare(CLONE_NEWPID)`.
pub unsafe fn fork_init() -> io::Result<RawFd> {
    let mut fds = [0 as libc::c_int; 2];
    if libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) != 0 {
        return Err(io::Error::last_os_error());
    }
    let pid = libc::fork();
    if pid < 0 {
        let err = io::Error::last_os_error();
        libc::close(fds[0]);
        libc::close(fds[1]);
        return Err(err);
    }
    if pid == 0 {
        libc::close(fds[0]);
        return Ok(fds[1]);
    }
    libc::close(fds[1]);
    relay(pid, fds[0])
}

/// Fork the program from init. Returns in the program; init stays behind
/// to reap and report on `report`.
///
/// # Safety
/// Must run in the process returned from [`fork_init`].
pub unsafe fn fork_program(report: RawFd) -> io::Result<()> {
    let pid = libc::fork();
    if pid < 0 {
        return Err(io::Error::last_os_error());
    }
    if pid == 0 {
        // `report` is close-on-exec.
        return Ok(());
    }
    supervise(pid, report)
}

unsafe fn relay(init: libc::pid_t, report: RawFd) -> ! {
    // Holding stdio or the exec-error pipe would keep the runner waiting.
    close_all_except(report);

    let mut buf = [0u8; 4];
    let mut got = 0usize;
    while got < buf.len() {
        let n = libc::read(
            report,
            buf.as_mut_ptr().add(got) as *mut libc::c_void,
            buf.len() - got,
        );
        if n > 0 {
            got += n as usize;
        } else if n < 0 && io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
            continue;
        } else {
            break;
        }
    }
    let init_status = wait_for(init);
    let status = if got == buf.len() {
        libc::c_int::from_ne_bytes(buf)
    } else {
        init_status
    };
    mirror(status)
}

unsafe fn supervise(program: libc::pid_t, report: RawFd) -> ! {
    close_all_except(report);

    // Exit status 1 if the program cannot be waited for.
    let mut program_status: libc::c_int = 1 << 8;
    loop {
        let mut status = 0;
        let pid = libc::waitpid(-1, &mut status, 0);
        if pid == program {
            program_status = status;
            break;
        }
        if pid < 0 && io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            break;
        }
    }
    let bytes = program_status.to_ne_bytes();
    libc::write(report, bytes.as_ptr() as *const libc::c_void, bytes.len());
    libc::_exit(0)
}

unsafe fn wait_for(pid: libc::pid_t) -> libc::c_int {
    loop {
        let mut status = 0;
        let rc = libc::waitpid(pid, &mut status, 0);
        if rc == pid {
            return status;
        }
        if rc < 0 && io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            return 1 << 8;
        }
    }
}

/// Leave with `status`: the same exit code, or the same fatal signal.
unsafe fn mirror(status: libc::c_int) -> ! {
    if libc::WIFEXITED(status) {
        libc::_exit(libc::WEXITSTATUS(status));
    }
    if libc::WIFSIGNALED(status) {
        let sig = libc::WTERMSIG(status);
        let no_core = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        libc::setrlimit(libc::RLIMIT_CORE, &no_core);
        libc::signal(sig, libc::SIG_DFL);
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, sig);
        libc::sigprocmask(libc::SIG_UNBLOCK, &set, std::ptr::null_mut());
        libc::kill(libc::getpid(), sig);
        libc::_exit(128 + sig);
    }
    libc::_exit(1)
}

unsafe fn close_all_except(keep: RawFd) {
    let keep = keep.max(0) as libc::c_uint;
    if keep > 0 {
        close_range(0, keep - 1);
    }
    close_range(keep + 1, libc::c_uint::MAX);
}

unsafe fn close_range(first: libc::c_uint, last: libc::c_uint) {
    if libc::syscall(SYS_CLOSE_RANGE, first, last, 0 as libc::c_uint) == 0 {
        return;
    }
    // Pre-5.9 kernels.
    let mut limit: libc::rlimit = std::mem::zeroed();
    let max = if libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) == 0 {
        limit.rlim_cur.min(65536) as libc::c_uint
    } else {
        1024
    };
    let mut fd = first;
    while fd <= last && fd < max {
        libc::close(fd as libc::c_int);
        fd += 1;
    }
}
