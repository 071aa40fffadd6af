/// Namespace isolation applied between fork and exec
///
/// Everything the child needs (paths, uid maps, mount options) is rendered
/// into owned buffers before fork. `IsolationPlan::apply` only issues raw
/// syscalls so it is safe to run inside a `pre_exec` hook.
use crate::config::types::{ExecutionError, Result};
use crate::kernel::credentials::{self, Credentials};
use crate::kernel::pidns;
use crate::kernel::rootfs::{make_root_private, mount_tmpfs, RootPlan};
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// What the running kernel lets this process do.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NamespaceSupport {
    /// Unprivileged user namespaces (or we are already root).
    pub user: bool,
    pub network: bool,
    pub mount: bool,
    /// Pid and IPC namespaces.
    pub pid: bool,
}

impl NamespaceSupport {
    pub fn none() -> Self {
        Self::default()
    }
}

const HAS_USER: i32 = 1;
const HAS_NET: i32 = 2;
const HAS_MOUNT: i32 = 4;
const HAS_PID: i32 = 8;

const SCRATCH_TMPFS_OPTS: &[u8] = b"mode=0755,size=16m\0";

/// Detect namespace support in a throwaway child.
///
/// `mount_target` must be an existing directory; the child mounts a tmpfs over
/// it inside its private namespace to prove that mounting works.
pub fn detect_support(mount_target: &Path) -> NamespaceSupport {
    let identity = IdentityMap::current();
    let Ok(target) = path_cstring(mount_target) else {
        return NamespaceSupport::none();
    };

    // SAFETY: the child only calls async-signal-safe libc functions and
    // leaves through _exit.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        log::warn!("namespace detection fork failed: {}", io::Error::last_os_error());
        return NamespaceSupport::none();
    }
    if pid == 0 {
        let mut bits = 0;
        // SAFETY: single-threaded child after fork.
        unsafe {
            if identity.enter().is_ok() {
                bits |= HAS_USER;
                if libc::unshare(libc::CLONE_NEWNET) == 0 {
                    bits |= HAS_NET;
                }
                if libc::unshare(libc::CLONE_NEWPID | libc::CLONE_NEWIPC) == 0 {
                    bits |= HAS_PID;
                }
                if libc::unshare(libc::CLONE_NEWNS) == 0
                    && make_root_private().is_ok()
                    && mount_tmpfs(&target, SCRATCH_TMPFS_OPTS, libc::MS_NOSUID | libc::MS_NODEV).is_ok()
                {
                    bits |= HAS_MOUNT;
                }
            }
            libc::_exit(bits);
        }
    }

    let mut status = 0;
    loop {
        // SAFETY: waiting on our own child.
        let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
        if rc == pid {
            break;
        }
        if rc < 0 && io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            return NamespaceSupport::none();
        }
    }
    if !libc::WIFEXITED(status) {
        return NamespaceSupport::none();
    }
    let bits = libc::WEXITSTATUS(status);
    NamespaceSupport {
        user: bits & HAS_USER != 0,
        network: bits & HAS_NET != 0,
        mount: bits & HAS_MOUNT != 0,
        pid: bits & HAS_PID != 0,
    }
}

/// User-namespace identity mapping for the current credentials.
#[derive(Clone, Debug)]
struct IdentityMap {
    /// Root already has the capabilities; no user namespace needed.
    skip: bool,
    uid_map: Vec<u8>,
    gid_map: Vec<u8>,
}

impl IdentityMap {
    fn current() -> Self {
        let uid = nix::unistd::geteuid();
        let gid = nix::unistd::getegid();
        Self {
            skip: uid.is_root(),
            uid_map: format!("{0} {0} 1\n", uid.as_raw()).into_bytes(),
            gid_map: format!("{0} {0} 1\n", gid.as_raw()).into_bytes(),
        }
    }

    /// Enter a user namespace mapping our uid/gid to themselves.
    unsafe fn enter(&self) -> io::Result<()> {
        if self.skip {
            return Ok(());
        }
        check(libc::unshare(libc::CLONE_NEWUSER))?;
        write_proc_file(b"/proc/self/setgroups\0", b"deny")?;
        write_proc_file(b"/proc/self/uid_map\0", &self.uid_map)?;
        write_proc_file(b"/proc/self/gid_map\0", &self.gid_map)
    }
}

/// Precomputed isolation steps for one child process.
#[derive(Clone, Debug)]
pub struct IsolationPlan {
    identity: IdentityMap,
    network: bool,
    processes: bool,
    root: Option<RootPlan>,
    credentials: Option<Credentials>,
}

impl IsolationPlan {
    /// `None` when no layer is requested. Credentials only apply together
    /// with a private root, where the workspace path stays reachable.
    pub fn new(
        network: bool,
        processes: bool,
        root: Option<RootPlan>,
        credentials: Option<Credentials>,
    ) -> Option<Self> {
        if !network && !processes && root.is_none() {
            return None;
        }
        let credentials = if root.is_some() { credentials } else { None };
        Some(Self {
            identity: IdentityMap::current(),
            network,
            processes,
            root,
            credentials,
        })
    }

    pub fn isolates_network(&self) -> bool {
        self.network
    }

    pub fn isolates_processes(&self) -> bool {
        self.processes
    }

    pub fn isolates_filesystem(&self) -> bool {
        self.root.is_some()
    }

    /// Enter the namespaces and rebuild the filesystem view.
    ///
    /// With a pid namespace the calling process becomes the relay described
    /// in [`pidns`] and this returns in the program process two forks down.
    ///
    /// # Safety
    /// Must run in a freshly forked, single-threaded child.
    pub unsafe fn apply(&self) -> io::Result<()> {
        self.identity.enter()?;

        let mut flags = 0;
        if self.network {
            flags |= libc::CLONE_NEWNET;
        }
        if self.root.is_some() {
            flags |= libc::CLONE_NEWNS;
        }
        if self.processes {
            flags |= libc::CLONE_NEWPID | libc::CLONE_NEWIPC;
        }
        check(libc::unshare(flags))?;

        if self.network {
            // Loopback stays usable; failure to raise it is not fatal.
            let _ = bring_up_loopback();
        }

        if self.processes {
            let report = pidns::fork_init()?;
            self.enter_root()?;
            pidns::fork_program(report)
        } else {
            self.enter_root()
        }
    }

    unsafe fn enter_root(&self) -> io::Result<()> {
        if let Some(root) = &self.root {
            root.apply()?;
        }
        credentials::drop_bounding_set();
        if let Some(credentials) = &self.credentials {
            credentials.apply()?;
        }
        // A credential change clears the parent-death signal.
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong, 0, 0, 0);
        Ok(())
    }
}

unsafe fn bring_up_loopback() -> io::Result<()> {
    let sock = libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0);
    if sock < 0 {
        return Err(io::Error::last_os_error());
    }
    let mut ifr: libc::ifreq = std::mem::zeroed();
    for (idx, b) in b"lo\0".iter().enumerate() {
        ifr.ifr_name[idx] = *b as libc::c_char;
    }
    let mut rc = libc::ioctl(sock, libc::SIOCGIFFLAGS as _, &mut ifr);
    if rc == 0 {
        ifr.ifr_ifru.ifru_flags |= libc::IFF_UP as libc::c_short;
        rc = libc::ioctl(sock, libc::SIOCSIFFLAGS as _, &ifr);
    }
    let err = io::Error::last_os_error();
    libc::close(sock);
    if rc != 0 {
        return Err(err);
    }
    Ok(())
}

unsafe fn write_proc_file(path: &[u8], contents: &[u8]) -> io::Result<()> {
    let fd = libc::open(path.as_ptr() as *const libc::c_char, libc::O_WRONLY | libc::O_CLOEXEC);
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let written = libc::write(fd, contents.as_ptr() as *const libc::c_void, contents.len());
    let err = io::Error::last_os_error();
    libc::close(fd);
    if written != contents.len() as isize {
        return Err(err);
    }
    Ok(())
}

/// Render `/proc/self/fd/<fd>` into `buf` without allocating.
pub(crate) fn fd_path(fd: libc::c_int, buf: &mut [u8; 48]) -> &[u8] {
    const PREFIX: &[u8] = b"/proc/self/fd/";
    buf[..PREFIX.len()].copy_from_slice(PREFIX);
    let mut digits = [0u8; 12];
    let mut n = fd.max(0) as u32;
    let mut count = 0;
    loop {
        digits[count] = b'0' + (n % 10) as u8;
        count += 1;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    let mut at = PREFIX.len();
    for i in (0..count).rev() {
        buf[at] = digits[i];
        at += 1;
    }
    buf[at] = 0;
    &buf[..=at]
}

pub(crate) fn check(rc: libc::c_int) -> io::Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

pub(crate) fn path_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        ExecutionError::Sandbox(format!("path contains a NUL byte: {}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::rootfs::RootLayout;

    #[test]
    fn test_fd_path_rendering() {
        let mut buf = [0u8; 48];
        assert_eq!(fd_path(7, &mut buf), b"/proc/self/fd/7\0");
        let mut buf = [0u8; 48];
        assert_eq!(fd_path(1024, &mut buf), b"/proc/self/fd/1024\0");
    }

    #[test]
    fn test_plan_is_none_without_layers() {
        assert!(IsolationPlan::new(false, false, None, None).is_none());
        let plan = IsolationPlan::new(false, true, None, None).expect("plan");
        assert!(plan.isolates_processes());
        assert!(!plan.isolates_filesystem());
    }

    #[test]
    fn test_credentials_need_a_private_root() {
        let nobody = Credentials::new(65534, 65534).expect("credentials");
        let plan = IsolationPlan::new(true, true, None, Some(nobody)).expect("plan");
        assert!(plan.credentials.is_none());

        let dir = tempfile::tempdir().expect("tempdir");
        let scratch = dir.path().canonicalize().expect("canonical");
        let workspace = scratch.join("ws-1");
        std::fs::create_dir_all(&workspace).expect("mkdir");
        let root = RootLayout::detect(&scratch, &[], "")
            .and_then(|layout| layout.for_workspace(&workspace, &workspace, true))
            .expect("root");
        let plan = IsolationPlan::new(false, true, Some(root), Some(nobody)).expect("plan");
        assert_eq!(plan.credentials, Some(nobody));
        assert!(plan.isolates_filesystem());
    }

    #[test]
    fn test_detect_support_does_not_panic() {
        let root = tempfile::tempdir().expect("tempdir");
        let support = detect_support(root.path());
        if support.mount || support.network || support.pid {
            assert!(support.user);
        }
    }
}
