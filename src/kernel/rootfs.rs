/// Minimal read-only root filesystem for sandboxed programs
///
/// The new root is a tmpfs mounted over the scratch root inside the child's
/// mount namespace. System directories are bound into it read-only, `/dev`,
/// `/dev/shm` and `/tmp` are fresh per run, and the workspace is the only
/// writable host directory. Everything is rendered into [`Step`]s before
/// fork; [`RootPlan::apply`] only issues syscalls.
use crate::config::types::{ExecutionError, Result};
use crate::kernel::namespace::{check, fd_path, path_cstring};
use std::collections::HashSet;
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};

/// Directories bound read-only when the configuration does not list any.
pub const DEFAULT_SYSTEM_PATHS: &[&str] = &[
    "/usr",
    "/bin",
    "/sbin",
    "/lib",
    "/lib32",
    "/lib64",
    "/libx32",
    "/etc",
    "/opt",
    "/var/lib",
    "/run/systemd/resolve",
];

const DEVICES: &[&str] = &["null", "zero", "full", "random", "urandom"];
const DEV_LINKS: &[(&str, &str)] = &[
    ("fd", "/proc/self/fd"),
    ("stdin", "/proc/self/fd/0"),
    ("stdout", "/proc/self/fd/1"),
    ("stderr", "/proc/self/fd/2"),
];

const ROOT_OPTS: &[u8] = b"mode=0755,size=1m\0";
const DEV_OPTS: &[u8] = b"mode=0755,size=64k\0";
const SHM_OPTS: &[u8] = b"mode=1777,size=64m\0";
const TMP_OPTS: &[u8] = b"mode=1777,size=64m\0";
const SCRATCH_OPTS: &[u8] = b"mode=0755,size=1m\0";

const SYS_MOUNT_SETATTR: libc::c_long = 442;
const AT_RECURSIVE: libc::c_uint = 0x8000;
const MOUNT_ATTR_RDONLY: u64 = 0x1;
const MOUNT_ATTR_NOSUID: u64 = 0x2;
const MOUNT_ATTR_NODEV: u64 = 0x4;

#[repr(C)]
struct MountAttr {
    attr_set: u64,
    attr_clr: u64,
    propagation: u64,
    userns_fd: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Step {
    /// `mkdir` with mode 0755; an existing directory is fine.
    Mkdir(CString),
    /// Empty file used as a bind target for a device node.
    Touch(CString),
    Tmpfs {
        target: CString,
        opts: &'static [u8],
        flags: libc::c_ulong,
    },
    /// Recursive bind of a host directory, then read-only for every submount.
    BindReadOnly { source: CString, target: CString },
    BindDevice { source: CString, target: CString },
    Symlink { contents: CString, link: CString },
    /// Fresh procfs for the run's pid namespace. Left empty if refused.
    Proc(CString),
    /// Bind the workspace, held open by descriptor, onto this path.
    Workspace(CString),
    /// Make a mount we created read-only, keeping its other flags.
    Seal { target: CString, flags: libc::c_ulong },
}

/// Host-dependent part of the root, computed once per runner.
#[derive(Clone, Debug)]
pub struct RootLayout {
    new_root: PathBuf,
    system: Vec<Step>,
    created: HashSet<PathBuf>,
}

impl RootLayout {
    /// Describe the root for programs started with `path_env`.
    ///
    /// Missing system paths are skipped. Toolchain directories on `PATH`
    /// outside the system paths are bound as well; for `.../bin` the parent
    /// is bound so sibling `lib` directories come along.
    pub fn detect(scratch_root: &Path, system_paths: &[PathBuf], path_env: &str) -> Result<Self> {
        let mut layout = Self {
            new_root: scratch_root.to_path_buf(),
            system: Vec::new(),
            created: HashSet::new(),
        };
        layout.system.push(Step::Tmpfs {
            target: path_cstring(scratch_root)?,
            opts: ROOT_OPTS,
            flags: libc::MS_NOSUID | libc::MS_NODEV,
        });

        let mut binds = Vec::new();
        for path in system_paths {
            let Ok(meta) = std::fs::symlink_metadata(path) else {
                continue;
            };
            if meta.file_type().is_symlink() {
                let contents = std::fs::read_link(path)
                    .map_err(|e| ExecutionError::Sandbox(format!("readlink {}: {}", path.display(), e)))?;
                layout.ensure_parent(path)?;
                layout.system.push(Step::Symlink {
                    contents: path_cstring(&contents)?,
                    link: path_cstring(&layout.rooted(path))?,
                });
            } else if meta.is_dir() {
                binds.push(path.clone());
            }
        }
        let covered: Vec<PathBuf> = binds
            .iter()
            .filter_map(|p| p.canonicalize().ok())
            .chain(binds.iter().cloned())
            .collect();
        binds.extend(toolchain_dirs(path_env, &covered, scratch_root));
        for path in outermost(binds) {
            layout.ensure_dir(&path)?;
            layout.system.push(Step::BindReadOnly {
                source: path_cstring(&path)?,
                target: path_cstring(&layout.rooted(&path))?,
            });
        }

        layout.push_dev()?;

        let tmp = layout.rooted(Path::new("/tmp"));
        layout.ensure_dir(Path::new("/tmp"))?;
        layout.system.push(Step::Tmpfs {
            target: path_cstring(&tmp)?,
            opts: TMP_OPTS,
            flags: libc::MS_NOSUID | libc::MS_NODEV,
        });
        Ok(layout)
    }

    fn push_dev(&mut self) -> Result<()> {
        let dev = Path::new("/dev");
        self.ensure_dir(dev)?;
        let dev_target = path_cstring(&self.rooted(dev))?;
        let dev_flags = libc::MS_NOSUID | libc::MS_NOEXEC;
        self.system.push(Step::Tmpfs {
            target: dev_target.clone(),
            opts: DEV_OPTS,
            flags: dev_flags,
        });
        for name in DEVICES {
            let host = dev.join(name);
            if !host.exists() {
                continue;
            }
            let target = path_cstring(&self.rooted(&host))?;
            self.system.push(Step::Touch(target.clone()));
            self.system.push(Step::BindDevice {
                source: path_cstring(&host)?,
                target,
            });
        }
        for (name, contents) in DEV_LINKS {
            self.system.push(Step::Symlink {
                contents: path_cstring(Path::new(contents))?,
                link: path_cstring(&self.rooted(&dev.join(name)))?,
            });
        }
        let shm = path_cstring(&self.rooted(&dev.join("shm")))?;
        self.system.push(Step::Mkdir(shm.clone()));
        self.system.push(Step::Tmpfs {
            target: shm,
            opts: SHM_OPTS,
            flags: libc::MS_NOSUID | libc::MS_NODEV,
        });
        self.system.push(Step::Seal {
            target: dev_target,
            flags: dev_flags,
        });
        Ok(())
    }

    /// Add the per-run part: the workspace chain and the final seal.
    ///
    /// `fresh_proc` mounts procfs; only meaningful inside a new pid namespace.
    pub fn for_workspace(&self, workspace: &Path, workdir: &Path, fresh_proc: bool) -> Result<RootPlan> {
        if !workdir.starts_with(workspace) {
            return Err(ExecutionError::Sandbox(format!(
                "working directory {} is outside workspace {}",
                workdir.display(),
                workspace.display()
            )));
        }
        let scratch = self.new_root.as_path();
        let below = workspace.strip_prefix(scratch).map_err(|_| {
            ExecutionError::Sandbox(format!(
                "workspace {} is outside scratch root {}",
                workspace.display(),
                scratch.display()
            ))
        })?;

        let mut run = Self {
            new_root: self.new_root.clone(),
            system: self.system.clone(),
            created: self.created.clone(),
        };
        if fresh_proc {
            let proc = Path::new("/proc");
            run.ensure_dir(proc)?;
            run.system.push(Step::Proc(path_cstring(&run.rooted(proc))?));
        }

        run.ensure_dir(scratch)?;
        let inner = path_cstring(&run.rooted(scratch))?;
        run.system.push(Step::Tmpfs {
            target: inner.clone(),
            opts: SCRATCH_OPTS,
            flags: libc::MS_NOSUID | libc::MS_NODEV,
        });
        let mut current = scratch.to_path_buf();
        for component in below.components() {
            current.push(component);
            run.system.push(Step::Mkdir(path_cstring(&run.rooted(&current))?));
        }
        run.system.push(Step::Workspace(path_cstring(&run.rooted(workspace))?));
        run.system.push(Step::Seal {
            target: inner,
            flags: libc::MS_NOSUID | libc::MS_NODEV,
        });
        run.system.push(Step::Seal {
            target: path_cstring(&run.new_root)?,
            flags: libc::MS_NOSUID | libc::MS_NODEV,
        });

        Ok(RootPlan {
            steps: run.system,
            new_root: path_cstring(&run.new_root)?,
            workspace: path_cstring(workspace)?,
            workdir: path_cstring(workdir)?,
        })
    }

    fn rooted(&self, path: &Path) -> PathBuf {
        self.new_root.join(path.strip_prefix("/").unwrap_or(path))
    }

    fn ensure_parent(&mut self, path: &Path) -> Result<()> {
        match path.parent() {
            Some(parent) => self.ensure_dir(parent),
            None => Ok(()),
        }
    }

    /// Queue `mkdir` for `path` and its ancestors under the new root.
    fn ensure_dir(&mut self, path: &Path) -> Result<()> {
        let mut current = PathBuf::from("/");
        for component in path.components() {
            if let Component::Normal(name) = component {
                current.push(name);
                if self.created.insert(current.clone()) {
                    self.system.push(Step::Mkdir(path_cstring(&self.rooted(&current))?));
                }
            }
        }
        Ok(())
    }
}

/// `PATH` entries not already covered by a system bind.
fn toolchain_dirs(path_env: &str, covered: &[PathBuf], scratch_root: &Path) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    for entry in std::env::split_paths(path_env) {
        if !entry.is_absolute() || !entry.is_dir() {
            continue;
        }
        let canonical = entry.canonicalize().unwrap_or_else(|_| entry.clone());
        for candidate in [entry, canonical] {
            let dir = match candidate.file_name().map(|n| n.as_bytes()) {
                Some(b"bin") | Some(b"sbin") => candidate.parent().map(Path::to_path_buf).unwrap_or(candidate),
                _ => candidate,
            };
            if dir.parent().is_none()
                || dir.starts_with(scratch_root)
                || covered.iter().any(|c| dir.starts_with(c))
            {
                continue;
            }
            dirs.push(dir);
        }
    }
    dirs
}

/// Drop entries nested inside another entry; a recursive bind already has them.
fn outermost(mut paths: Vec<PathBuf>) -> Vec<PathBuf> {
    paths.sort_by_key(|p| p.components().count());
    let mut kept: Vec<PathBuf> = Vec::new();
    for path in paths {
        if !kept.iter().any(|outer| path.starts_with(outer)) {
            kept.push(path);
        }
    }
    kept
}

/// Mount script for one run.
#[derive(Clone, Debug)]
pub struct RootPlan {
    steps: Vec<Step>,
    new_root: CString,
    workspace: CString,
    workdir: CString,
}

impl RootPlan {
    /// Build the root, `chroot` into it and enter the working directory.
    ///
    /// # Safety
    /// Must run in a single-threaded child inside a private mount namespace.
    pub unsafe fn apply(&self) -> io::Result<()> {
        make_root_private()?;

        // Open before the scratch root is covered.
        let fd = libc::open(
            self.workspace.as_ptr(),
            libc::O_PATH | libc::O_DIRECTORY | libc::O_CLOEXEC,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let result = self.run_steps(fd);
        libc::close(fd);
        result?;

        check(libc::chroot(self.new_root.as_ptr()))?;
        check(libc::chdir(self.workdir.as_ptr()))
    }

    unsafe fn run_steps(&self, workspace_fd: libc::c_int) -> io::Result<()> {
        for step in &self.steps {
            match step {
                Step::Mkdir(path) => {
                    if libc::mkdir(path.as_ptr(), 0o755) != 0 {
                        let err = io::Error::last_os_error();
                        if err.raw_os_error() != Some(libc::EEXIST) {
                            return Err(err);
                        }
                    }
                }
                Step::Touch(path) => {
                    let fd = libc::open(
                        path.as_ptr(),
                        libc::O_CREAT | libc::O_WRONLY | libc::O_CLOEXEC,
                        0o644 as libc::c_uint,
                    );
                    if fd < 0 {
                        return Err(io::Error::last_os_error());
                    }
                    libc::close(fd);
                }
                Step::Tmpfs { target, opts, flags } => mount_tmpfs(target, opts, *flags)?,
                Step::BindReadOnly { source, target } => {
                    bind(source.as_ptr(), target, libc::MS_REC)?;
                    seal_recursive(target)?;
                }
                Step::BindDevice { source, target } => bind(source.as_ptr(), target, 0)?,
                Step::Symlink { contents, link } => {
                    if libc::symlink(contents.as_ptr(), link.as_ptr()) != 0 {
                        let err = io::Error::last_os_error();
                        if err.raw_os_error() != Some(libc::EEXIST) {
                            return Err(err);
                        }
                    }
                }
                Step::Proc(target) => {
                    // Refused under a masked host /proc; the host's is never bound.
                    let _ = check(libc::mount(
                        b"proc\0".as_ptr() as *const libc::c_char,
                        target.as_ptr(),
                        b"proc\0".as_ptr() as *const libc::c_char,
                        libc::MS_NOSUID | libc::MS_NODEV | libc::MS_NOEXEC,
                        std::ptr::null(),
                    ));
                }
                Step::Workspace(target) => {
                    let mut buf = [0u8; 48];
                    let source = fd_path(workspace_fd, &mut buf);
                    bind(source.as_ptr() as *const libc::c_char, target, libc::MS_REC)?;
                }
                Step::Seal { target, flags } => check(libc::mount(
                    std::ptr::null(),
                    target.as_ptr(),
                    std::ptr::null(),
                    libc::MS_REMOUNT | libc::MS_BIND | libc::MS_RDONLY | *flags,
                    std::ptr::null(),
                ))?,
            }
        }
        Ok(())
    }
}

pub(crate) unsafe fn make_root_private() -> io::Result<()> {
    check(libc::mount(
        std::ptr::null(),
        b"/\0".as_ptr() as *const libc::c_char,
        std::ptr::null(),
        libc::MS_REC | libc::MS_PRIVATE,
        std::ptr::null(),
    ))
}

pub(crate) unsafe fn mount_tmpfs(target: &CString, opts: &[u8], flags: libc::c_ulong) -> io::Result<()> {
    check(libc::mount(
        b"tmpfs\0".as_ptr() as *const libc::c_char,
        target.as_ptr(),
        b"tmpfs\0".as_ptr() as *const libc::c_char,
        flags,
        opts.as_ptr() as *const libc::c_void,
    ))
}

unsafe fn bind(source: *const libc::c_char, target: &CString, extra: libc::c_ulong) -> io::Result<()> {
    check(libc::mount(
        source,
        target.as_ptr(),
        std::ptr::null(),
        libc::MS_BIND | extra,
        std::ptr::null(),
    ))
}

/// Read-only for the bind and everything below it.
///
/// Older kernels without `mount_setattr` only get the top mount remounted,
/// preserving the flags a user namespace may not clear.
unsafe fn seal_recursive(target: &CString) -> io::Result<()> {
    let attr = MountAttr {
        attr_set: MOUNT_ATTR_RDONLY | MOUNT_ATTR_NOSUID | MOUNT_ATTR_NODEV,
        attr_clr: 0,
        propagation: 0,
        userns_fd: 0,
    };
    let rc = libc::syscall(
        SYS_MOUNT_SETATTR,
        libc::AT_FDCWD,
        target.as_ptr(),
        AT_RECURSIVE,
        &attr as *const MountAttr,
        std::mem::size_of::<MountAttr>(),
    );
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::ENOSYS) {
        return Err(err);
    }

    let mut stat: libc::statvfs = std::mem::zeroed();
    check(libc::statvfs(target.as_ptr(), &mut stat))?;
    let keep = (libc::MS_NOSUID
        | libc::MS_NODEV
        | libc::MS_NOEXEC
        | libc::MS_NOATIME
        | libc::MS_NODIRATIME
        | libc::MS_RELATIME) as u64;
    let flags = (stat.f_flag as u64 & keep) as libc::c_ulong;
    check(libc::mount(
        std::ptr::null(),
        target.as_ptr(),
        std::ptr::null(),
        libc::MS_REMOUNT | libc::MS_BIND | libc::MS_RDONLY | flags,
        std::ptr::null(),
    ))
}
