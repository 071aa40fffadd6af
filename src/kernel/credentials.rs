//! Leaving root before untrusted code runs.
//!
//! setresgid must come before setresuid; once the uid is dropped the gid
//! can no longer be changed.

use crate::config::types::{ExecutionError, Result};
use std::io;
use std::path::Path;
use walkdir::WalkDir;

/// Highest capability number the kernel may define; unknown ones are ignored.
const MAX_CAP: libc::c_ulong = 63;

/// Unprivileged identity for sandboxed processes started by root.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Credentials {
    uid: u32,
    gid: u32,
}

impl Credentials {
    pub fn new(uid: u32, gid: u32) -> Result<Self> {
        if uid == 0 || gid == 0 {
            return Err(ExecutionError::Config(format!(
                "sandbox identity must not be root (uid={uid}, gid={gid})"
            )));
        }
        Ok(Self { uid, gid })
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }

    /// Clear supplementary groups, then switch gid and uid.
    ///
    /// # Safety
    /// Pre-exec context: only raw syscalls.
    pub unsafe fn apply(&self) -> io::Result<()> {
        clear_ambient();
        if libc::setgroups(0, std::ptr::null()) != 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::setresgid(self.gid, self.gid, self.gid) != 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::setresuid(self.uid, self.uid, self.uid) != 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::geteuid() != self.uid || libc::getegid() != self.gid {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        Ok(())
    }

    /// Give the tree at `root` to this identity so the program can write it.
    pub fn hand_over(&self, root: &Path) -> Result<()> {
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = entry.map_err(|e| {
                ExecutionError::resource(format!("walking {}", root.display()), io::Error::from(e))
            })?;
            std::os::unix::fs::lchown(entry.path(), Some(self.uid), Some(self.gid)).map_err(|e| {
                ExecutionError::resource(format!("chown {}", entry.path().display()), e)
            })?;
        }
        Ok(())
    }
}

/// Empty the capability bounding set so no later exec can regain privileges.
/// Fails quietly for capabilities the kernel does not know.
///
/// # Safety
/// Pre-exec context: only raw syscalls.
pub unsafe fn drop_bounding_set() {
    for cap in 0..=MAX_CAP {
        libc::prctl(libc::PR_CAPBSET_DROP, cap, 0, 0, 0);
    }
}

unsafe fn clear_ambient() {
    // Kernels before 4.3 have no ambient set.
    libc::prctl(libc::PR_CAP_AMBIENT, libc::PR_CAP_AMBIENT_CLEAR_ALL, 0, 0, 0);
}
