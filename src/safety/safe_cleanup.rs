/// Symlink-safe recursive removal
///
/// Every step is relative to an open directory descriptor and never follows
/// symlinks, so a program that plants links in its workspace cannot redirect
/// cleanup onto host files.
use crate::config::types::{ExecutionError, Result};
use nix::dir::Dir;
use nix::errno::Errno;
use nix::fcntl::{AtFlags, OFlag};
use nix::sys::stat::{fchmodat, fstatat, FchmodatFlags, Mode, SFlag};
use nix::unistd::{unlinkat, UnlinkatFlags};
use std::ffi::{CStr, CString};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

fn dir_flags() -> OFlag {
    OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC
}

fn cleanup_error(what: &str, name: &CStr, err: Errno) -> ExecutionError {
    ExecutionError::Resource(format!("{what} failed for {:?}: {}", name, err))
}

/// Open `name` below `parent`, restoring owner permissions if the program
/// stripped them.
fn open_child_dir(parent: RawFd, name: &CStr) -> Result<Dir> {
    match Dir::openat(parent, name, dir_flags(), Mode::empty()) {
        Ok(dir) => Ok(dir),
        Err(Errno::EACCES) => {
            // Already verified to be a directory, not a link.
            fchmodat(Some(parent), name, Mode::S_IRWXU, FchmodatFlags::FollowSymlink)
                .map_err(|e| cleanup_error("chmod", name, e))?;
            Dir::openat(parent, name, dir_flags(), Mode::empty())
                .map_err(|e| cleanup_error("openat", name, e))
        }
        Err(e) => Err(cleanup_error("openat", name, e)),
    }
}

fn remove_dir_contents(dir: &mut Dir, root_dev: u64) -> Result<()> {
    let fd = dir.as_raw_fd();
    // Collect first; unlinking while reading the same stream is unspecified.
    let mut names: Vec<CString> = Vec::new();
    for entry in dir.iter() {
        let entry = entry.map_err(|e| ExecutionError::Resource(format!("readdir failed: {e}")))?;
        let name = entry.file_name();
        if name.to_bytes() != b"." && name.to_bytes() != b".." {
            names.push(name.to_owned());
        }
    }

    for name in names {
        let st = match fstatat(fd, name.as_c_str(), AtFlags::AT_SYMLINK_NOFOLLOW) {
            Ok(st) => st,
            Err(Errno::ENOENT) => continue,
            Err(e) => return Err(cleanup_error("fstatat", &name, e)),
        };
        if SFlag::from_bits_truncate(st.st_mode) & SFlag::S_IFMT == SFlag::S_IFDIR {
            if st.st_dev as u64 != root_dev {
                return Err(ExecutionError::Resource(format!(
                    "refusing to cross a filesystem boundary at {:?}",
                    name
                )));
            }
            let mut child = open_child_dir(fd, &name)?;
            remove_dir_contents(&mut child, root_dev)?;
            drop(child);
            unlinkat(Some(fd), name.as_c_str(), UnlinkatFlags::RemoveDir)
                .map_err(|e| cleanup_error("rmdir", &name, e))?;
        } else {
            match unlinkat(Some(fd), name.as_c_str(), UnlinkatFlags::NoRemoveDir) {
                Ok(()) | Err(Errno::ENOENT) => {}
                Err(e) => return Err(cleanup_error("unlink", &name, e)),
            }
        }
    }
    Ok(())
}

/// Remove `path` and everything below it without following symlinks.
///
/// Missing paths are not an error, so calling this twice is harmless.
pub fn remove_tree_secure(path: &Path) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        ExecutionError::Resource(format!("cannot remove {} without a parent", path.display()))
    })?;
    let name = path.file_name().ok_or_else(|| {
        ExecutionError::Resource(format!("cannot remove {} without a file name", path.display()))
    })?;
    let name = CString::new(name.as_bytes()).map_err(|_| {
        ExecutionError::Resource(format!("path contains a NUL byte: {}", path.display()))
    })?;

    let parent_dir = match Dir::open(parent, dir_flags(), Mode::empty()) {
        Ok(dir) => dir,
        Err(Errno::ENOENT) => return Ok(()),
        Err(e) => {
            return Err(ExecutionError::Resource(format!(
                "failed to open {}: {}",
                parent.display(),
                e
            )))
        }
    };
    let parent_fd = parent_dir.as_raw_fd();

    let st = match fstatat(parent_fd, name.as_c_str(), AtFlags::AT_SYMLINK_NOFOLLOW) {
        Ok(st) => st,
        Err(Errno::ENOENT) => return Ok(()),
        Err(e) => return Err(cleanup_error("fstatat", &name, e)),
    };

    if SFlag::from_bits_truncate(st.st_mode) & SFlag::S_IFMT == SFlag::S_IFDIR {
        let mut dir = open_child_dir(parent_fd, &name)?;
        remove_dir_contents(&mut dir, st.st_dev as u64)?;
        drop(dir);
        unlinkat(Some(parent_fd), name.as_c_str(), UnlinkatFlags::RemoveDir)
            .map_err(|e| cleanup_error("rmdir", &name, e))
    } else {
        unlinkat(Some(parent_fd), name.as_c_str(), UnlinkatFlags::NoRemoveDir)
            .map_err(|e| cleanup_error("unlink", &name, e))
    }
}
