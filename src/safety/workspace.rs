/// Per-request workspaces under a shared scratch root
///
/// Each request gets a fresh `ws-<uuid>` directory with owner-only
/// permissions. The workspace is removed on `release` or, failing that,
/// when it is dropped.
use crate::config::types::{ExecutionError, Result};
use crate::safety::safe_cleanup;
use std::fs::{self, DirBuilder};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

const PREFIX: &str = "ws-";

/// A request's private directory.
#[derive(Debug)]
pub struct Workspace {
    id: String,
    root: PathBuf,
    released: bool,
    live: Arc<AtomicUsize>,
}

impl Workspace {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// `TMPDIR` for programs.
    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Install target for interpreter-local dependencies.
    pub fn deps_dir(&self) -> PathBuf {
        self.root.join(".deps")
    }

    /// Write `contents` to a file directly inside the workspace.
    pub fn write_file(&self, name: &str, contents: &[u8]) -> Result<PathBuf> {
        let mut components = Path::new(name).components();
        let valid = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !valid {
            return Err(ExecutionError::Validation(format!(
                "workspace file name must be a single path component: {name}"
            )));
        }

        let path = self.root.join(name);
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)
            .map_err(|e| ExecutionError::resource(format!("failed to create {}", path.display()), e))?;
        file.write_all(contents)
            .map_err(|e| ExecutionError::resource(format!("failed to write {}", path.display()), e))?;
        Ok(path)
    }

    /// Make a subdirectory (and parents) inside the workspace.
    pub fn create_dir(&self, relative: &Path) -> Result<PathBuf> {
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(ExecutionError::Validation(format!(
                "workspace directory must be relative: {}",
                relative.display()
            )));
        }
        let path = self.root.join(relative);
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&path)
            .map_err(|e| ExecutionError::resource(format!("failed to create {}", path.display()), e))?;
        Ok(path)
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Remove the workspace tree. Calling this again is a no-op.
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        safe_cleanup::remove_tree_secure(&self.root)?;
        self.released = true;
        self.live.fetch_sub(1, Ordering::SeqCst);
        log::debug!("[{}] workspace removed", self.id);
        Ok(())
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("[{}] workspace cleanup failed: {}", self.id, e);
        }
    }
}

/// Creates workspaces and sweeps stale ones.
#[derive(Debug)]
pub struct WorkspaceManager {
    root: PathBuf,
    min_free_bytes: u64,
    live: Arc<AtomicUsize>,
}

impl WorkspaceManager {
    /// Prepare the scratch root: create it owner-only and prove it is writable.
    pub fn new(root: &Path, min_free_bytes: u64) -> Result<Self> {
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(root)
            .map_err(|e| ExecutionError::Config(format!("scratch root {}: {}", root.display(), e)))?;
        fs::set_permissions(root, fs::Permissions::from_mode(0o700)).map_err(|e| {
            ExecutionError::Config(format!("scratch root {} permissions: {}", root.display(), e))
        })?;
        let root = root
            .canonicalize()
            .map_err(|e| ExecutionError::Config(format!("scratch root {}: {}", root.display(), e)))?;

        let marker = root.join(format!(".writable-{}", Uuid::new_v4().simple()));
        fs::create_dir(&marker)
            .and_then(|_| fs::remove_dir(&marker))
            .map_err(|e| {
                ExecutionError::Config(format!("scratch root {} is not writable: {}", root.display(), e))
            })?;

        Ok(Self {
            root,
            min_free_bytes,
            live: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Workspaces acquired by this manager and not yet released.
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Create a fresh, empty workspace.
    pub fn acquire(&self) -> Result<Workspace> {
        self.check_free_space()?;

        let mut attempts = 0;
        let (id, path) = loop {
            let id = format!("{PREFIX}{}", Uuid::new_v4().simple());
            let path = self.root.join(&id);
            match DirBuilder::new().mode(0o700).create(&path) {
                Ok(()) => break (id, path),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists && attempts == 0 => {
                    attempts += 1;
                }
                Err(e) => {
                    return Err(ExecutionError::resource(
                        format!("failed to create workspace in {}", self.root.display()),
                        e,
                    ))
                }
            }
        };

        self.live.fetch_add(1, Ordering::SeqCst);
        let workspace = Workspace {
            id,
            root: path,
            released: false,
            live: Arc::clone(&self.live),
        };
        workspace.create_dir(Path::new("tmp"))?;
        log::debug!("[{}] workspace created at {}", workspace.id, workspace.root.display());
        Ok(workspace)
    }

    fn check_free_space(&self) -> Result<()> {
        if self.min_free_bytes == 0 {
            return Ok(());
        }
        let stat = nix::sys::statvfs::statvfs(&self.root)
            .map_err(|e| ExecutionError::Resource(format!("statvfs {}: {}", self.root.display(), e)))?;
        let free = stat.blocks_available() as u64 * stat.fragment_size() as u64;
        if free < self.min_free_bytes {
            return Err(ExecutionError::Resource(format!(
                "scratch filesystem has {} bytes free, need {}",
                free, self.min_free_bytes
            )));
        }
        Ok(())
    }

    /// Names of every workspace directory currently on disk.
    pub fn list(&self) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.root)
            .map_err(|e| ExecutionError::resource(format!("failed to read {}", self.root.display()), e))?;
        let mut names: Vec<String> = entries
            .flatten()
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| name.starts_with(PREFIX))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Remove workspaces older than `max_age`, left behind by crashed runs.
    pub fn sweep_stale(&self, max_age: Duration) -> Result<usize> {
        let now = SystemTime::now();
        let mut removed = 0;
        for name in self.list()? {
            let path = self.root.join(&name);
            let modified = match fs::symlink_metadata(&path).and_then(|m| m.modified()) {
                Ok(m) => m,
                Err(e) => {
                    log::warn!("skipping {}: {}", path.display(), e);
                    continue;
                }
            };
            let Ok(age) = now.duration_since(modified) else {
                continue;
            };
            if age < max_age {
                continue;
            }
            match safe_cleanup::remove_tree_secure(&path) {
                Ok(()) => {
                    log::info!("removed stale workspace {}", path.display());
                    removed += 1;
                }
                Err(e) => log::warn!("failed to remove stale workspace {}: {}", path.display(), e),
            }
        }
        Ok(removed)
    }
}
