//! Ephemeral per-run workspace.
//!
//! Holds everything a run renders: the proxy admission rules, the
//! redirection rules, the host rules, the session CA and the access log. The
//! directory is `0700`, files are `0600`, and an `owner.pid` marker lets a
//! later sweep tell live workspaces from abandoned ones.
//!
//! A workspace is assembled under a hidden staging name,
//! `.run-<id>-workspace.<pid>`, and renamed into place only once the marker
//! is written. A sweep therefore never sees a workspace without an owner
//! that is still being created.
//!
//! The directory is removed when the [`Workspace`] is dropped, unless
//! [`hand_over`](Workspace::hand_over) passed that job on.

use super::error::WorkspaceError;
use super::naming::{ResourceRole, SessionId};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// File recording the PID of the owning process.
pub const OWNER_FILE: &str = "owner.pid";
/// Subdirectory for the session CA.
pub const CA_DIR: &str = "ca";
/// Subdirectory for proxy access records.
pub const LOGS_DIR: &str = "logs";

/// A run's workspace directory.
#[derive(Debug)]
pub struct Workspace {
    id: SessionId,
    path: PathBuf,
    handed_over: bool,
    removed: bool,
}

impl Workspace {
    /// Create `$TMPDIR/run-<id>-workspace`.
    pub fn create(id: &SessionId) -> Result<Self, WorkspaceError> {
        Self::create_in(&std::env::temp_dir(), id)
    }

    /// Create the workspace under `root`.
    ///
    /// # Errors
    ///
    /// [`WorkspaceError::Exists`] if a workspace with this id is already
    /// there, which means the id collided with another run.
    pub fn create_in(root: &Path, id: &SessionId) -> Result<Self, WorkspaceError> {
        let path = root.join(id.workspace_dir_name());
        if path.symlink_metadata().is_ok() {
            return Err(WorkspaceError::Exists(path));
        }

        let pid = std::process::id();
        let staging = root.join(staging_name(id, pid));
        // A leftover with our own PID in its name is from a dead process
        // whose PID was reused.
        remove_dir(&staging)?;
        if let Err(e) = stage(&staging, pid) {
            let _ = remove_dir(&staging);
            return Err(e);
        }
        if let Err(source) = fs::rename(&staging, &path) {
            let _ = remove_dir(&staging);
            return Err(match source.raw_os_error() {
                Some(libc::EEXIST | libc::ENOTEMPTY) => WorkspaceError::Exists(path),
                _ => WorkspaceError::Create { path, source },
            });
        }

        info!("Created workspace {:?}", path);
        Ok(Self {
            id: id.clone(),
            path,
            handed_over: false,
            removed: false,
        })
    }

    /// Session this workspace belongs to.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Root of the workspace.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of a file directly inside the workspace.
    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// `<workspace>/ca`
    pub fn ca_dir(&self) -> PathBuf {
        self.path.join(CA_DIR)
    }

    /// `<workspace>/logs`
    pub fn logs_dir(&self) -> PathBuf {
        self.path.join(LOGS_DIR)
    }

    /// Write `contents` to `name` with mode `0600`.
    pub fn write_file(&self, name: &str, contents: &str) -> Result<PathBuf, WorkspaceError> {
        let path = self.file(name);
        write_private(&path, contents).map_err(|source| WorkspaceError::Write {
            path: path.clone(),
            source,
        })?;
        debug!("Wrote {:?} ({} bytes)", path, contents.len());
        Ok(path)
    }

    /// Stop removing the directory on drop; whoever called this removes
    /// or keeps it.
    pub fn hand_over(&mut self) {
        debug!("Removal of {:?} handed over", self.path);
        self.handed_over = true;
    }

    /// Remove the workspace now. Removing twice is not an error.
    pub fn remove(&mut self) -> Result<(), WorkspaceError> {
        self.removed = true;
        remove_dir(&self.path)
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.handed_over || self.removed {
            return;
        }
        if let Err(e) = remove_dir(&self.path) {
            warn!("{}", e);
        }
    }
}

/// Remove a workspace directory, treating a missing directory as success.
pub fn remove_dir(path: &Path) -> Result<(), WorkspaceError> {
    match fs::remove_dir_all(path) {
        Ok(()) => {
            debug!("Removed workspace {:?}", path);
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(source) => Err(WorkspaceError::Remove {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Hidden name a workspace is assembled under before it is renamed.
fn staging_name(id: &SessionId, pid: u32) -> String {
    format!(".{}.{pid}", id.workspace_dir_name())
}

/// Session and creating PID of a staging directory name.
pub fn parse_staging_name(name: &str) -> Option<(SessionId, u32)> {
    let (dir, pid) = name.strip_prefix('.')?.rsplit_once('.')?;
    match SessionId::from_resource_name(dir)? {
        (id, ResourceRole::Workspace) => Some((id, pid.parse().ok()?)),
        _ => None,
    }
}

/// Build the workspace contents in `staging`.
fn stage(staging: &Path, pid: u32) -> Result<(), WorkspaceError> {
    let create = |path: &Path| {
        fs::DirBuilder::new()
            .mode(0o700)
            .create(path)
            .map_err(|source| WorkspaceError::Create {
                path: path.to_path_buf(),
                source,
            })
    };
    create(staging)?;
    let owner = staging.join(OWNER_FILE);
    write_private(&owner, &pid.to_string())
        .map_err(|source| WorkspaceError::Write { path: owner, source })?;
    create(&staging.join(LOGS_DIR))
}

/// Read the owner PID recorded in a workspace directory.
pub fn owner_pid(dir: &Path) -> Option<u32> {
    fs::read_to_string(dir.join(OWNER_FILE))
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Write a file with restricted permissions (0600).
pub(crate) fn write_private(path: &Path, contents: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn id() -> SessionId {
        SessionId::generate()
    }

    #[test]
    fn test_create_layout() {
        let root = tempfile::tempdir().unwrap();
        let id = id();
        let ws = Workspace::create_in(root.path(), &id).unwrap();

        assert_eq!(ws.path(), root.path().join(id.workspace_dir_name()));
        assert!(ws.logs_dir().is_dir());
        assert_eq!(owner_pid(ws.path()), Some(std::process::id()));

        let mode = fs::metadata(ws.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn test_write_file_is_private() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::create_in(root.path(), &id()).unwrap();
        let path = ws.write_file("host.rules", "*filter\nCOMMIT\n").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "*filter\nCOMMIT\n");
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_collision_is_reported() {
        let root = tempfile::tempdir().unwrap();
        let id = id();
        let _first = Workspace::create_in(root.path(), &id).unwrap();
        match Workspace::create_in(root.path(), &id) {
            Err(WorkspaceError::Exists(_)) => {}
            other => panic!("Expected Exists, got {other:?}"),
        }
    }

    #[test]
    fn test_no_staging_left_behind() {
        let root = tempfile::tempdir().unwrap();
        let id = id();
        let ws = Workspace::create_in(root.path(), &id).unwrap();

        let names: Vec<String> = fs::read_dir(root.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![id.workspace_dir_name()]);
        assert_eq!(owner_pid(ws.path()), Some(std::process::id()));

        // A collision leaves no staging directory either.
        assert!(Workspace::create_in(root.path(), &id).is_err());
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_existing_empty_directory_is_a_collision() {
        let root = tempfile::tempdir().unwrap();
        let id = id();
        fs::create_dir(root.path().join(id.workspace_dir_name())).unwrap();
        assert!(matches!(
            Workspace::create_in(root.path(), &id),
            Err(WorkspaceError::Exists(_))
        ));
    }

    #[test]
    fn test_parse_staging_name() {
        let id = SessionId::parse("0badcafe").unwrap();
        let name = staging_name(&id, 4242);
        assert_eq!(name, ".run-0badcafe-workspace.4242");
        assert_eq!(parse_staging_name(&name), Some((id, 4242)));
        assert_eq!(parse_staging_name("run-0badcafe-workspace"), None);
        assert_eq!(parse_staging_name(".run-0badcafe-proxy.4242"), None);
        assert_eq!(parse_staging_name(".run-0badcafe-workspace.x"), None);
    }

    #[test]
    fn test_hand_over_keeps_directory_quietly() {
        let root = tempfile::tempdir().unwrap();
        let path = {
            let mut ws = Workspace::create_in(root.path(), &id()).unwrap();
            ws.hand_over();
            ws.path().to_path_buf()
        };
        assert!(path.exists());
    }

    #[test]
    fn test_removed_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let path = {
            let ws = Workspace::create_in(root.path(), &id()).unwrap();
            ws.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let mut ws = Workspace::create_in(root.path(), &id()).unwrap();
        ws.remove().unwrap();
        ws.remove().unwrap();
        assert!(!ws.path().exists());
    }
}
