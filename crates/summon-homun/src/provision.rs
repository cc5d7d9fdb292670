//! Branch directory provisioning.
//!
//! Creates `<repo-root>/.homun/branches/<branch>/{report,workspace}` and
//! makes the tree group-shared so the container user (a member of the
//! `homun` group) can write to it.
//!
//! Every step is fatal on failure. Nothing is rolled back: a partially
//! created tree is left in place for the operator to inspect.

use homun_core::BranchDirs;
use nix::unistd::{getuid, Group};
use std::fs::{self, DirBuilder};
use std::os::unix::fs::{lchown, DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Group shared between the operator and the container user.
pub const SHARED_GROUP: &str = "homun";

/// Mode for newly created directories (rwx for owner and group).
const DIR_MODE: u32 = 0o775;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("failed to create {label} directory {path}: {source}")]
    CreateDir {
        label: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("group '{0}' does not exist")]
    UnknownGroup(String),
    #[error("failed to look up group '{group}': {reason}")]
    GroupLookup { group: String, reason: String },
    #[error("failed to set ownership of {path} (you may need sudo): {source}")]
    Chown {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to set permissions on {path}: {source}")]
    Chmod {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to walk {path}: {source}")]
    Walk {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ProvisionError>;

/// Creates and shares branch directories.
#[derive(Debug, Clone)]
pub struct Provisioner {
    group: String,
}

impl Default for Provisioner {
    fn default() -> Self {
        Self::new(SHARED_GROUP)
    }
}

impl Provisioner {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
        }
    }

    /// Create and share the directories for `branch`.
    pub fn provision(&self, repo_root: &Path, branch: &str) -> Result<BranchDirs> {
        let dirs = BranchDirs::for_branch(repo_root, branch);
        info!(branch, path = %dirs.root.display(), "provisioning branch directories");

        create_dir(&dirs.report, "report")?;
        create_dir(&dirs.workspace, "workspace")?;

        let gid = self.resolve_gid()?;
        let uid = getuid().as_raw();
        walk(&dirs.root, &mut |path| {
            lchown(path, Some(uid), Some(gid)).map_err(|source| ProvisionError::Chown {
                path: path.to_path_buf(),
                source,
            })
        })?;
        debug!(uid, gid, group = %self.group, "ownership set");

        walk(&dirs.root, &mut mirror_owner_bits)?;
        debug!("group permissions mirror owner");

        Ok(dirs)
    }

    fn resolve_gid(&self) -> Result<u32> {
        match Group::from_name(&self.group) {
            Ok(Some(group)) => Ok(group.gid.as_raw()),
            Ok(None) => Err(ProvisionError::UnknownGroup(self.group.clone())),
            Err(errno) => Err(ProvisionError::GroupLookup {
                group: self.group.clone(),
                reason: errno.to_string(),
            }),
        }
    }
}

fn create_dir(path: &Path, label: &'static str) -> Result<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(path)
        .map_err(|source| ProvisionError::CreateDir {
            label,
            path: path.to_path_buf(),
            source,
        })
}

/// Set the group permission bits equal to the owner bits (`chmod g=u`).
fn mirror_owner_bits(path: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(path).map_err(|source| ProvisionError::Chmod {
        path: path.to_path_buf(),
        source,
    })?;
    // Symlink modes are meaningless and chmod would follow the link.
    if meta.file_type().is_symlink() {
        return Ok(());
    }

    let mode = meta.permissions().mode();
    let mirrored = group_mirrors_owner(mode);
    if mirrored != mode {
        fs::set_permissions(path, fs::Permissions::from_mode(mirrored)).map_err(|source| {
            ProvisionError::Chmod {
                path: path.to_path_buf(),
                source,
            }
        })?;
    }
    Ok(())
}

fn group_mirrors_owner(mode: u32) -> u32 {
    let owner = (mode >> 6) & 0o7;
    (mode & !0o070) | (owner << 3)
}

/// Visit `root` and everything below it, parents before children.
/// Symlinked directories are visited but not descended into.
fn walk(root: &Path, visit: &mut dyn FnMut(&Path) -> Result<()>) -> Result<()> {
    visit(root)?;

    let meta = fs::symlink_metadata(root).map_err(|source| ProvisionError::Walk {
        path: root.to_path_buf(),
        source,
    })?;
    if !meta.is_dir() {
        return Ok(());
    }

    let entries = fs::read_dir(root).map_err(|source| ProvisionError::Walk {
        path: root.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| ProvisionError::Walk {
            path: root.to_path_buf(),
            source,
        })?;
        walk(&entry.path(), visit)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::getgid;
    use std::os::unix::fs::MetadataExt;
    use tempfile::TempDir;

    fn own_group() -> String {
        Group::from_gid(getgid())
            .unwrap()
            .expect("primary group has an entry")
            .name
    }

    fn mode_of(path: &Path) -> u32 {
        fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    #[test]
    fn group_bits_copy_owner_bits() {
        assert_eq!(group_mirrors_owner(0o700), 0o770);
        assert_eq!(group_mirrors_owner(0o755), 0o775);
        assert_eq!(group_mirrors_owner(0o640), 0o660);
        assert_eq!(group_mirrors_owner(0o4750), 0o4770);
        assert_eq!(group_mirrors_owner(0o477), 0o447);
    }

    #[test]
    fn creates_both_directories() {
        let repo = TempDir::new().unwrap();
        let provisioner = Provisioner::new(own_group());

        let dirs = provisioner.provision(repo.path(), "feat-x_1").unwrap();

        assert_eq!(dirs, BranchDirs::for_branch(repo.path(), "feat-x_1"));
        assert!(dirs.report.is_dir());
        assert!(dirs.workspace.is_dir());
        for dir in [&dirs.root, &dirs.report, &dirs.workspace] {
            let mode = mode_of(dir);
            assert_eq!((mode >> 3) & 0o7, (mode >> 6) & 0o7, "{}", dir.display());
        }
    }

    #[test]
    fn existing_content_is_shared_recursively() {
        let repo = TempDir::new().unwrap();
        let dirs = BranchDirs::for_branch(repo.path(), "rerun");
        fs::create_dir_all(dirs.workspace.join("src")).unwrap();
        let file = dirs.workspace.join("src/main.rs");
        fs::write(&file, "fn main() {}").unwrap();
        fs::set_permissions(&file, fs::Permissions::from_mode(0o600)).unwrap();

        let group = own_group();
        Provisioner::new(group.clone())
            .provision(repo.path(), "rerun")
            .unwrap();

        assert_eq!(mode_of(&file), 0o660);
        let expected_gid = Group::from_name(&group).unwrap().unwrap().gid.as_raw();
        assert_eq!(fs::metadata(&file).unwrap().gid(), expected_gid);
        assert_eq!(fs::metadata(&file).unwrap().uid(), getuid().as_raw());
    }

    #[test]
    fn unknown_group_fails_and_leaves_directories() {
        let repo = TempDir::new().unwrap();
        let provisioner = Provisioner::new("no-such-group-for-homun-tests");

        let err = provisioner.provision(repo.path(), "partial").unwrap_err();
        assert!(matches!(err, ProvisionError::UnknownGroup(_)));

        // No rollback.
        let dirs = BranchDirs::for_branch(repo.path(), "partial");
        assert!(dirs.report.is_dir());
        assert!(dirs.workspace.is_dir());
    }

    #[test]
    fn unwritable_root_fails_on_first_directory() {
        let repo = TempDir::new().unwrap();
        // A regular file where `.homun` should be.
        fs::write(repo.path().join(".homun"), "not a dir").unwrap();

        let err = Provisioner::new(own_group())
            .provision(repo.path(), "blocked")
            .unwrap_err();
        match err {
            ProvisionError::CreateDir { label, .. } => assert_eq!(label, "report"),
            other => panic!("expected CreateDir, got {other:?}"),
        }
    }

    #[test]
    fn default_group_is_homun() {
        assert_eq!(Provisioner::default().group, SHARED_GROUP);
    }
}
