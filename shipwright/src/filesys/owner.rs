//! File ownership for the deploy user and group

use std::path::Path;

use nix::unistd::{chown, fchownat, FchownatFlags, Gid, Group, Uid, User};
use tracing::debug;
use walkdir::WalkDir;

use crate::errors::DeployError;

/// The deploy user and group that own release artifacts.
///
/// Either side may be unset, in which case that half of the ownership is left
/// untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ownership {
    pub user: Option<String>,
    pub group: Option<String>,
}

impl Ownership {
    pub fn new(user: Option<String>, group: Option<String>) -> Self {
        Self { user, group }
    }

    /// Whether applying this ownership would change anything
    pub fn is_noop(&self) -> bool {
        self.user.is_none() && self.group.is_none()
    }

    fn resolve(&self) -> Result<(Option<Uid>, Option<Gid>), DeployError> {
        let uid = match &self.user {
            Some(name) => Some(
                User::from_name(name)
                    .map_err(|e| DeployError::Ownership(format!("lookup of user {}: {}", name, e)))?
                    .ok_or_else(|| DeployError::Ownership(format!("unknown user {}", name)))?
                    .uid,
            ),
            None => None,
        };
        let gid = match &self.group {
            Some(name) => Some(
                Group::from_name(name)
                    .map_err(|e| DeployError::Ownership(format!("lookup of group {}: {}", name, e)))?
                    .ok_or_else(|| DeployError::Ownership(format!("unknown group {}", name)))?
                    .gid,
            ),
            None => None,
        };
        Ok((uid, gid))
    }

    /// Change the owner of a single path (not recursive)
    pub fn apply(&self, path: &Path) -> Result<(), DeployError> {
        if self.is_noop() {
            return Ok(());
        }
        let (uid, gid) = self.resolve()?;
        debug!("chown {:?}:{:?} {}", self.user, self.group, path.display());
        chown(path, uid, gid)
            .map_err(|e| DeployError::Ownership(format!("chown {}: {}", path.display(), e)))
    }

    /// Change the owner of a tree, `root` included.
    ///
    /// Symlinks are chowned themselves, never followed.
    pub async fn apply_recursive(&self, root: &Path) -> Result<(), DeployError> {
        if self.is_noop() {
            return Ok(());
        }
        let (uid, gid) = self.resolve()?;
        let root = root.to_path_buf();
        debug!("chown -R {:?}:{:?} {}", self.user, self.group, root.display());

        tokio::task::spawn_blocking(move || {
            for entry in WalkDir::new(&root).follow_links(false) {
                let entry = entry.map_err(|e| DeployError::Ownership(e.to_string()))?;
                fchownat(None, entry.path(), uid, gid, FchownatFlags::NoFollowSymlink).map_err(
                    |e| DeployError::Ownership(format!("chown {}: {}", entry.path().display(), e)),
                )?;
            }
            Ok(())
        })
        .await?
    }
}
