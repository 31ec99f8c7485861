//! On-disk layout of a deploy root
//!
//! ```text
//! <deploy_to>/
//!   releases/<timestamp>/
//!   shared/cached-copy/
//!   shared/log/
//!   current -> releases/<timestamp>
//! ```

use std::path::{Path, PathBuf};

use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::filesys::owner::Ownership;

/// Name of the symlink that points at the active release
pub const CURRENT_LINK: &str = "current";

/// Prefix of the temporary link written before it is renamed over `current`
pub const CURRENT_TMP_PREFIX: &str = "current.tmp-";

/// Storage layout for one application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployLayout {
    /// The deploy root, `deploy_to`
    pub base_dir: PathBuf,
}

impl DeployLayout {
    /// Create a new layout rooted at `deploy_to`
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn root(&self) -> Dir {
        Dir::new(&self.base_dir)
    }

    pub fn releases_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("releases"))
    }

    /// Directory of one release
    pub fn release_dir(&self, id: &str) -> Dir {
        self.releases_dir().subdir(id)
    }

    pub fn shared_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("shared"))
    }

    /// The single reusable SCM working tree
    pub fn cached_copy_dir(&self) -> Dir {
        self.shared_dir().subdir("cached-copy")
    }

    pub fn log_dir(&self) -> Dir {
        self.shared_dir().subdir("log")
    }

    /// Scratch space for unpacked archives before they become a repository
    pub fn staging_dir(&self) -> Dir {
        self.shared_dir().subdir("scm-staging")
    }

    /// Persisted release history
    pub fn history_file(&self) -> File {
        self.shared_dir().file("releases.json")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.base_dir.join(".shipwright.lock")
    }

    pub fn current_link(&self) -> PathBuf {
        self.base_dir.join(CURRENT_LINK)
    }

    /// Path for a not-yet-committed `current` link
    pub fn current_tmp_link(&self, suffix: &str) -> PathBuf {
        self.base_dir.join(format!("{}{}", CURRENT_TMP_PREFIX, suffix))
    }

    /// Id of the release `current` points at, if the link exists
    pub async fn current_release_id(&self) -> Result<Option<String>, DeployError> {
        match tokio::fs::read_link(self.current_link()).await {
            Ok(target) => Ok(release_id_of(&target)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Setup the deploy root (create directories)
    pub async fn setup(&self, ownership: &Ownership) -> Result<(), DeployError> {
        let root = self.root();
        root.create().await?;
        root.set_mode(0o775).await?;
        ownership.apply(root.path())?;

        for dir in [self.releases_dir(), self.shared_dir(), self.log_dir()] {
            dir.create().await?;
            ownership.apply(dir.path())?;
        }
        Ok(())
    }
}

fn release_id_of(target: &Path) -> Option<String> {
    target
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.to_string())
}
