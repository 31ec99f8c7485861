//! Release Manager
//!
//! Allocates release directories, switches the `current` pointer and prunes
//! old releases. The pointer switch is a symlink written under a temporary
//! name and renamed over `current`, so readers see either the old or the new
//! target.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::deploy::fsm::{ReleaseEvent, ReleaseStatus};
use crate::errors::DeployError;
use crate::filesys::owner::Ownership;
use crate::models::release::{Release, ReleaseHistory};
use crate::models::spec::DeploymentSpec;
use crate::storage::history;
use crate::storage::layout::{DeployLayout, CURRENT_TMP_PREFIX};
use crate::utils::temp_suffix;

/// Manages the releases of one deploy root
#[derive(Debug, Clone)]
pub struct ReleaseManager {
    layout: DeployLayout,
    ownership: Ownership,
}

impl ReleaseManager {
    pub fn new(layout: DeployLayout, ownership: Ownership) -> Self {
        Self { layout, ownership }
    }

    pub fn for_spec(spec: &DeploymentSpec) -> Self {
        Self::new(spec.layout(), spec.ownership())
    }

    pub fn layout(&self) -> &DeployLayout {
        &self.layout
    }

    pub async fn history(&self) -> Result<ReleaseHistory, DeployError> {
        history::load(&self.layout).await
    }

    /// Allocate a new, empty release directory and record it as pending
    pub async fn begin_release(&self) -> Result<Release, DeployError> {
        self.allocate()
            .await
            .map_err(|e| match e {
                e @ DeployError::ReleaseAllocationFailed(_) => e,
                e => DeployError::ReleaseAllocationFailed(e.to_string()),
            })
    }

    async fn allocate(&self) -> Result<Release, DeployError> {
        let mut history = self.history().await?;
        let now = Utc::now();
        let id = history.next_id(now);

        let dir = self.layout.release_dir(&id);
        if dir.exists().await {
            return Err(DeployError::ReleaseAllocationFailed(format!(
                "release directory {} already exists",
                dir.path().display()
            )));
        }
        dir.create().await?;
        self.ownership.apply(dir.path())?;

        let release = Release::new(id, now);
        history.push(release.clone());
        history::save(&self.layout, &history).await?;

        info!("Allocated release {}", dir.path().display());
        Ok(release)
    }

    /// Write a `current` link for `release` under a temporary name.
    ///
    /// `current` itself is untouched until `commit_pointer`.
    pub async fn stage_pointer(&self, release: &Release) -> Result<PathBuf, DeployError> {
        let target = self.layout.release_dir(&release.id);
        if !target.exists().await {
            return Err(DeployError::Internal(format!(
                "release directory {} is missing",
                target.path().display()
            )));
        }

        let tmp = self.layout.current_tmp_link(&temp_suffix());
        tokio::fs::symlink(target.path(), &tmp).await?;
        debug!("Staged pointer {} -> {}", tmp.display(), target.path().display());
        Ok(tmp)
    }

    /// Atomically replace `current` with a staged link
    pub async fn commit_pointer(&self, staged: &Path) -> Result<(), DeployError> {
        tokio::fs::rename(staged, self.layout.current_link()).await?;
        Ok(())
    }

    /// Remove `current.tmp-*` links left behind by an interrupted promote
    pub async fn clean_stale_pointers(&self) -> Result<usize, DeployError> {
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.layout.base_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(CURRENT_TMP_PREFIX) {
                warn!("Removing stale pointer {}", entry.path().display());
                tokio::fs::remove_file(entry.path()).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn switch_to(&self, release: &Release) -> Result<(), DeployError> {
        self.clean_stale_pointers().await?;
        let staged = self.stage_pointer(release).await?;
        if let Err(e) = self.commit_pointer(&staged).await {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(e);
        }
        Ok(())
    }

    /// Persist the history once `current` has moved.
    ///
    /// The switch is already visible, so a failed write is only logged; the
    /// next `load` reconciles the manifest against `current`.
    async fn save_after_switch(&self, history: &ReleaseHistory) {
        if let Err(e) = history::save(&self.layout, history).await {
            warn!("Failed to record release history after switching current: {}", e);
        }
    }

    /// Make `release` the active release.
    ///
    /// Status changes are validated before the pointer moves, and persisted
    /// after it has.
    pub async fn promote(&self, release: &Release) -> Result<Release, DeployError> {
        let mut history = self.history().await?;
        let previous = history
            .active()
            .map(|r| r.id.clone())
            .filter(|id| id != &release.id);

        if let Some(previous) = &previous {
            if let Some(r) = history.get_mut(previous) {
                r.apply(ReleaseEvent::Supersede)?;
            }
        }

        let promoted = {
            let target = history.get_mut(&release.id).ok_or_else(|| {
                DeployError::Internal(format!("release {} is not recorded", release.id))
            })?;
            match target.status {
                ReleaseStatus::Active => {}
                ReleaseStatus::Stale => target.apply(ReleaseEvent::Reinstate)?,
                _ => target.apply(ReleaseEvent::Promote)?,
            }
            target.clone()
        };

        self.switch_to(&promoted).await?;
        self.save_after_switch(&history).await;

        match previous {
            Some(previous) => info!("Promoted release {} (was {})", promoted.id, previous),
            None => info!("Promoted release {}", promoted.id),
        }
        Ok(promoted)
    }

    /// Point `current` back at the newest superseded release
    pub async fn rollback(&self) -> Result<Release, DeployError> {
        let mut history = self.history().await?;
        let active = history
            .active()
            .map(|r| r.id.clone())
            .ok_or(DeployError::NoPreviousRelease)?;
        let target = history
            .rollback_target()
            .map(|r| r.id.clone())
            .ok_or(DeployError::NoPreviousRelease)?;

        if let Some(r) = history.get_mut(&active) {
            r.apply(ReleaseEvent::RollBack)?;
        }
        let reinstated = {
            let r = history.get_mut(&target).ok_or(DeployError::NoPreviousRelease)?;
            r.apply(ReleaseEvent::Reinstate)?;
            r.clone()
        };

        self.switch_to(&reinstated).await?;
        self.save_after_switch(&history).await;

        info!("Rolled back from release {} to {}", active, reinstated.id);
        Ok(reinstated)
    }

    /// Delete releases beyond the newest `keep`, never the active one.
    ///
    /// Does nothing when `keep` is unset.
    pub async fn prune(&self, keep: Option<usize>) -> Result<Vec<String>, DeployError> {
        let Some(keep) = keep else {
            return Ok(Vec::new());
        };

        let mut history = self.history().await?;
        let doomed = history.prune_candidates(keep);
        let mut pruned = Vec::with_capacity(doomed.len());

        for id in doomed {
            let dir = self.layout.release_dir(&id);
            if let Err(e) = dir.delete().await {
                warn!("Failed to delete release {}: {}", dir.path().display(), e);
                continue;
            }
            history.remove(&id);
            debug!("Pruned release {}", id);
            pruned.push(id);
        }

        history::save(&self.layout, &history).await?;
        if !pruned.is_empty() {
            info!("Pruned {} release(s), keeping {}", pruned.len(), keep);
        }
        Ok(pruned)
    }
}
