//! Persisted release history
//!
//! The manifest is bookkeeping only. The `current` symlink decides which
//! release is active, and the `releases/` directory decides which releases
//! exist; `load` reconciles the manifest against both.

use chrono::Utc;
use tracing::{debug, warn};

use crate::deploy::fsm::ReleaseStatus;
use crate::errors::DeployError;
use crate::models::release::{Release, ReleaseHistory};
use crate::storage::layout::DeployLayout;

/// Load the history of a deploy root, reconciled with the filesystem
pub async fn load(layout: &DeployLayout) -> Result<ReleaseHistory, DeployError> {
    let manifest = layout.history_file();
    let mut history = if manifest.exists().await {
        match manifest.read_json::<ReleaseHistory>().await {
            Ok(history) => history,
            Err(e) => {
                warn!("Ignoring unreadable release manifest: {}", e);
                ReleaseHistory::default()
            }
        }
    } else {
        ReleaseHistory::default()
    };

    let on_disk = if layout.releases_dir().exists().await {
        layout.releases_dir().list_dir_names().await?
    } else {
        Vec::new()
    };

    history.retain(|r| on_disk.contains(&r.id));
    for id in &on_disk {
        if history.get(id).is_none() {
            debug!("Release {} has no manifest entry, recording it as stale", id);
            let mut release = Release::new(id.clone(), Utc::now());
            release.status = ReleaseStatus::Stale;
            history.push(release);
        }
    }

    let current = layout.current_release_id().await?;
    let ids: Vec<String> = history.releases().iter().map(|r| r.id.clone()).collect();
    for id in ids {
        if let Some(release) = history.get_mut(&id) {
            if Some(&id) == current.as_ref() {
                release.status = ReleaseStatus::Active;
            } else if release.status == ReleaseStatus::Active {
                release.status = ReleaseStatus::Stale;
            }
        }
    }

    Ok(history)
}

/// Persist the history
pub async fn save(layout: &DeployLayout, history: &ReleaseHistory) -> Result<(), DeployError> {
    layout.history_file().write_json(history).await
}
