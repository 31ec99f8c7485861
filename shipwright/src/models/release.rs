//! Release records and history

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::deploy::fsm::{ReleaseEvent, ReleaseStatus};
use crate::errors::DeployError;

/// Format of release ids, which double as directory names
pub const RELEASE_ID_FORMAT: &str = "%Y%m%d%H%M%S";

/// One release directory under `releases/`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    /// Timestamp id, strictly increasing per application
    pub id: String,

    pub status: ReleaseStatus,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promoted_at: Option<DateTime<Utc>>,
}

impl Release {
    pub fn new(id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            status: ReleaseStatus::Pending,
            created_at,
            promoted_at: None,
        }
    }

    /// Apply a status event
    pub fn apply(&mut self, event: ReleaseEvent) -> Result<(), DeployError> {
        self.status = self.status.transition(event)?;
        if matches!(event, ReleaseEvent::Promote | ReleaseEvent::Reinstate) {
            self.promoted_at = Some(Utc::now());
        }
        Ok(())
    }
}

/// Releases of one application, oldest first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseHistory {
    #[serde(default)]
    releases: Vec<Release>,
}

impl ReleaseHistory {
    pub fn new(mut releases: Vec<Release>) -> Self {
        releases.sort_by(|a, b| a.id.cmp(&b.id));
        Self { releases }
    }

    pub fn releases(&self) -> &[Release] {
        &self.releases
    }

    pub fn len(&self) -> usize {
        self.releases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.releases.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Release> {
        self.releases.iter().find(|r| r.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Release> {
        self.releases.iter_mut().find(|r| r.id == id)
    }

    pub fn active(&self) -> Option<&Release> {
        self.releases
            .iter()
            .find(|r| r.status == ReleaseStatus::Active)
    }

    pub fn latest(&self) -> Option<&Release> {
        self.releases.last()
    }

    /// Add a release, keeping the history ordered
    pub fn push(&mut self, release: Release) {
        self.releases.push(release);
        self.releases.sort_by(|a, b| a.id.cmp(&b.id));
    }

    pub fn remove(&mut self, id: &str) -> Option<Release> {
        let index = self.releases.iter().position(|r| r.id == id)?;
        Some(self.releases.remove(index))
    }

    /// Keep only the releases for which `keep` returns true
    pub fn retain(&mut self, keep: impl FnMut(&Release) -> bool) {
        self.releases.retain(keep);
    }

    /// Id for a release allocated at `now`.
    ///
    /// Ids are `YYYYmmddHHMMSS`. When the clock has not moved past the newest
    /// existing id, the newest id moved one second on is used instead so ids
    /// stay unique, ordered and valid timestamps.
    pub fn next_id(&self, now: DateTime<Utc>) -> String {
        let candidate = now.format(RELEASE_ID_FORMAT).to_string();
        let newest = self
            .releases
            .iter()
            .filter_map(|r| r.id.parse::<u64>().ok())
            .max();

        match (candidate.parse::<u64>(), newest) {
            (Ok(c), Some(n)) if c <= n => id_after(n),
            _ => candidate,
        }
    }

    /// The release a rollback returns to: the newest release older than the
    /// active one that was superseded rather than abandoned or never served.
    pub fn rollback_target(&self) -> Option<&Release> {
        let active = self
            .releases
            .iter()
            .position(|r| r.status == ReleaseStatus::Active)?;
        self.releases[..active]
            .iter()
            .rev()
            .find(|r| r.status == ReleaseStatus::Stale)
    }

    /// Ids to delete so that at most `keep` releases remain.
    ///
    /// The active release is always kept and counts toward `keep`; the rest of
    /// the window goes to the newest releases.
    pub fn prune_candidates(&self, keep: usize) -> Vec<String> {
        let keep = keep.max(1);
        let active = self.active().map(|r| r.id.as_str());
        let mut kept = usize::from(active.is_some());
        let mut doomed = Vec::new();

        for release in self.releases.iter().rev() {
            if Some(release.id.as_str()) == active {
                continue;
            }
            if kept < keep {
                kept += 1;
            } else {
                doomed.push(release.id.clone());
            }
        }

        doomed.reverse();
        doomed
    }
}

/// The id one second after `newest`, or `newest + 1` when it is not a timestamp
fn id_after(newest: u64) -> String {
    let id = format!("{:014}", newest);
    match NaiveDateTime::parse_from_str(&id, RELEASE_ID_FORMAT) {
        Ok(at) => (at + Duration::seconds(1)).format(RELEASE_ID_FORMAT).to_string(),
        Err(_) => format!("{:014}", newest + 1),
    }
}
