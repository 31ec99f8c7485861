//! Finite State Machine for release status

use serde::{Deserialize, Serialize};

use crate::errors::DeployError;

/// Release status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReleaseStatus {
    /// Allocated, never promoted
    Pending,

    /// Pointed to by `current`
    Active,

    /// Was active, superseded by a newer release
    Stale,

    /// Was active, abandoned by an explicit rollback
    RolledBack,
}

/// Release event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseEvent {
    /// `current` switched to this release after a deployment
    Promote,

    /// Another release was promoted over this one
    Supersede,

    /// `current` was moved back off this release
    RollBack,

    /// `current` was moved back onto this release
    Reinstate,
}

impl ReleaseStatus {
    /// Compute the status after `event`, rejecting invalid transitions
    pub fn transition(self, event: ReleaseEvent) -> Result<ReleaseStatus, DeployError> {
        let next = match (self, event) {
            (ReleaseStatus::Pending, ReleaseEvent::Promote) => ReleaseStatus::Active,

            (ReleaseStatus::Active, ReleaseEvent::Supersede) => ReleaseStatus::Stale,
            (ReleaseStatus::Active, ReleaseEvent::RollBack) => ReleaseStatus::RolledBack,

            (ReleaseStatus::Stale, ReleaseEvent::Reinstate) => ReleaseStatus::Active,

            // Invalid transitions
            (state, event) => {
                return Err(DeployError::InvalidTransition(format!(
                    "{:?} -> {:?}",
                    state, event
                )));
            }
        };

        Ok(next)
    }
}
