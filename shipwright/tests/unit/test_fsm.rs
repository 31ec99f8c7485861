//! Release status FSM tests

use chrono::Utc;
use shipwright::deploy::fsm::{ReleaseEvent, ReleaseStatus};
use shipwright::errors::DeployError;
use shipwright::models::release::{Release, ReleaseHistory};

#[test]
fn test_release_starts_pending() {
    let release = Release::new("20240101000000", Utc::now());
    assert_eq!(release.status, ReleaseStatus::Pending);
    assert!(release.promoted_at.is_none());
}

#[test]
fn test_promote_and_supersede_flow() {
    let mut release = Release::new("20240101000000", Utc::now());

    // Pending -> Active
    release.apply(ReleaseEvent::Promote).unwrap();
    assert_eq!(release.status, ReleaseStatus::Active);
    assert!(release.promoted_at.is_some());

    // Active -> Stale
    release.apply(ReleaseEvent::Supersede).unwrap();
    assert_eq!(release.status, ReleaseStatus::Stale);

    // Stale -> Active
    release.apply(ReleaseEvent::Reinstate).unwrap();
    assert_eq!(release.status, ReleaseStatus::Active);
}

#[test]
fn test_rolled_back_release_is_final() {
    let mut release = Release::new("20240101000000", Utc::now());
    release.apply(ReleaseEvent::Promote).unwrap();
    release.apply(ReleaseEvent::RollBack).unwrap();
    assert_eq!(release.status, ReleaseStatus::RolledBack);

    for event in [
        ReleaseEvent::Promote,
        ReleaseEvent::Supersede,
        ReleaseEvent::RollBack,
        ReleaseEvent::Reinstate,
    ] {
        assert!(matches!(
            release.status.transition(event),
            Err(DeployError::InvalidTransition(_))
        ));
    }
}

#[test]
fn test_pending_release_cannot_be_reinstated() {
    let mut release = Release::new("20240101000000", Utc::now());
    assert!(release.apply(ReleaseEvent::Reinstate).is_err());
    assert_eq!(release.status, ReleaseStatus::Pending);
}

#[test]
fn test_history_serializes_statuses_in_kebab_case() {
    let mut release = Release::new("20240101000000", Utc::now());
    release.apply(ReleaseEvent::Promote).unwrap();
    release.apply(ReleaseEvent::RollBack).unwrap();
    let history = ReleaseHistory::new(vec![release]);

    let json = serde_json::to_string(&history).unwrap();
    assert!(json.contains("\"rolled-back\""));

    let parsed: ReleaseHistory = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, history);
}
