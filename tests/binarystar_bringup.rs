use clonecache::binarystar::{BinaryStar, FsmEvent, FsmState, Transition};

/// Simulates the startup handshake between two configured replicas: the
/// primary hears the backup announce BACKUP and becomes ACTIVE; the backup
/// then hears the primary announce ACTIVE and becomes PASSIVE.
#[test]
fn primary_and_backup_converge_to_active_passive() {
    let mut primary = BinaryStar::new(true);
    let mut backup = BinaryStar::new(false);

    let t = primary.apply(FsmEvent::PeerBackup, 0).unwrap();
    assert_eq!(t, Some(Transition::ToActive));
    assert_eq!(primary.state(), FsmState::Active);

    let t = backup.apply(FsmEvent::PeerActive, 0).unwrap();
    assert_eq!(t, Some(Transition::ToPassive));
    assert_eq!(backup.state(), FsmState::Passive);
}

/// If the backup's peer (the primary) goes silent long enough, a client
/// snapshot request against the backup promotes it to ACTIVE.
#[test]
fn passive_backup_takes_over_after_primary_silence() {
    let mut backup = BinaryStar::new(false);
    backup.apply(FsmEvent::PeerActive, 0).unwrap();
    assert_eq!(backup.state(), FsmState::Passive);
    backup.refresh_peer_expiry(0);

    let rejected = backup.apply(FsmEvent::SnapshotRequest, 500);
    assert!(rejected.is_err());
    assert_eq!(backup.state(), FsmState::Passive);

    let t = backup.apply(FsmEvent::SnapshotRequest, 3000).unwrap();
    assert_eq!(t, Some(Transition::ToActive));
    assert_eq!(backup.state(), FsmState::Active);
}

/// Two servers that both believe they are ACTIVE must refuse to keep
/// running rather than silently serve conflicting writes.
#[test]
fn split_brain_dual_active_is_detected() {
    let mut primary = BinaryStar::new(true);
    primary.apply(FsmEvent::PeerBackup, 0).unwrap();
    assert_eq!(primary.state(), FsmState::Active);

    let err = primary.apply(FsmEvent::PeerActive, 0).unwrap_err();
    assert!(matches!(err, clonecache::error::CacheError::Fatal(_)));
}
