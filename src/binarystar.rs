//! BinaryStar FSM (C4): the 4-state failover state machine described in
//! spec.md §4.4, driven by peer heartbeats and client snapshot requests.

use crate::error::{CacheError, Result};

/// How often the FSM publishes its current state to the peer.
pub const HEARTBEAT_MS: u64 = 1000;

/// One of the four runtime states of a Binary Star server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmState {
    /// Static primary identity, not yet active.
    Primary,
    /// Static backup identity, not yet passive.
    Backup,
    /// Serving writes and snapshot requests.
    Active,
    /// Buffering updates, tracking the active peer.
    Passive,
}

impl FsmState {
    /// Encode as the ASCII-decimal wire representation (§6).
    pub fn to_code(self) -> u8 {
        match self {
            FsmState::Primary => 1,
            FsmState::Backup => 2,
            FsmState::Active => 3,
            FsmState::Passive => 4,
        }
    }

    /// Decode from the ASCII-decimal wire representation.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(FsmState::Primary),
            2 => Some(FsmState::Backup),
            3 => Some(FsmState::Active),
            4 => Some(FsmState::Passive),
            _ => None,
        }
    }
}

impl std::fmt::Display for FsmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FsmState::Primary => "PRIMARY",
            FsmState::Backup => "BACKUP",
            FsmState::Active => "ACTIVE",
            FsmState::Passive => "PASSIVE",
        };
        write!(f, "{}", s)
    }
}

/// An event driving the FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmEvent {
    /// Peer announced it is PRIMARY.
    PeerPrimary,
    /// Peer announced it is BACKUP.
    PeerBackup,
    /// Peer announced it is ACTIVE.
    PeerActive,
    /// Peer announced it is PASSIVE.
    PeerPassive,
    /// A client requested a snapshot.
    SnapshotRequest,
}

impl FsmEvent {
    /// Build the peer-announcement event corresponding to a received state code.
    pub fn from_peer_state(state: FsmState) -> Self {
        match state {
            FsmState::Primary => FsmEvent::PeerPrimary,
            FsmState::Backup => FsmEvent::PeerBackup,
            FsmState::Active => FsmEvent::PeerActive,
            FsmState::Passive => FsmEvent::PeerPassive,
        }
    }

    fn name(self) -> &'static str {
        match self {
            FsmEvent::PeerPrimary => "PEER_PRIMARY",
            FsmEvent::PeerBackup => "PEER_BACKUP",
            FsmEvent::PeerActive => "PEER_ACTIVE",
            FsmEvent::PeerPassive => "PEER_PASSIVE",
            FsmEvent::SnapshotRequest => "SNAPSHOT_REQUEST",
        }
    }
}

/// A successful transition that requires firing a role handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Fire the registered activeHandler.
    ToActive,
    /// Fire the registered passiveHandler.
    ToPassive,
}

/// The Binary Star failover state machine plus its peer-expiry clock.
pub struct BinaryStar {
    state: FsmState,
    /// Epoch-ms after which the peer is considered dead. Refreshed on
    /// every inbound peer state frame.
    peer_expiry_ms: u64,
}

impl BinaryStar {
    /// Construct the FSM in its statically-configured initial state.
    pub fn new(primary: bool) -> Self {
        Self {
            state: if primary {
                FsmState::Primary
            } else {
                FsmState::Backup
            },
            peer_expiry_ms: 0,
        }
    }

    /// Current FSM state.
    pub fn state(&self) -> FsmState {
        self.state
    }

    /// True once `now_ms` has passed the peer-expiry deadline.
    pub fn peer_is_dead(&self, now_ms: u64) -> bool {
        now_ms >= self.peer_expiry_ms
    }

    /// Refresh the peer-expiry deadline; call on every inbound peer state frame.
    pub fn refresh_peer_expiry(&mut self, now_ms: u64) {
        self.peer_expiry_ms = now_ms + 2 * HEARTBEAT_MS;
    }

    /// Drive the FSM with `event`. On success, returns `Some(transition)`
    /// if a role handler must fire, or `None` for a no-op success. On
    /// failure, returns `CacheError::FsmRejected` (silent-drop the inbound
    /// message and continue) or `CacheError::Fatal` (dual-active /
    /// dual-passive — the reactor must shut down).
    pub fn apply(&mut self, event: FsmEvent, now_ms: u64) -> Result<Option<Transition>> {
        use FsmEvent::*;
        use FsmState::*;

        match (self.state, event) {
            (Primary, PeerBackup) => {
                self.state = Active;
                Ok(Some(Transition::ToActive))
            }
            (Primary, PeerActive) => {
                self.state = Passive;
                Ok(Some(Transition::ToPassive))
            }
            (Primary, SnapshotRequest) => {
                if self.peer_is_dead(now_ms) {
                    self.state = Active;
                    Ok(Some(Transition::ToActive))
                } else {
                    Err(self.rejected(event))
                }
            }
            (Backup, PeerActive) => {
                self.state = Passive;
                Ok(Some(Transition::ToPassive))
            }
            (Backup, SnapshotRequest) => Err(self.rejected(event)),
            (Active, PeerActive) => Err(CacheError::Fatal(
                "dual-actives: peer announced ACTIVE while we are ACTIVE".to_string(),
            )),
            (Passive, PeerPrimary) | (Passive, PeerBackup) => {
                self.state = Active;
                Ok(Some(Transition::ToActive))
            }
            (Passive, PeerPassive) => Err(CacheError::Fatal(
                "dual-passives: peer announced PASSIVE while we are PASSIVE".to_string(),
            )),
            (Passive, SnapshotRequest) => {
                if self.peer_is_dead(now_ms) {
                    self.state = Active;
                    Ok(Some(Transition::ToActive))
                } else {
                    Err(self.rejected(event))
                }
            }
            // All unlisted (state, event) pairs are no-ops that succeed.
            _ => Ok(None),
        }
    }

    fn rejected(&self, event: FsmEvent) -> CacheError {
        CacheError::FsmRejected {
            event: event.name().to_string(),
            state: self.state.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_becomes_active_on_peer_backup() {
        let mut fsm = BinaryStar::new(true);
        let t = fsm.apply(FsmEvent::PeerBackup, 0).unwrap();
        assert_eq!(t, Some(Transition::ToActive));
        assert_eq!(fsm.state(), FsmState::Active);
    }

    #[test]
    fn primary_snapshot_request_rejected_while_peer_alive() {
        let mut fsm = BinaryStar::new(true);
        fsm.refresh_peer_expiry(0); // peer alive until 2000
        let err = fsm.apply(FsmEvent::SnapshotRequest, 500).unwrap_err();
        assert!(matches!(err, CacheError::FsmRejected { .. }));
        assert_eq!(fsm.state(), FsmState::Primary);
    }

    #[test]
    fn primary_snapshot_request_succeeds_once_peer_expired() {
        let mut fsm = BinaryStar::new(true);
        fsm.refresh_peer_expiry(0);
        let t = fsm.apply(FsmEvent::SnapshotRequest, 2000).unwrap();
        assert_eq!(t, Some(Transition::ToActive));
    }

    #[test]
    fn backup_snapshot_request_always_rejected() {
        let mut fsm = BinaryStar::new(false);
        let err = fsm.apply(FsmEvent::SnapshotRequest, 999_999).unwrap_err();
        assert!(matches!(err, CacheError::FsmRejected { .. }));
    }

    #[test]
    fn dual_active_is_fatal() {
        let mut fsm = BinaryStar::new(true);
        fsm.apply(FsmEvent::PeerBackup, 0).unwrap();
        assert_eq!(fsm.state(), FsmState::Active);
        let err = fsm.apply(FsmEvent::PeerActive, 0).unwrap_err();
        assert!(matches!(err, CacheError::Fatal(_)));
    }

    #[test]
    fn dual_passive_is_fatal() {
        let mut fsm = BinaryStar::new(true);
        fsm.apply(FsmEvent::PeerActive, 0).unwrap(); // -> Passive
        assert_eq!(fsm.state(), FsmState::Passive);
        let err = fsm.apply(FsmEvent::PeerPassive, 0).unwrap_err();
        assert!(matches!(err, CacheError::Fatal(_)));
    }

    #[test]
    fn unlisted_pairs_are_no_op_success() {
        let mut fsm = BinaryStar::new(true);
        let t = fsm.apply(FsmEvent::PeerPrimary, 0).unwrap();
        assert_eq!(t, None);
        assert_eq!(fsm.state(), FsmState::Primary);
    }

    #[test]
    fn passive_becomes_active_on_either_peer_primary_or_backup() {
        let mut fsm = BinaryStar::new(true);
        fsm.apply(FsmEvent::PeerActive, 0).unwrap();
        assert_eq!(fsm.state(), FsmState::Passive);
        let t = fsm.apply(FsmEvent::PeerPrimary, 0).unwrap();
        assert_eq!(t, Some(Transition::ToActive));
    }

    #[test]
    fn state_code_round_trips() {
        for state in [FsmState::Primary, FsmState::Backup, FsmState::Active, FsmState::Passive] {
            assert_eq!(FsmState::from_code(state.to_code()), Some(state));
        }
    }
}
