//! Sync decision table

use super::{Action, ConflictDetector, ConflictInfo, LocalState, RemoteState};
use crate::note::Note;
use crate::storage::Tombstone;
use crate::types::{ConflictResolutionStrategy, RemoteSummary};

/// Decide the action for one note.
///
/// Pure: the result depends only on the two states and the strategy.
pub fn classify(
    local: LocalState,
    remote: RemoteState,
    strategy: ConflictResolutionStrategy,
) -> Action {
    match (local, remote) {
        (LocalState::Absent, RemoteState::Absent) => Action::NoOp,
        (LocalState::Absent, RemoteState::Present { .. }) => Action::MaterializeLocalFromRemote,

        // A remote edit made after the local delete wins over the delete
        (LocalState::Deleted, RemoteState::Present { dirty: true }) => {
            Action::MaterializeLocalFromRemote
        }
        (LocalState::Deleted, RemoteState::Present { dirty: false }) => Action::DeleteRemote,
        (LocalState::Deleted, RemoteState::Absent) => Action::NoOp,

        (LocalState::Present { dirty, synced }, RemoteState::Absent) => {
            if synced && !dirty {
                Action::DeleteLocal
            } else {
                Action::CreateRemoteFromLocal
            }
        }

        (LocalState::Present { dirty: false, .. }, RemoteState::Present { dirty: false }) => {
            Action::NoOp
        }
        (LocalState::Present { dirty: true, .. }, RemoteState::Present { dirty: false }) => {
            Action::PushLocal
        }
        (LocalState::Present { dirty: false, .. }, RemoteState::Present { dirty: true }) => {
            Action::PullRemote
        }
        (LocalState::Present { dirty: true, .. }, RemoteState::Present { dirty: true }) => {
            match strategy {
                ConflictResolutionStrategy::PreferLocal => Action::PushLocal,
                ConflictResolutionStrategy::PreferRemote => Action::PullRemote,
                ConflictResolutionStrategy::PreferLocalKeepRemote => {
                    Action::PushLocalAndArchiveRemoteAsNew
                }
                ConflictResolutionStrategy::PreferRemoteKeepLocal => {
                    Action::PullRemoteAndArchiveLocalAsNew
                }
            }
        }
    }
}

/// Outcome of classifying one joined entry
#[derive(Debug, Clone)]
pub struct Decision {
    pub local: LocalState,
    pub remote: RemoteState,
    pub action: Action,
    pub conflict: Option<ConflictInfo>,
}

/// Applies the configured strategy to joined local/remote entries
#[derive(Debug, Clone, Copy)]
pub struct ConflictResolver {
    strategy: ConflictResolutionStrategy,
    detector: ConflictDetector,
}

impl ConflictResolver {
    pub fn new(strategy: ConflictResolutionStrategy) -> Self {
        Self {
            strategy,
            detector: ConflictDetector::new(),
        }
    }

    pub fn strategy(&self) -> ConflictResolutionStrategy {
        self.strategy
    }

    /// Classify one entry of the local/remote join
    pub fn decide(
        &self,
        note: Option<&Note>,
        tombstone: Option<&Tombstone>,
        summary: Option<&RemoteSummary>,
    ) -> Decision {
        let known = note
            .and_then(|n| n.version())
            .or_else(|| tombstone.and_then(|t| t.version.as_ref()));
        let local = self.detector.local_state(note, tombstone);
        let remote = self.detector.remote_state(known, summary);
        Decision {
            local,
            remote,
            action: classify(local, remote, self.strategy),
            conflict: self.detector.detect(note, tombstone, summary),
        }
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(ConflictResolutionStrategy::default())
    }
}
