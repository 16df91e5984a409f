//! Conflict detection and resolution
//!
//! Provides:
//! - Derivation of the local and remote state of one note from its local
//!   copy, tombstone and remote summary
//! - The pure decision table mapping those states and the configured
//!   strategy to a sync [`Action`]

mod detector;
mod resolver;

pub use detector::{ConflictDetector, ConflictInfo, ConflictType, NewerSide};
pub use resolver::{classify, ConflictResolver, Decision};

use serde::{Deserialize, Serialize};

/// What a sync pass does for one note
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Upload local content over the remote copy
    PushLocal,
    /// Overwrite local content with the remote copy
    PullRemote,
    /// Upload local content; the remote content survives as a new note
    PushLocalAndArchiveRemoteAsNew,
    /// Take the remote content; the local content survives as a new note
    PullRemoteAndArchiveLocalAsNew,
    /// First upload of a local note
    CreateRemoteFromLocal,
    /// First download of a remote note
    MaterializeLocalFromRemote,
    /// Remote copy is gone, drop the local one
    DeleteLocal,
    /// Local copy was deleted, drop the remote one
    DeleteRemote,
    NoOp,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::PushLocal => "push_local",
            Action::PullRemote => "pull_remote",
            Action::PushLocalAndArchiveRemoteAsNew => "push_local_and_archive_remote_as_new",
            Action::PullRemoteAndArchiveLocalAsNew => "pull_remote_and_archive_local_as_new",
            Action::CreateRemoteFromLocal => "create_remote_from_local",
            Action::MaterializeLocalFromRemote => "materialize_local_from_remote",
            Action::DeleteLocal => "delete_local",
            Action::DeleteRemote => "delete_remote",
            Action::NoOp => "no_op",
        }
    }

    /// Whether the action produces an archived conflict copy
    pub fn archives(&self) -> bool {
        matches!(
            self,
            Action::PushLocalAndArchiveRemoteAsNew | Action::PullRemoteAndArchiveLocalAsNew
        )
    }

    /// Whether the action needs a provider round trip
    pub fn touches_remote(&self) -> bool {
        !matches!(self, Action::NoOp | Action::DeleteLocal)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Local side of a note as seen by the decision table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LocalState {
    /// No local copy and no pending deletion
    Absent,
    /// Deleted locally; the remote copy still awaits deletion
    Deleted,
    Present {
        /// Unpushed local edits
        dirty: bool,
        /// Has a remote identity from an earlier push or pull
        synced: bool,
    },
}

/// Remote side of a note as seen by the decision table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RemoteState {
    Absent,
    Present {
        /// Version differs from the last one this client saw
        dirty: bool,
    },
}

impl LocalState {
    pub fn is_dirty(&self) -> bool {
        matches!(self, LocalState::Present { dirty: true, .. })
    }
}

impl RemoteState {
    pub fn is_present(&self) -> bool {
        matches!(self, RemoteState::Present { .. })
    }

    pub fn is_dirty(&self) -> bool {
        matches!(self, RemoteState::Present { dirty: true })
    }
}
