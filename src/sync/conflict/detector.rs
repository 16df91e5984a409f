//! Conflict detection logic

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{LocalState, RemoteState};
use crate::note::Note;
use crate::storage::Tombstone;
use crate::types::{NoteId, RemoteId, RemoteSummary, VersionMarker};

/// Types of conflicts that can occur
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictType {
    /// Both sides modified the note since the last sync
    BothModified,
    /// Deleted locally while modified remotely
    DeleteModify,
    /// Modified locally while deleted remotely
    ModifyDelete,
}

/// Which copy carries the later modification timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NewerSide {
    Local,
    Remote,
    Same,
}

/// Information about a detected conflict, for logs and events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictInfo {
    pub conflict_type: ConflictType,
    pub note: Option<NoteId>,
    pub remote_id: Option<RemoteId>,
    pub local_modified: Option<DateTime<Utc>>,
    pub remote_modified: Option<DateTime<Utc>>,
    /// Informational only; decisions never depend on clocks
    pub newer: NewerSide,
    pub description: String,
}

/// Derives the decision-table inputs for one joined entry
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictDetector;

impl ConflictDetector {
    pub fn new() -> Self {
        Self
    }

    /// Local side of an entry
    pub fn local_state(&self, note: Option<&Note>, tombstone: Option<&Tombstone>) -> LocalState {
        match (note, tombstone) {
            (Some(note), _) => LocalState::Present {
                dirty: note.local_dirty(),
                synced: note.was_synced(),
            },
            (None, Some(_)) => LocalState::Deleted,
            (None, None) => LocalState::Absent,
        }
    }

    /// Remote side of an entry. A remote copy is dirty when its version
    /// differs from the last version this client confirmed.
    pub fn remote_state(
        &self,
        known: Option<&VersionMarker>,
        summary: Option<&RemoteSummary>,
    ) -> RemoteState {
        match summary {
            None => RemoteState::Absent,
            Some(summary) => RemoteState::Present {
                dirty: known != Some(&summary.version),
            },
        }
    }

    /// Describe a conflict between the two sides, if there is one
    pub fn detect(
        &self,
        note: Option<&Note>,
        tombstone: Option<&Tombstone>,
        summary: Option<&RemoteSummary>,
    ) -> Option<ConflictInfo> {
        let known = note
            .and_then(|n| n.version())
            .or_else(|| tombstone.and_then(|t| t.version.as_ref()));
        let local = self.local_state(note, tombstone);
        let remote = self.remote_state(known, summary);

        let conflict_type = match (local, remote) {
            (LocalState::Present { dirty: true, .. }, RemoteState::Present { dirty: true }) => {
                ConflictType::BothModified
            }
            (LocalState::Deleted, RemoteState::Present { dirty: true }) => {
                ConflictType::DeleteModify
            }
            (
                LocalState::Present {
                    dirty: true,
                    synced: true,
                },
                RemoteState::Absent,
            ) => ConflictType::ModifyDelete,
            _ => return None,
        };

        let local_modified = note.map(|n| n.modified_at());
        let remote_modified = summary.map(|s| s.modified_at);
        let newer = match (local_modified, remote_modified) {
            (Some(l), Some(r)) if l > r => NewerSide::Local,
            (Some(l), Some(r)) if r > l => NewerSide::Remote,
            (Some(_), Some(_)) => NewerSide::Same,
            (Some(_), None) => NewerSide::Local,
            _ => NewerSide::Remote,
        };

        let description = match conflict_type {
            ConflictType::BothModified => {
                "Both local and remote copies changed since the last sync".to_string()
            }
            ConflictType::DeleteModify => {
                "Deleted locally while the remote copy was modified".to_string()
            }
            ConflictType::ModifyDelete => {
                "Modified locally while the remote copy was deleted".to_string()
            }
        };

        Some(ConflictInfo {
            conflict_type,
            note: note
                .map(|n| n.unique_name().clone())
                .or_else(|| tombstone.map(|t| t.note.clone())),
            remote_id: summary
                .map(|s| s.remote_id.clone())
                .or_else(|| note.and_then(|n| n.remote_id().cloned())),
            local_modified,
            remote_modified,
            newer,
            description,
        })
    }
}
