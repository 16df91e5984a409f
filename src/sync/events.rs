//! Sync pass reports and notifications

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::conflict::{Action, ConflictInfo};
use crate::types::{ConflictResolutionStrategy, NoteId, RemoteId};

/// Result of the action taken for one note
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    TransportError,
    ProtocolError,
    VersionConflict,
    /// Not attempted: quarantined, cancelled, or deleted mid-pass
    Skipped,
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Outcome::TransportError | Outcome::ProtocolError | Outcome::VersionConflict
        )
    }
}

/// Per-note line of a pass report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteOutcome {
    pub note: Option<NoteId>,
    pub remote_id: Option<RemoteId>,
    pub action: Action,
    pub outcome: Outcome,
    /// Error text for failed outcomes
    pub error: Option<String>,
    /// Conflict copy created by an archive action
    pub archived: Option<NoteId>,
    pub conflict: Option<ConflictInfo>,
}

impl NoteOutcome {
    pub fn new(
        note: Option<NoteId>,
        remote_id: Option<RemoteId>,
        action: Action,
        outcome: Outcome,
    ) -> Self {
        Self {
            note,
            remote_id,
            action,
            outcome,
            error: None,
            archived: None,
            conflict: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Summary of one completed pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub strategy: ConflictResolutionStrategy,
    pub outcomes: Vec<NoteOutcome>,
    /// The pass was cancelled before every note was processed
    pub cancelled: bool,
    /// Something in the local note set changed and should be persisted
    pub state_changed: bool,
}

impl SyncReport {
    /// Number of notes with the given outcome
    pub fn count(&self, outcome: Outcome) -> usize {
        self.outcomes.iter().filter(|o| o.outcome == outcome).count()
    }

    /// Number of notes for which `action` was chosen
    pub fn count_action(&self, action: Action) -> usize {
        self.outcomes.iter().filter(|o| o.action == action).count()
    }

    /// Outcome recorded for a note
    pub fn for_note(&self, id: &NoteId) -> Option<&NoteOutcome> {
        self.outcomes.iter().find(|o| o.note.as_ref() == Some(id))
    }

    /// Outcome recorded for a remote note
    pub fn for_remote(&self, id: &RemoteId) -> Option<&NoteOutcome> {
        self.outcomes.iter().find(|o| o.remote_id.as_ref() == Some(id))
    }

    pub fn failures(&self) -> impl Iterator<Item = &NoteOutcome> {
        self.outcomes.iter().filter(|o| o.outcome.is_failure())
    }

    /// True when every note ended in `NoOp`
    pub fn is_quiet(&self) -> bool {
        self.outcomes.iter().all(|o| o.action == Action::NoOp)
    }

    pub fn duration(&self) -> chrono::Duration {
        self.completed_at - self.started_at
    }
}

/// Notification for GUI observers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    PassStarted { at: DateTime<Utc> },
    PassCompleted { report: SyncReport },
    PassFailed { at: DateTime<Utc>, error: String },
}

/// Fan-out of sync events to any number of subscribers
pub struct SyncNotifier {
    tx: broadcast::Sender<SyncEvent>,
}

impl SyncNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn broadcast(&self, event: SyncEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for SyncNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for SyncNotifier {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}
