//! Local note storage
//!
//! The in-memory [`NoteStore`] holds the live note set shared by the GUI and
//! the sync engine. A [`NoteRepository`] persists snapshots of it; the SQLite
//! implementation is [`NoteDatabase`].

mod connection;
mod migrations;
pub mod queries;
mod store;

pub use connection::{is_in_cloud_folder, JournalMode, NoteDatabase};
pub use store::{NoteHandle, NoteStore, StoreEvent};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::note::Note;
use crate::types::{NoteId, RemoteId, VersionMarker};

/// Record of a locally deleted note whose remote copy still has to be deleted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub remote_id: RemoteId,
    /// Unique name the note had before deletion
    pub note: NoteId,
    /// Remote version last seen before deletion
    pub version: Option<VersionMarker>,
    pub deleted_at: DateTime<Utc>,
}

/// Everything that needs to survive a restart
#[derive(Debug, Clone, Default)]
pub struct NoteSnapshot {
    pub notes: Vec<Note>,
    pub tombstones: Vec<Tombstone>,
}

/// Persistence collaborator for the note set
pub trait NoteRepository: Send + Sync {
    /// Load the full note set
    fn load_all(&self) -> Result<NoteSnapshot>;

    /// Replace the stored note set
    fn save_all(&self, snapshot: &NoteSnapshot) -> Result<()>;

    /// Account the stored remote identities belong to
    fn account_key(&self) -> Result<Option<String>> {
        Ok(None)
    }

    fn set_account_key(&self, _key: &str) -> Result<()> {
        Ok(())
    }
}
