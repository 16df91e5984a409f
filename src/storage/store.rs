//! Shared in-memory note set
//!
//! Each note lives behind its own async mutex, so the GUI and a running sync
//! pass never write the same note at the same time. Store-level changes are
//! published on a broadcast channel the sync session listens to.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::{broadcast, Mutex};

use super::{NoteSnapshot, Tombstone};
use crate::error::{NoteSyncError, Result};
use crate::note::{Note, NoteChange};
use crate::types::{NoteId, RemoteId};

/// Exclusive-access handle to one note
pub type NoteHandle = Arc<Mutex<Note>>;

/// Change published by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// A note's content was edited
    Changed(NoteChange),
    /// A note was added by the user
    Added(NoteId),
    /// A note was deleted by the user
    Removed(NoteId),
}

/// The live note set
pub struct NoteStore {
    notes: RwLock<BTreeMap<NoteId, NoteHandle>>,
    tombstones: RwLock<BTreeMap<RemoteId, Tombstone>>,
    tx: broadcast::Sender<StoreEvent>,
}

impl NoteStore {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1000);
        Self {
            notes: RwLock::new(BTreeMap::new()),
            tombstones: RwLock::new(BTreeMap::new()),
            tx,
        }
    }

    /// Rebuild a store from a persisted snapshot
    pub fn from_snapshot(snapshot: NoteSnapshot) -> Self {
        let store = Self::new();
        for note in snapshot.notes {
            store.insert_quiet(note);
        }
        {
            let mut tombstones = store.tombstones.write();
            for tombstone in snapshot.tombstones {
                tombstones.insert(tombstone.remote_id.clone(), tombstone);
            }
        }
        store
    }

    /// Subscribe to store changes
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.tx.subscribe()
    }

    /// Add a note created by the user
    pub fn insert(&self, note: Note) -> NoteHandle {
        let id = note.unique_name().clone();
        let handle = self.insert_quiet(note);
        let _ = self.tx.send(StoreEvent::Added(id));
        handle
    }

    /// Add a note without publishing an `Added` event. Used by the sync
    /// engine for notes it materializes itself.
    pub fn insert_quiet(&self, mut note: Note) -> NoteHandle {
        let tx = self.tx.clone();
        note.subscribe(Arc::new(move |change: &NoteChange| {
            let _ = tx.send(StoreEvent::Changed(change.clone()));
        }));
        let id = note.unique_name().clone();
        let handle = Arc::new(Mutex::new(note));
        self.notes.write().insert(id, handle.clone());
        handle
    }

    pub fn get(&self, id: &NoteId) -> Option<NoteHandle> {
        self.notes.read().get(id).cloned()
    }

    /// All note handles in unique-name order
    pub fn handles(&self) -> Vec<(NoteId, NoteHandle)> {
        self.notes
            .read()
            .iter()
            .map(|(id, handle)| (id.clone(), handle.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.notes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.read().is_empty()
    }

    /// Drop a note from the set without leaving a tombstone. Used when the
    /// remote copy is already gone.
    pub fn remove_quiet(&self, id: &NoteId) -> Option<NoteHandle> {
        self.notes.write().remove(id)
    }

    /// Delete a note on behalf of the user. If the note was ever synced a
    /// tombstone is kept so the next pass deletes the remote copy.
    pub async fn delete_local(&self, id: &NoteId) -> Result<Note> {
        let handle = self
            .notes
            .write()
            .remove(id)
            .ok_or_else(|| NoteSyncError::NotFound(format!("Note not found: {}", id)))?;

        let mut note = handle.lock().await;
        note.clear_observers();
        if let Some(remote_id) = note.remote_id().cloned() {
            let tombstone = Tombstone {
                remote_id: remote_id.clone(),
                note: id.clone(),
                version: note.version().cloned(),
                deleted_at: Utc::now(),
            };
            self.tombstones.write().insert(remote_id, tombstone);
        }
        let _ = self.tx.send(StoreEvent::Removed(id.clone()));
        Ok(note.clone())
    }

    pub fn tombstones(&self) -> Vec<Tombstone> {
        self.tombstones.read().values().cloned().collect()
    }

    pub fn clear_tombstone(&self, remote_id: &RemoteId) -> Option<Tombstone> {
        self.tombstones.write().remove(remote_id)
    }

    /// Number of notes with unpushed local edits plus pending remote deletions
    pub async fn pending_count(&self) -> usize {
        let mut count = self.tombstones.read().len();
        for (_, handle) in self.handles() {
            if handle.lock().await.local_dirty() {
                count += 1;
            }
        }
        count
    }

    /// Point-in-time copy for persistence
    pub async fn snapshot(&self) -> NoteSnapshot {
        let mut notes = Vec::with_capacity(self.len());
        for (_, handle) in self.handles() {
            notes.push(handle.lock().await.clone());
        }
        NoteSnapshot {
            notes,
            tombstones: self.tombstones(),
        }
    }

    /// Forget every remote identity, e.g. after switching accounts. All
    /// notes become new local notes and pending deletions are dropped.
    pub async fn detach_all(&self) {
        for (_, handle) in self.handles() {
            let mut note = handle.lock().await;
            note.detach_remote();
            note.mark_dirty();
        }
        self.tombstones.write().clear();
    }
}

impl Default for NoteStore {
    fn default() -> Self {
        Self::new()
    }
}
