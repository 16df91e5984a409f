//! Note entity with dirty tracking
//!
//! A [`Note`] records two dirty flags:
//! - `local_dirty`: the local copy has edits not yet confirmed by a push or pull
//! - `remote_dirty`: the local copy has not yet incorporated the latest known
//!   remote state
//!
//! Every content mutation sets both flags and refreshes the modification
//! timestamp, unless it happens inside a [`SuppressedEdit`] scope. The sync
//! engine opens such a scope while applying data received from a provider so
//! the note is not re-marked as needing sync.

use std::collections::BTreeSet;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{NoteId, RemoteId, RemoteNote, VersionMarker};

/// Content field touched by a mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteField {
    Title,
    Body,
    Tags,
}

/// Notification fired on every unsuppressed content mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteChange {
    pub note: NoteId,
    pub field: NoteField,
}

/// Callback registered on a single note
pub type NoteObserver = Arc<dyn Fn(&NoteChange) + Send + Sync>;

/// A single note and its sync state
#[derive(Serialize, Deserialize)]
pub struct Note {
    unique_name: NoteId,
    remote_id: Option<RemoteId>,
    /// Last remote version this copy is known to match
    version: Option<VersionMarker>,
    title: String,
    body: String,
    tags: BTreeSet<String>,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
    local_dirty: bool,
    remote_dirty: bool,
    #[serde(skip)]
    suppress_depth: usize,
    #[serde(skip)]
    observers: Vec<NoteObserver>,
}

impl Note {
    /// Create a new local note. It has never been synced, so both flags are set.
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            unique_name: NoteId::generate(),
            remote_id: None,
            version: None,
            title: title.into(),
            body: body.into(),
            tags: BTreeSet::new(),
            created_at: now,
            modified_at: now,
            local_dirty: true,
            remote_dirty: true,
            suppress_depth: 0,
            observers: Vec::new(),
        }
    }

    /// Materialize a local note from a remote snapshot; clean in both directions
    pub fn from_remote(remote: &RemoteNote) -> Self {
        let mut note = Self::new(String::new(), String::new());
        note.apply_remote(remote);
        note.clear_local_dirty();
        note.clear_remote_dirty();
        note
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn unique_name(&self) -> &NoteId {
        &self.unique_name
    }

    pub fn remote_id(&self) -> Option<&RemoteId> {
        self.remote_id.as_ref()
    }

    pub fn version(&self) -> Option<&VersionMarker> {
        self.version.as_ref()
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn modified_at(&self) -> DateTime<Utc> {
        self.modified_at
    }

    pub fn local_dirty(&self) -> bool {
        self.local_dirty
    }

    pub fn remote_dirty(&self) -> bool {
        self.remote_dirty
    }

    /// Whether the note ever completed a push or pull
    pub fn was_synced(&self) -> bool {
        self.remote_id.is_some()
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppress_depth > 0
    }

    /// Identity comparison across copies is by unique name only
    pub fn same_identity_as(&self, other: &Note) -> bool {
        self.unique_name == other.unique_name
    }

    /// Compare title, body and tags
    pub fn content_eq(&self, other: &Note) -> bool {
        self.title == other.title && self.body == other.body && self.tags == other.tags
    }

    // ------------------------------------------------------------------
    // Content mutation
    // ------------------------------------------------------------------

    pub fn set_title(&mut self, title: impl Into<String>) {
        let title = title.into();
        if self.title == title {
            return;
        }
        self.title = title;
        self.content_changed(NoteField::Title);
    }

    pub fn set_body(&mut self, body: impl Into<String>) {
        let body = body.into();
        if self.body == body {
            return;
        }
        self.body = body;
        self.content_changed(NoteField::Body);
    }

    pub fn set_tags<I, S>(&mut self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tags: BTreeSet<String> = tags.into_iter().map(Into::into).collect();
        if self.tags == tags {
            return;
        }
        self.tags = tags;
        self.content_changed(NoteField::Tags);
    }

    pub fn add_tag(&mut self, tag: impl Into<String>) {
        if self.tags.insert(tag.into()) {
            self.content_changed(NoteField::Tags);
        }
    }

    pub fn remove_tag(&mut self, tag: &str) {
        if self.tags.remove(tag) {
            self.content_changed(NoteField::Tags);
        }
    }

    /// Overwrite the creation timestamp without dirty marking
    pub fn set_created_at(&mut self, at: DateTime<Utc>) {
        self.created_at = at;
    }

    /// Overwrite the modification timestamp without dirty marking
    pub fn set_modified_at(&mut self, at: DateTime<Utc>) {
        self.modified_at = at;
    }

    fn content_changed(&mut self, field: NoteField) {
        if self.is_suppressed() {
            return;
        }
        self.mark_dirty();
        self.modified_at = Utc::now();
        self.notify(field);
    }

    // ------------------------------------------------------------------
    // Suppression
    // ------------------------------------------------------------------

    /// Open a scope in which mutations neither mark dirty, touch the
    /// modification timestamp nor notify observers. Scopes nest.
    pub fn suppress_dirty(&mut self) -> SuppressedEdit<'_> {
        self.suppress_depth += 1;
        SuppressedEdit { note: self }
    }

    // ------------------------------------------------------------------
    // Low-level dirty hooks
    // ------------------------------------------------------------------

    pub fn mark_dirty(&mut self) {
        self.local_dirty = true;
        self.remote_dirty = true;
    }

    pub fn mark_local_dirty(&mut self) {
        self.local_dirty = true;
    }

    pub fn mark_remote_dirty(&mut self) {
        self.remote_dirty = true;
    }

    pub fn clear_local_dirty(&mut self) {
        self.local_dirty = false;
    }

    pub fn clear_remote_dirty(&mut self) {
        self.remote_dirty = false;
    }

    /// Record the remote identity and version confirmed by a provider
    pub fn set_remote_identity(&mut self, remote_id: RemoteId, version: VersionMarker) {
        self.remote_id = Some(remote_id);
        self.version = Some(version);
    }

    pub fn set_version(&mut self, version: VersionMarker) {
        self.version = Some(version);
    }

    /// Forget the remote identity, e.g. after the remote copy was deleted
    pub fn detach_remote(&mut self) {
        self.remote_id = None;
        self.version = None;
    }

    // ------------------------------------------------------------------
    // Sync helpers
    // ------------------------------------------------------------------

    /// Apply a fetched remote snapshot without marking the note dirty.
    /// Dirty flags are left for the caller to clear once the I/O is confirmed.
    pub fn apply_remote(&mut self, remote: &RemoteNote) {
        let mut edit = self.suppress_dirty();
        edit.set_title(remote.title.clone());
        edit.set_body(remote.body.clone());
        edit.set_tags(remote.tags.iter().cloned());
        edit.set_created_at(remote.created_at);
        edit.set_modified_at(remote.modified_at);
        edit.set_remote_identity(remote.remote_id.clone(), remote.version.clone());
    }

    /// Copy of this note's content under a fresh unique name and without a
    /// remote identity, used to preserve the losing side of a conflict.
    pub fn to_archive_copy(&self) -> Note {
        let mut copy = self.clone();
        copy.unique_name = NoteId::generate();
        copy.detach_remote();
        copy.mark_dirty();
        copy
    }

    // ------------------------------------------------------------------
    // Change notification
    // ------------------------------------------------------------------

    /// Register an observer for content changes on this note
    pub fn subscribe(&mut self, observer: NoteObserver) {
        self.observers.push(observer);
    }

    pub fn clear_observers(&mut self) {
        self.observers.clear();
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Re-notify observers of every field without changing state
    pub fn trigger_changed(&self) {
        for field in [NoteField::Title, NoteField::Body, NoteField::Tags] {
            self.notify(field);
        }
    }

    fn notify(&self, field: NoteField) {
        if self.observers.is_empty() {
            return;
        }
        let change = NoteChange {
            note: self.unique_name.clone(),
            field,
        };
        for observer in &self.observers {
            observer(&change);
        }
    }
}

/// Flat persisted form of a note, without runtime state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteRecord {
    pub unique_name: NoteId,
    pub remote_id: Option<RemoteId>,
    pub version: Option<VersionMarker>,
    pub title: String,
    pub body: String,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub local_dirty: bool,
    pub remote_dirty: bool,
}

impl From<&Note> for NoteRecord {
    fn from(note: &Note) -> Self {
        Self {
            unique_name: note.unique_name.clone(),
            remote_id: note.remote_id.clone(),
            version: note.version.clone(),
            title: note.title.clone(),
            body: note.body.clone(),
            tags: note.tags.iter().cloned().collect(),
            created_at: note.created_at,
            modified_at: note.modified_at,
            local_dirty: note.local_dirty,
            remote_dirty: note.remote_dirty,
        }
    }
}

impl From<NoteRecord> for Note {
    fn from(record: NoteRecord) -> Self {
        Self {
            unique_name: record.unique_name,
            remote_id: record.remote_id,
            version: record.version,
            title: record.title,
            body: record.body,
            tags: record.tags.into_iter().collect(),
            created_at: record.created_at,
            modified_at: record.modified_at,
            local_dirty: record.local_dirty,
            remote_dirty: record.remote_dirty,
            suppress_depth: 0,
            observers: Vec::new(),
        }
    }
}

/// Deep, independent copy. Observers and open suppression scopes belong to
/// the original and are not carried over.
impl Clone for Note {
    fn clone(&self) -> Self {
        Self {
            unique_name: self.unique_name.clone(),
            remote_id: self.remote_id.clone(),
            version: self.version.clone(),
            title: self.title.clone(),
            body: self.body.clone(),
            tags: self.tags.clone(),
            created_at: self.created_at,
            modified_at: self.modified_at,
            local_dirty: self.local_dirty,
            remote_dirty: self.remote_dirty,
            suppress_depth: 0,
            observers: Vec::new(),
        }
    }
}

impl fmt::Debug for Note {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Note")
            .field("unique_name", &self.unique_name)
            .field("remote_id", &self.remote_id)
            .field("version", &self.version)
            .field("title", &self.title)
            .field("tags", &self.tags)
            .field("modified_at", &self.modified_at)
            .field("local_dirty", &self.local_dirty)
            .field("remote_dirty", &self.remote_dirty)
            .field("observers", &self.observers.len())
            .finish()
    }
}

/// Scope guard returned by [`Note::suppress_dirty`]; dirty marking resumes
/// when the outermost guard is dropped.
pub struct SuppressedEdit<'a> {
    note: &'a mut Note,
}

impl Deref for SuppressedEdit<'_> {
    type Target = Note;

    fn deref(&self) -> &Note {
        self.note
    }
}

impl DerefMut for SuppressedEdit<'_> {
    fn deref_mut(&mut self) -> &mut Note {
        self.note
    }
}

impl Drop for SuppressedEdit<'_> {
    fn drop(&mut self) {
        self.note.suppress_depth -= 1;
    }
}
