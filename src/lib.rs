//! notesync - note synchronization core
//!
//! Keeps a local note set in sync with an interchangeable remote storage
//! backend. Tracks local and remote divergence per note, decides an action
//! for every note on each pass and applies the configured conflict
//! resolution strategy without silently losing either side.

pub mod error;
pub mod note;
pub mod provider;
pub mod storage;
pub mod sync;
pub mod types;

pub use error::{NoteSyncError, ProviderError, Result};
pub use note::{Note, NoteChange, NoteField, NoteObserver, SuppressedEdit};
pub use provider::{Provider, ProviderConfig, StorageProvider};
pub use storage::{NoteDatabase, NoteRepository, NoteSnapshot, NoteStore};
pub use sync::{Action, SyncEngine, SyncReport, SyncSession};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
