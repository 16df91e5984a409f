//! Note synchronization
//!
//! - [`conflict`]: the decision table for one note
//! - [`SyncEngine`]: one pass over the whole note set
//! - [`SyncSession`]: when passes run (timer, manual, debounced edits)

pub mod conflict;
mod engine;
mod events;
mod worker;

pub use conflict::{
    classify, Action, ConflictDetector, ConflictInfo, ConflictResolver, ConflictType, Decision,
    LocalState, NewerSide, RemoteState,
};
pub use engine::{CancelToken, QuarantineKey, SyncEngine};
pub use events::{NoteOutcome, Outcome, SyncEvent, SyncNotifier, SyncReport};
pub use worker::{backoff_delay, SyncCommand, SyncSession};
