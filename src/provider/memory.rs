//! In-process storage provider
//!
//! Keeps remote notes in memory behind a shared handle. Clones share state,
//! so a test can keep one handle while the engine drives another. Supports
//! fault injection for exercising the engine's failure paths.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use super::{ProviderResult, StorageProvider};
use crate::error::ProviderError;
use crate::note::Note;
use crate::types::{RemoteId, RemoteNote, RemoteSummary, VersionMarker};

/// Provider operations, for call accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderOp {
    List,
    Fetch,
    Create,
    Update,
    Delete,
}

#[derive(Default)]
struct MemoryState {
    notes: BTreeMap<RemoteId, RemoteNote>,
    next_id: u64,
    next_version: u64,
    offline: bool,
    latency: Option<Duration>,
    /// Persistent failure for every operation touching a remote id
    failures: HashMap<RemoteId, ProviderError>,
    /// Number of upcoming updates on a remote id that report a version conflict
    forced_conflicts: HashMap<RemoteId, u32>,
    calls: HashMap<ProviderOp, u32>,
}

impl MemoryState {
    fn bump_version(&mut self) -> VersionMarker {
        self.next_version += 1;
        VersionMarker::new(format!("v{}", self.next_version))
    }

    fn check(&mut self, op: ProviderOp, remote_id: Option<&RemoteId>) -> ProviderResult<()> {
        *self.calls.entry(op).or_insert(0) += 1;
        if self.offline {
            return Err(ProviderError::transport("remote unreachable"));
        }
        if let Some(id) = remote_id {
            if let Some(err) = self.failures.get(id) {
                return Err(err.clone());
            }
        }
        Ok(())
    }
}

/// Storage provider that keeps everything in memory
#[derive(Clone, Default)]
pub struct MemoryProvider {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every operation, to simulate a slow network
    pub fn with_latency(self, latency: Duration) -> Self {
        self.state.lock().latency = Some(latency);
        self
    }

    /// Make every operation fail with a transport error
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Make every operation on `remote_id` fail with `error` until cleared
    pub fn fail_remote(&self, remote_id: &RemoteId, error: ProviderError) {
        self.state.lock().failures.insert(remote_id.clone(), error);
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Report a version conflict on the next `count` updates of `remote_id`
    pub fn force_version_conflicts(&self, remote_id: &RemoteId, count: u32) {
        self.state
            .lock()
            .forced_conflicts
            .insert(remote_id.clone(), count);
    }

    /// Insert a note as if another client had created it
    pub fn insert_remote(&self, title: &str, body: &str, tags: &[&str]) -> RemoteId {
        let mut state = self.state.lock();
        state.next_id += 1;
        let remote_id = RemoteId::new(format!("mem-{}", state.next_id));
        let version = state.bump_version();
        let now = Utc::now();
        state.notes.insert(
            remote_id.clone(),
            RemoteNote {
                remote_id: remote_id.clone(),
                title: title.to_string(),
                body: body.to_string(),
                tags: tags.iter().map(|t| t.to_string()).collect(),
                created_at: now,
                modified_at: now,
                version,
            },
        );
        remote_id
    }

    /// Edit a note as if another client had changed it; bumps the version
    pub fn edit_remote<F>(&self, remote_id: &RemoteId, edit: F) -> bool
    where
        F: FnOnce(&mut RemoteNote),
    {
        let mut state = self.state.lock();
        let version = state.bump_version();
        match state.notes.get_mut(remote_id) {
            Some(note) => {
                edit(note);
                note.version = version;
                note.modified_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Delete a note as if another client had removed it
    pub fn remove_remote(&self, remote_id: &RemoteId) -> Option<RemoteNote> {
        self.state.lock().notes.remove(remote_id)
    }

    pub fn get(&self, remote_id: &RemoteId) -> Option<RemoteNote> {
        self.state.lock().notes.get(remote_id).cloned()
    }

    pub fn all(&self) -> Vec<RemoteNote> {
        self.state.lock().notes.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().notes.is_empty()
    }

    /// Number of calls made for an operation
    pub fn calls(&self, op: ProviderOp) -> u32 {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    async fn simulate_latency(&self) {
        let latency = self.state.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

fn snapshot(remote_id: RemoteId, note: &Note, version: VersionMarker) -> RemoteNote {
    RemoteNote {
        remote_id,
        title: note.title().to_string(),
        body: note.body().to_string(),
        tags: note.tags().iter().cloned().collect(),
        created_at: note.created_at(),
        modified_at: note.modified_at(),
        version,
    }
}

#[async_trait]
impl StorageProvider for MemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    async fn list_remote_summaries(&self) -> ProviderResult<Vec<RemoteSummary>> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.check(ProviderOp::List, None)?;
        Ok(state.notes.values().map(RemoteNote::summary).collect())
    }

    async fn fetch_full(&self, remote_id: &RemoteId) -> ProviderResult<RemoteNote> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.check(ProviderOp::Fetch, Some(remote_id))?;
        state
            .notes
            .get(remote_id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(remote_id.clone()))
    }

    async fn create_remote(&self, note: &Note) -> ProviderResult<RemoteSummary> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.check(ProviderOp::Create, None)?;
        state.next_id += 1;
        let remote_id = RemoteId::new(format!("mem-{}", state.next_id));
        let version = state.bump_version();
        let stored = snapshot(remote_id.clone(), note, version);
        let summary = stored.summary();
        state.notes.insert(remote_id, stored);
        Ok(summary)
    }

    async fn update_remote(
        &self,
        remote_id: &RemoteId,
        note: &Note,
        expected: Option<&VersionMarker>,
    ) -> ProviderResult<VersionMarker> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.check(ProviderOp::Update, Some(remote_id))?;

        if let Some(remaining) = state.forced_conflicts.get_mut(remote_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ProviderError::VersionConflict {
                    remote_id: remote_id.clone(),
                    expected: expected.cloned(),
                });
            }
        }

        let current = state
            .notes
            .get(remote_id)
            .map(|n| n.version.clone())
            .ok_or_else(|| ProviderError::NotFound(remote_id.clone()))?;
        if let Some(expected) = expected {
            if *expected != current {
                return Err(ProviderError::VersionConflict {
                    remote_id: remote_id.clone(),
                    expected: Some(expected.clone()),
                });
            }
        }

        let version = state.bump_version();
        let stored = snapshot(remote_id.clone(), note, version.clone());
        state.notes.insert(remote_id.clone(), stored);
        Ok(version)
    }

    async fn delete_remote(&self, remote_id: &RemoteId) -> ProviderResult<()> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.check(ProviderOp::Delete, Some(remote_id))?;
        state
            .notes
            .remove(remote_id)
            .map(|_| ())
            .ok_or_else(|| ProviderError::NotFound(remote_id.clone()))
    }
}
