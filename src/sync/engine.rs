//! One sync pass over the full note set
//!
//! A pass lists the remote summaries, joins them with local notes and
//! tombstones by remote identity, classifies each entry and runs the chosen
//! action under the note's lock. Local state is only touched after the
//! provider call for an action succeeded, so a failed action leaves the
//! note exactly as it was.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::conflict::{Action, ConflictResolver, Decision};
use super::events::{NoteOutcome, Outcome, SyncReport};
use crate::error::{NoteSyncError, ProviderError, Result};
use crate::note::Note;
use crate::provider::{ProviderResult, StorageProvider};
use crate::storage::{NoteHandle, NoteStore, Tombstone};
use crate::types::{ConflictResolutionStrategy, NoteId, RemoteId, RemoteSummary};

/// Cooperative cancellation flag shared between a pass and its owner
#[derive(Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `cancel` has been called
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CancelToken(cancelled: {})", self.is_cancelled())
    }
}

/// Entry excluded from sync after a protocol error
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum QuarantineKey {
    /// A local note
    Note(NoteId),
    /// A remote note without a local counterpart, or a pending remote delete
    Remote(RemoteId),
}

impl std::fmt::Display for QuarantineKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuarantineKey::Note(id) => write!(f, "note {}", id),
            QuarantineKey::Remote(id) => write!(f, "remote {}", id),
        }
    }
}

/// One row of the local/remote join
enum Entry {
    Local {
        id: NoteId,
        handle: NoteHandle,
        summary: Option<RemoteSummary>,
    },
    /// Remote-only entry, possibly with a pending local deletion
    Detached {
        tombstone: Option<Tombstone>,
        summary: Option<RemoteSummary>,
    },
}

/// Per-pass state shared by the concurrently running note actions
struct PassContext<'a> {
    store: &'a NoteStore,
    resolver: ConflictResolver,
    cancel: &'a CancelToken,
    changed: AtomicBool,
}

impl PassContext<'_> {
    fn mark_changed(&self) {
        self.changed.store(true, Ordering::Relaxed);
    }
}

/// Runs sync passes against one storage provider
pub struct SyncEngine {
    provider: Arc<dyn StorageProvider>,
    quarantine: RwLock<HashSet<QuarantineKey>>,
}

impl SyncEngine {
    pub fn new(provider: Arc<dyn StorageProvider>) -> Self {
        Self {
            provider,
            quarantine: RwLock::new(HashSet::new()),
        }
    }

    pub fn provider(&self) -> &Arc<dyn StorageProvider> {
        &self.provider
    }

    pub fn is_quarantined(&self, key: &QuarantineKey) -> bool {
        self.quarantine.read().contains(key)
    }

    pub fn quarantined(&self) -> Vec<QuarantineKey> {
        self.quarantine.read().iter().cloned().collect()
    }

    /// Let a quarantined entry take part in passes again
    pub fn release_quarantine(&self, key: &QuarantineKey) -> bool {
        self.quarantine.write().remove(key)
    }

    /// Run one pass.
    ///
    /// Only a failure to list the remote notes fails the pass; per-note
    /// failures are recorded in the report.
    pub async fn run_pass(
        &self,
        store: &NoteStore,
        strategy: ConflictResolutionStrategy,
        max_concurrency: usize,
        cancel: &CancelToken,
    ) -> Result<SyncReport> {
        let started_at = Utc::now();
        if cancel.is_cancelled() {
            return Err(NoteSyncError::Cancelled);
        }

        tracing::info!(
            "Sync pass started against {} using {}",
            self.provider.name(),
            strategy
        );

        let summaries = match guarded(cancel, self.provider.list_remote_summaries()).await {
            Ok(summaries) => summaries,
            Err(_) if cancel.is_cancelled() => return Err(NoteSyncError::Cancelled),
            Err(e) => {
                tracing::warn!("Listing remote notes failed: {}", e);
                return Err(e.into());
            }
        };

        let entries = join(store, summaries).await;
        let ctx = PassContext {
            store,
            resolver: ConflictResolver::new(strategy),
            cancel,
            changed: AtomicBool::new(false),
        };

        let outcomes: Vec<NoteOutcome> = stream::iter(entries)
            .map(|entry| self.process(&ctx, entry))
            .buffer_unordered(max_concurrency.max(1))
            .collect()
            .await;

        let report = SyncReport {
            started_at,
            completed_at: Utc::now(),
            strategy,
            outcomes,
            cancelled: cancel.is_cancelled(),
            state_changed: ctx.changed.load(Ordering::Relaxed),
        };

        tracing::info!(
            "Sync pass finished in {}ms: {} ok, {} failed, {} skipped",
            report.duration().num_milliseconds(),
            report.count(Outcome::Success),
            report.failures().count(),
            report.count(Outcome::Skipped)
        );

        Ok(report)
    }

    async fn process(&self, ctx: &PassContext<'_>, entry: Entry) -> NoteOutcome {
        match entry {
            Entry::Local {
                id,
                handle,
                summary,
            } => self.process_local(ctx, id, handle, summary).await,
            Entry::Detached { tombstone, summary } => {
                self.process_detached(ctx, tombstone, summary).await
            }
        }
    }

    async fn process_local(
        &self,
        ctx: &PassContext<'_>,
        id: NoteId,
        handle: NoteHandle,
        summary: Option<RemoteSummary>,
    ) -> NoteOutcome {
        let key = QuarantineKey::Note(id.clone());
        if self.is_quarantined(&key) {
            return NoteOutcome::new(Some(id), None, Action::NoOp, Outcome::Skipped)
                .with_error("quarantined");
        }

        let mut note = handle.lock().await;
        if ctx.store.get(&id).is_none() {
            // Deleted by the user while the pass was waiting for the lock
            return NoteOutcome::new(Some(id), None, Action::NoOp, Outcome::Skipped);
        }

        let mut decision = ctx.resolver.decide(Some(&note), None, summary.as_ref());
        if decision.action != Action::NoOp && ctx.cancel.is_cancelled() {
            return NoteOutcome::new(Some(id), None, decision.action, Outcome::Skipped);
        }
        let mut result = self
            .run_local(ctx, &mut note, decision.action, summary.as_ref())
            .await;

        if matches!(&result, Err(e) if e.is_race()) {
            tracing::debug!("Note {} raced with another writer, reclassifying", id);
            match self.refresh(ctx.cancel, note.remote_id()).await {
                Ok(fresh) => {
                    decision = ctx.resolver.decide(Some(&note), None, fresh.as_ref());
                    result = self
                        .run_local(ctx, &mut note, decision.action, fresh.as_ref())
                        .await;
                }
                Err(e) => result = Err(e),
            }
        }

        let remote_id = note.remote_id().cloned();
        let mut outcome = self.finish(ctx, key, Some(id), remote_id, decision, &result);
        if let Ok(archived) = result {
            outcome.archived = archived;
        }
        outcome
    }

    async fn process_detached(
        &self,
        ctx: &PassContext<'_>,
        tombstone: Option<Tombstone>,
        summary: Option<RemoteSummary>,
    ) -> NoteOutcome {
        let Some(remote_id) = tombstone
            .as_ref()
            .map(|t| t.remote_id.clone())
            .or_else(|| summary.as_ref().map(|s| s.remote_id.clone()))
        else {
            return NoteOutcome::new(None, None, Action::NoOp, Outcome::Success);
        };

        let key = QuarantineKey::Remote(remote_id.clone());
        if self.is_quarantined(&key) {
            return NoteOutcome::new(None, Some(remote_id), Action::NoOp, Outcome::Skipped)
                .with_error("quarantined");
        }

        let mut decision = ctx
            .resolver
            .decide(None, tombstone.as_ref(), summary.as_ref());
        if decision.action != Action::NoOp && ctx.cancel.is_cancelled() {
            return NoteOutcome::new(None, Some(remote_id), decision.action, Outcome::Skipped);
        }
        let mut result = self
            .run_detached(ctx, tombstone.as_ref(), decision.action, summary.as_ref())
            .await;

        if matches!(&result, Err(e) if e.is_race()) {
            tracing::debug!("Remote note {} changed mid-pass, reclassifying", remote_id);
            match self.refresh(ctx.cancel, Some(&remote_id)).await {
                Ok(fresh) => {
                    decision = ctx.resolver.decide(None, tombstone.as_ref(), fresh.as_ref());
                    result = self
                        .run_detached(ctx, tombstone.as_ref(), decision.action, fresh.as_ref())
                        .await;
                }
                Err(e) => result = Err(e),
            }
        }

        let note = match &result {
            Ok(Some(created)) => Some(created.clone()),
            _ => tombstone.as_ref().map(|t| t.note.clone()),
        };
        self.finish(ctx, key, note, Some(remote_id), decision, &result)
    }

    /// Execute an action for a note that exists locally
    async fn run_local(
        &self,
        ctx: &PassContext<'_>,
        note: &mut Note,
        action: Action,
        summary: Option<&RemoteSummary>,
    ) -> ProviderResult<Option<NoteId>> {
        if action == Action::NoOp {
            return Ok(None);
        }
        if ctx.cancel.is_cancelled() {
            return Err(ProviderError::transport("cancelled"));
        }
        tracing::debug!("{} for note {}", action, note.unique_name());

        match action {
            Action::NoOp => Ok(None),
            Action::PushLocal => {
                let target = required(summary, action)?;
                let version = guarded(
                    ctx.cancel,
                    self.provider
                        .update_remote(&target.remote_id, note, Some(&target.version)),
                )
                .await?;
                note.set_version(version);
                mark_clean(note);
                Ok(None)
            }
            Action::PullRemote => {
                let target = required(summary, action)?;
                let remote =
                    guarded(ctx.cancel, self.provider.fetch_full(&target.remote_id)).await?;
                note.apply_remote(&remote);
                mark_clean(note);
                Ok(None)
            }
            Action::PushLocalAndArchiveRemoteAsNew => {
                let target = required(summary, action)?;
                let remote =
                    guarded(ctx.cancel, self.provider.fetch_full(&target.remote_id)).await?;
                let version = guarded(
                    ctx.cancel,
                    self.provider
                        .update_remote(&target.remote_id, note, Some(&remote.version)),
                )
                .await?;
                note.set_version(version);
                mark_clean(note);
                let archive = Note::from_remote(&remote).to_archive_copy();
                Ok(Some(self.store_archive(ctx, archive).await))
            }
            Action::PullRemoteAndArchiveLocalAsNew => {
                let target = required(summary, action)?;
                let remote =
                    guarded(ctx.cancel, self.provider.fetch_full(&target.remote_id)).await?;
                let archive = note.to_archive_copy();
                note.apply_remote(&remote);
                mark_clean(note);
                Ok(Some(self.store_archive(ctx, archive).await))
            }
            Action::CreateRemoteFromLocal => {
                let created = guarded(ctx.cancel, self.provider.create_remote(note)).await?;
                note.set_remote_identity(created.remote_id, created.version);
                mark_clean(note);
                Ok(None)
            }
            Action::DeleteLocal => {
                note.clear_observers();
                ctx.store.remove_quiet(note.unique_name());
                Ok(None)
            }
            Action::MaterializeLocalFromRemote | Action::DeleteRemote => Err(
                ProviderError::protocol(format!("{} does not apply to a local note", action)),
            ),
        }
    }

    /// Execute an action for a remote-only entry or a pending delete.
    /// Returns the unique name of a newly materialized note.
    async fn run_detached(
        &self,
        ctx: &PassContext<'_>,
        tombstone: Option<&Tombstone>,
        action: Action,
        summary: Option<&RemoteSummary>,
    ) -> ProviderResult<Option<NoteId>> {
        if action != Action::NoOp && ctx.cancel.is_cancelled() {
            return Err(ProviderError::transport("cancelled"));
        }

        let created = match action {
            Action::NoOp => None,
            Action::DeleteRemote => {
                let target = required(summary, action)?;
                guarded(ctx.cancel, self.provider.delete_remote(&target.remote_id)).await?;
                None
            }
            Action::MaterializeLocalFromRemote => {
                let target = required(summary, action)?;
                let remote =
                    guarded(ctx.cancel, self.provider.fetch_full(&target.remote_id)).await?;
                let note = Note::from_remote(&remote);
                let id = note.unique_name().clone();
                ctx.store.insert_quiet(note);
                tracing::debug!("Materialized {} as note {}", target.remote_id, id);
                Some(id)
            }
            other => {
                return Err(ProviderError::protocol(format!(
                    "{} does not apply to a remote-only note",
                    other
                )))
            }
        };

        if let Some(tombstone) = tombstone {
            ctx.store.clear_tombstone(&tombstone.remote_id);
            ctx.mark_changed();
        }
        Ok(created)
    }

    /// Insert a conflict copy and try to create it remotely right away.
    /// If that fails the copy stays local and dirty for the next pass.
    async fn store_archive(&self, ctx: &PassContext<'_>, mut archive: Note) -> NoteId {
        let id = archive.unique_name().clone();
        match guarded(ctx.cancel, self.provider.create_remote(&archive)).await {
            Ok(created) => {
                archive.set_remote_identity(created.remote_id, created.version);
                mark_clean(&mut archive);
            }
            Err(e) => {
                tracing::warn!("Conflict copy {} kept local only: {}", id, e);
            }
        }
        ctx.store.insert_quiet(archive);
        id
    }

    /// Re-list and pick the summary for one remote id
    async fn refresh(
        &self,
        cancel: &CancelToken,
        remote_id: Option<&RemoteId>,
    ) -> ProviderResult<Option<RemoteSummary>> {
        let Some(remote_id) = remote_id else {
            return Ok(None);
        };
        let summaries = guarded(cancel, self.provider.list_remote_summaries()).await?;
        Ok(summaries.into_iter().find(|s| &s.remote_id == remote_id))
    }

    fn finish(
        &self,
        ctx: &PassContext<'_>,
        key: QuarantineKey,
        note: Option<NoteId>,
        remote_id: Option<RemoteId>,
        decision: Decision,
        result: &ProviderResult<Option<NoteId>>,
    ) -> NoteOutcome {
        let action = decision.action;
        let mut outcome = match result {
            Ok(_) => {
                if action != Action::NoOp {
                    ctx.mark_changed();
                }
                NoteOutcome::new(note, remote_id, action, Outcome::Success)
            }
            Err(ProviderError::Transport(msg)) => {
                tracing::warn!("{} failed for {}: {}", action, key, msg);
                NoteOutcome::new(note, remote_id, action, Outcome::TransportError)
                    .with_error(msg.clone())
            }
            Err(e @ ProviderError::Protocol(_)) => {
                tracing::error!("{} failed for {}, quarantining: {}", action, key, e);
                self.quarantine.write().insert(key.clone());
                NoteOutcome::new(note, remote_id, action, Outcome::ProtocolError)
                    .with_error(e.to_string())
            }
            Err(e) => {
                tracing::warn!("{} lost a second race for {}: {}", action, key, e);
                NoteOutcome::new(note, remote_id, action, Outcome::VersionConflict)
                    .with_error(e.to_string())
            }
        };
        if let Some(conflict) = decision.conflict {
            tracing::info!(
                "Conflict on {}: {} (newer: {:?})",
                key,
                conflict.description,
                conflict.newer
            );
            outcome.conflict = Some(conflict);
        }
        outcome
    }
}

/// Join local notes, tombstones and remote summaries by remote identity
async fn join(store: &NoteStore, summaries: Vec<RemoteSummary>) -> Vec<Entry> {
    let mut remote: HashMap<RemoteId, RemoteSummary> = summaries
        .into_iter()
        .map(|s| (s.remote_id.clone(), s))
        .collect();

    let mut entries = Vec::with_capacity(store.len() + remote.len());
    for (id, handle) in store.handles() {
        let remote_id = handle.lock().await.remote_id().cloned();
        let summary = remote_id.and_then(|rid| remote.remove(&rid));
        entries.push(Entry::Local {
            id,
            handle,
            summary,
        });
    }

    for tombstone in store.tombstones() {
        let summary = remote.remove(&tombstone.remote_id);
        entries.push(Entry::Detached {
            tombstone: Some(tombstone),
            summary,
        });
    }

    let mut remaining: Vec<RemoteSummary> = remote.into_values().collect();
    remaining.sort_by(|a, b| a.remote_id.cmp(&b.remote_id));
    entries.extend(remaining.into_iter().map(|summary| Entry::Detached {
        tombstone: None,
        summary: Some(summary),
    }));
    entries
}

/// Run a provider call, giving up with a transport error on cancellation
async fn guarded<T, F>(cancel: &CancelToken, call: F) -> ProviderResult<T>
where
    F: Future<Output = ProviderResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProviderError::transport("cancelled")),
        result = call => result,
    }
}

fn required(summary: Option<&RemoteSummary>, action: Action) -> ProviderResult<&RemoteSummary> {
    summary.ok_or_else(|| {
        ProviderError::protocol(format!("{} requires a remote summary", action))
    })
}

fn mark_clean(note: &mut Note) {
    note.clear_local_dirty();
    note.clear_remote_dirty();
}
