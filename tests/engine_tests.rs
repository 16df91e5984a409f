//! Integration tests for sync passes and the background session
//!
//! Run with: cargo test --test engine_tests

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use notesync::provider::{DirectoryProvider, MemoryProvider, ProviderOp};
use notesync::storage::NoteStore;
use notesync::sync::{CancelToken, Outcome, QuarantineKey, SyncEngine, SyncReport};
use notesync::{Action, ConflictResolutionStrategy, Note, NoteId, ProviderError, RemoteId};

fn engine(provider: &MemoryProvider) -> SyncEngine {
    SyncEngine::new(Arc::new(provider.clone()))
}

async fn pass(
    engine: &SyncEngine,
    store: &NoteStore,
    strategy: ConflictResolutionStrategy,
) -> SyncReport {
    engine
        .run_pass(store, strategy, 4, &CancelToken::new())
        .await
        .unwrap()
}

/// Insert a note and sync it once so both sides agree
async fn synced_note(
    engine: &SyncEngine,
    store: &NoteStore,
    title: &str,
    body: &str,
) -> (NoteId, RemoteId) {
    let handle = store.insert(Note::new(title, body));
    let id = handle.lock().await.unique_name().clone();
    pass(engine, store, ConflictResolutionStrategy::default()).await;
    let remote_id = handle.lock().await.remote_id().cloned().unwrap();
    (id, remote_id)
}

async fn note(store: &NoteStore, id: &NoteId) -> Note {
    store.get(id).unwrap().lock().await.clone()
}

async fn titled(store: &NoteStore, title: &str) -> Vec<Note> {
    let mut found = Vec::new();
    for (_, handle) in store.handles() {
        let note = handle.lock().await;
        if note.title() == title {
            found.push(note.clone());
        }
    }
    found
}

// ============================================================================
// SINGLE PASS SCENARIOS
// ============================================================================

#[tokio::test]
async fn test_local_edit_is_pushed() {
    let provider = MemoryProvider::new();
    let engine = engine(&provider);
    let store = NoteStore::new();
    let (id, remote_id) = synced_note(&engine, &store, "foo", "first").await;

    store.get(&id).unwrap().lock().await.set_body("second");
    let report = pass(&engine, &store, ConflictResolutionStrategy::default()).await;

    let outcome = report.for_note(&id).unwrap();
    assert_eq!(outcome.action, Action::PushLocal);
    assert_eq!(outcome.outcome, Outcome::Success);
    let local = note(&store, &id).await;
    assert!(!local.local_dirty());
    assert!(!local.remote_dirty());
    assert_eq!(provider.get(&remote_id).unwrap().body, "second");
    assert_eq!(local.version(), Some(&provider.get(&remote_id).unwrap().version));
}

#[tokio::test]
async fn test_new_local_note_is_created_remotely() {
    let provider = MemoryProvider::new();
    let engine = engine(&provider);
    let store = NoteStore::new();
    let handle = store.insert(Note::new("fresh", "body"));
    let id = handle.lock().await.unique_name().clone();

    let report = pass(&engine, &store, ConflictResolutionStrategy::default()).await;

    assert_eq!(report.for_note(&id).unwrap().action, Action::CreateRemoteFromLocal);
    assert_eq!(provider.len(), 1);
    let local = note(&store, &id).await;
    assert!(local.was_synced());
    assert!(!local.local_dirty());
    assert!(report.state_changed);
}

#[tokio::test]
async fn test_remote_only_note_is_materialized() {
    let provider = MemoryProvider::new();
    let remote_id = provider.insert_remote("bar", "from elsewhere", &["shared"]);
    let engine = engine(&provider);
    let store = NoteStore::new();

    let report = pass(&engine, &store, ConflictResolutionStrategy::default()).await;

    let outcome = report.for_remote(&remote_id).unwrap();
    assert_eq!(outcome.action, Action::MaterializeLocalFromRemote);
    assert_eq!(outcome.outcome, Outcome::Success);

    let bar = titled(&store, "bar").await;
    assert_eq!(bar.len(), 1);
    assert_eq!(bar[0].body(), "from elsewhere");
    assert!(bar[0].tags().contains("shared"));
    assert_eq!(bar[0].remote_id(), Some(&remote_id));
    assert!(!bar[0].local_dirty());
    assert!(!bar[0].remote_dirty());
    assert_eq!(outcome.note.as_ref(), Some(bar[0].unique_name()));
}

#[tokio::test]
async fn test_remote_edit_is_pulled() {
    let provider = MemoryProvider::new();
    let engine = engine(&provider);
    let store = NoteStore::new();
    let (id, remote_id) = synced_note(&engine, &store, "foo", "first").await;

    provider.edit_remote(&remote_id, |n| n.body = "changed remotely".to_string());
    let report = pass(&engine, &store, ConflictResolutionStrategy::default()).await;

    assert_eq!(report.for_note(&id).unwrap().action, Action::PullRemote);
    let local = note(&store, &id).await;
    assert_eq!(local.body(), "changed remotely");
    assert!(!local.local_dirty());
    assert!(!local.remote_dirty());
}

#[tokio::test]
async fn test_pull_remote_keeps_local_as_conflict_copy() {
    let provider = MemoryProvider::new();
    let engine = engine(&provider);
    let store = NoteStore::new();
    let (id, remote_id) = synced_note(&engine, &store, "foo", "original").await;

    store.get(&id).unwrap().lock().await.set_body("local edit");
    provider.edit_remote(&remote_id, |n| n.body = "remote edit".to_string());

    let report = pass(
        &engine,
        &store,
        ConflictResolutionStrategy::PreferRemoteKeepLocal,
    )
    .await;

    let outcome = report.for_note(&id).unwrap();
    assert_eq!(outcome.action, Action::PullRemoteAndArchiveLocalAsNew);
    assert_eq!(outcome.outcome, Outcome::Success);
    assert!(outcome.conflict.is_some());

    let original = note(&store, &id).await;
    assert_eq!(original.body(), "remote edit");
    assert_eq!(original.remote_id(), Some(&remote_id));
    assert!(!original.local_dirty());

    let archive_id = outcome.archived.clone().unwrap();
    assert_ne!(archive_id, id);
    let archive = note(&store, &archive_id).await;
    assert_eq!(archive.body(), "local edit");
    assert_eq!(archive.title(), "foo");
    assert_ne!(archive.remote_id(), Some(&remote_id));

    // The copy went up in the same pass
    assert!(archive.was_synced());
    assert_eq!(provider.len(), 2);
    assert_eq!(store.len(), 2);
}

#[tokio::test]
async fn test_push_local_keeps_remote_as_conflict_copy() {
    let provider = MemoryProvider::new();
    let engine = engine(&provider);
    let store = NoteStore::new();
    let (id, remote_id) = synced_note(&engine, &store, "foo", "original").await;

    store.get(&id).unwrap().lock().await.set_body("local edit");
    provider.edit_remote(&remote_id, |n| n.body = "remote edit".to_string());

    let report = pass(
        &engine,
        &store,
        ConflictResolutionStrategy::PreferLocalKeepRemote,
    )
    .await;

    let outcome = report.for_note(&id).unwrap();
    assert_eq!(outcome.action, Action::PushLocalAndArchiveRemoteAsNew);
    assert_eq!(provider.get(&remote_id).unwrap().body, "local edit");

    let archive = note(&store, outcome.archived.as_ref().unwrap()).await;
    assert_eq!(archive.body(), "remote edit");
    assert!(!archive.local_dirty());
    assert_eq!(provider.len(), 2);
}

#[tokio::test]
async fn test_plain_strategies_pick_one_side() {
    let provider = MemoryProvider::new();
    let engine = engine(&provider);
    let store = NoteStore::new();
    let (id, remote_id) = synced_note(&engine, &store, "foo", "original").await;

    store.get(&id).unwrap().lock().await.set_body("local edit");
    provider.edit_remote(&remote_id, |n| n.body = "remote edit".to_string());
    let report = pass(&engine, &store, ConflictResolutionStrategy::PreferLocal).await;
    assert_eq!(report.for_note(&id).unwrap().action, Action::PushLocal);
    assert_eq!(provider.get(&remote_id).unwrap().body, "local edit");

    store.get(&id).unwrap().lock().await.set_body("local again");
    provider.edit_remote(&remote_id, |n| n.body = "remote again".to_string());
    let report = pass(&engine, &store, ConflictResolutionStrategy::PreferRemote).await;
    assert_eq!(report.for_note(&id).unwrap().action, Action::PullRemote);
    assert_eq!(note(&store, &id).await.body(), "remote again");

    assert_eq!(store.len(), 1);
    assert_eq!(provider.len(), 1);
}

#[tokio::test]
async fn test_second_pass_is_quiet() {
    let provider = MemoryProvider::new();
    provider.insert_remote("remote", "r", &[]);
    let engine = engine(&provider);
    let store = NoteStore::new();
    store.insert(Note::new("local", "l"));

    let first = pass(&engine, &store, ConflictResolutionStrategy::default()).await;
    assert!(first.state_changed);

    let second = pass(&engine, &store, ConflictResolutionStrategy::default()).await;
    assert_eq!(second.outcomes.len(), 2);
    assert!(second.outcomes.iter().all(|o| o.action == Action::NoOp));
    assert!(second.is_quiet());
    assert!(!second.state_changed);
    assert_eq!(provider.calls(ProviderOp::Update), 0);
}

// ============================================================================
// DELETION
// ============================================================================

#[tokio::test]
async fn test_remote_deletion_removes_clean_local_note() {
    let provider = MemoryProvider::new();
    let engine = engine(&provider);
    let store = NoteStore::new();
    let (id, remote_id) = synced_note(&engine, &store, "foo", "body").await;

    provider.remove_remote(&remote_id);
    let report = pass(&engine, &store, ConflictResolutionStrategy::default()).await;

    assert_eq!(report.for_note(&id).unwrap().action, Action::DeleteLocal);
    assert!(store.get(&id).is_none());
}

#[tokio::test]
async fn test_remote_deletion_recreates_dirty_local_note() {
    let provider = MemoryProvider::new();
    let engine = engine(&provider);
    let store = NoteStore::new();
    let (id, remote_id) = synced_note(&engine, &store, "foo", "body").await;

    store.get(&id).unwrap().lock().await.set_body("still editing");
    provider.remove_remote(&remote_id);
    let report = pass(&engine, &store, ConflictResolutionStrategy::default()).await;

    assert_eq!(
        report.for_note(&id).unwrap().action,
        Action::CreateRemoteFromLocal
    );
    let local = note(&store, &id).await;
    assert_ne!(local.remote_id(), Some(&remote_id));
    assert_eq!(provider.all()[0].body, "still editing");
}

#[tokio::test]
async fn test_local_deletion_is_propagated() {
    let provider = MemoryProvider::new();
    let engine = engine(&provider);
    let store = NoteStore::new();
    let (id, remote_id) = synced_note(&engine, &store, "foo", "body").await;

    store.delete_local(&id).await.unwrap();
    assert_eq!(store.tombstones().len(), 1);

    let report = pass(&engine, &store, ConflictResolutionStrategy::default()).await;

    let outcome = report.for_remote(&remote_id).unwrap();
    assert_eq!(outcome.action, Action::DeleteRemote);
    assert_eq!(outcome.outcome, Outcome::Success);
    assert!(provider.is_empty());
    assert!(store.tombstones().is_empty());
}

#[tokio::test]
async fn test_remote_edit_survives_local_deletion() {
    let provider = MemoryProvider::new();
    let engine = engine(&provider);
    let store = NoteStore::new();
    let (id, remote_id) = synced_note(&engine, &store, "foo", "body").await;

    store.delete_local(&id).await.unwrap();
    provider.edit_remote(&remote_id, |n| n.body = "edited elsewhere".to_string());

    let report = pass(&engine, &store, ConflictResolutionStrategy::default()).await;

    let outcome = report.for_remote(&remote_id).unwrap();
    assert_eq!(outcome.action, Action::MaterializeLocalFromRemote);
    let restored = titled(&store, "foo").await;
    assert_eq!(restored.len(), 1);
    assert_eq!(restored[0].body(), "edited elsewhere");
    assert!(store.tombstones().is_empty());
    assert_eq!(provider.len(), 1);
}

// ============================================================================
// FAILURES
// ============================================================================

#[tokio::test]
async fn test_transport_failure_is_isolated() {
    let provider = MemoryProvider::new();
    let engine = engine(&provider);
    let store = NoteStore::new();
    let (a, remote_a) = synced_note(&engine, &store, "a", "a1").await;
    let (b, remote_b) = synced_note(&engine, &store, "b", "b1").await;

    store.get(&a).unwrap().lock().await.set_body("a2");
    store.get(&b).unwrap().lock().await.set_body("b2");
    provider.fail_remote(&remote_a, ProviderError::transport("connection reset"));

    let report = pass(&engine, &store, ConflictResolutionStrategy::default()).await;

    let failed = report.for_note(&a).unwrap();
    assert_eq!(failed.outcome, Outcome::TransportError);
    assert!(failed.error.as_deref().unwrap().contains("connection reset"));
    let a_note = note(&store, &a).await;
    assert!(a_note.local_dirty());
    assert_eq!(a_note.body(), "a2");

    assert_eq!(report.for_note(&b).unwrap().outcome, Outcome::Success);
    assert!(!note(&store, &b).await.local_dirty());
    assert_eq!(provider.get(&remote_b).unwrap().body, "b2");

    // Transport failures are retried on the next pass
    provider.clear_failures();
    let report = pass(&engine, &store, ConflictResolutionStrategy::default()).await;
    assert_eq!(report.for_note(&a).unwrap().action, Action::PushLocal);
    assert_eq!(provider.get(&remote_a).unwrap().body, "a2");
}

#[tokio::test]
async fn test_single_version_conflict_is_retried() {
    let provider = MemoryProvider::new();
    let engine = engine(&provider);
    let store = NoteStore::new();
    let (id, remote_id) = synced_note(&engine, &store, "foo", "first").await;

    store.get(&id).unwrap().lock().await.set_body("second");
    provider.force_version_conflicts(&remote_id, 1);

    let report = pass(&engine, &store, ConflictResolutionStrategy::default()).await;

    let outcome = report.for_note(&id).unwrap();
    assert_eq!(outcome.action, Action::PushLocal);
    assert_eq!(outcome.outcome, Outcome::Success);
    assert_eq!(provider.get(&remote_id).unwrap().body, "second");
    assert_eq!(provider.calls(ProviderOp::Update), 2);
}

#[tokio::test]
async fn test_repeated_version_conflict_is_reported() {
    let provider = MemoryProvider::new();
    let engine = engine(&provider);
    let store = NoteStore::new();
    let (id, remote_id) = synced_note(&engine, &store, "foo", "first").await;

    store.get(&id).unwrap().lock().await.set_body("second");
    provider.force_version_conflicts(&remote_id, 2);

    let report = pass(&engine, &store, ConflictResolutionStrategy::default()).await;

    assert_eq!(report.for_note(&id).unwrap().outcome, Outcome::VersionConflict);
    let local = note(&store, &id).await;
    assert!(local.local_dirty());
    assert_eq!(local.body(), "second");
    let remote = provider.get(&remote_id).unwrap();
    assert_eq!(remote.body, "first");
    assert_eq!(local.version(), Some(&remote.version));

    let report = pass(&engine, &store, ConflictResolutionStrategy::default()).await;
    assert_eq!(report.for_note(&id).unwrap().outcome, Outcome::Success);
    assert_eq!(provider.get(&remote_id).unwrap().body, "second");
}

#[tokio::test]
async fn test_protocol_error_quarantines_note() {
    let provider = MemoryProvider::new();
    let engine = engine(&provider);
    let store = NoteStore::new();
    let (id, remote_id) = synced_note(&engine, &store, "foo", "first").await;

    store.get(&id).unwrap().lock().await.set_body("second");
    provider.fail_remote(&remote_id, ProviderError::protocol("bad payload"));

    let report = pass(&engine, &store, ConflictResolutionStrategy::default()).await;
    assert_eq!(report.for_note(&id).unwrap().outcome, Outcome::ProtocolError);
    let key = QuarantineKey::Note(id.clone());
    assert!(engine.is_quarantined(&key));
    assert_eq!(engine.quarantined(), vec![key.clone()]);

    provider.clear_failures();
    let report = pass(&engine, &store, ConflictResolutionStrategy::default()).await;
    assert_eq!(report.for_note(&id).unwrap().outcome, Outcome::Skipped);
    assert_eq!(provider.get(&remote_id).unwrap().body, "first");

    assert!(engine.release_quarantine(&key));
    let report = pass(&engine, &store, ConflictResolutionStrategy::default()).await;
    assert_eq!(report.for_note(&id).unwrap().action, Action::PushLocal);
    assert_eq!(provider.get(&remote_id).unwrap().body, "second");
}

#[tokio::test]
async fn test_protocol_error_during_conflict_keeps_conflict_info() {
    let provider = MemoryProvider::new();
    let engine = engine(&provider);
    let store = NoteStore::new();
    let (id, remote_id) = synced_note(&engine, &store, "foo", "first").await;

    store.get(&id).unwrap().lock().await.set_body("local edit");
    provider.edit_remote(&remote_id, |n| n.body = "remote edit".to_string());
    provider.fail_remote(&remote_id, ProviderError::protocol("bad payload"));

    let report = pass(&engine, &store, ConflictResolutionStrategy::default()).await;

    let outcome = report.for_note(&id).unwrap();
    assert_eq!(outcome.outcome, Outcome::ProtocolError);
    assert!(outcome.conflict.is_some());
    assert!(outcome.error.as_deref().unwrap().contains("bad payload"));
    assert!(engine.is_quarantined(&QuarantineKey::Note(id.clone())));
    assert_eq!(note(&store, &id).await.body(), "local edit");
}

#[tokio::test]
async fn test_cancel_during_listing() {
    let provider = MemoryProvider::new().with_latency(Duration::from_millis(300));
    let engine = engine(&provider);
    let store = NoteStore::new();
    let handle = store.insert(Note::new("pending", "body"));
    let cancel = CancelToken::new();

    let (result, _) = tokio::join!(
        engine.run_pass(&store, ConflictResolutionStrategy::default(), 4, &cancel),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        }
    );

    assert!(matches!(result, Err(notesync::NoteSyncError::Cancelled)));
    assert!(handle.lock().await.local_dirty());
    assert!(provider.is_empty());
}

// ============================================================================
// CONCURRENCY AND CANCELLATION
// ============================================================================

#[tokio::test]
async fn test_cancel_between_notes() {
    let provider = MemoryProvider::new().with_latency(Duration::from_millis(200));
    let engine = engine(&provider);
    let store = NoteStore::new();
    for i in 0..4 {
        store.insert(Note::new(format!("note {}", i), "draft"));
    }
    let cancel = CancelToken::new();

    // Listing ends at 200ms, the first create at 400ms, the second is cut off
    let (result, _) = tokio::join!(
        engine.run_pass(&store, ConflictResolutionStrategy::default(), 1, &cancel),
        async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            cancel.cancel();
        }
    );
    let report = result.unwrap();

    assert!(report.cancelled);
    assert_eq!(report.outcomes.len(), 4);
    assert_eq!(report.count(Outcome::Success), 1);
    assert_eq!(report.count(Outcome::TransportError), 1);
    assert_eq!(report.count(Outcome::Skipped), 2);
    assert_eq!(provider.len(), 1);

    let interrupted = report
        .outcomes
        .iter()
        .find(|o| o.outcome == Outcome::TransportError)
        .unwrap();
    assert!(interrupted.error.as_deref().unwrap().contains("cancelled"));
    let interrupted = note(&store, interrupted.note.as_ref().unwrap()).await;
    assert!(interrupted.local_dirty());
    assert!(interrupted.remote_id().is_none());
    assert_eq!(interrupted.body(), "draft");

    let mut dirty = 0;
    for (_, handle) in store.handles() {
        if handle.lock().await.local_dirty() {
            dirty += 1;
        }
    }
    assert_eq!(dirty, 3);

    // Everything left behind goes out on the next pass
    let report = pass(&engine, &store, ConflictResolutionStrategy::default()).await;
    assert_eq!(report.count_action(Action::CreateRemoteFromLocal), 3);
    assert_eq!(provider.len(), 4);
}

#[tokio::test]
async fn test_user_edit_waits_for_in_flight_push() {
    let provider = MemoryProvider::new().with_latency(Duration::from_millis(200));
    let engine = engine(&provider);
    let store = NoteStore::new();
    let (id, remote_id) = synced_note(&engine, &store, "foo", "first").await;
    let handle = store.get(&id).unwrap();
    handle.lock().await.set_body("second");

    let (report, _) = tokio::join!(
        pass(&engine, &store, ConflictResolutionStrategy::default()),
        async {
            // Listing is done, the push holds the note
            tokio::time::sleep(Duration::from_millis(300)).await;
            assert!(handle.try_lock().is_err());

            let mut edited = handle.lock().await;
            assert!(!edited.local_dirty());
            assert_eq!(edited.body(), "second");
            edited.set_body("third");
        }
    );

    assert_eq!(report.for_note(&id).unwrap().outcome, Outcome::Success);
    assert_eq!(provider.get(&remote_id).unwrap().body, "second");
    let local = note(&store, &id).await;
    assert!(local.local_dirty());
    assert_eq!(local.body(), "third");
}

#[tokio::test]
async fn test_note_deleted_while_pass_waits_is_skipped() {
    let provider = MemoryProvider::new();
    let engine = engine(&provider);
    let store = NoteStore::new();
    let handle = store.insert(Note::new("doomed", "body"));
    let id = handle.lock().await.unique_name().clone();
    let guard = handle.lock().await;

    let (report, deleted) = tokio::join!(
        pass(&engine, &store, ConflictResolutionStrategy::default()),
        async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let (deleted, _) = tokio::join!(store.delete_local(&id), async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                drop(guard);
            });
            deleted
        }
    );

    assert_eq!(deleted.unwrap().title(), "doomed");
    assert_eq!(report.for_note(&id).unwrap().outcome, Outcome::Skipped);
    assert!(provider.is_empty());
    assert!(store.is_empty());
    assert!(store.tombstones().is_empty());
}

// ============================================================================
// DIRECTORY PROVIDER END TO END
// ============================================================================

#[tokio::test]
async fn test_two_devices_share_a_directory() {
    let dir = tempfile::tempdir().unwrap();
    let laptop_engine = SyncEngine::new(Arc::new(DirectoryProvider::open(dir.path()).unwrap()));
    let phone_engine = SyncEngine::new(Arc::new(DirectoryProvider::open(dir.path()).unwrap()));
    let laptop = NoteStore::new();
    let phone = NoteStore::new();
    let strategy = ConflictResolutionStrategy::default();

    let handle = laptop.insert(Note::new("groceries", "milk"));
    let laptop_id = handle.lock().await.unique_name().clone();
    pass(&laptop_engine, &laptop, strategy).await;

    let report = pass(&phone_engine, &phone, strategy).await;
    assert_eq!(report.count_action(Action::MaterializeLocalFromRemote), 1);
    let (phone_id, phone_handle) = phone.handles().remove(0);
    assert_eq!(phone_handle.lock().await.body(), "milk");

    phone_handle.lock().await.set_body("milk, eggs");
    let report = pass(&phone_engine, &phone, strategy).await;
    assert_eq!(report.for_note(&phone_id).unwrap().action, Action::PushLocal);

    let report = pass(&laptop_engine, &laptop, strategy).await;
    assert_eq!(report.for_note(&laptop_id).unwrap().action, Action::PullRemote);
    assert_eq!(handle.lock().await.body(), "milk, eggs");

    laptop.delete_local(&laptop_id).await.unwrap();
    pass(&laptop_engine, &laptop, strategy).await;
    let report = pass(&phone_engine, &phone, strategy).await;
    assert_eq!(report.for_note(&phone_id).unwrap().action, Action::DeleteLocal);
    assert!(phone.is_empty());
}

#[tokio::test]
async fn test_account_switch_reuploads_everything() {
    let old_account = MemoryProvider::new();
    let store = NoteStore::new();
    let (id, _) = synced_note(&engine(&old_account), &store, "foo", "body").await;

    store.detach_all().await;

    let new_account = MemoryProvider::new();
    let report = pass(
        &engine(&new_account),
        &store,
        ConflictResolutionStrategy::default(),
    )
    .await;
    assert_eq!(
        report.for_note(&id).unwrap().action,
        Action::CreateRemoteFromLocal
    );
    assert_eq!(new_account.len(), 1);
    assert_eq!(old_account.len(), 1);
}

// ============================================================================
// SESSION
// ============================================================================

mod session_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    use notesync::storage::{NoteDatabase, NoteRepository};
    use notesync::sync::{SyncEvent, SyncSession};
    use notesync::{ProviderConfig, SyncSettings};
    use tokio::sync::broadcast;
    use tokio::time::timeout;

    fn settings() -> SyncSettings {
        let mut settings = SyncSettings::new(ProviderConfig::Memory);
        settings.sync_interval_secs = 0;
        settings.debounce_ms = 50;
        settings.backoff_base_ms = 60_000;
        settings.backoff_max_ms = 120_000;
        settings
    }

    async fn next_report(events: &mut broadcast::Receiver<SyncEvent>) -> SyncReport {
        loop {
            match timeout(Duration::from_secs(5), events.recv()).await {
                Ok(Ok(SyncEvent::PassCompleted { report })) => return report,
                Ok(Ok(SyncEvent::PassFailed { error, .. })) => panic!("pass failed: {}", error),
                Ok(Ok(SyncEvent::PassStarted { .. })) => continue,
                Ok(Err(e)) => panic!("event channel: {}", e),
                Err(_) => panic!("no pass completed in time"),
            }
        }
    }

    #[tokio::test]
    async fn test_manual_request_runs_a_pass() {
        let provider = MemoryProvider::new();
        provider.insert_remote("bar", "remote", &[]);
        let store = Arc::new(NoteStore::new());
        let session = SyncSession::start(
            Arc::new(engine(&provider)),
            store.clone(),
            None,
            settings(),
        )
        .unwrap();
        let mut events = session.subscribe();

        session.request_sync().await.unwrap();
        let report = next_report(&mut events).await;

        assert_eq!(report.count_action(Action::MaterializeLocalFromRemote), 1);
        assert_eq!(store.len(), 1);
        assert!(session.status().last_sync.is_some());
        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_requests_during_a_pass_coalesce() {
        let provider = MemoryProvider::new().with_latency(Duration::from_millis(100));
        let store = Arc::new(NoteStore::new());
        let session = SyncSession::start(
            Arc::new(engine(&provider)),
            store,
            None,
            settings(),
        )
        .unwrap();
        let mut events = session.subscribe();

        for _ in 0..5 {
            session.request_sync().await.unwrap();
        }
        next_report(&mut events).await;
        next_report(&mut events).await;

        let extra = timeout(Duration::from_millis(400), events.recv()).await;
        assert!(extra.is_err(), "unexpected third pass");
        assert_eq!(provider.calls(ProviderOp::List), 2);
        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_local_edit_triggers_debounced_pass() {
        let provider = MemoryProvider::new();
        let store = Arc::new(NoteStore::new());
        let session = SyncSession::start(
            Arc::new(engine(&provider)),
            store.clone(),
            None,
            settings(),
        )
        .unwrap();
        let mut events = session.subscribe();

        let handle = store.insert(Note::new("typed", "a"));
        handle.lock().await.set_body("ab");
        handle.lock().await.set_body("abc");

        let report = next_report(&mut events).await;
        assert_eq!(report.count_action(Action::CreateRemoteFromLocal), 1);
        assert_eq!(provider.all()[0].body, "abc");

        // Engine writes do not echo back as edits
        let extra = timeout(Duration::from_millis(300), events.recv()).await;
        assert!(extra.is_err(), "engine changes triggered another pass");
        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_pass_backs_off() {
        let provider = MemoryProvider::new();
        provider.set_offline(true);
        let store = Arc::new(NoteStore::new());
        let session = SyncSession::start(
            Arc::new(engine(&provider)),
            store.clone(),
            None,
            settings(),
        )
        .unwrap();
        let mut events = session.subscribe();

        session.request_sync().await.unwrap();
        loop {
            match timeout(Duration::from_secs(5), events.recv()).await.unwrap() {
                Ok(SyncEvent::PassFailed { .. }) => break,
                Ok(_) => continue,
                Err(e) => panic!("event channel: {}", e),
            }
        }

        let status = session.status();
        assert_eq!(status.consecutive_failures, 1);
        assert!(status.next_allowed_at.is_some());
        assert!(status.last_error.is_some());

        // Edits wait out the backoff window
        store.insert(Note::new("offline", "draft"));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(provider.calls(ProviderOp::List), 1);
        assert!(session.status().pending_followup);

        // Manual requests do not
        provider.set_offline(false);
        session.request_sync().await.unwrap();
        let report = next_report(&mut events).await;
        assert_eq!(report.count_action(Action::CreateRemoteFromLocal), 1);
        assert_eq!(session.status().consecutive_failures, 0);

        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_provider_change_moves_notes_to_new_backend() {
        let old = MemoryProvider::new();
        let store = Arc::new(NoteStore::new());
        let db = NoteDatabase::open_in_memory().unwrap();
        db.set_account_key("memory").unwrap();
        let repository: Arc<dyn NoteRepository> = Arc::new(db.clone());
        let session = SyncSession::start(
            Arc::new(engine(&old)),
            store.clone(),
            Some(repository),
            settings(),
        )
        .unwrap();
        let mut events = session.subscribe();

        let handle = store.insert(Note::new("kept", "before switch"));
        let id = handle.lock().await.unique_name().clone();
        next_report(&mut events).await;
        assert_eq!(old.len(), 1);

        let dir = tempfile::tempdir().unwrap();
        let mut moved = settings();
        moved.provider = ProviderConfig::Directory {
            path: dir.path().to_path_buf(),
        };
        session.update_settings(moved.clone()).unwrap();
        store.insert(Note::new("fresh", "after switch"));
        session.request_sync().await.unwrap();

        let report = next_report(&mut events).await;
        assert_eq!(report.count_action(Action::CreateRemoteFromLocal), 2);
        assert_eq!(report.for_note(&id).unwrap().outcome, Outcome::Success);
        assert_eq!(session.engine().provider().name(), "directory");
        assert_eq!(old.len(), 1);
        assert_eq!(db.account_key().unwrap(), Some(moved.provider.account_key()));

        // Another device on the same directory sees both notes
        let other = SyncEngine::new(Arc::new(DirectoryProvider::open(dir.path()).unwrap()));
        let other_store = NoteStore::new();
        let report = pass(&other, &other_store, ConflictResolutionStrategy::default()).await;
        assert_eq!(report.count_action(Action::MaterializeLocalFromRemote), 2);

        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unusable_provider_change_fails_pass() {
        let old = MemoryProvider::new();
        let store = Arc::new(NoteStore::new());
        let session = SyncSession::start(
            Arc::new(engine(&old)),
            store.clone(),
            None,
            settings(),
        )
        .unwrap();
        let mut events = session.subscribe();

        let mut hosted = settings();
        hosted.provider = ProviderConfig::SimpleNote {
            username: "someone@example.com".to_string(),
            password: notesync::Credential::new("secret"),
        };
        session.update_settings(hosted).unwrap();
        session.request_sync().await.unwrap();

        let error = loop {
            match timeout(Duration::from_secs(5), events.recv()).await.unwrap() {
                Ok(SyncEvent::PassFailed { error, .. }) => break error,
                Ok(SyncEvent::PassCompleted { .. }) => {
                    panic!("pass ran against the old provider")
                }
                Ok(_) => continue,
                Err(e) => panic!("event channel: {}", e),
            }
        };
        assert!(error.contains("not built in"));
        assert_eq!(old.calls(ProviderOp::List), 0);
        assert_eq!(session.engine().provider().name(), "memory");
        assert!(session.status().last_error.is_some());

        // Going back to the original provider resumes syncing
        session.update_settings(settings()).unwrap();
        store.insert(Note::new("queued", "body"));
        let report = next_report(&mut events).await;
        assert_eq!(report.count_action(Action::CreateRemoteFromLocal), 1);
        assert_eq!(old.len(), 1);

        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending_edits() {
        let provider = MemoryProvider::new();
        let store = Arc::new(NoteStore::new());
        let db = NoteDatabase::open_in_memory().unwrap();
        let repository: Arc<dyn NoteRepository> = Arc::new(db.clone());
        let mut settings = settings();
        settings.debounce_ms = 60_000;
        let session = SyncSession::start(
            Arc::new(engine(&provider)),
            store.clone(),
            Some(repository),
            settings,
        )
        .unwrap();

        store.insert(Note::new("last minute", "unsynced"));
        session.shutdown().await.unwrap();

        assert_eq!(provider.len(), 1);
        let saved = db.load_all().unwrap();
        assert_eq!(saved.notes.len(), 1);
        assert!(!saved.notes[0].local_dirty());
        assert!(saved.notes[0].was_synced());

        assert!(session.request_sync().await.is_err());
    }
}
