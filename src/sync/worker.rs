//! Background sync session with debouncing and backoff
//!
//! The session owns a worker task that decides when passes run. Triggers are
//! the periodic timer, manual requests and (debounced) local edits. At most
//! one pass is in flight; triggers arriving meanwhile collapse into a single
//! follow-up pass.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};

use super::engine::{CancelToken, SyncEngine};
use super::events::{SyncEvent, SyncNotifier, SyncReport};
use crate::error::{NoteSyncError, Result};
use crate::provider::Provider;
use crate::storage::{NoteRepository, NoteStore, StoreEvent};
use crate::types::{SyncSettings, SyncStatus};

/// Commands for the sync worker
#[derive(Debug)]
pub enum SyncCommand {
    /// Manual sync request; ignores backoff
    Sync,
    /// A note was edited (debounced)
    LocalEdit,
    /// Cancel the pass in flight
    Cancel,
    /// Finish the current pass, run a final one if needed, then stop
    Shutdown(oneshot::Sender<()>),
}

/// Delay before the next automatic pass after `failures` consecutive
/// pass-level transport failures: `base * 2^(failures - 1)`, capped at `max`.
pub fn backoff_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }
    let factor = 2u32.saturating_pow(failures - 1);
    base.saturating_mul(factor).min(max)
}

/// Handle to a running sync session
pub struct SyncSession {
    sender: mpsc::Sender<SyncCommand>,
    status: Arc<RwLock<SyncStatus>>,
    notifier: SyncNotifier,
    settings: watch::Sender<SyncSettings>,
    engine: Arc<RwLock<Arc<SyncEngine>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncSession {
    /// Start the worker task. Must be called inside a tokio runtime.
    ///
    /// `engine` must talk to the provider named in `settings`. When a later
    /// settings update names another provider or account, the next pass
    /// builds a new engine for it and detaches every note from the old one.
    pub fn start(
        engine: Arc<SyncEngine>,
        store: Arc<NoteStore>,
        repository: Option<Arc<dyn NoteRepository>>,
        settings: SyncSettings,
    ) -> Result<Self> {
        settings.validate()?;

        let (sender, receiver) = mpsc::channel::<SyncCommand>(100);
        let (settings_tx, settings_rx) = watch::channel(settings);
        let status = Arc::new(RwLock::new(SyncStatus::default()));
        let notifier = SyncNotifier::new();
        let store_events = store.subscribe();
        let engine = Arc::new(RwLock::new(engine));

        let worker = Worker::new(
            engine.clone(),
            store,
            repository,
            settings_rx,
            status.clone(),
            notifier.clone(),
        );
        let task = tokio::spawn(worker.run(receiver, store_events));

        Ok(Self {
            sender,
            status,
            notifier,
            settings: settings_tx,
            engine,
            task: Mutex::new(Some(task)),
        })
    }

    async fn send(&self, command: SyncCommand) -> Result<()> {
        self.sender
            .send(command)
            .await
            .map_err(|_| NoteSyncError::Sync("Worker channel closed".to_string()))
    }

    /// Request a pass now, bypassing any backoff
    pub async fn request_sync(&self) -> Result<()> {
        self.send(SyncCommand::Sync).await
    }

    /// Report a local edit; a pass follows after the debounce period
    pub async fn notify_local_edit(&self) -> Result<()> {
        self.send(SyncCommand::LocalEdit).await
    }

    /// Cancel the pass in flight, if any
    pub async fn cancel_pass(&self) -> Result<()> {
        self.send(SyncCommand::Cancel).await
    }

    /// Replace the settings; takes effect at the next pass start
    pub fn update_settings(&self, settings: SyncSettings) -> Result<()> {
        settings.validate()?;
        self.settings.send_replace(settings);
        Ok(())
    }

    pub fn settings(&self) -> SyncSettings {
        self.settings.borrow().clone()
    }

    pub fn status(&self) -> SyncStatus {
        self.status.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.notifier.subscribe()
    }

    /// Engine used by the next pass
    pub fn engine(&self) -> Arc<SyncEngine> {
        self.engine.read().clone()
    }

    /// Stop the worker after a final pass and a last save
    pub async fn shutdown(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send(SyncCommand::Shutdown(ack_tx)).await?;
        ack_rx
            .await
            .map_err(|_| NoteSyncError::Sync("Worker stopped before acknowledging".to_string()))?;

        let task = self.task.lock().take();
        if let Some(task) = task {
            task.await
                .map_err(|e| NoteSyncError::Sync(format!("Worker task failed: {}", e)))?;
        }
        Ok(())
    }
}

struct InFlight {
    handle: JoinHandle<Result<SyncReport>>,
    cancel: CancelToken,
}

struct Worker {
    engine: Arc<RwLock<Arc<SyncEngine>>>,
    /// Account the current engine syncs against
    account: String,
    store: Arc<NoteStore>,
    repository: Option<Arc<dyn NoteRepository>>,
    settings: watch::Receiver<SyncSettings>,
    status: Arc<RwLock<SyncStatus>>,
    notifier: SyncNotifier,
    in_flight: Option<InFlight>,
    /// A trigger arrived that still needs a pass
    pending: bool,
    /// The pending trigger was a manual request
    pending_manual: bool,
    edit_deadline: Option<Instant>,
    failures: u32,
    backoff_until: Option<Instant>,
}

impl Worker {
    fn new(
        engine: Arc<RwLock<Arc<SyncEngine>>>,
        store: Arc<NoteStore>,
        repository: Option<Arc<dyn NoteRepository>>,
        settings: watch::Receiver<SyncSettings>,
        status: Arc<RwLock<SyncStatus>>,
        notifier: SyncNotifier,
    ) -> Self {
        let account = settings.borrow().provider.account_key();
        Self {
            engine,
            account,
            store,
            repository,
            settings,
            status,
            notifier,
            in_flight: None,
            pending: false,
            pending_manual: false,
            edit_deadline: None,
            failures: 0,
            backoff_until: None,
        }
    }

    async fn run(
        mut self,
        mut receiver: mpsc::Receiver<SyncCommand>,
        mut store_events: broadcast::Receiver<StoreEvent>,
    ) {
        let mut store_open = true;
        let mut timer = self.make_timer();

        loop {
            let backoff_wake = if self.pending && self.in_flight.is_none() {
                self.backoff_until
            } else {
                None
            };

            tokio::select! {
                cmd = receiver.recv() => {
                    match cmd {
                        Some(SyncCommand::Sync) => self.trigger(true),
                        Some(SyncCommand::LocalEdit) => self.local_edit(),
                        Some(SyncCommand::Cancel) => self.cancel(),
                        Some(SyncCommand::Shutdown(ack)) => {
                            self.finish().await;
                            let _ = ack.send(());
                            break;
                        }
                        None => {
                            self.finish().await;
                            break;
                        }
                    }
                }
                event = store_events.recv(), if store_open => {
                    match event {
                        Ok(StoreEvent::Changed(_))
                        | Ok(StoreEvent::Added(_))
                        | Ok(StoreEvent::Removed(_))
                        | Err(broadcast::error::RecvError::Lagged(_)) => self.local_edit(),
                        Err(broadcast::error::RecvError::Closed) => store_open = false,
                    }
                }
                _ = tick(&mut timer) => {
                    tracing::debug!("Sync timer fired");
                    self.trigger(false);
                }
                _ = sleep_until_opt(self.edit_deadline) => {
                    self.edit_deadline = None;
                    tracing::debug!("Debounce period elapsed");
                    self.trigger(false);
                }
                _ = sleep_until_opt(backoff_wake) => {
                    tracing::debug!("Backoff elapsed, running deferred pass");
                    self.backoff_until = None;
                    self.start_followup();
                }
                result = wait_pass(&mut self.in_flight) => {
                    self.in_flight = None;
                    self.complete(result).await;
                    self.start_followup();
                }
            }
        }

        tracing::info!("Sync worker stopped");
    }

    fn make_timer(&self) -> Option<Interval> {
        let secs = self.settings.borrow().sync_interval_secs;
        if secs == 0 {
            return None;
        }
        let period = Duration::from_secs(secs);
        let mut timer = interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Some(timer)
    }

    fn local_edit(&mut self) {
        let debounce = Duration::from_millis(self.settings.borrow().debounce_ms);
        self.edit_deadline = Some(Instant::now() + debounce);
    }

    fn in_backoff(&self) -> bool {
        self.backoff_until
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }

    /// Handle a trigger. Manual requests bypass the backoff window.
    fn trigger(&mut self, manual: bool) {
        if self.in_flight.is_some() {
            self.pending = true;
            self.pending_manual |= manual;
            self.update_status();
            return;
        }
        if !manual && self.in_backoff() {
            tracing::debug!("In backoff, deferring pass");
            self.pending = true;
            self.update_status();
            return;
        }
        self.start_pass();
    }

    fn start_followup(&mut self) {
        if !self.pending || self.in_flight.is_some() {
            return;
        }
        let manual = std::mem::take(&mut self.pending_manual);
        self.pending = false;
        self.trigger(manual);
    }

    fn cancel(&mut self) {
        if let Some(in_flight) = &self.in_flight {
            tracing::info!("Cancelling sync pass");
            in_flight.cancel.cancel();
        }
        self.pending = false;
        self.pending_manual = false;
        self.update_status();
    }

    /// Engine for the provider named in `settings`. A changed account
    /// replaces the engine; the returned key is the account to adopt.
    fn engine_for(
        &mut self,
        settings: &SyncSettings,
    ) -> Result<(Arc<SyncEngine>, Option<String>)> {
        let account = settings.provider.account_key();
        if account == self.account {
            return Ok((self.engine.read().clone(), None));
        }
        let provider = Provider::from_config(&settings.provider)?;
        tracing::warn!(
            "Provider changed from {} to {}, notes will be re-uploaded",
            self.account,
            account
        );
        let engine = Arc::new(SyncEngine::new(Arc::new(provider)));
        *self.engine.write() = engine.clone();
        self.account = account.clone();
        Ok((engine, Some(account)))
    }

    fn start_pass(&mut self) {
        let settings = self.settings.borrow().clone();
        let (engine, adopt) = match self.engine_for(&settings) {
            Ok(found) => found,
            Err(e) => {
                tracing::error!("Configured provider is unusable: {}", e);
                self.pending = false;
                self.pending_manual = false;
                self.status.write().last_error = Some(e.to_string());
                self.update_status();
                self.notifier.broadcast(SyncEvent::PassFailed {
                    at: Utc::now(),
                    error: e.to_string(),
                });
                return;
            }
        };
        let cancel = CancelToken::new();
        let store = self.store.clone();
        let repository = self.repository.clone();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            if let Some(account) = adopt {
                adopt_account(&store, repository, account).await?;
            }
            engine
                .run_pass(&store, settings.strategy, settings.max_concurrency, &token)
                .await
        });

        self.in_flight = Some(InFlight { handle, cancel });
        self.pending = false;
        self.pending_manual = false;
        self.notifier
            .broadcast(SyncEvent::PassStarted { at: Utc::now() });
        self.update_status();
    }

    async fn complete(&mut self, result: std::result::Result<Result<SyncReport>, JoinError>) {
        let outcome = result
            .map_err(|e| NoteSyncError::Sync(format!("Sync pass panicked: {}", e)))
            .and_then(|r| r);

        let event = match outcome {
            Ok(report) => {
                self.failures = 0;
                self.backoff_until = None;
                {
                    let mut status = self.status.write();
                    status.last_sync = Some(report.completed_at);
                    status.last_error = None;
                }
                if report.state_changed {
                    self.persist().await;
                }
                Some(SyncEvent::PassCompleted { report })
            }
            Err(NoteSyncError::Cancelled) => {
                tracing::info!("Sync pass cancelled before it started");
                None
            }
            Err(e) => {
                if e.is_transport() {
                    self.failures += 1;
                    let delay = self.next_backoff();
                    self.backoff_until = Some(Instant::now() + delay);
                    tracing::warn!(
                        "Sync pass failed ({} in a row), backing off {:?}: {}",
                        self.failures,
                        delay,
                        e
                    );
                } else {
                    tracing::error!("Sync pass failed: {}", e);
                }
                self.status.write().last_error = Some(e.to_string());
                Some(SyncEvent::PassFailed {
                    at: Utc::now(),
                    error: e.to_string(),
                })
            }
        };
        self.update_status();
        if let Some(event) = event {
            self.notifier.broadcast(event);
        }
    }

    /// Exponential delay plus up to 10% jitter, never above the cap
    fn next_backoff(&self) -> Duration {
        let settings = self.settings.borrow();
        let base = Duration::from_millis(settings.backoff_base_ms);
        let max = Duration::from_millis(settings.backoff_max_ms);
        let delay = backoff_delay(base, max, self.failures);
        let jitter_ms = (delay.as_millis() / 10) as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        (delay + jitter).min(max)
    }

    async fn persist(&self) {
        let Some(repository) = self.repository.clone() else {
            return;
        };
        let snapshot = self.store.snapshot().await;
        let count = snapshot.notes.len();
        match tokio::task::spawn_blocking(move || repository.save_all(&snapshot)).await {
            Ok(Ok(())) => tracing::debug!("Saved {} notes", count),
            Ok(Err(e)) => tracing::error!("Saving notes failed: {}", e),
            Err(e) => tracing::error!("Save task failed: {}", e),
        }
    }

    /// Wait for the pass in flight, run a final pass when local changes are
    /// still unsynced, then save.
    async fn finish(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            let result = in_flight.handle.await;
            self.complete(result).await;
        }

        if self.store.pending_count().await > 0 {
            tracing::info!("Running final sync pass before shutdown");
            let settings = self.settings.borrow().clone();
            let result = async {
                let (engine, adopt) = self.engine_for(&settings)?;
                if let Some(account) = adopt {
                    adopt_account(&self.store, self.repository.clone(), account).await?;
                }
                engine
                    .run_pass(
                        &self.store,
                        settings.strategy,
                        settings.max_concurrency,
                        &CancelToken::new(),
                    )
                    .await
            }
            .await;
            self.complete(Ok(result)).await;
        }

        self.persist().await;
    }

    fn update_status(&self) {
        let mut status = self.status.write();
        status.is_syncing = self.in_flight.is_some();
        status.pending_followup = self.pending;
        status.consecutive_failures = self.failures;
        status.next_allowed_at = self.backoff_until.and_then(|until| {
            let remaining = until.saturating_duration_since(Instant::now());
            chrono::Duration::from_std(remaining)
                .ok()
                .map(|d| Utc::now() + d)
        });
    }
}

/// Detach every note from the previous account and record the new one
async fn adopt_account(
    store: &NoteStore,
    repository: Option<Arc<dyn NoteRepository>>,
    account: String,
) -> Result<()> {
    store.detach_all().await;
    let Some(repository) = repository else {
        return Ok(());
    };
    let snapshot = store.snapshot().await;
    tokio::task::spawn_blocking(move || {
        repository.save_all(&snapshot)?;
        repository.set_account_key(&account)
    })
    .await
    .map_err(|e| NoteSyncError::Sync(format!("Save task failed: {}", e)))?
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn wait_pass(
    in_flight: &mut Option<InFlight>,
) -> std::result::Result<Result<SyncReport>, JoinError> {
    match in_flight {
        Some(in_flight) => (&mut in_flight.handle).await,
        None => std::future::pending().await,
    }
}
