//! notesync CLI
//!
//! Command-line shell over the sync core: manage notes in the local
//! database and sync them against the configured provider.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use notesync::storage::{NoteDatabase, NoteHandle, NoteRepository, NoteStore};
use notesync::sync::{CancelToken, Outcome, SyncEngine, SyncEvent, SyncReport, SyncSession};
use notesync::{ConflictResolutionStrategy, Note, NoteId, Provider, ProviderConfig, SyncSettings};

#[derive(Parser)]
#[command(name = "notesync")]
#[command(about = "Local notes synced against a remote store")]
#[command(version)]
struct Cli {
    /// Database path
    #[arg(long, env = "NOTESYNC_DB_PATH")]
    db_path: Option<String>,

    /// Settings file (TOML)
    #[arg(long, env = "NOTESYNC_CONFIG")]
    config: Option<String>,

    /// Directory used as the remote when no settings file is given
    #[arg(long, env = "NOTESYNC_REMOTE_DIR")]
    remote_dir: Option<String>,

    /// Conflict strategy (name or code 1-4), overrides the settings file
    #[arg(long, env = "NOTESYNC_STRATEGY")]
    strategy: Option<String>,

    /// Log as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a note
    New {
        title: String,
        #[arg(short, long, default_value = "")]
        body: String,
        /// Tags (comma-separated)
        #[arg(short = 'T', long)]
        tags: Option<String>,
    },
    /// Edit a note
    Edit {
        /// Note id or unique prefix
        id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(short, long)]
        body: Option<String>,
        /// Replace tags (comma-separated)
        #[arg(short = 'T', long)]
        tags: Option<String>,
    },
    /// List notes
    List,
    /// Show a note
    Show {
        /// Note id or unique prefix
        id: String,
    },
    /// Delete a note
    Delete {
        /// Note id or unique prefix
        id: String,
    },
    /// Run one sync pass
    Sync,
    /// Keep syncing until interrupted
    Watch,
    /// Show sync state of the local database
    Status,
    /// List conflict strategies
    Strategies,
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .init();
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("notesync")
}

fn load_settings(cli: &Cli) -> anyhow::Result<SyncSettings> {
    let mut settings = match &cli.config {
        Some(path) => {
            let path = shellexpand::tilde(path).to_string();
            SyncSettings::load(std::path::Path::new(&path))
                .with_context(|| format!("loading settings from {}", path))?
        }
        None => {
            let remote_dir = cli
                .remote_dir
                .as_ref()
                .map(|d| PathBuf::from(shellexpand::tilde(d).to_string()))
                .unwrap_or_else(|| default_data_dir().join("remote"));
            SyncSettings::new(ProviderConfig::Directory { path: remote_dir })
        }
    };
    if let Some(strategy) = &cli.strategy {
        settings.strategy = strategy.parse::<ConflictResolutionStrategy>()?;
    }
    settings.validate()?;
    Ok(settings)
}

/// Open the database and rebuild the note set. Remote identities recorded
/// for a different account are dropped.
async fn open_store(
    db_path: &str,
    settings: &SyncSettings,
) -> anyhow::Result<(NoteDatabase, Arc<NoteStore>)> {
    let db = NoteDatabase::open(db_path).with_context(|| format!("opening {}", db_path))?;
    let store = Arc::new(NoteStore::from_snapshot(db.load_all()?));

    let account = settings.provider.account_key();
    match db.account_key()? {
        Some(previous) if previous != account => {
            tracing::warn!(
                "Account changed from {} to {}, notes will be re-uploaded",
                previous,
                account
            );
            store.detach_all().await;
            db.save_all(&store.snapshot().await)?;
            db.set_account_key(&account)?;
        }
        Some(_) => {}
        None => db.set_account_key(&account)?,
    }
    Ok((db, store))
}

fn split_tags(tags: &str) -> Vec<String> {
    tags.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn resolve(store: &NoteStore, prefix: &str) -> anyhow::Result<(NoteId, NoteHandle)> {
    let mut matches: Vec<_> = store
        .handles()
        .into_iter()
        .filter(|(id, _)| id.as_str().starts_with(prefix))
        .collect();
    match matches.len() {
        0 => bail!("no note matches '{}'", prefix),
        1 => Ok(matches.remove(0)),
        n => bail!("'{}' is ambiguous ({} notes match)", prefix, n),
    }
}

fn truncate(s: &str, max: usize) -> String {
    let line = s.lines().next().unwrap_or("");
    if line.chars().count() <= max {
        line.to_string()
    } else {
        let truncated: String = line.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", truncated)
    }
}

fn print_report(report: &SyncReport) {
    for outcome in &report.outcomes {
        if outcome.action == notesync::Action::NoOp && outcome.outcome == Outcome::Success {
            continue;
        }
        let subject = outcome
            .note
            .as_ref()
            .map(|n| n.to_string())
            .or_else(|| outcome.remote_id.as_ref().map(|r| format!("remote {}", r)))
            .unwrap_or_default();
        print!("{:<40} {:<38} {:?}", outcome.action, subject, outcome.outcome);
        if let Some(error) = &outcome.error {
            print!(" ({})", error);
        }
        if let Some(archived) = &outcome.archived {
            print!(" conflict copy {}", archived);
        }
        println!();
    }
    println!(
        "{} notes, {} ok, {} failed, {} skipped",
        report.outcomes.len(),
        report.count(Outcome::Success),
        report.failures().count(),
        report.count(Outcome::Skipped)
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json_logs);

    let db_path = match &cli.db_path {
        Some(path) => shellexpand::tilde(path).to_string(),
        None => default_data_dir()
            .join("notes.db")
            .to_string_lossy()
            .to_string(),
    };

    if let Commands::Strategies = cli.command {
        for strategy in ConflictResolutionStrategy::ALL {
            println!(
                "{} {:<34} {}",
                strategy.code(),
                strategy.as_str(),
                strategy.description()
            );
        }
        return Ok(());
    }

    let settings = load_settings(&cli)?;
    let (db, store) = open_store(&db_path, &settings).await?;

    match cli.command {
        Commands::New { title, body, tags } => {
            let mut note = Note::new(title, body);
            if let Some(tags) = tags {
                note.set_tags(split_tags(&tags));
            }
            let id = note.unique_name().clone();
            store.insert(note);
            db.save_all(&store.snapshot().await)?;
            println!("Created note {}", id);
        }

        Commands::Edit {
            id,
            title,
            body,
            tags,
        } => {
            let (id, handle) = resolve(&store, &id)?;
            {
                let mut note = handle.lock().await;
                if let Some(title) = title {
                    note.set_title(title);
                }
                if let Some(body) = body {
                    note.set_body(body);
                }
                if let Some(tags) = tags {
                    note.set_tags(split_tags(&tags));
                }
            }
            db.save_all(&store.snapshot().await)?;
            println!("Updated note {}", id);
        }

        Commands::List => {
            for (id, handle) in store.handles() {
                let note = handle.lock().await;
                let marker = if note.local_dirty() { "*" } else { " " };
                let tags: Vec<&str> = note.tags().iter().map(String::as_str).collect();
                println!(
                    "{} {} [{}] {}",
                    marker,
                    id,
                    tags.join(", "),
                    truncate(note.title(), 60)
                );
            }
        }

        Commands::Show { id } => {
            let (_, handle) = resolve(&store, &id)?;
            let note = handle.lock().await;
            println!("{}", serde_json::to_string_pretty(&*note)?);
        }

        Commands::Delete { id } => {
            let (id, _) = resolve(&store, &id)?;
            store.delete_local(&id).await?;
            db.save_all(&store.snapshot().await)?;
            println!("Deleted note {}", id);
        }

        Commands::Sync => {
            let provider = Provider::from_config(&settings.provider)?;
            let engine = SyncEngine::new(Arc::new(provider));
            let report = engine
                .run_pass(
                    &store,
                    settings.strategy,
                    settings.max_concurrency,
                    &CancelToken::new(),
                )
                .await?;
            if report.state_changed {
                db.save_all(&store.snapshot().await)?;
            }
            print_report(&report);
        }

        Commands::Watch => {
            let provider = Provider::from_config(&settings.provider)?;
            let engine = Arc::new(SyncEngine::new(Arc::new(provider)));
            let repository: Arc<dyn NoteRepository> = Arc::new(db.clone());
            let session = SyncSession::start(engine, store.clone(), Some(repository), settings)?;
            let mut events = session.subscribe();
            session.request_sync().await?;

            println!("Watching, press Ctrl-C to stop");
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Ok(SyncEvent::PassCompleted { report }) => print_report(&report),
                        Ok(SyncEvent::PassFailed { error, .. }) => eprintln!("Sync failed: {}", error),
                        Ok(SyncEvent::PassStarted { .. }) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }

            session.shutdown().await?;
        }

        Commands::Status => {
            let total = store.len();
            let pending = store.pending_count().await;
            println!("Database:   {}", db.path());
            println!("Provider:   {}", settings.provider.account_key());
            println!(
                "Strategy:   {} ({})",
                settings.strategy,
                settings.strategy.description()
            );
            println!("Notes:      {}", total);
            println!("Pending:    {}", pending);
            println!("Deletions:  {}", store.tombstones().len());
        }

        Commands::Strategies => {}
    }

    Ok(())
}
