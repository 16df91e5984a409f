//! Core types for notesync

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{NoteSyncError, Result};
use crate::provider::ProviderConfig;

/// Locally generated unique name of a note, stable for its lifetime
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NoteId(String);

impl NoteId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh unique name
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque per-note identifier assigned by a storage provider
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteId(String);

impl RemoteId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque token identifying a version of remote content
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionMarker(String);

impl VersionMarker {
    pub fn new(marker: impl Into<String>) -> Self {
        Self(marker.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cheap metadata listing entry for one remote note
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSummary {
    pub remote_id: RemoteId,
    pub modified_at: DateTime<Utc>,
    pub version: VersionMarker,
}

/// Full snapshot of a remote note as returned by `fetch_full`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteNote {
    pub remote_id: RemoteId,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub version: VersionMarker,
}

impl RemoteNote {
    /// Summary view of this snapshot
    pub fn summary(&self) -> RemoteSummary {
        RemoteSummary {
            remote_id: self.remote_id.clone(),
            modified_at: self.modified_at,
            version: self.version.clone(),
        }
    }
}

/// How a true conflict (both sides changed) is resolved.
///
/// Numeric codes match the values persisted by older settings files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolutionStrategy {
    /// Local copy wins, remote is overwritten
    #[serde(rename = "use_client_version", alias = "prefer-local")]
    PreferLocal = 1,
    /// Remote copy wins, local is overwritten
    #[serde(rename = "use_server_version", alias = "prefer-remote")]
    PreferRemote = 2,
    /// Local wins, remote content is kept as a new note
    #[default]
    #[serde(
        rename = "use_client_create_conflict_file",
        alias = "prefer-local-keep-remote-as-conflict-copy"
    )]
    PreferLocalKeepRemote = 3,
    /// Remote wins, local content is kept as a new note
    #[serde(
        rename = "use_server_create_conflict_file",
        alias = "prefer-remote-keep-local-as-conflict-copy"
    )]
    PreferRemoteKeepLocal = 4,
}

impl ConflictResolutionStrategy {
    pub const ALL: [ConflictResolutionStrategy; 4] = [
        ConflictResolutionStrategy::PreferLocal,
        ConflictResolutionStrategy::PreferRemote,
        ConflictResolutionStrategy::PreferLocalKeepRemote,
        ConflictResolutionStrategy::PreferRemoteKeepLocal,
    ];

    /// Stable configuration name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreferLocal => "use_client_version",
            Self::PreferRemote => "use_server_version",
            Self::PreferLocalKeepRemote => "use_client_create_conflict_file",
            Self::PreferRemoteKeepLocal => "use_server_create_conflict_file",
        }
    }

    /// Human readable label for settings screens
    pub fn description(&self) -> &'static str {
        match self {
            Self::PreferLocal => "Use client version, override server",
            Self::PreferRemote => "Use server version, override client",
            Self::PreferLocalKeepRemote => "Use client version, create conflict note",
            Self::PreferRemoteKeepLocal => "Use server version, create conflict note",
        }
    }

    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    /// Whether the local side wins a true conflict
    pub fn local_wins(&self) -> bool {
        matches!(self, Self::PreferLocal | Self::PreferLocalKeepRemote)
    }

    /// Whether the losing side is preserved as a conflict copy
    pub fn keeps_conflict_copy(&self) -> bool {
        matches!(
            self,
            Self::PreferLocalKeepRemote | Self::PreferRemoteKeepLocal
        )
    }
}

impl fmt::Display for ConflictResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictResolutionStrategy {
    type Err = NoteSyncError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_lowercase();
        if let Ok(code) = normalized.parse::<u8>() {
            return Self::from_code(code).ok_or_else(|| {
                NoteSyncError::Config(format!("Unknown conflict strategy code: {}", code))
            });
        }
        match normalized.as_str() {
            "use_client_version" | "prefer-local" => Ok(Self::PreferLocal),
            "use_server_version" | "prefer-remote" => Ok(Self::PreferRemote),
            "use_client_create_conflict_file" | "prefer-local-keep-remote-as-conflict-copy" => {
                Ok(Self::PreferLocalKeepRemote)
            }
            "use_server_create_conflict_file" | "prefer-remote-keep-local-as-conflict-copy" => {
                Ok(Self::PreferRemoteKeepLocal)
            }
            other => Err(NoteSyncError::Config(format!(
                "Unknown conflict strategy: {}",
                other
            ))),
        }
    }
}

/// Opaque credential blob handed to a provider; never printed
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// Sync configuration, read as an immutable snapshot at pass start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Active storage provider
    pub provider: ProviderConfig,
    /// Conflict resolution strategy
    #[serde(default)]
    pub strategy: ConflictResolutionStrategy,
    /// Periodic sync interval in seconds (0 = timer disabled)
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
    /// Quiet period after a local edit before syncing
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,
    /// First backoff delay after a failed pass
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,
    /// Backoff ceiling
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,
    /// Maximum number of note actions in flight during a pass
    #[serde(default = "default_concurrency")]
    pub max_concurrency: usize,
}

fn default_sync_interval() -> u64 {
    300
}

fn default_debounce() -> u64 {
    2000
}

fn default_backoff_base() -> u64 {
    1000
}

fn default_backoff_max() -> u64 {
    5 * 60 * 1000
}

fn default_concurrency() -> usize {
    4
}

impl SyncSettings {
    /// Settings with defaults for the given provider
    pub fn new(provider: ProviderConfig) -> Self {
        Self {
            provider,
            strategy: ConflictResolutionStrategy::default(),
            sync_interval_secs: default_sync_interval(),
            debounce_ms: default_debounce(),
            backoff_base_ms: default_backoff_base(),
            backoff_max_ms: default_backoff_max(),
            max_concurrency: default_concurrency(),
        }
    }

    pub fn with_strategy(mut self, strategy: ConflictResolutionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Parse settings from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        let settings: SyncSettings = toml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a TOML file
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(NoteSyncError::Config(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(NoteSyncError::Config(
                "backoff_base_ms must not exceed backoff_max_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Snapshot of the scheduler state for display
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncStatus {
    pub is_syncing: bool,
    pub pending_followup: bool,
    pub consecutive_failures: u32,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub next_allowed_at: Option<DateTime<Utc>>,
}
