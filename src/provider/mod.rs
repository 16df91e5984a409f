//! Storage provider capability
//!
//! This module defines the `StorageProvider` trait that every remote note
//! backend implements. The sync engine only ever talks to this trait; the
//! concrete backend is picked once from [`ProviderConfig`] and wrapped in the
//! closed [`Provider`] enum.
//!
//! # Design Principles
//!
//! 1. **Async Interface**: every operation is a network round-trip and a
//!    suspension point for the engine.
//!
//! 2. **Typed Failures**: operations return [`ProviderError`] so the engine
//!    can tell transport failures from protocol failures and version races.
//!
//! 3. **Optimistic Concurrency**: `update_remote` must reject a write whose
//!    expected version marker no longer matches the remote.

mod directory;
mod memory;

pub use directory::DirectoryProvider;
pub use memory::{MemoryProvider, ProviderOp};

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{NoteSyncError, ProviderError, Result};
use crate::note::Note;
use crate::types::{Credential, RemoteId, RemoteNote, RemoteSummary, VersionMarker};

/// Result type for provider operations
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Abstract remote note storage
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &str;

    /// Cheap metadata listing of every remote note, without bodies
    async fn list_remote_summaries(&self) -> ProviderResult<Vec<RemoteSummary>>;

    /// Fetch the full content of one remote note
    async fn fetch_full(&self, remote_id: &RemoteId) -> ProviderResult<RemoteNote>;

    /// Create a remote copy of `note`, returning its new identity and version
    async fn create_remote(&self, note: &Note) -> ProviderResult<RemoteSummary>;

    /// Overwrite a remote note.
    ///
    /// Fails with [`ProviderError::VersionConflict`] when the remote version
    /// differs from `expected`. `None` means the caller has no version on
    /// record and the write is unconditional.
    async fn update_remote(
        &self,
        remote_id: &RemoteId,
        note: &Note,
        expected: Option<&VersionMarker>,
    ) -> ProviderResult<VersionMarker>;

    /// Delete a remote note
    async fn delete_remote(&self, remote_id: &RemoteId) -> ProviderResult<()>;
}

/// Backend selection, as stored in the settings file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderConfig {
    /// In-process remote, nothing leaves the machine
    Memory,
    /// One JSON file per note in a (possibly shared) directory
    Directory { path: PathBuf },
    /// SimpleNote account; the HTTP client ships as a separate plugin
    SimpleNote {
        username: String,
        #[serde(default)]
        password: Credential,
    },
    /// StandardNotes server; the HTTP client ships as a separate plugin
    StandardNote {
        server: String,
        email: String,
        #[serde(default)]
        password: Credential,
    },
}

impl ProviderConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderConfig::Memory => "memory",
            ProviderConfig::Directory { .. } => "directory",
            ProviderConfig::SimpleNote { .. } => "simple_note",
            ProviderConfig::StandardNote { .. } => "standard_note",
        }
    }

    /// Identifies the remote account. Notes synced against one account carry
    /// remote identities that mean nothing to another.
    pub fn account_key(&self) -> String {
        match self {
            ProviderConfig::Memory => "memory".to_string(),
            ProviderConfig::Directory { path } => format!("directory:{}", path.display()),
            ProviderConfig::SimpleNote { username, .. } => format!("simple_note:{}", username),
            ProviderConfig::StandardNote { server, email, .. } => {
                format!("standard_note:{}@{}", email, server)
            }
        }
    }
}

/// The configured backend
#[derive(Clone)]
pub enum Provider {
    Memory(MemoryProvider),
    Directory(DirectoryProvider),
    /// Backend implemented outside this crate (e.g. an HTTP plugin)
    External(Arc<dyn StorageProvider>),
}

impl Provider {
    /// Build the backend named by the configuration
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        match config {
            ProviderConfig::Memory => Ok(Provider::Memory(MemoryProvider::new())),
            ProviderConfig::Directory { path } => {
                let expanded = shellexpand::tilde(&path.to_string_lossy()).to_string();
                Ok(Provider::Directory(DirectoryProvider::open(expanded)?))
            }
            other => Err(NoteSyncError::Config(format!(
                "Provider '{}' is not built in; register it with Provider::External",
                other.kind()
            ))),
        }
    }

    fn inner(&self) -> &dyn StorageProvider {
        match self {
            Provider::Memory(p) => p,
            Provider::Directory(p) => p,
            Provider::External(p) => p.as_ref(),
        }
    }
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Provider({})", self.inner().name())
    }
}

#[async_trait]
impl StorageProvider for Provider {
    fn name(&self) -> &str {
        self.inner().name()
    }

    async fn list_remote_summaries(&self) -> ProviderResult<Vec<RemoteSummary>> {
        self.inner().list_remote_summaries().await
    }

    async fn fetch_full(&self, remote_id: &RemoteId) -> ProviderResult<RemoteNote> {
        self.inner().fetch_full(remote_id).await
    }

    async fn create_remote(&self, note: &Note) -> ProviderResult<RemoteSummary> {
        self.inner().create_remote(note).await
    }

    async fn update_remote(
        &self,
        remote_id: &RemoteId,
        note: &Note,
        expected: Option<&VersionMarker>,
    ) -> ProviderResult<VersionMarker> {
        self.inner().update_remote(remote_id, note, expected).await
    }

    async fn delete_remote(&self, remote_id: &RemoteId) -> ProviderResult<()> {
        self.inner().delete_remote(remote_id).await
    }
}
