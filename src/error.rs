//! Error types for notesync

use thiserror::Error;

use crate::types::{RemoteId, VersionMarker};

/// Result type alias for notesync operations
pub type Result<T> = std::result::Result<T, NoteSyncError>;

/// Failure reported by a storage provider.
///
/// The engine reacts differently to each variant: transport failures are
/// retried on the next pass, protocol failures quarantine the note, version
/// conflicts get one reclassify-and-retry round.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Network or authentication failure; nothing was changed remotely
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed response or backend contract violation
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The remote changed since `expected` was observed
    #[error("Version conflict on {remote_id}: expected {expected:?}")]
    VersionConflict {
        remote_id: RemoteId,
        expected: Option<VersionMarker>,
    },

    /// The remote note disappeared between listing and access
    #[error("Remote note not found: {0}")]
    NotFound(RemoteId),
}

impl ProviderError {
    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        ProviderError::Transport(message.into())
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        ProviderError::Protocol(message.into())
    }

    /// Check if the failure is safe to retry on a later pass
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ProviderError::Protocol(_))
    }

    /// Races with another writer: reclassify against a fresh listing
    pub fn is_race(&self) -> bool {
        matches!(
            self,
            ProviderError::VersionConflict { .. } | ProviderError::NotFound(_)
        )
    }
}

/// Main error type for notesync
#[derive(Error, Debug)]
pub enum NoteSyncError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Note not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Sync error: {0}")]
    Sync(String),

    #[error("Sync pass cancelled")]
    Cancelled,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl NoteSyncError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            NoteSyncError::Provider(e) => e.is_retryable(),
            NoteSyncError::Sync(_) | NoteSyncError::Cancelled => true,
            _ => false,
        }
    }

    /// Pass-level failure caused by the remote being unreachable
    pub fn is_transport(&self) -> bool {
        matches!(self, NoteSyncError::Provider(ProviderError::Transport(_)))
    }
}

impl From<toml::de::Error> for NoteSyncError {
    fn from(err: toml::de::Error) -> Self {
        NoteSyncError::Config(err.to_string())
    }
}
