//! Directory-backed storage provider
//!
//! Stores each remote note as `<remote_id>.json` inside a directory, which
//! can live on a shared or externally synced drive. The version marker of a
//! note is a truncated SHA-256 of its file contents, so any writer that
//! changes a file also changes its version.
//!
//! The version check in `update_remote` is serialized between handles that
//! share one `DirectoryProvider` (clones included). Writers in other
//! processes, or on other machines syncing the folder, are not covered: the
//! read, compare and rename are not atomic on a shared folder, so the check
//! there is best-effort and the last rename wins.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use super::{ProviderResult, StorageProvider};
use crate::error::{ProviderError, Result};
use crate::note::Note;
use crate::types::{RemoteId, RemoteNote, RemoteSummary, VersionMarker};

const NOTE_EXTENSION: &str = "json";

/// On-disk representation of one note
#[derive(Debug, Serialize, Deserialize)]
struct StoredNote {
    title: String,
    body: String,
    #[serde(default)]
    tags: Vec<String>,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
}

impl StoredNote {
    fn from_note(note: &Note) -> Self {
        Self {
            title: note.title().to_string(),
            body: note.body().to_string(),
            tags: note.tags().iter().cloned().collect(),
            created_at: note.created_at(),
            modified_at: note.modified_at(),
        }
    }
}

/// Storage provider over a directory of JSON files
#[derive(Debug, Clone)]
pub struct DirectoryProvider {
    root: PathBuf,
    /// Held across read-compare-write so in-process writers cannot both pass
    /// the version check
    write_lock: Arc<Mutex<()>>,
}

impl DirectoryProvider {
    /// Open (and create if needed) the directory
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, remote_id: &RemoteId) -> PathBuf {
        self.root.join(format!("{}.{}", remote_id.as_str(), NOTE_EXTENSION))
    }

    async fn read_note(&self, remote_id: &RemoteId) -> ProviderResult<(StoredNote, VersionMarker)> {
        let bytes = tokio::fs::read(self.path_for(remote_id))
            .await
            .map_err(|e| io_error(e, remote_id))?;
        let stored: StoredNote = serde_json::from_slice(&bytes).map_err(|e| {
            ProviderError::protocol(format!("Malformed note file {}: {}", remote_id, e))
        })?;
        Ok((stored, content_version(&bytes)))
    }

    /// Write via a temporary file and rename so readers never see a torn file
    async fn write_note(
        &self,
        remote_id: &RemoteId,
        stored: &StoredNote,
    ) -> ProviderResult<VersionMarker> {
        let bytes = serde_json::to_vec_pretty(stored)
            .map_err(|e| ProviderError::protocol(format!("Cannot encode note: {}", e)))?;
        let target = self.path_for(remote_id);
        let tmp = self.root.join(format!(".{}.tmp", remote_id.as_str()));
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| ProviderError::transport(e.to_string()))?;
        tokio::fs::rename(&tmp, &target)
            .await
            .map_err(|e| ProviderError::transport(e.to_string()))?;
        Ok(content_version(&bytes))
    }
}

/// Hash of the file contents, used as the version marker
fn content_version(bytes: &[u8]) -> VersionMarker {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    VersionMarker::new(hex::encode(hasher.finalize())[..16].to_string())
}

fn io_error(err: std::io::Error, remote_id: &RemoteId) -> ProviderError {
    if err.kind() == ErrorKind::NotFound {
        ProviderError::NotFound(remote_id.clone())
    } else {
        ProviderError::transport(err.to_string())
    }
}

fn remote_id_from_path(path: &Path) -> Option<RemoteId> {
    if path.extension().and_then(|e| e.to_str()) != Some(NOTE_EXTENSION) {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.starts_with('.') {
        return None;
    }
    Some(RemoteId::new(stem))
}

#[async_trait]
impl StorageProvider for DirectoryProvider {
    fn name(&self) -> &str {
        "directory"
    }

    async fn list_remote_summaries(&self) -> ProviderResult<Vec<RemoteSummary>> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| ProviderError::transport(e.to_string()))?;

        let mut summaries = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ProviderError::transport(e.to_string()))?
        {
            let Some(remote_id) = remote_id_from_path(&entry.path()) else {
                continue;
            };
            let bytes = match tokio::fs::read(entry.path()).await {
                Ok(bytes) => bytes,
                // Removed between read_dir and read
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(ProviderError::transport(e.to_string())),
            };
            // A malformed file is still listed so its local counterpart is not
            // mistaken for a remote deletion; fetching it reports the error.
            let modified_at = match serde_json::from_slice::<StoredNote>(&bytes) {
                Ok(stored) => stored.modified_at,
                Err(e) => {
                    tracing::warn!("Malformed note file {}: {}", remote_id, e);
                    Utc::now()
                }
            };
            summaries.push(RemoteSummary {
                remote_id,
                modified_at,
                version: content_version(&bytes),
            });
        }

        summaries.sort_by(|a, b| a.remote_id.cmp(&b.remote_id));
        Ok(summaries)
    }

    async fn fetch_full(&self, remote_id: &RemoteId) -> ProviderResult<RemoteNote> {
        let (stored, version) = self.read_note(remote_id).await?;
        Ok(RemoteNote {
            remote_id: remote_id.clone(),
            title: stored.title,
            body: stored.body,
            tags: stored.tags,
            created_at: stored.created_at,
            modified_at: stored.modified_at,
            version,
        })
    }

    async fn create_remote(&self, note: &Note) -> ProviderResult<RemoteSummary> {
        let remote_id = RemoteId::new(uuid::Uuid::new_v4().simple().to_string());
        let stored = StoredNote::from_note(note);
        let version = self.write_note(&remote_id, &stored).await?;
        Ok(RemoteSummary {
            remote_id,
            modified_at: stored.modified_at,
            version,
        })
    }

    async fn update_remote(
        &self,
        remote_id: &RemoteId,
        note: &Note,
        expected: Option<&VersionMarker>,
    ) -> ProviderResult<VersionMarker> {
        let _guard = self.write_lock.lock().await;
        let existing = tokio::fs::read(self.path_for(remote_id))
            .await
            .map_err(|e| io_error(e, remote_id))?;
        let current = content_version(&existing);
        if let Some(expected) = expected {
            if *expected != current {
                return Err(ProviderError::VersionConflict {
                    remote_id: remote_id.clone(),
                    expected: Some(expected.clone()),
                });
            }
        }
        self.write_note(remote_id, &StoredNote::from_note(note)).await
    }

    async fn delete_remote(&self, remote_id: &RemoteId) -> ProviderResult<()> {
        tokio::fs::remove_file(self.path_for(remote_id))
            .await
            .map_err(|e| io_error(e, remote_id))
    }
}
