//! SQLite note database
//!
//! Local persistence for the note set. Uses WAL mode unless the database
//! sits in a cloud-synced folder, where a single-file journal is safer.

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::sync::Arc;

use super::migrations::run_migrations;
use super::queries;
use super::{NoteRepository, NoteSnapshot};
use crate::error::Result;

/// Journal mode for the note database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JournalMode {
    /// WAL for performance and crash recovery
    #[default]
    Wal,
    /// DELETE journal, safe inside Dropbox/OneDrive/iCloud folders
    CloudSafe,
}

/// SQLite-backed note repository
pub struct NoteDatabase {
    path: String,
    mode: JournalMode,
    conn: Arc<Mutex<Connection>>,
}

impl NoteDatabase {
    /// Open or create a database
    pub fn open(path: &str) -> Result<Self> {
        let mode = if is_in_cloud_folder(path) {
            JournalMode::CloudSafe
        } else {
            JournalMode::Wal
        };
        Self::open_with_mode(path, mode)
    }

    /// Open or create a database with an explicit journal mode
    pub fn open_with_mode(path: &str, mode: JournalMode) -> Result<Self> {
        let conn = Self::create_connection(path, mode)?;
        run_migrations(&conn)?;

        Ok(Self {
            path: path.to_string(),
            mode,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database for tests
    pub fn open_in_memory() -> Result<Self> {
        Self::open_with_mode(":memory:", JournalMode::Wal)
    }

    fn create_connection(path: &str, mode: JournalMode) -> Result<Connection> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = Path::new(path).parent() {
                std::fs::create_dir_all(parent)?;
            }
            Connection::open_with_flags(path, flags)?
        };

        Self::configure_pragmas(&conn, mode)?;
        Ok(conn)
    }

    fn configure_pragmas(conn: &Connection, mode: JournalMode) -> Result<()> {
        match mode {
            JournalMode::Wal => {
                conn.execute_batch(
                    r#"
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=30000;
                    PRAGMA temp_store=MEMORY;
                    PRAGMA foreign_keys=ON;
                    "#,
                )?;
            }
            JournalMode::CloudSafe => {
                conn.execute_batch(
                    r#"
                    PRAGMA journal_mode=DELETE;
                    PRAGMA synchronous=FULL;
                    PRAGMA busy_timeout=30000;
                    PRAGMA temp_store=MEMORY;
                    PRAGMA foreign_keys=ON;
                    "#,
                )?;
            }
        }
        Ok(())
    }

    /// Execute a function with the connection
    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Execute a function inside a transaction
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn journal_mode(&self) -> JournalMode {
        self.mode
    }
}

impl NoteRepository for NoteDatabase {
    fn load_all(&self) -> Result<NoteSnapshot> {
        self.with_connection(|conn| {
            Ok(NoteSnapshot {
                notes: queries::load_notes(conn)?,
                tombstones: queries::load_tombstones(conn)?,
            })
        })
    }

    fn save_all(&self, snapshot: &NoteSnapshot) -> Result<()> {
        self.with_transaction(|conn| {
            queries::replace_notes(conn, &snapshot.notes)?;
            queries::replace_tombstones(conn, &snapshot.tombstones)
        })
    }

    fn account_key(&self) -> Result<Option<String>> {
        self.with_connection(|conn| queries::get_meta(conn, "account_key"))
    }

    fn set_account_key(&self, key: &str) -> Result<()> {
        self.with_connection(|conn| queries::set_meta(conn, "account_key", key))
    }
}

impl Clone for NoteDatabase {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            mode: self.mode,
            conn: self.conn.clone(),
        }
    }
}

/// Check if a path appears to be in a cloud-synced folder
pub fn is_in_cloud_folder(path: &str) -> bool {
    let path = path.to_lowercase();
    path.contains("dropbox")
        || path.contains("onedrive")
        || path.contains("icloud")
        || path.contains("google drive")
}
