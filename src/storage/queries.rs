//! Database queries for notes and tombstones

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::Tombstone;
use crate::error::Result;
use crate::note::{Note, NoteRecord};
use crate::types::{NoteId, RemoteId, VersionMarker};

/// Read an RFC 3339 timestamp column. Unparseable values are reported, not
/// replaced, so a corrupt row never gets silently rewritten on the next save.
fn time_column(row: &Row, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    let value: String = row.get(column)?;
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

fn tags_column(row: &Row, column: usize) -> rusqlite::Result<Vec<String>> {
    let value: String = row.get(column)?;
    serde_json::from_str(&value)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

fn column(row: &Row, name: &str) -> rusqlite::Result<usize> {
    row.as_ref().column_index(name)
}

/// Parse a note from a database row
pub fn note_from_row(row: &Row) -> rusqlite::Result<Note> {
    let unique_name: String = row.get("unique_name")?;
    let remote_id: Option<String> = row.get("remote_id")?;
    let version: Option<String> = row.get("version")?;
    let local_dirty: i32 = row.get("local_dirty")?;
    let remote_dirty: i32 = row.get("remote_dirty")?;

    let record = NoteRecord {
        unique_name: NoteId::new(unique_name),
        remote_id: remote_id.map(RemoteId::new),
        version: version.map(VersionMarker::new),
        title: row.get("title")?,
        body: row.get("body")?,
        tags: tags_column(row, column(row, "tags")?)?,
        created_at: time_column(row, column(row, "created_at")?)?,
        modified_at: time_column(row, column(row, "modified_at")?)?,
        local_dirty: local_dirty != 0,
        remote_dirty: remote_dirty != 0,
    };
    Ok(record.into())
}

/// Load every note
pub fn load_notes(conn: &Connection) -> Result<Vec<Note>> {
    let mut stmt = conn.prepare(
        "SELECT unique_name, remote_id, version, title, body, tags, created_at,
                modified_at, local_dirty, remote_dirty
         FROM notes ORDER BY created_at, unique_name",
    )?;
    let notes = stmt
        .query_map([], note_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(notes)
}

/// Replace the stored note set with `notes`
pub fn replace_notes(conn: &Connection, notes: &[Note]) -> Result<()> {
    conn.execute("DELETE FROM notes", [])?;
    let mut stmt = conn.prepare(
        "INSERT INTO notes (unique_name, remote_id, version, title, body, tags,
                            created_at, modified_at, local_dirty, remote_dirty)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )?;
    for note in notes {
        let record = NoteRecord::from(note);
        stmt.execute(params![
            record.unique_name.as_str(),
            record.remote_id.as_ref().map(|r| r.as_str()),
            record.version.as_ref().map(|v| v.as_str()),
            record.title,
            record.body,
            serde_json::to_string(&record.tags)?,
            record.created_at.to_rfc3339(),
            record.modified_at.to_rfc3339(),
            record.local_dirty as i32,
            record.remote_dirty as i32,
        ])?;
    }
    Ok(())
}

/// Load pending remote deletions
pub fn load_tombstones(conn: &Connection) -> Result<Vec<Tombstone>> {
    let mut stmt = conn.prepare(
        "SELECT remote_id, unique_name, version, deleted_at FROM tombstones ORDER BY deleted_at",
    )?;
    let tombstones = stmt
        .query_map([], |row| {
            let remote_id: String = row.get(0)?;
            let unique_name: String = row.get(1)?;
            let version: Option<String> = row.get(2)?;
            Ok(Tombstone {
                remote_id: RemoteId::new(remote_id),
                note: NoteId::new(unique_name),
                version: version.map(VersionMarker::new),
                deleted_at: time_column(row, 3)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(tombstones)
}

/// Replace the stored tombstones
pub fn replace_tombstones(conn: &Connection, tombstones: &[Tombstone]) -> Result<()> {
    conn.execute("DELETE FROM tombstones", [])?;
    let mut stmt = conn.prepare(
        "INSERT INTO tombstones (remote_id, unique_name, version, deleted_at) VALUES (?, ?, ?, ?)",
    )?;
    for tombstone in tombstones {
        stmt.execute(params![
            tombstone.remote_id.as_str(),
            tombstone.note.as_str(),
            tombstone.version.as_ref().map(|v| v.as_str()),
            tombstone.deleted_at.to_rfc3339(),
        ])?;
    }
    Ok(())
}

pub fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    let value = conn
        .query_row("SELECT value FROM meta WHERE key = ?", params![key], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(value)
}

pub fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO meta (key, value) VALUES (?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}
