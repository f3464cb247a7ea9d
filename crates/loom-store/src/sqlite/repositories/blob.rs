//! Blob repository: content-addressable storage with SHA-256 dedup.
//!
//! Debug payloads and large attachments are moved out of the event log into
//! this table. Callers exchange content as base64 strings; the table stores
//! decoded bytes. Saving content that already exists bumps the reference
//! count and returns the existing ID.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::errors::Result;
use crate::sqlite::row_types::BlobRow;

/// A blob read back from storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedBlob {
    /// Base64-encoded content.
    pub data: String,
    /// Stored metadata.
    pub metadata: BlobRow,
}

/// Blob repository. Stateless; every method takes `&Connection`.
pub struct BlobRepo;

impl BlobRepo {
    /// Store base64 content, deduplicating by SHA-256 of the decoded bytes.
    pub fn save(conn: &Connection, data_base64: &str, mime_type: &str) -> Result<String> {
        let content = STANDARD.decode(data_base64)?;
        let hash = hex_sha256(&content);

        let existing: Option<String> = conn
            .query_row("SELECT id FROM blobs WHERE hash = ?1", params![hash], |row| row.get(0))
            .optional()?;

        if let Some(id) = existing {
            let _ = conn.execute(
                "UPDATE blobs SET ref_count = ref_count + 1 WHERE id = ?1",
                params![id],
            )?;
            return Ok(id);
        }

        let id = format!("blob_{}", Uuid::now_v7());
        let now = chrono::Utc::now().to_rfc3339();
        let size = i64::try_from(content.len()).unwrap_or(i64::MAX);

        let _ = conn.execute(
            "INSERT INTO blobs (id, hash, content, mime_type, size, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, hash, content, mime_type, size, now],
        )?;

        Ok(id)
    }

    /// Load a blob as base64 with its metadata.
    pub fn load(conn: &Connection, blob_id: &str) -> Result<Option<LoadedBlob>> {
        let row = conn
            .query_row(
                "SELECT id, hash, mime_type, size, created_at, ref_count, content
                 FROM blobs WHERE id = ?1",
                params![blob_id],
                |row| {
                    let content: Vec<u8> = row.get(6)?;
                    Ok((Self::map_row(row)?, content))
                },
            )
            .optional()?;
        Ok(row.map(|(metadata, content)| LoadedBlob {
            data: STANDARD.encode(content),
            metadata,
        }))
    }

    /// Get blob metadata by ID.
    pub fn get_by_id(conn: &Connection, blob_id: &str) -> Result<Option<BlobRow>> {
        let row = conn
            .query_row(
                "SELECT id, hash, mime_type, size, created_at, ref_count FROM blobs WHERE id = ?1",
                params![blob_id],
                Self::map_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Remove a blob regardless of its reference count.
    ///
    /// Saving identical content afterwards mints a fresh ID.
    pub fn delete(conn: &Connection, blob_id: &str) -> Result<bool> {
        let changed = conn.execute("DELETE FROM blobs WHERE id = ?1", params![blob_id])?;
        Ok(changed > 0)
    }

    /// Drop one reference, deleting the blob when none remain.
    ///
    /// Returns the remaining count, or `None` if the blob does not exist.
    pub fn release(conn: &Connection, blob_id: &str) -> Result<Option<i64>> {
        let _ = conn.execute(
            "UPDATE blobs SET ref_count = ref_count - 1 WHERE id = ?1 AND ref_count > 0",
            params![blob_id],
        )?;
        let remaining: Option<i64> = conn
            .query_row(
                "SELECT ref_count FROM blobs WHERE id = ?1",
                params![blob_id],
                |row| row.get(0),
            )
            .optional()?;
        if remaining == Some(0) {
            let _ = Self::delete(conn, blob_id)?;
        }
        Ok(remaining)
    }

    /// Count total blobs.
    pub fn count(conn: &Connection) -> Result<i64> {
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM blobs", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Total stored bytes.
    pub fn total_size(conn: &Connection) -> Result<i64> {
        let size: i64 = conn.query_row("SELECT COALESCE(SUM(size), 0) FROM blobs", [], |row| row.get(0))?;
        Ok(size)
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BlobRow> {
        Ok(BlobRow {
            id: row.get(0)?,
            hash: row.get(1)?,
            mime_type: row.get(2)?,
            size: row.get(3)?,
            created_at: row.get(4)?,
            ref_count: row.get(5)?,
        })
    }
}

fn hex_sha256(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest.iter().fold(String::with_capacity(64), |mut out, byte| {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
        out
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use crate::errors::StoreError;
    use crate::sqlite::migrations::run_migrations;
    use assert_matches::assert_matches;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    fn encode(text: &str) -> String {
        STANDARD.encode(text.as_bytes())
    }

    #[test]
    fn save_and_load() {
        let conn = setup();
        let id = BlobRepo::save(&conn, &encode("hello"), "text/plain").unwrap();
        assert!(id.starts_with("blob_"));
        let loaded = BlobRepo::load(&conn, &id).unwrap().unwrap();
        assert_eq!(loaded.data, encode("hello"));
        assert_eq!(loaded.metadata.mime_type, "text/plain");
        assert_eq!(loaded.metadata.size, 5);
        assert_eq!(loaded.metadata.hash.len(), 64);
    }

    #[test]
    fn identical_content_deduplicates() {
        let conn = setup();
        let a = BlobRepo::save(&conn, &encode("same"), "text/plain").unwrap();
        let b = BlobRepo::save(&conn, &encode("same"), "text/plain").unwrap();
        assert_eq!(a, b);
        assert_eq!(BlobRepo::count(&conn).unwrap(), 1);
        assert_eq!(BlobRepo::get_by_id(&conn, &a).unwrap().unwrap().ref_count, 2);
    }

    #[test]
    fn delete_then_save_mints_new_id() {
        let conn = setup();
        let first = BlobRepo::save(&conn, &encode("payload"), "text/plain").unwrap();
        assert!(BlobRepo::delete(&conn, &first).unwrap());
        assert!(BlobRepo::load(&conn, &first).unwrap().is_none());
        let second = BlobRepo::save(&conn, &encode("payload"), "text/plain").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn release_deletes_at_zero() {
        let conn = setup();
        let id = BlobRepo::save(&conn, &encode("x"), "text/plain").unwrap();
        BlobRepo::save(&conn, &encode("x"), "text/plain").unwrap();
        assert_eq!(BlobRepo::release(&conn, &id).unwrap(), Some(1));
        assert_eq!(BlobRepo::release(&conn, &id).unwrap(), Some(0));
        assert!(BlobRepo::get_by_id(&conn, &id).unwrap().is_none());
        assert_eq!(BlobRepo::release(&conn, &id).unwrap(), None);
    }

    #[test]
    fn invalid_base64_is_rejected() {
        let conn = setup();
        assert_matches!(BlobRepo::save(&conn, "%%%", "text/plain"), Err(StoreError::Base64(_)));
    }

    #[test]
    fn total_size_sums_bytes() {
        let conn = setup();
        BlobRepo::save(&conn, &encode("abc"), "text/plain").unwrap();
        BlobRepo::save(&conn, &encode("defg"), "text/plain").unwrap();
        assert_eq!(BlobRepo::total_size(&conn).unwrap(), 7);
    }
}
