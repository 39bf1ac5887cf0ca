//! Durable bookkeeping for interrupted resumable uploads.
//!
//! Keyed by fingerprint (`bucket/path:size`) so a restarted process can find
//! the session URL of a transfer it never finished.

use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DatabaseError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeRow {
    pub fingerprint: String,
    pub upload_url: String,
    pub object_key: String,
    pub total_bytes: i64,
    pub created_at: String,
}

impl ResumeRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            fingerprint: row.get("fingerprint")?,
            upload_url: row.get("upload_url")?,
            object_key: row.get("object_key")?,
            total_bytes: row.get("total_bytes")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// Records (or replaces) the session for a fingerprint.
pub fn upsert(db: &Database, row: &ResumeRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO resumable_uploads (fingerprint, upload_url, object_key, total_bytes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(fingerprint) DO UPDATE SET
               upload_url = excluded.upload_url,
               object_key = excluded.object_key,
               total_bytes = excluded.total_bytes,
               created_at = excluded.created_at",
            params![
                row.fingerprint,
                row.upload_url,
                row.object_key,
                row.total_bytes,
                row.created_at,
            ],
        )?;
        Ok(())
    })
}

pub fn find(db: &Database, fingerprint: &str) -> Result<Option<ResumeRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM resumable_uploads WHERE fingerprint = ?1",
                params![fingerprint],
                ResumeRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Every session recorded for an object key, whatever its size.
pub fn find_for_key(db: &Database, object_key: &str) -> Result<Vec<ResumeRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT * FROM resumable_uploads WHERE object_key = ?1")?;
        let rows = stmt
            .query_map(params![object_key], ResumeRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Removes the entry. Returns true if a row was deleted.
pub fn remove(db: &Database, fingerprint: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let n = conn.execute(
            "DELETE FROM resumable_uploads WHERE fingerprint = ?1",
            params![fingerprint],
        )?;
        Ok(n > 0)
    })
}

/// Removes every entry for an object key regardless of size.
pub fn remove_for_key(db: &Database, object_key: &str) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let n = conn.execute(
            "DELETE FROM resumable_uploads WHERE object_key = ?1",
            params![object_key],
        )?;
        Ok(n)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(fingerprint: &str, url: &str) -> ResumeRow {
        ResumeRow {
            fingerprint: fingerprint.to_string(),
            upload_url: url.to_string(),
            object_key: "archives/evt/job.zip".to_string(),
            total_bytes: 42,
            created_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn test_upsert_replaces_url() {
        let db = Database::open_in_memory().unwrap();
        upsert(&db, &row("fp", "http://a/1")).unwrap();
        upsert(&db, &row("fp", "http://a/2")).unwrap();

        let found = find(&db, "fp").unwrap().unwrap();
        assert_eq!(found.upload_url, "http://a/2");
    }

    #[test]
    fn test_remove() {
        let db = Database::open_in_memory().unwrap();
        upsert(&db, &row("fp", "http://a/1")).unwrap();
        assert!(remove(&db, "fp").unwrap());
        assert!(!remove(&db, "fp").unwrap());
        assert!(find(&db, "fp").unwrap().is_none());
    }

    #[test]
    fn test_remove_for_key() {
        let db = Database::open_in_memory().unwrap();
        upsert(&db, &row("fp1", "http://a/1")).unwrap();
        upsert(&db, &row("fp2", "http://a/2")).unwrap();
        assert_eq!(find_for_key(&db, "archives/evt/job.zip").unwrap().len(), 2);
        assert_eq!(remove_for_key(&db, "archives/evt/job.zip").unwrap(), 2);
    }
}
