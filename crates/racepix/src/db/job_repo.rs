//! Job repository: CRUD operations for the `upload_jobs` table.
//!
//! The `*_in` variants take a bare connection so callers can compose them
//! inside [`Database::with_transaction`].

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{Database, DatabaseError};

/// A raw upload job row from the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRow {
    pub id: String,
    pub event_id: String,
    pub user_id: String,
    pub status: String,
    pub archive_ref: Option<String>,
    pub archive_name: String,
    pub archive_size_bytes: i64,
    pub total_items: Option<i64>,
    pub processed_items: i64,
    pub failed_items: i64,
    /// JSON array of `{item_name, error}` objects.
    pub item_errors: String,
    /// JSON array of member names.
    pub file_manifest: Option<String>,
    pub error_message: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            event_id: row.get("event_id")?,
            user_id: row.get("user_id")?,
            status: row.get("status")?,
            archive_ref: row.get("archive_ref")?,
            archive_name: row.get("archive_name")?,
            archive_size_bytes: row.get("archive_size_bytes")?,
            total_items: row.get("total_items")?,
            processed_items: row.get("processed_items")?,
            failed_items: row.get("failed_items")?,
            item_errors: row.get("item_errors")?,
            file_manifest: row.get("file_manifest")?,
            error_message: row.get("error_message")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Inserts a new job row.
pub fn insert_in(conn: &Connection, job: &JobRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO upload_jobs (id, event_id, user_id, status, archive_ref, archive_name,
         archive_size_bytes, total_items, processed_items, failed_items, item_errors,
         file_manifest, error_message, started_at, completed_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            job.id,
            job.event_id,
            job.user_id,
            job.status,
            job.archive_ref,
            job.archive_name,
            job.archive_size_bytes,
            job.total_items,
            job.processed_items,
            job.failed_items,
            job.item_errors,
            job.file_manifest,
            job.error_message,
            job.started_at,
            job.completed_at,
            job.created_at,
            job.updated_at,
        ],
    )?;
    Ok(())
}

/// Overwrites every mutable column of an existing row.
///
/// `id`, `event_id`, `user_id` and `created_at` are never rewritten.
pub fn update_in(conn: &Connection, job: &JobRow) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE upload_jobs SET status=?2, archive_ref=?3, archive_name=?4,
         archive_size_bytes=?5, total_items=?6, processed_items=?7, failed_items=?8,
         item_errors=?9, file_manifest=?10, error_message=?11, started_at=?12,
         completed_at=?13, updated_at=?14
         WHERE id=?1",
        params![
            job.id,
            job.status,
            job.archive_ref,
            job.archive_name,
            job.archive_size_bytes,
            job.total_items,
            job.processed_items,
            job.failed_items,
            job.item_errors,
            job.file_manifest,
            job.error_message,
            job.started_at,
            job.completed_at,
            job.updated_at,
        ],
    )?;
    Ok(())
}

/// Finds a job by its ID.
pub fn find_by_id_in(conn: &Connection, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM upload_jobs WHERE id = ?1",
            params![id],
            JobRow::from_row,
        )
        .optional()?;
    Ok(row)
}

pub fn insert(db: &Database, job: &JobRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| insert_in(conn, job))
}

pub fn update(db: &Database, job: &JobRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| update_in(conn, job))
}

pub fn find_by_id(db: &Database, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| find_by_id_in(conn, id))
}

/// Lists jobs for an event, newest first.
pub fn list_by_event(
    db: &Database,
    event_id: &str,
    limit: u64,
) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM upload_jobs WHERE event_id = ?1
             ORDER BY created_at DESC, rowid DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![event_id, limit as i64], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Counts jobs in a given status.
pub fn count_by_status(db: &Database, status: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM upload_jobs WHERE status = ?1",
            params![status],
            |r| r.get(0),
        )?;
        Ok(count as u64)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_row(id: &str, event_id: &str, created_at: &str) -> JobRow {
        JobRow {
            id: id.to_string(),
            event_id: event_id.to_string(),
            user_id: "user-1".to_string(),
            status: "uploading".to_string(),
            archive_ref: None,
            archive_name: "race.zip".to_string(),
            archive_size_bytes: 1024,
            total_items: None,
            processed_items: 0,
            failed_items: 0,
            item_errors: "[]".to_string(),
            file_manifest: None,
            error_message: None,
            started_at: None,
            completed_at: None,
            created_at: created_at.to_string(),
            updated_at: created_at.to_string(),
        }
    }

    #[test]
    fn test_insert_and_find() {
        let db = Database::open_in_memory().unwrap();
        let row = make_row("j1", "evt-1", "2026-01-01T00:00:00Z");
        insert(&db, &row).unwrap();

        let found = find_by_id(&db, "j1").unwrap().unwrap();
        assert_eq!(found, row);
    }

    #[test]
    fn test_find_nonexistent() {
        let db = Database::open_in_memory().unwrap();
        assert!(find_by_id(&db, "missing").unwrap().is_none());
    }

    #[test]
    fn test_update_overwrites_mutable_columns() {
        let db = Database::open_in_memory().unwrap();
        let mut row = make_row("j1", "evt-1", "2026-01-01T00:00:00Z");
        insert(&db, &row).unwrap();

        row.status = "extracting".to_string();
        row.archive_ref = Some("archives/evt-1/j1.zip".to_string());
        row.item_errors = r#"[{"item_name":"a.jpg","error":"boom"}]"#.to_string();
        row.updated_at = "2026-01-01T00:05:00Z".to_string();
        update(&db, &row).unwrap();

        let found = find_by_id(&db, "j1").unwrap().unwrap();
        assert_eq!(found.status, "extracting");
        assert_eq!(found.archive_ref.as_deref(), Some("archives/evt-1/j1.zip"));
        assert!(found.item_errors.contains("boom"));
        assert_eq!(found.created_at, "2026-01-01T00:00:00Z");
    }

    #[test]
    fn test_list_by_event_newest_first() {
        let db = Database::open_in_memory().unwrap();
        insert(&db, &make_row("old", "evt-1", "2026-01-01T00:00:00Z")).unwrap();
        insert(&db, &make_row("new", "evt-1", "2026-01-02T00:00:00Z")).unwrap();
        insert(&db, &make_row("other", "evt-2", "2026-01-03T00:00:00Z")).unwrap();

        let rows = list_by_event(&db, "evt-1", 10).unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "old"]);

        assert_eq!(list_by_event(&db, "evt-1", 1).unwrap().len(), 1);
    }

    #[test]
    fn test_count_by_status() {
        let db = Database::open_in_memory().unwrap();
        insert(&db, &make_row("a", "evt-1", "2026-01-01T00:00:00Z")).unwrap();
        insert(&db, &make_row("b", "evt-1", "2026-01-01T00:00:01Z")).unwrap();
        assert_eq!(count_by_status(&db, "uploading").unwrap(), 2);
        assert_eq!(count_by_status(&db, "failed").unwrap(), 0);
    }
}
