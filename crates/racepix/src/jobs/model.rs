//! Upload job record and its status graph.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::db::job_repo::JobRow;
use crate::db::DatabaseError;

/// Lifecycle status of an upload job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Uploading,
    Extracting,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Pending,
        JobStatus::Uploading,
        JobStatus::Extracting,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Uploading => "uploading",
            JobStatus::Extracting => "extracting",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }

    /// Terminal statuses never change through an ordinary transition.
    /// `failed` can only be left through an explicit retry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn is_cancellable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Uploading)
    }

    /// Forward edges of the status graph. Retry (`failed -> extracting`) is
    /// not an ordinary edge.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Uploading)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Uploading, Extracting)
                | (Uploading, Cancelled)
                | (Uploading, Failed)
                | (Extracting, Processing)
                | (Extracting, Failed)
                | (Processing, Completed)
                | (Processing, Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A per-item failure recorded while processing archive members.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemError {
    pub item_name: String,
    pub error: String,
}

/// Durable record of one bulk archive upload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UploadJob {
    pub id: String,
    pub event_id: String,
    pub user_id: String,
    pub status: JobStatus,
    /// Storage path (`bucket/path`) of the uploaded archive.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_ref: Option<String>,
    pub archive_name: String,
    pub archive_size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_items: Option<u64>,
    pub processed_items: u64,
    pub failed_items: u64,
    #[serde(default)]
    pub item_errors: Vec<ItemError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_manifest: Option<Vec<String>>,
    /// Present exactly when `status` is `failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadJob {
    /// Items accounted for so far, successful or not.
    pub fn items_done(&self) -> u64 {
        self.processed_items + self.failed_items
    }

    /// Processing progress in whole percent, once the item count is known.
    pub fn percentage(&self) -> Option<u8> {
        match self.total_items {
            Some(0) => Some(100),
            Some(total) => Some(((self.items_done() as f64 / total as f64) * 100.0).round() as u8),
            None => None,
        }
    }

    pub fn from_row(row: &JobRow) -> Result<Self, DatabaseError> {
        let corrupt = |column: &'static str, reason: String| DatabaseError::CorruptColumn {
            id: row.id.clone(),
            column,
            reason,
        };

        let status = JobStatus::parse(&row.status)
            .ok_or_else(|| corrupt("status", format!("unknown status '{}'", row.status)))?;
        let item_errors: Vec<ItemError> = serde_json::from_str(&row.item_errors)
            .map_err(|e| corrupt("item_errors", e.to_string()))?;
        let file_manifest = row
            .file_manifest
            .as_deref()
            .map(serde_json::from_str::<Vec<String>>)
            .transpose()
            .map_err(|e| corrupt("file_manifest", e.to_string()))?;

        Ok(Self {
            id: row.id.clone(),
            event_id: row.event_id.clone(),
            user_id: row.user_id.clone(),
            status,
            archive_ref: row.archive_ref.clone(),
            archive_name: row.archive_name.clone(),
            archive_size_bytes: row.archive_size_bytes.max(0) as u64,
            total_items: row.total_items.map(|n| n.max(0) as u64),
            processed_items: row.processed_items.max(0) as u64,
            failed_items: row.failed_items.max(0) as u64,
            item_errors,
            file_manifest,
            error_message: row.error_message.clone(),
            started_at: row.started_at.as_deref().map(parse_timestamp),
            completed_at: row.completed_at.as_deref().map(parse_timestamp),
            created_at: parse_timestamp(&row.created_at),
            updated_at: parse_timestamp(&row.updated_at),
        })
    }

    pub fn to_row(&self) -> JobRow {
        JobRow {
            id: self.id.clone(),
            event_id: self.event_id.clone(),
            user_id: self.user_id.clone(),
            status: self.status.as_str().to_string(),
            archive_ref: self.archive_ref.clone(),
            archive_name: self.archive_name.clone(),
            archive_size_bytes: self.archive_size_bytes as i64,
            total_items: self.total_items.map(|n| n as i64),
            processed_items: self.processed_items as i64,
            failed_items: self.failed_items as i64,
            // Vec<ItemError> and Vec<String> always serialize.
            item_errors: serde_json::to_string(&self.item_errors)
                .unwrap_or_else(|_| "[]".to_string()),
            file_manifest: self
                .file_manifest
                .as_ref()
                .and_then(|m| serde_json::to_string(m).ok()),
            error_message: self.error_message.clone(),
            started_at: self.started_at.map(format_timestamp),
            completed_at: self.completed_at.map(format_timestamp),
            created_at: format_timestamp(self.created_at),
            updated_at: format_timestamp(self.updated_at),
        }
    }
}

pub(crate) fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            log::warn!("parse_timestamp: failed to parse '{}': {}", s, e);
            Utc::now()
        })
}

/// Current time at the precision the database keeps, so a record in memory
/// equals the same record read back.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width RFC 3339 so text ordering in SQLite matches time ordering.
pub(crate) fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}
