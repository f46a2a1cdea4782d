use serde::{Deserialize, Serialize};

/// A row of the `posts` table as stored.
///
/// Structured documents are JSON text; timestamps are RFC 3339 UTC text.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PostRow {
    pub id: String,
    pub date_gmt: String,
    pub modified_gmt: String,
    pub title: String,
    pub slug: Option<String>,
    pub status: String,
    #[sqlx(rename = "type")]
    pub post_type: String,
    pub link: String,
    pub content: Option<String>,
    pub excerpt: Option<String>,
    pub author: Option<String>,
    pub editor: Option<String>,
    pub comment_status: String,
    pub comments_count: i64,
    pub comments: Option<String>,
    pub featured_image: Option<String>,
    pub post_images: Option<String>,
    pub seo: Option<String>,
    pub categories: Option<String>,
    pub tags: Option<String>,
    pub companies: Option<String>,
    pub is_sponsored: bool,
    pub sponsor: Option<String>,
    pub is_partnership: bool,
    pub external_scripts: Option<String>,
    pub show_ads: bool,
    pub is_subscriber_exclusive: bool,
    pub is_paywalled: bool,
    pub is_inappbrowser: bool,
    pub read_time: i64,
    pub word_count: i64,
}

/// Outcome of one ingest run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    /// Finished, but some rows were rejected by the destination.
    Partial,
    Failed,
    Cancelled,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "partial" => Some(Self::Partial),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Counters accumulated over one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub pages: i64,
    pub skipped_pages: i64,
    pub fetched: i64,
    pub invalid_records: i64,
    pub written: i64,
    pub unchanged: i64,
    pub rejected: i64,
}

/// A row of the `ingest_runs` ledger.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct IngestRun {
    pub id: i64,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: String,
    pub pages: i64,
    pub skipped_pages: i64,
    pub fetched: i64,
    pub invalid_records: i64,
    pub written: i64,
    pub unchanged: i64,
    pub rejected: i64,
    pub error: Option<String>,
}

impl IngestRun {
    #[must_use]
    pub fn status(&self) -> Option<RunStatus> {
        RunStatus::from_str(&self.status)
    }

    #[must_use]
    pub fn counts(&self) -> RunCounts {
        RunCounts {
            pages: self.pages,
            skipped_pages: self.skipped_pages,
            fetched: self.fetched,
            invalid_records: self.invalid_records,
            written: self.written,
            unchanged: self.unchanged,
            rejected: self.rejected,
        }
    }
}
