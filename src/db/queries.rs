use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use serde_json::Value;
use sqlx::{Executor, Sqlite, SqlitePool};

use super::models::{IngestRun, PostRow, RunCounts, RunStatus};
use crate::config::ConflictPolicy;
use crate::transform::StorageRecord;

// ========== Posts ==========

/// Full-row upsert: every non-key column is replaced on an id conflict.
///
/// A different id carrying an existing slug is not a conflict target, so it
/// fails with a unique violation instead of overwriting the other row.
const UPSERT_POST: &str = r#"
    INSERT INTO posts (
        id, date_gmt, modified_gmt, title, slug, status, "type", link, content, excerpt,
        author, editor, comment_status, comments_count, comments, featured_image,
        post_images, seo, categories, tags, companies, is_sponsored, sponsor,
        is_partnership, external_scripts, show_ads, is_subscriber_exclusive,
        is_paywalled, is_inappbrowser, read_time, word_count
    ) VALUES (
        ?, ?, ?, ?, ?, ?, ?, ?, ?, ?,
        ?, ?, ?, ?, ?, ?,
        ?, ?, ?, ?, ?, ?, ?,
        ?, ?, ?, ?, ?, ?, ?, ?
    )
    ON CONFLICT(id) DO UPDATE SET
        date_gmt = excluded.date_gmt,
        modified_gmt = excluded.modified_gmt,
        title = excluded.title,
        slug = excluded.slug,
        status = excluded.status,
        "type" = excluded."type",
        link = excluded.link,
        content = excluded.content,
        excerpt = excluded.excerpt,
        author = excluded.author,
        editor = excluded.editor,
        comment_status = excluded.comment_status,
        comments_count = excluded.comments_count,
        comments = excluded.comments,
        featured_image = excluded.featured_image,
        post_images = excluded.post_images,
        seo = excluded.seo,
        categories = excluded.categories,
        tags = excluded.tags,
        companies = excluded.companies,
        is_sponsored = excluded.is_sponsored,
        sponsor = excluded.sponsor,
        is_partnership = excluded.is_partnership,
        external_scripts = excluded.external_scripts,
        show_ads = excluded.show_ads,
        is_subscriber_exclusive = excluded.is_subscriber_exclusive,
        is_paywalled = excluded.is_paywalled,
        is_inappbrowser = excluded.is_inappbrowser,
        read_time = excluded.read_time,
        word_count = excluded.word_count
"#;

// Timestamps are fixed-width UTC text, so text order is time order.
static UPSERT_POST_IF_NEWER: Lazy<String> =
    Lazy::new(|| format!("{UPSERT_POST}    WHERE excluded.modified_gmt > posts.modified_gmt\n"));

/// Result of a single upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The row was inserted or overwritten.
    Written,
    /// The stored row was at least as new; nothing changed.
    Unchanged,
}

/// Storage form of a timestamp: `YYYY-MM-DDTHH:MM:SS.ffffffZ`.
///
/// Always six fractional digits, so sub-second edits still order correctly.
#[must_use]
pub fn storage_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// JSON text of a structured document; JSON null is stored as SQL NULL.
fn document(value: &Value) -> Option<String> {
    if value.is_null() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Insert a post, or overwrite the stored row with the same id.
///
/// With [`ConflictPolicy::NewerOnly`] the overwrite only happens when the
/// incoming `modified_gmt` is strictly newer than the stored one.
///
/// # Errors
///
/// Returns the database error unchanged so callers can tell constraint
/// violations from connection problems.
pub async fn upsert_post<'e, E>(
    executor: E,
    record: &StorageRecord,
    policy: ConflictPolicy,
) -> Result<UpsertOutcome, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = match policy {
        ConflictPolicy::LastWriteWins => UPSERT_POST,
        ConflictPolicy::NewerOnly => UPSERT_POST_IF_NEWER.as_str(),
    };
    let post = &record.post;

    let result = sqlx::query(sql)
        .bind(&post.id)
        .bind(storage_timestamp(&post.date_gmt))
        .bind(storage_timestamp(&post.modified_gmt))
        .bind(&post.title)
        .bind(&post.slug)
        .bind(&post.status)
        .bind(&post.post_type)
        .bind(&post.link)
        .bind(&post.content)
        .bind(&post.excerpt)
        .bind(document(&post.author))
        .bind(&post.editor)
        .bind(&post.comment_status)
        .bind(post.comments_count)
        .bind(document(&post.comments))
        .bind(document(&post.featured_image))
        .bind(document(&post.post_images))
        .bind(document(&post.seo))
        .bind(document(&post.categories))
        .bind(document(&post.tags))
        .bind(document(&post.companies))
        .bind(post.is_sponsored)
        .bind(document(&post.sponsor))
        .bind(post.is_partnership)
        .bind(&post.external_scripts)
        .bind(post.show_ads)
        .bind(post.is_subscriber_exclusive)
        .bind(post.is_paywalled)
        .bind(post.is_inappbrowser)
        .bind(post.read_time)
        .bind(i64::from(record.word_count))
        .execute(executor)
        .await?;

    Ok(if result.rows_affected() > 0 {
        UpsertOutcome::Written
    } else {
        UpsertOutcome::Unchanged
    })
}

/// Get a post by its id.
pub async fn get_post(pool: &SqlitePool, id: &str) -> Result<Option<PostRow>> {
    sqlx::query_as("SELECT * FROM posts WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch post by id")
}

/// Get a post by its slug.
pub async fn get_post_by_slug(pool: &SqlitePool, slug: &str) -> Result<Option<PostRow>> {
    sqlx::query_as("SELECT * FROM posts WHERE slug = ?")
        .bind(slug)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch post by slug")
}

/// Count stored posts.
pub async fn count_posts(pool: &SqlitePool) -> Result<i64> {
    sqlx::query_scalar("SELECT COUNT(*) FROM posts")
        .fetch_one(pool)
        .await
        .context("Failed to count posts")
}

// ========== Ingest runs ==========

/// Open a ledger entry for a new run, returning its id.
pub async fn start_run(pool: &SqlitePool) -> Result<i64> {
    let result = sqlx::query("INSERT INTO ingest_runs (status) VALUES (?)")
        .bind(RunStatus::Running.as_str())
        .execute(pool)
        .await
        .context("Failed to record run start")?;

    Ok(result.last_insert_rowid())
}

/// Close a ledger entry with its final status and counters.
pub async fn finish_run(
    pool: &SqlitePool,
    run_id: i64,
    status: RunStatus,
    counts: &RunCounts,
    error: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r"
        UPDATE ingest_runs
        SET finished_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now'),
            status = ?,
            pages = ?,
            skipped_pages = ?,
            fetched = ?,
            invalid_records = ?,
            written = ?,
            unchanged = ?,
            rejected = ?,
            error = ?
        WHERE id = ?
        ",
    )
    .bind(status.as_str())
    .bind(counts.pages)
    .bind(counts.skipped_pages)
    .bind(counts.fetched)
    .bind(counts.invalid_records)
    .bind(counts.written)
    .bind(counts.unchanged)
    .bind(counts.rejected)
    .bind(error)
    .bind(run_id)
    .execute(pool)
    .await
    .context("Failed to record run result")?;

    Ok(())
}

/// Get a run by id.
pub async fn get_run(pool: &SqlitePool, run_id: i64) -> Result<Option<IngestRun>> {
    sqlx::query_as("SELECT * FROM ingest_runs WHERE id = ?")
        .bind(run_id)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch run")
}

/// Most recent runs, newest first.
pub async fn get_recent_runs(pool: &SqlitePool, limit: i64) -> Result<Vec<IngestRun>> {
    sqlx::query_as("SELECT * FROM ingest_runs ORDER BY id DESC LIMIT ?")
        .bind(limit)
        .fetch_all(pool)
        .await
        .context("Failed to fetch recent runs")
}
