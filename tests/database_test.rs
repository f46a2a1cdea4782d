//! Integration tests for the destination schema and the batch writer.

use std::time::Duration;

use posts_ingest::api::RawPost;
use posts_ingest::config::{Config, ConflictPolicy, RowErrorPolicy};
use posts_ingest::db::{
    count_posts, finish_run, get_post, get_post_by_slug, get_recent_runs, get_run, start_run,
    upsert_post, BatchWriter, Database, PersistError, RunCounts, RunStatus, UpsertOutcome,
};
use posts_ingest::transform::{to_storage, StorageRecord};
use serde_json::{json, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::Connection;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

async fn setup_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("test.sqlite");
    let db = Database::new(&db_path)
        .await
        .expect("Failed to create database");
    (db, temp_dir)
}

fn post_json(id: &str, slug: Option<&str>, modified: &str) -> Value {
    json!({
        "id": id,
        "date_gmt": "2024-05-01T03:00:00",
        "modified_gmt": modified,
        "title": format!("Post {id}"),
        "slug": slug,
        "status": "publish",
        "type": "post",
        "link": format!("https://example.com/posts/{id}"),
        "content": "<p>Hello <b>world</b></p>",
        "excerpt": "<p>Hello</p>",
        "author": {"id": 3, "display_name": "Ada"},
        "editor": null,
        "comment_status": "open",
        "comments_count": 2,
        "comments": [{"id": 1, "content": "Nice"}],
        "featured_image": {"source": "https://cdn.example.com/a.png"},
        "post_images": [],
        "seo": {"title": format!("Post {id}"), "description": "desc"},
        "categories": [{"id": 1, "name": "Startups"}],
        "tags": [],
        "companies": [],
        "is_sponsored": false,
        "sponsor": null,
        "is_partnership": false,
        "external_scripts": null,
        "show_ads": true,
        "is_subscriber_exclusive": false,
        "is_paywalled": false,
        "is_inappbrowser": false,
        "read_time": 1
    })
}

fn record(raw: Value) -> StorageRecord {
    let post: RawPost = serde_json::from_value(raw).expect("fixture must decode");
    to_storage(post)
}

fn post_record(id: &str, slug: &str) -> StorageRecord {
    record(post_json(id, Some(slug), "2024-05-01T03:00:00"))
}

fn writer_config(conflict_policy: ConflictPolicy, row_error_policy: RowErrorPolicy) -> Config {
    Config {
        conflict_policy,
        row_error_policy,
        ..Config::for_testing()
    }
}

/// Every stored row, serialized, ordered by id.
async fn snapshot(db: &Database) -> Vec<Value> {
    let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM posts ORDER BY id")
        .fetch_all(db.pool())
        .await
        .unwrap();
    let mut rows = Vec::new();
    for id in ids {
        let row = get_post(db.pool(), &id).await.unwrap().unwrap();
        rows.push(serde_json::to_value(row).unwrap());
    }
    rows
}

#[tokio::test]
async fn test_schema_creation_is_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.sqlite");

    let db = Database::new(&db_path).await.unwrap();
    upsert_post(db.pool(), &post_record("1", "first"), ConflictPolicy::LastWriteWins)
        .await
        .unwrap();
    db.ensure_schema().await.unwrap();
    drop(db);

    let reopened = Database::new(&db_path).await.unwrap();
    reopened.ensure_schema().await.unwrap();

    assert_eq!(count_posts(reopened.pool()).await.unwrap(), 1);
}

#[tokio::test]
async fn test_upsert_then_read_back() {
    let (db, _temp_dir) = setup_db().await;

    let outcome = upsert_post(db.pool(), &post_record("42", "a"), ConflictPolicy::NewerOnly)
        .await
        .unwrap();
    assert_eq!(outcome, UpsertOutcome::Written);

    let row = get_post(db.pool(), "42").await.unwrap().expect("row stored");
    assert_eq!(row.slug.as_deref(), Some("a"));
    assert_eq!(row.post_type, "post");
    assert_eq!(row.date_gmt, "2024-05-01T03:00:00.000000Z");
    assert_eq!(row.word_count, 2);
    assert_eq!(row.comments_count, 2);
    assert!(row.show_ads);
    assert_eq!(row.editor, None);
    assert_eq!(row.sponsor, None);

    let seo: Value = serde_json::from_str(row.seo.as_deref().unwrap()).unwrap();
    assert_eq!(seo, json!({"title": "Post 42", "description": "desc"}));
}

#[tokio::test]
async fn test_upsert_conflict_updates_in_place() {
    let (db, _temp_dir) = setup_db().await;

    upsert_post(db.pool(), &post_record("42", "a"), ConflictPolicy::LastWriteWins)
        .await
        .unwrap();

    let mut changed = post_json("42", Some("a"), "2024-05-01T03:00:00");
    changed["title"] = json!("Updated title");
    upsert_post(db.pool(), &record(changed), ConflictPolicy::LastWriteWins)
        .await
        .unwrap();

    assert_eq!(count_posts(db.pool()).await.unwrap(), 1);
    let row = get_post(db.pool(), "42").await.unwrap().unwrap();
    assert_eq!(row.title, "Updated title");
    assert_eq!(row.slug.as_deref(), Some("a"));
}

#[tokio::test]
async fn test_upsert_replaces_the_full_row() {
    let (db, _temp_dir) = setup_db().await;

    upsert_post(db.pool(), &post_record("7", "seven"), ConflictPolicy::LastWriteWins)
        .await
        .unwrap();

    let mut stripped = post_json("7", None, "2024-06-01T00:00:00");
    stripped["content"] = Value::Null;
    stripped["seo"] = Value::Null;
    upsert_post(db.pool(), &record(stripped), ConflictPolicy::LastWriteWins)
        .await
        .unwrap();

    let row = get_post(db.pool(), "7").await.unwrap().unwrap();
    assert_eq!(row.slug, None);
    assert_eq!(row.content, None);
    assert_eq!(row.seo, None);
    assert_eq!(row.word_count, 0);
    assert_eq!(row.modified_gmt, "2024-06-01T00:00:00.000000Z");
}

#[tokio::test]
async fn test_applying_a_batch_twice_is_idempotent() {
    let (db, _temp_dir) = setup_db().await;
    let batch: Vec<StorageRecord> = (1..=12)
        .map(|i| post_record(&i.to_string(), &format!("slug-{i}")))
        .collect();
    let cancel = CancellationToken::new();

    for policy in [ConflictPolicy::NewerOnly, ConflictPolicy::LastWriteWins] {
        let config = writer_config(policy, RowErrorPolicy::Skip);
        let writer = BatchWriter::new(db.pool(), &config);

        writer.write(&batch, &cancel).await.unwrap();
        let once = snapshot(&db).await;
        writer.write(&batch, &cancel).await.unwrap();
        let twice = snapshot(&db).await;

        assert_eq!(once.len(), 12);
        assert_eq!(once, twice, "re-applying with {policy:?} must not drift");
    }
}

#[tokio::test]
async fn test_newer_only_ignores_stale_versions() {
    let (db, _temp_dir) = setup_db().await;

    let current = post_json("5", Some("five"), "2024-05-02T00:00:00");
    upsert_post(db.pool(), &record(current), ConflictPolicy::NewerOnly)
        .await
        .unwrap();

    let mut stale = post_json("5", Some("five"), "2024-05-01T00:00:00");
    stale["title"] = json!("Stale title");
    let outcome = upsert_post(db.pool(), &record(stale), ConflictPolicy::NewerOnly)
        .await
        .unwrap();
    assert_eq!(outcome, UpsertOutcome::Unchanged);

    let mut same_time = post_json("5", Some("five"), "2024-05-02T00:00:00");
    same_time["title"] = json!("Same timestamp");
    let outcome = upsert_post(db.pool(), &record(same_time), ConflictPolicy::NewerOnly)
        .await
        .unwrap();
    assert_eq!(outcome, UpsertOutcome::Unchanged);
    assert_eq!(get_post(db.pool(), "5").await.unwrap().unwrap().title, "Post 5");

    let mut newer = post_json("5", Some("five"), "2024-05-03T00:00:00");
    newer["title"] = json!("Fresh title");
    let outcome = upsert_post(db.pool(), &record(newer), ConflictPolicy::NewerOnly)
        .await
        .unwrap();
    assert_eq!(outcome, UpsertOutcome::Written);
    assert_eq!(get_post(db.pool(), "5").await.unwrap().unwrap().title, "Fresh title");
}

#[tokio::test]
async fn test_last_write_wins_accepts_older_versions() {
    let (db, _temp_dir) = setup_db().await;

    upsert_post(
        db.pool(),
        &record(post_json("5", Some("five"), "2024-05-02T00:00:00")),
        ConflictPolicy::LastWriteWins,
    )
    .await
    .unwrap();

    let mut older = post_json("5", Some("five"), "2024-05-01T00:00:00");
    older["title"] = json!("Older but last");
    let outcome = upsert_post(db.pool(), &record(older), ConflictPolicy::LastWriteWins)
        .await
        .unwrap();

    assert_eq!(outcome, UpsertOutcome::Written);
    let row = get_post(db.pool(), "5").await.unwrap().unwrap();
    assert_eq!(row.title, "Older but last");
    assert_eq!(row.modified_gmt, "2024-05-01T00:00:00.000000Z");
}

#[tokio::test]
async fn test_slug_conflict_is_surfaced_not_overwritten() {
    let (db, _temp_dir) = setup_db().await;
    let config = writer_config(ConflictPolicy::NewerOnly, RowErrorPolicy::Abort);
    let writer = BatchWriter::new(db.pool(), &config);
    let cancel = CancellationToken::new();

    writer.write(&[post_record("1", "shared")], &cancel).await.unwrap();
    let result = writer.write(&[post_record("2", "shared")], &cancel).await;

    match result {
        Err(PersistError::RowRejected { id, source }) => {
            assert_eq!(id, "2");
            let is_unique = source
                .as_database_error()
                .is_some_and(|e| e.is_unique_violation());
            assert!(is_unique, "expected a unique violation, got {source}");
        }
        other => panic!("expected a rejected row, got {other:?}"),
    }

    assert_eq!(count_posts(db.pool()).await.unwrap(), 1);
    let owner = get_post_by_slug(db.pool(), "shared").await.unwrap().unwrap();
    assert_eq!(owner.id, "1");
    assert_eq!(get_post(db.pool(), "2").await.unwrap().map(|r| r.id), None);
}

#[tokio::test]
async fn test_null_slugs_never_conflict() {
    let (db, _temp_dir) = setup_db().await;
    let config = writer_config(ConflictPolicy::NewerOnly, RowErrorPolicy::Abort);
    let writer = BatchWriter::new(db.pool(), &config);

    let batch = vec![
        record(post_json("1", None, "2024-05-01T03:00:00")),
        record(post_json("2", None, "2024-05-01T03:00:00")),
    ];
    let report = writer.write(&batch, &CancellationToken::new()).await.unwrap();

    assert_eq!(report.written, 2);
    assert_eq!(count_posts(db.pool()).await.unwrap(), 2);
}

#[tokio::test]
async fn test_skip_mode_isolates_bad_row_and_recovers() {
    let (db, _temp_dir) = setup_db().await;
    let config = Config {
        batch_size: 4,
        ..writer_config(ConflictPolicy::NewerOnly, RowErrorPolicy::Skip)
    };
    let writer = BatchWriter::new(db.pool(), &config);
    let cancel = CancellationToken::new();

    // Record 5 reuses record 1's slug under a different id.
    let mut batch: Vec<StorageRecord> = (1..=10)
        .map(|i| post_record(&i.to_string(), &format!("slug-{i}")))
        .collect();
    batch[4] = post_record("5", "slug-1");

    let report = writer.write(&batch, &cancel).await.unwrap();
    assert_eq!(report.written, 9);
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].id, "5");
    assert_eq!(count_posts(db.pool()).await.unwrap(), 9);
    assert!(get_post(db.pool(), "5").await.unwrap().is_none());

    // Fix the record and re-apply the whole batch.
    batch[4] = post_record("5", "slug-5");
    let report = writer.write(&batch, &cancel).await.unwrap();
    assert_eq!(report.written, 1);
    assert_eq!(report.unchanged, 9);
    assert!(report.rejected.is_empty());
    assert_eq!(count_posts(db.pool()).await.unwrap(), 10);
}

#[tokio::test]
async fn test_abort_mode_rolls_back_only_the_failing_chunk() {
    let (db, _temp_dir) = setup_db().await;
    let config = Config {
        batch_size: 3,
        ..writer_config(ConflictPolicy::NewerOnly, RowErrorPolicy::Abort)
    };
    let writer = BatchWriter::new(db.pool(), &config);

    let mut batch: Vec<StorageRecord> = (1..=7)
        .map(|i| post_record(&i.to_string(), &format!("slug-{i}")))
        .collect();
    batch[4] = post_record("5", "slug-1");

    let result = writer.write(&batch, &CancellationToken::new()).await;
    assert!(matches!(result, Err(PersistError::RowRejected { ref id, .. }) if id == "5"));

    // Chunk [1, 2, 3] committed; chunk [4, 5, 6] rolled back; chunk [7] never ran.
    assert_eq!(count_posts(db.pool()).await.unwrap(), 3);
    assert!(get_post(db.pool(), "4").await.unwrap().is_none());
    assert!(get_post(db.pool(), "7").await.unwrap().is_none());
}

#[tokio::test]
async fn test_oversized_identifier_is_rejected() {
    let (db, _temp_dir) = setup_db().await;
    let config = writer_config(ConflictPolicy::NewerOnly, RowErrorPolicy::Skip);
    let writer = BatchWriter::new(db.pool(), &config);

    let long_id = "9".repeat(51);
    let batch = vec![post_record(&long_id, "too-long"), post_record("1", "fine")];
    let report = writer.write(&batch, &CancellationToken::new()).await.unwrap();

    assert_eq!(report.written, 1);
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].id, long_id);
}

#[tokio::test]
async fn test_cancelled_write_stops_before_next_chunk() {
    let (db, _temp_dir) = setup_db().await;
    let config = writer_config(ConflictPolicy::NewerOnly, RowErrorPolicy::Skip);
    let writer = BatchWriter::new(db.pool(), &config);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = writer.write(&[post_record("1", "one")], &cancel).await;

    assert!(matches!(result, Err(PersistError::Cancelled)));
    assert_eq!(count_posts(db.pool()).await.unwrap(), 0);
}

#[tokio::test]
async fn test_chunk_is_retried_after_database_busy() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.sqlite");
    let db = Database::open(&db_path, Duration::from_millis(50))
        .await
        .unwrap();

    // Another writer holds the write lock briefly.
    let options = SqliteConnectOptions::new().filename(&db_path);
    let mut holder = SqliteConnection::connect_with(&options).await.unwrap();
    sqlx::query("BEGIN IMMEDIATE")
        .execute(&mut holder)
        .await
        .unwrap();
    let release = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        sqlx::query("COMMIT").execute(&mut holder).await.unwrap();
        holder
    });

    let config = Config {
        persist_retries: 2,
        ..writer_config(ConflictPolicy::NewerOnly, RowErrorPolicy::Abort)
    };
    let writer = BatchWriter::new(db.pool(), &config);
    let report = writer
        .write(&[post_record("1", "one")], &CancellationToken::new())
        .await
        .expect("busy chunk should commit on retry");

    assert_eq!(report.written, 1);
    release.await.unwrap();
    assert_eq!(count_posts(db.pool()).await.unwrap(), 1);
}

#[tokio::test]
async fn test_busy_database_fails_without_retries() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.sqlite");
    let db = Database::open(&db_path, Duration::from_millis(50))
        .await
        .unwrap();

    let options = SqliteConnectOptions::new().filename(&db_path);
    let mut holder = SqliteConnection::connect_with(&options).await.unwrap();
    sqlx::query("BEGIN IMMEDIATE")
        .execute(&mut holder)
        .await
        .unwrap();

    let config = Config {
        persist_retries: 0,
        ..writer_config(ConflictPolicy::NewerOnly, RowErrorPolicy::Abort)
    };
    let writer = BatchWriter::new(db.pool(), &config);
    let result = writer
        .write(&[post_record("1", "one")], &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(PersistError::Database(_))));
    sqlx::query("ROLLBACK").execute(&mut holder).await.unwrap();
}

#[tokio::test]
async fn test_newer_only_orders_edits_within_one_second() {
    let (db, _temp_dir) = setup_db().await;

    let first = post_json("8", Some("eight"), "2024-05-01T03:00:00.100");
    upsert_post(db.pool(), &record(first), ConflictPolicy::NewerOnly)
        .await
        .unwrap();

    let mut second = post_json("8", Some("eight"), "2024-05-01T03:00:00.200");
    second["title"] = json!("Second edit");
    let outcome = upsert_post(db.pool(), &record(second), ConflictPolicy::NewerOnly)
        .await
        .unwrap();

    assert_eq!(outcome, UpsertOutcome::Written);
    let row = get_post(db.pool(), "8").await.unwrap().unwrap();
    assert_eq!(row.title, "Second edit");
    assert_eq!(row.modified_gmt, "2024-05-01T03:00:00.200000Z");
}

#[tokio::test]
async fn test_run_ledger() {
    let (db, _temp_dir) = setup_db().await;

    let run_id = start_run(db.pool()).await.unwrap();
    let run = get_run(db.pool(), run_id).await.unwrap().unwrap();
    assert_eq!(run.status(), Some(RunStatus::Running));
    assert!(run.finished_at.is_none());

    let counts = RunCounts {
        pages: 3,
        skipped_pages: 1,
        fetched: 30,
        invalid_records: 1,
        written: 27,
        unchanged: 1,
        rejected: 1,
    };
    finish_run(db.pool(), run_id, RunStatus::Partial, &counts, None)
        .await
        .unwrap();

    let runs = get_recent_runs(db.pool(), 10).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status(), Some(RunStatus::Partial));
    assert_eq!(runs[0].counts(), counts);
    assert!(runs[0].finished_at.is_some());
}
