//! End-to-end runs against a mock API and a temporary SQLite file.

use posts_ingest::config::Config;
use posts_ingest::db::{count_posts, get_post, get_recent_runs, get_run, Database, RunStatus};
use posts_ingest::pipeline;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn setup_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("test.sqlite");
    let db = Database::new(&db_path)
        .await
        .expect("Failed to create database");
    (db, temp_dir)
}

fn create_test_config(server: &MockServer) -> Config {
    Config {
        api_url: format!("{}/posts", server.uri()),
        ..Config::for_testing()
    }
}

fn post(id: u32, slug: &str) -> Value {
    json!({
        "id": id,
        "date_gmt": "2024-05-01T03:00:00",
        "modified_gmt": "2024-05-01T03:00:00",
        "title": format!("Post {id}"),
        "slug": slug,
        "status": "publish",
        "type": "post",
        "link": format!("https://example.com/{slug}"),
        "content": "<p>Hello <b>world</b></p>",
        "comment_status": "open",
        "comments_count": 0,
        "read_time": 1
    })
}

async fn mount_listing(server: &MockServer, page: u32, total_pages: u32, posts: Vec<Value>) {
    let body = json!({"posts": posts, "total_pages": total_pages});
    let mock = Mock::given(method("GET")).and(path("/posts"));
    let mock = if page == 1 {
        mock.and(query_param_is_missing("page"))
    } else {
        mock.and(query_param("page", page.to_string()))
    };
    mock.respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

/// Three pages of two posts each, ids 1..=6.
async fn mount_three_pages(server: &MockServer) {
    for page in 1..=3u32 {
        let first = page * 2 - 1;
        let posts = vec![
            post(first, &format!("post-{first}")),
            post(first + 1, &format!("post-{}", first + 1)),
        ];
        mount_listing(server, page, 3, posts).await;
    }
}

#[tokio::test]
async fn test_full_run_ingests_every_page() {
    let server = MockServer::start().await;
    mount_three_pages(&server).await;
    let (db, _temp_dir) = setup_db().await;
    let config = create_test_config(&server);

    let summary = pipeline::run(&config, &db, &CancellationToken::new())
        .await
        .unwrap();

    assert!(summary.is_clean());
    assert_eq!(summary.counts.pages, 3);
    assert_eq!(summary.counts.fetched, 6);
    assert_eq!(summary.counts.written, 6);
    assert_eq!(count_posts(db.pool()).await.unwrap(), 6);

    let row = get_post(db.pool(), "4").await.unwrap().unwrap();
    assert_eq!(row.slug.as_deref(), Some("post-4"));
    assert_eq!(row.word_count, 2);

    let run = get_run(db.pool(), summary.run_id).await.unwrap().unwrap();
    assert_eq!(run.status(), Some(RunStatus::Succeeded));
    assert_eq!(run.counts(), summary.counts);
}

#[tokio::test]
async fn test_rerun_converges() {
    let server = MockServer::start().await;
    mount_three_pages(&server).await;
    let (db, _temp_dir) = setup_db().await;
    let config = create_test_config(&server);
    let cancel = CancellationToken::new();

    let first = pipeline::run(&config, &db, &cancel).await.unwrap();
    let second = pipeline::run(&config, &db, &cancel).await.unwrap();

    assert_eq!(first.counts.written, 6);
    assert_eq!(second.counts.written, 0);
    assert_eq!(second.counts.unchanged, 6);
    assert_eq!(count_posts(db.pool()).await.unwrap(), 6);
    assert_eq!(get_recent_runs(db.pool(), 10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_rejected_rows_mark_run_partial() {
    let server = MockServer::start().await;
    mount_listing(&server, 1, 2, vec![post(1, "shared"), post(2, "two")]).await;
    mount_listing(&server, 2, 2, vec![post(3, "shared"), post(4, "four")]).await;
    let (db, _temp_dir) = setup_db().await;
    let config = create_test_config(&server);

    let summary = pipeline::run(&config, &db, &CancellationToken::new())
        .await
        .unwrap();

    assert!(!summary.is_clean());
    assert_eq!(summary.rejected.len(), 1);
    assert_eq!(summary.rejected[0].id, "3");
    assert_eq!(count_posts(db.pool()).await.unwrap(), 3);

    let run = get_run(db.pool(), summary.run_id).await.unwrap().unwrap();
    assert_eq!(run.status(), Some(RunStatus::Partial));
    assert_eq!(run.rejected, 1);
}

#[tokio::test]
async fn test_invalid_records_are_counted_and_skipped() {
    let server = MockServer::start().await;
    let broken = json!({"title": "No identifier", "slug": "broken"});
    mount_listing(&server, 1, 1, vec![post(1, "one"), broken, post(2, "two")]).await;
    let (db, _temp_dir) = setup_db().await;
    let config = create_test_config(&server);

    let summary = pipeline::run(&config, &db, &CancellationToken::new())
        .await
        .unwrap();

    assert!(summary.is_clean());
    assert_eq!(summary.counts.fetched, 3);
    assert_eq!(summary.counts.invalid_records, 1);
    assert_eq!(summary.counts.written, 2);
}

#[tokio::test]
async fn test_failed_initial_request_is_recorded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500).set_body_string("oops"))
        .mount(&server)
        .await;
    let (db, _temp_dir) = setup_db().await;
    let config = create_test_config(&server);

    let result = pipeline::run(&config, &db, &CancellationToken::new()).await;
    assert!(result.is_err());

    let runs = get_recent_runs(db.pool(), 1).await.unwrap();
    assert_eq!(runs[0].status(), Some(RunStatus::Failed));
    let message = runs[0].error.as_deref().unwrap_or_default();
    assert!(message.contains("500"), "unexpected error message: {message}");
    assert_eq!(count_posts(db.pool()).await.unwrap(), 0);
}

#[tokio::test]
async fn test_cancelled_run_writes_nothing() {
    let server = MockServer::start().await;
    mount_three_pages(&server).await;
    let (db, _temp_dir) = setup_db().await;
    let config = create_test_config(&server);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = pipeline::run(&config, &db, &cancel).await;

    assert!(result.is_err());
    let runs = get_recent_runs(db.pool(), 1).await.unwrap();
    assert_eq!(runs[0].status(), Some(RunStatus::Cancelled));
    assert_eq!(count_posts(db.pool()).await.unwrap(), 0);
}
