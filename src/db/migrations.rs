use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::debug;

/// Run all pending migrations.
pub async fn run(pool: &SqlitePool) -> Result<()> {
    create_migration_table(pool).await?;
    let current_version = get_schema_version(pool).await?;

    if current_version < 1 {
        debug!("Running migration v1");
        run_migration_v1(pool).await?;
        set_schema_version(pool, 1).await?;
    }

    if current_version < 2 {
        debug!("Running migration v2");
        run_migration_v2(pool).await?;
        set_schema_version(pool, 2).await?;
    }

    Ok(())
}

async fn create_migration_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS _schema_version (
            version INTEGER PRIMARY KEY
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create schema version table")?;

    Ok(())
}

async fn get_schema_version(pool: &SqlitePool) -> Result<i32> {
    let version: Option<i32> = sqlx::query_scalar("SELECT MAX(version) FROM _schema_version")
        .fetch_one(pool)
        .await
        .context("Failed to get schema version")?;

    Ok(version.unwrap_or(0))
}

async fn set_schema_version(pool: &SqlitePool, version: i32) -> Result<()> {
    // INSERT OR IGNORE: an overlapping run may have recorded the same version.
    sqlx::query("INSERT OR IGNORE INTO _schema_version (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await
        .context("Failed to record schema version")?;
    Ok(())
}

async fn run_migration_v1(pool: &SqlitePool) -> Result<()> {
    debug!("Running migration v1: creating posts table");

    // Length limits mirror the upstream column widths; JSON documents are
    // stored as text.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS posts (
            id TEXT NOT NULL CHECK (length(id) BETWEEN 1 AND 50),
            date_gmt TEXT NOT NULL,
            modified_gmt TEXT NOT NULL,
            title TEXT NOT NULL,
            slug TEXT NULL CHECK (slug IS NULL OR length(slug) <= 255),
            status TEXT NOT NULL CHECK (length(status) <= 20),
            "type" TEXT NOT NULL CHECK (length("type") <= 20),
            link TEXT NOT NULL,
            content TEXT NULL,
            excerpt TEXT NULL,
            author TEXT NULL,
            editor TEXT NULL,
            comment_status TEXT NOT NULL CHECK (length(comment_status) <= 20),
            comments_count INTEGER NOT NULL DEFAULT 0,
            comments TEXT NULL,
            featured_image TEXT NULL,
            post_images TEXT NULL,
            seo TEXT NULL,
            categories TEXT NULL,
            tags TEXT NULL,
            companies TEXT NULL,
            is_sponsored BOOLEAN NOT NULL DEFAULT 0,
            sponsor TEXT NULL,
            is_partnership BOOLEAN NOT NULL DEFAULT 0,
            external_scripts TEXT NULL,
            show_ads BOOLEAN NOT NULL DEFAULT 1,
            is_subscriber_exclusive BOOLEAN NOT NULL DEFAULT 0,
            is_paywalled BOOLEAN NOT NULL DEFAULT 0,
            is_inappbrowser BOOLEAN NOT NULL DEFAULT 0,
            read_time INTEGER NOT NULL,
            word_count INTEGER NOT NULL DEFAULT 0 CHECK (word_count >= 0),
            CONSTRAINT posts_pkey PRIMARY KEY (id),
            CONSTRAINT posts_slug_key UNIQUE (slug)
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create posts table")?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_posts_modified_gmt ON posts(modified_gmt)")
        .execute(pool)
        .await
        .context("Failed to create posts modified_gmt index")?;

    Ok(())
}

async fn run_migration_v2(pool: &SqlitePool) -> Result<()> {
    debug!("Running migration v2: creating ingest_runs table");

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS ingest_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            started_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
            finished_at TEXT,
            status TEXT NOT NULL DEFAULT 'running',
            pages INTEGER NOT NULL DEFAULT 0,
            skipped_pages INTEGER NOT NULL DEFAULT 0,
            fetched INTEGER NOT NULL DEFAULT 0,
            invalid_records INTEGER NOT NULL DEFAULT 0,
            written INTEGER NOT NULL DEFAULT 0,
            unchanged INTEGER NOT NULL DEFAULT 0,
            rejected INTEGER NOT NULL DEFAULT 0,
            error TEXT
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create ingest_runs table")?;

    Ok(())
}
