//! Chunked, row-isolated batch writes.
//!
//! Each chunk of records is one transaction and each record runs inside its
//! own savepoint, so a row that violates a constraint only rolls back itself.
//! Every statement is an idempotent upsert keyed by id, which makes retrying
//! a chunk (or a whole run) from the start safe.

use sqlx::error::ErrorKind;
use sqlx::{Acquire, SqlitePool};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::queries::{upsert_post, UpsertOutcome};
use crate::backoff::backoff_delay;
use crate::config::{Config, ConflictPolicy, RowErrorPolicy};
use crate::transform::StorageRecord;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("row {id} rejected: {source}")]
    RowRejected {
        id: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("persistence cancelled")]
    Cancelled,
}

/// A record the destination refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRow {
    pub id: String,
    pub reason: String,
}

/// What a batch write did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistReport {
    pub written: usize,
    pub unchanged: usize,
    pub rejected: Vec<RejectedRow>,
}

impl PersistReport {
    fn merge(&mut self, other: Self) {
        self.written += other.written;
        self.unchanged += other.unchanged;
        self.rejected.extend(other.rejected);
    }
}

pub struct BatchWriter<'a> {
    pool: &'a SqlitePool,
    chunk_size: usize,
    retries: u32,
    conflict_policy: ConflictPolicy,
    row_error_policy: RowErrorPolicy,
}

impl<'a> BatchWriter<'a> {
    #[must_use]
    pub fn new(pool: &'a SqlitePool, config: &Config) -> Self {
        Self {
            pool,
            chunk_size: config.batch_size.max(1),
            retries: config.persist_retries,
            conflict_policy: config.conflict_policy,
            row_error_policy: config.row_error_policy,
        }
    }

    /// Upsert every record, one transaction per chunk.
    ///
    /// Chunks committed before an error stay committed.
    ///
    /// # Errors
    ///
    /// - [`PersistError::RowRejected`] for a constraint violation when rows are
    ///   not being skipped (the chunk holding it is rolled back).
    /// - [`PersistError::Database`] for non-row failures, after retrying
    ///   transient ones.
    /// - [`PersistError::Cancelled`] if `cancel` fires between chunks.
    pub async fn write(
        &self,
        records: &[StorageRecord],
        cancel: &CancellationToken,
    ) -> Result<PersistReport, PersistError> {
        let mut report = PersistReport::default();

        for chunk in records.chunks(self.chunk_size) {
            if cancel.is_cancelled() {
                return Err(PersistError::Cancelled);
            }
            report.merge(self.write_chunk_with_retry(chunk).await?);
        }

        debug!(
            records = records.len(),
            written = report.written,
            unchanged = report.unchanged,
            rejected = report.rejected.len(),
            "Batch persisted"
        );
        Ok(report)
    }

    async fn write_chunk_with_retry(
        &self,
        chunk: &[StorageRecord],
    ) -> Result<PersistReport, PersistError> {
        let mut attempt = 0;
        loop {
            match self.write_chunk(chunk).await {
                Err(PersistError::Database(e)) if is_transient(&e) && attempt < self.retries => {
                    attempt += 1;
                    let delay = backoff_delay(attempt);
                    warn!(
                        attempt,
                        rows = chunk.len(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient database error, retrying chunk"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    async fn write_chunk(&self, chunk: &[StorageRecord]) -> Result<PersistReport, PersistError> {
        let mut tx = self.pool.begin().await?;
        let mut report = PersistReport::default();

        for record in chunk {
            let mut savepoint = tx.begin().await?;
            match upsert_post(&mut *savepoint, record, self.conflict_policy).await {
                Ok(outcome) => {
                    savepoint.commit().await?;
                    match outcome {
                        UpsertOutcome::Written => report.written += 1,
                        UpsertOutcome::Unchanged => report.unchanged += 1,
                    }
                }
                Err(e) if is_row_violation(&e) => {
                    savepoint.rollback().await?;
                    match self.row_error_policy {
                        RowErrorPolicy::Skip => {
                            error!(id = %record.id(), error = %e, "Row rejected, continuing with the rest of the batch");
                            report.rejected.push(RejectedRow {
                                id: record.id().to_string(),
                                reason: e.to_string(),
                            });
                        }
                        RowErrorPolicy::Abort => {
                            tx.rollback().await?;
                            return Err(PersistError::RowRejected {
                                id: record.id().to_string(),
                                source: e,
                            });
                        }
                    }
                }
                // Dropping the transaction rolls the chunk back.
                Err(e) => return Err(e.into()),
            }
        }

        tx.commit().await?;
        Ok(report)
    }
}

/// Constraint violations are a property of the row, not of the connection.
fn is_row_violation(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db_err) => matches!(
            db_err.kind(),
            ErrorKind::UniqueViolation
                | ErrorKind::ForeignKeyViolation
                | ErrorKind::NotNullViolation
                | ErrorKind::CheckViolation
        ),
        _ => false,
    }
}

/// Busy/locked database, pool exhaustion and I/O hiccups clear up on retry.
fn is_transient(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        // SQLITE_BUSY, SQLITE_LOCKED and their extended codes
        sqlx::Error::Database(db_err) => db_err
            .code()
            .is_some_and(|code| matches!(code.as_ref(), "5" | "6" | "261" | "262" | "517")),
        _ => false,
    }
}
