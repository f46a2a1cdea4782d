//! One ingest run: paginate → decode → transform → persist.
//!
//! Pages are streamed; records are buffered only up to one batch before they
//! are written, so memory stays bounded by the batch size plus the pages in
//! flight.

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::api::{decode_posts, ApiClient, FetchError, Paginator};
use crate::config::Config;
use crate::db::{
    finish_run, start_run, BatchWriter, Database, PersistError, RejectedRow, RunCounts, RunStatus,
};
use crate::transform::{to_storage, StorageRecord};

/// Result of a completed run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: i64,
    pub counts: RunCounts,
    pub rejected: Vec<RejectedRow>,
}

impl RunSummary {
    /// Whether every fetched post made it into the destination.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// Run the pipeline once, recording the run in the ledger.
///
/// # Errors
///
/// Returns an error for any fatal condition: transport failure, a failed
/// initial request, too many declared pages, a destination failure, a
/// rejected row when rows are not being skipped, or cancellation.
pub async fn run(config: &Config, db: &Database, cancel: &CancellationToken) -> Result<RunSummary> {
    let run_id = start_run(db.pool()).await?;
    info!(run_id, api_url = %config.api_url, "Ingest run started");

    let mut counts = RunCounts::default();
    let mut rejected = Vec::new();
    let result = ingest(config, db, cancel, &mut counts, &mut rejected).await;

    match result {
        Ok(()) => {
            counts.rejected = rejected.len() as i64;
            let status = if rejected.is_empty() {
                RunStatus::Succeeded
            } else {
                RunStatus::Partial
            };
            finish_run(db.pool(), run_id, status, &counts, None).await?;
            info!(
                run_id,
                pages = counts.pages,
                skipped_pages = counts.skipped_pages,
                fetched = counts.fetched,
                invalid_records = counts.invalid_records,
                written = counts.written,
                unchanged = counts.unchanged,
                rejected = counts.rejected,
                "Ingest run finished"
            );
            Ok(RunSummary {
                run_id,
                counts,
                rejected,
            })
        }
        Err(e) => {
            counts.rejected = rejected.len() as i64;
            let status = if cancel.is_cancelled() {
                RunStatus::Cancelled
            } else {
                RunStatus::Failed
            };
            let message = format!("{e:#}");
            if let Err(ledger_err) =
                finish_run(db.pool(), run_id, status, &counts, Some(&message)).await
            {
                error!(run_id, "Failed to record run failure: {ledger_err:#}");
            }
            Err(e)
        }
    }
}

async fn ingest(
    config: &Config,
    db: &Database,
    cancel: &CancellationToken,
    counts: &mut RunCounts,
    rejected: &mut Vec<RejectedRow>,
) -> Result<()> {
    let client = ApiClient::new(config)?;
    let paginator = Paginator::new(&client, config);
    let writer = BatchWriter::new(db.pool(), config);

    let mut pages = tokio::select! {
        biased;
        () = cancel.cancelled() => return Err(FetchError::Cancelled.into()),
        opened = paginator.open() => opened.context("Failed to start pagination")?,
    };

    let mut buffer: Vec<StorageRecord> = Vec::with_capacity(config.batch_size);
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(FetchError::Cancelled.into()),
            next = pages.next_page() => next.context("Pagination failed")?,
        };
        counts.skipped_pages = i64::from(pages.skipped_pages());
        let Some(page) = next else { break };

        counts.pages += 1;
        counts.fetched += page.records.len() as i64;
        let (posts, invalid) = decode_posts(page.number, page.records);
        counts.invalid_records += invalid as i64;
        buffer.extend(posts.into_iter().map(to_storage));

        if buffer.len() >= config.batch_size {
            flush(&writer, &mut buffer, cancel, counts, rejected).await?;
        }
    }

    flush(&writer, &mut buffer, cancel, counts, rejected).await
}

async fn flush(
    writer: &BatchWriter<'_>,
    buffer: &mut Vec<StorageRecord>,
    cancel: &CancellationToken,
    counts: &mut RunCounts,
    rejected: &mut Vec<RejectedRow>,
) -> Result<()> {
    if buffer.is_empty() {
        return Ok(());
    }

    let report = writer.write(buffer, cancel).await.map_err(|e| {
        let context = if matches!(e, PersistError::RowRejected { .. }) {
            "Batch aborted on rejected row"
        } else {
            "Failed to persist batch"
        };
        anyhow::Error::new(e).context(context)
    })?;

    counts.written += report.written as i64;
    counts.unchanged += report.unchanged as i64;
    rejected.extend(report.rejected);
    buffer.clear();
    Ok(())
}
