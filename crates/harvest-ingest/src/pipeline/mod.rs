//! Ingestion pipeline: concurrent reads feeding buffered bulk writes.
//!
//! A run takes a batch of read queries, executes them with a bounded number
//! of in-flight reads, buffers accepted documents, and flushes the buffer to
//! the bulk writer whenever it reaches the configured bucket size. The final
//! drain flushes whatever remains, so accepted documents are never lost to
//! an undersized last bucket.

pub mod read;

pub use read::{JsonDocs, ReadQuery, RecordParser};

use futures::{stream, StreamExt};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};
use uuid::Uuid;

use crate::bulk::BulkWriter;
use read::{ReadOutcome, SkipReason};

/// Tuning knobs for a pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Maximum reads in flight at once.
    pub threads: usize,

    /// Buffer flush threshold in documents.
    pub bucket_size: usize,

    /// Attempt cap for overloaded reads.
    pub retry_limit: u32,

    /// Backoff time unit. One second matches upstream rate-limit windows;
    /// tests shrink it to keep retries fast.
    pub retry_unit: Duration,

    /// Log a progress line every N completed reads.
    pub job_status_every: Option<u64>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            threads: 1,
            bucket_size: 1,
            retry_limit: read::DEFAULT_RETRY_LIMIT,
            retry_unit: Duration::from_secs(1),
            job_status_every: None,
        }
    }
}

impl PipelineOptions {
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_bucket_size(mut self, bucket_size: usize) -> Self {
        self.bucket_size = bucket_size;
        self
    }

    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn with_retry_unit(mut self, retry_unit: Duration) -> Self {
        self.retry_unit = retry_unit;
        self
    }

    pub fn with_job_status_every(mut self, every: u64) -> Self {
        self.job_status_every = Some(every);
        self
    }
}

/// What a finished run did. Failures are tallied, never raised: one bad
/// read or flush does not abort the batch.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Short id stamped on every log line of the run.
    pub run_id: String,

    /// Reads that completed, in any terminal state.
    pub reads: usize,

    /// Reads skipped because the remote document does not exist.
    pub skipped_not_found: usize,

    /// Reads skipped because the body parsed to no documents.
    pub skipped_invalid: usize,

    /// Terminal read failures, tallied by reason.
    pub failures: BTreeMap<String, usize>,

    /// Buffer flushes performed (only non-empty buffers count).
    pub flushes: usize,

    /// Documents handed to the bulk writer across all flushes.
    pub total_flushed: usize,

    /// Documents the store acknowledged as written.
    pub total_saved: usize,

    /// Per-reason write result tallies merged across flushes.
    pub write_reasons: BTreeMap<String, usize>,

    /// First read or write error of the run, if any.
    pub error: Option<String>,

    pub elapsed: Duration,
}

impl RunSummary {
    fn new(run_id: String) -> Self {
        Self {
            run_id,
            reads: 0,
            skipped_not_found: 0,
            skipped_invalid: 0,
            failures: BTreeMap::new(),
            flushes: 0,
            total_flushed: 0,
            total_saved: 0,
            write_reasons: BTreeMap::new(),
            error: None,
            elapsed: Duration::ZERO,
        }
    }

    /// Saved-document throughput over the whole run.
    pub fn docs_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.total_saved as f64 / secs
        } else {
            0.0
        }
    }
}

/// Reads documents from an upstream API and bulk-writes them downstream.
pub struct IngestionPipeline {
    client: reqwest::Client,
    writer: BulkWriter,
    parser: Arc<dyn RecordParser>,
    options: PipelineOptions,
}

impl IngestionPipeline {
    pub fn new(
        writer: BulkWriter,
        parser: impl RecordParser + 'static,
        options: PipelineOptions,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            writer,
            parser: Arc::new(parser),
            options,
        }
    }

    /// Run the batch to completion and report what happened.
    pub async fn go(&self, queries: Vec<ReadQuery>) -> RunSummary {
        let run_id = Uuid::new_v4().simple().to_string()[..8].to_string();
        let started = Instant::now();
        let total_queries = queries.len();
        info!(
            "[{}] starting run: {} queries, {} threads, bucket size {}",
            run_id, total_queries, self.options.threads, self.options.bucket_size
        );

        let mut summary = RunSummary::new(run_id.clone());
        let mut buffer: Vec<Value> = Vec::new();

        {
            let client = &self.client;
            let parser: &dyn RecordParser = self.parser.as_ref();
            let run_id = run_id.as_str();
            let retry_limit = self.options.retry_limit;
            let retry_unit = self.options.retry_unit;

            let mut outcomes = stream::iter(queries.into_iter().map(|query| async move {
                read::execute(client, parser, &query, retry_limit, retry_unit, run_id).await
            }))
            .buffer_unordered(self.options.threads.max(1));

            while let Some(outcome) = outcomes.next().await {
                summary.reads += 1;
                match outcome {
                    ReadOutcome::Accepted(docs) => {
                        buffer.extend(docs);
                        if buffer.len() >= self.options.bucket_size {
                            self.flush(&mut buffer, &mut summary).await;
                        }
                    },
                    ReadOutcome::Skipped(SkipReason::NotFound) => {
                        summary.skipped_not_found += 1;
                    },
                    ReadOutcome::Skipped(SkipReason::EmptyParse) => {
                        summary.skipped_invalid += 1;
                    },
                    ReadOutcome::Failed(e) => {
                        *summary.failures.entry(e.reason().to_string()).or_insert(0) += 1;
                        summary.error.get_or_insert_with(|| e.to_string());
                    },
                }

                if let Some(every) = self.options.job_status_every {
                    if summary.reads as u64 % every == 0 {
                        info!(
                            "[{}] progress: {}/{} reads, {} docs saved",
                            run_id, summary.reads, total_queries, summary.total_saved
                        );
                    }
                }
            }
        }

        // Drain: whatever is left in the buffer still gets written.
        self.flush(&mut buffer, &mut summary).await;

        summary.elapsed = started.elapsed();
        info!(
            "[{}] run complete: {} reads, {} flushes, {} docs saved in {:.1}s ({:.0} docs/s)",
            run_id,
            summary.reads,
            summary.flushes,
            summary.total_saved,
            summary.elapsed.as_secs_f64(),
            summary.docs_per_second()
        );
        summary
    }

    /// Hand the buffered documents to the writer. Empty buffers are not a
    /// flush. Write failures are recorded on the summary and the partial
    /// tallies kept.
    async fn flush(&self, buffer: &mut Vec<Value>, summary: &mut RunSummary) {
        if buffer.is_empty() {
            return;
        }

        let docs = std::mem::take(buffer);
        let count = docs.len();
        summary.flushes += 1;
        summary.total_flushed += count;

        match self.writer.save(docs).await {
            Ok(outcome) => {
                summary.total_saved += outcome.ok;
                for (reason, n) in &outcome.reasons {
                    *summary.write_reasons.entry(reason.clone()).or_insert(0) += n;
                }
                info!(
                    "[{}] flushed {} docs ({} ok)",
                    summary.run_id, count, outcome.ok
                );
            },
            Err(e) => {
                summary.total_saved += e.partial.ok;
                for (reason, n) in &e.partial.reasons {
                    *summary.write_reasons.entry(reason.clone()).or_insert(0) += n;
                }
                error!("[{}] flush of {} docs failed: {}", summary.run_id, count, e);
                summary.error.get_or_insert_with(|| e.to_string());
            },
        }
    }
}
