// Indexer module
// Embeds documents batch by batch and upserts them with bounded retries

#[cfg(test)]
mod tests;

use std::fmt;
use std::ops::Range;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::database::VectorCollection;
use crate::embeddings::Embedder;
use crate::records::Document;

/// Texts sent to the embedding model per request
pub const DEFAULT_EMBED_CHUNK_SIZE: usize = 64;

/// Split `len` items into contiguous ranges of at most `batch_size`, in order
#[inline]
pub fn partition_batches(len: usize, batch_size: usize) -> Vec<Range<usize>> {
    let batch_size = batch_size.max(1);
    (0..len)
        .step_by(batch_size)
        .map(|start| start..(start + batch_size).min(len))
        .collect()
}

/// Embed `texts` in sub-chunks of `chunk_size`, concatenating the vectors in input order
#[inline]
pub fn embed_in_chunks<E>(
    embedder: &E,
    texts: &[String],
    chunk_size: usize,
) -> anyhow::Result<Vec<Vec<f32>>>
where
    E: Embedder + ?Sized,
{
    let mut embeddings = Vec::with_capacity(texts.len());

    for chunk in texts.chunks(chunk_size.max(1)) {
        let vectors = embedder.embed(chunk)?;
        if vectors.len() != chunk.len() {
            anyhow::bail!(
                "Embedding model returned {} vectors for {} texts",
                vectors.len(),
                chunk.len()
            );
        }
        embeddings.extend(vectors);
    }

    Ok(embeddings)
}

/// How often and how patiently a failed upsert is retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total upsert attempts per batch, including the first
    pub max_attempts: u32,
    pub backoff_unit: Duration,
}

impl Default for RetryPolicy {
    #[inline]
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_unit: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    #[inline]
    pub fn new(max_attempts: u32, backoff_unit: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_unit,
        }
    }

    /// Wait after failed attempt `attempt` (1-based): `2^attempt` backoff units
    #[inline]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2_u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.backoff_unit.saturating_mul(factor)
    }
}

/// Why a batch was abandoned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchFailure {
    /// Embedding the batch failed; never retried
    Embedding(String),
    /// Every upsert attempt failed
    Upsert { attempts: u32, last_error: String },
}

impl fmt::Display for BatchFailure {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Embedding(reason) => write!(f, "embedding failed: {}", reason),
            Self::Upsert {
                attempts,
                last_error,
            } => write!(
                f,
                "upsert failed after {} attempts: {}",
                attempts, last_error
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    Success { count: usize },
    Failed { reason: BatchFailure },
}

/// Result of processing one batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    /// 0-based batch number
    pub index: usize,
    /// Positions of the batch's documents in the run's document sequence
    pub range: Range<usize>,
    /// Upsert attempts made; 0 when embedding failed
    pub attempts: u32,
    pub outcome: BatchOutcome,
}

/// Aggregate of every batch outcome in a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub total_documents: usize,
    pub batches: Vec<BatchReport>,
}

impl RunSummary {
    /// Documents in successful batches
    #[inline]
    pub fn indexed(&self) -> usize {
        self.batches
            .iter()
            .map(|batch| match batch.outcome {
                BatchOutcome::Success { count } => count,
                BatchOutcome::Failed { .. } => 0,
            })
            .sum()
    }

    #[inline]
    pub fn failed_batches(&self) -> impl Iterator<Item = (&BatchReport, &BatchFailure)> {
        self.batches.iter().filter_map(|batch| match &batch.outcome {
            BatchOutcome::Failed { reason } => Some((batch, reason)),
            BatchOutcome::Success { .. } => None,
        })
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.indexed() == self.total_documents
    }
}

/// Sequential batch pipeline: embed, then upsert with retries.
///
/// A failing batch is reported in the [`RunSummary`] and never stops the run.
#[derive(Debug, Clone)]
pub struct BatchedIndexer {
    batch_size: usize,
    embed_chunk_size: usize,
    retry: RetryPolicy,
    expected_dimension: Option<usize>,
    show_progress: bool,
}

impl BatchedIndexer {
    #[inline]
    pub fn new(batch_size: usize, retry: RetryPolicy) -> Self {
        Self {
            batch_size: batch_size.max(1),
            embed_chunk_size: DEFAULT_EMBED_CHUNK_SIZE,
            retry,
            expected_dimension: None,
            show_progress: console::user_attended_stderr(),
        }
    }

    #[inline]
    pub fn with_embed_chunk_size(mut self, chunk_size: usize) -> Self {
        self.embed_chunk_size = chunk_size.max(1);
        self
    }

    /// Require every embedding to have `dimension` entries. Without it the
    /// first embedded batch fixes the dimension for the run.
    #[inline]
    pub fn with_expected_dimension(mut self, dimension: Option<usize>) -> Self {
        self.expected_dimension = dimension;
        self
    }

    #[inline]
    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Index `documents` into `collection`, batch by batch
    #[inline]
    pub async fn index<E, C>(
        &self,
        documents: &[Document],
        embedder: &E,
        collection: &mut C,
    ) -> RunSummary
    where
        E: Embedder + ?Sized,
        C: VectorCollection + ?Sized,
    {
        let ranges = partition_batches(documents.len(), self.batch_size);
        let total_batches = ranges.len();
        info!(
            "Indexing {} documents in {} batches of up to {}",
            documents.len(),
            total_batches,
            self.batch_size
        );

        let bar = self.progress_bar(total_batches);
        let mut dimension = self.expected_dimension;
        let mut summary = RunSummary {
            total_documents: documents.len(),
            batches: Vec::with_capacity(total_batches),
        };

        for (index, range) in ranges.into_iter().enumerate() {
            bar.set_message(format!("batch {}", index + 1));

            let report = self
                .index_batch(
                    index,
                    range,
                    documents,
                    embedder,
                    collection,
                    &mut dimension,
                )
                .await;

            match &report.outcome {
                BatchOutcome::Success { count } => info!(
                    "Batch {}/{}: indexed {} documents",
                    index + 1,
                    total_batches,
                    count
                ),
                BatchOutcome::Failed { reason } => {
                    error!("Batch {}/{} abandoned: {}", index + 1, total_batches, reason);
                }
            }

            summary.batches.push(report);
            bar.inc(1);
        }

        bar.finish_and_clear();
        summary
    }

    async fn index_batch<E, C>(
        &self,
        index: usize,
        range: Range<usize>,
        documents: &[Document],
        embedder: &E,
        collection: &mut C,
        dimension: &mut Option<usize>,
    ) -> BatchReport
    where
        E: Embedder + ?Sized,
        C: VectorCollection + ?Sized,
    {
        let batch = &documents[range.clone()];
        let failed = |attempts: u32, reason: BatchFailure| BatchReport {
            index,
            range: range.clone(),
            attempts,
            outcome: BatchOutcome::Failed { reason },
        };

        let texts: Vec<String> = batch.iter().map(|doc| doc.text.clone()).collect();
        let embeddings = match embed_in_chunks(embedder, &texts, self.embed_chunk_size) {
            Ok(embeddings) => embeddings,
            Err(e) => {
                warn!("Embedding failed for batch {}: {:#}", index + 1, e);
                return failed(0, BatchFailure::Embedding(format!("{:#}", e)));
            }
        };

        if let Err(reason) = check_dimensions(&embeddings, dimension) {
            warn!("Embedding dimension mismatch in batch {}: {}", index + 1, reason);
            return failed(0, BatchFailure::Embedding(reason));
        }

        let mut attempt = 1;
        loop {
            debug!(
                "Upserting batch {} (attempt {}/{})",
                index + 1,
                attempt,
                self.retry.max_attempts
            );

            match collection.upsert(batch, &embeddings).await {
                Ok(()) => {
                    return BatchReport {
                        index,
                        range: range.clone(),
                        attempts: attempt,
                        outcome: BatchOutcome::Success { count: batch.len() },
                    };
                }
                Err(e) if attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        "Upsert of batch {} failed (attempt {}/{}): {}. Retrying in {:?}",
                        index + 1,
                        attempt,
                        self.retry.max_attempts,
                        e,
                        delay
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return failed(
                        attempt,
                        BatchFailure::Upsert {
                            attempts: attempt,
                            last_error: e.to_string(),
                        },
                    );
                }
            }
        }
    }

    fn progress_bar(&self, total_batches: usize) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }

        let style = ProgressStyle::with_template("{bar:40} [{pos}/{len}] Indexing {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        ProgressBar::new(total_batches as u64).with_style(style)
    }
}

/// Every vector must match the run's dimension; the first one seen fixes it if unset
fn check_dimensions(embeddings: &[Vec<f32>], dimension: &mut Option<usize>) -> Result<(), String> {
    let expected = match (*dimension, embeddings.first()) {
        (Some(expected), _) => expected,
        (None, Some(first)) => first.len(),
        (None, None) => return Ok(()),
    };

    if let Some((position, vector)) = embeddings
        .iter()
        .enumerate()
        .find(|(_, vector)| vector.len() != expected)
    {
        return Err(format!(
            "vector {} has {} dimensions, expected {}",
            position,
            vector.len(),
            expected
        ));
    }

    *dimension = Some(expected);
    Ok(())
}
