use super::*;
use crate::records::Metadata;
use crate::{IndexerError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use tokio::time::Instant;

/// Embeds a text as `[len, first byte]`, failing for texts containing "BROKEN"
#[derive(Debug, Default)]
struct FakeEmbedder {
    calls: Mutex<Vec<usize>>,
    dimension_override: Option<usize>,
}

impl Embedder for FakeEmbedder {
    fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        self.calls
            .lock()
            .expect("calls lock should not be poisoned")
            .push(texts.len());

        if texts.iter().any(|text| text.contains("BROKEN")) {
            anyhow::bail!("model rejected input");
        }

        Ok(texts
            .iter()
            .map(|text| match self.dimension_override {
                Some(dimension) if text.contains("WIDE") => vec![0.0; dimension],
                _ => vec![
                    text.len() as f32,
                    f32::from(text.bytes().next().unwrap_or_default()),
                ],
            })
            .collect())
    }

    fn model_name(&self) -> &str {
        "fake"
    }
}

/// In-memory collection that can fail upserts on demand
#[derive(Debug, Default)]
struct FakeCollection {
    rows: BTreeMap<String, (String, Vec<f32>)>,
    /// Upserts of a batch containing one of these ids always fail
    poisoned_ids: HashSet<String>,
    /// Number of upcoming upserts to fail before succeeding
    transient_failures: u32,
    upsert_calls: Vec<Vec<String>>,
}

#[async_trait]
impl VectorCollection for FakeCollection {
    async fn upsert(&mut self, documents: &[Document], embeddings: &[Vec<f32>]) -> Result<()> {
        self.upsert_calls
            .push(documents.iter().map(|doc| doc.id.clone()).collect());

        if self.transient_failures > 0 {
            self.transient_failures -= 1;
            return Err(IndexerError::Database("temporarily unavailable".to_string()));
        }
        if documents.iter().any(|doc| self.poisoned_ids.contains(&doc.id)) {
            return Err(IndexerError::Database("write rejected".to_string()));
        }

        for (document, embedding) in documents.iter().zip(embeddings) {
            self.rows.insert(
                document.id.clone(),
                (document.text.clone(), embedding.clone()),
            );
        }
        Ok(())
    }

    async fn query(&self, _embedding: &[f32], _k: usize) -> Result<Vec<crate::database::SearchHit>> {
        Ok(Vec::new())
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.rows.len() as u64)
    }

    async fn recreate(&mut self) -> Result<()> {
        self.rows.clear();
        Ok(())
    }
}

fn documents(count: usize) -> Vec<Document> {
    (0..count)
        .map(|i| Document {
            id: format!("doc-{}", i),
            text: format!("Event: {}{}", "x".repeat(i), i),
            metadata: Metadata::new(),
        })
        .collect()
}

fn indexer(batch_size: usize, max_attempts: u32) -> BatchedIndexer {
    BatchedIndexer::new(
        batch_size,
        RetryPolicy::new(max_attempts, Duration::from_secs(1)),
    )
    .with_progress(false)
}

#[test]
fn partitions_into_ceil_batches() {
    let ranges = partition_batches(5, 2);
    assert_eq!(ranges, vec![0..2, 2..4, 4..5]);

    assert_eq!(partition_batches(6, 3), vec![0..3, 3..6]);
    assert_eq!(partition_batches(250, 100).len(), 3);
    assert!(partition_batches(0, 100).is_empty());
    assert_eq!(partition_batches(3, 0), vec![0..1, 1..2, 2..3]);
}

#[test]
fn backoff_doubles_per_attempt() {
    let policy = RetryPolicy::new(3, Duration::from_secs(1));

    assert_eq!(policy.delay_for(1), Duration::from_secs(2));
    assert_eq!(policy.delay_for(2), Duration::from_secs(4));
    assert_eq!(policy.delay_for(3), Duration::from_secs(8));
    assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
}

#[test]
fn embeds_in_ordered_sub_chunks() {
    let embedder = FakeEmbedder::default();
    let texts: Vec<String> = (0..5).map(|i| "t".repeat(i + 1)).collect();

    let embeddings = embed_in_chunks(&embedder, &texts, 2).expect("embedding should succeed");

    assert_eq!(
        *embedder.calls.lock().expect("calls lock should not be poisoned"),
        vec![2, 2, 1]
    );
    let lengths: Vec<f32> = embeddings.iter().map(|e| e[0]).collect();
    assert_eq!(lengths, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
}

#[tokio::test]
async fn indexes_every_batch_in_order() {
    let docs = documents(7);
    let embedder = FakeEmbedder::default();
    let mut collection = FakeCollection::default();

    let summary = indexer(3, 3)
        .index(&docs, &embedder, &mut collection)
        .await;

    assert_eq!(summary.total_documents, 7);
    assert_eq!(summary.indexed(), 7);
    assert!(summary.is_complete());
    assert_eq!(summary.batches.len(), 3);
    assert_eq!(
        summary.batches.iter().map(|b| b.range.clone()).collect::<Vec<_>>(),
        vec![0..3, 3..6, 6..7]
    );
    assert_eq!(collection.count().await.expect("should count"), 7);
}

#[tokio::test]
async fn embeddings_stay_aligned_with_documents() {
    let docs = documents(10);
    let embedder = FakeEmbedder::default();
    let mut collection = FakeCollection::default();

    indexer(4, 1)
        .with_embed_chunk_size(3)
        .index(&docs, &embedder, &mut collection)
        .await;

    for doc in &docs {
        let (text, embedding) = &collection.rows[&doc.id];
        assert_eq!(text, &doc.text);
        assert_eq!(embedding[0], doc.text.len() as f32);
    }
}

#[tokio::test(start_paused = true)]
async fn transient_upsert_failures_back_off_then_succeed() {
    let docs = documents(2);
    let embedder = FakeEmbedder::default();
    let mut collection = FakeCollection {
        transient_failures: 2,
        ..FakeCollection::default()
    };

    let started = Instant::now();
    let summary = indexer(10, 3)
        .index(&docs, &embedder, &mut collection)
        .await;
    let elapsed = started.elapsed();

    assert_eq!(summary.indexed(), 2);
    assert_eq!(summary.batches[0].attempts, 3);
    assert_eq!(collection.upsert_calls.len(), 3);
    // 2^1 + 2^2 units
    assert!(elapsed >= Duration::from_secs(6), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(7), "elapsed {:?}", elapsed);
}

#[tokio::test(start_paused = true)]
async fn exhausted_batch_is_abandoned_and_run_continues() {
    let docs = documents(5);
    let embedder = FakeEmbedder::default();
    let mut collection = FakeCollection {
        poisoned_ids: HashSet::from(["doc-2".to_string()]),
        ..FakeCollection::default()
    };

    let summary = indexer(2, 3)
        .index(&docs, &embedder, &mut collection)
        .await;

    assert_eq!(summary.indexed(), 3);
    assert!(!summary.is_complete());

    let second_batch_attempts = collection
        .upsert_calls
        .iter()
        .filter(|ids| ids.contains(&"doc-2".to_string()))
        .count();
    assert_eq!(second_batch_attempts, 3);
    assert_eq!(collection.upsert_calls.len(), 5);

    let failures: Vec<_> = summary.failed_batches().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0.index, 1);
    assert!(matches!(
        failures[0].1,
        BatchFailure::Upsert { attempts: 3, .. }
    ));

    assert!(collection.rows.contains_key("doc-4"));
    assert!(!collection.rows.contains_key("doc-2"));
}

#[tokio::test]
async fn embedding_failure_skips_batch_without_retry() {
    let mut docs = documents(4);
    docs[1].text = "Event: BROKEN".to_string();
    let embedder = FakeEmbedder::default();
    let mut collection = FakeCollection::default();

    let summary = indexer(2, 3)
        .index(&docs, &embedder, &mut collection)
        .await;

    assert_eq!(summary.indexed(), 2);
    assert_eq!(summary.batches[0].attempts, 0);
    assert!(matches!(
        summary.batches[0].outcome,
        BatchOutcome::Failed {
            reason: BatchFailure::Embedding(_)
        }
    ));
    // Only the second batch reached the collection
    assert_eq!(collection.upsert_calls.len(), 1);
    assert_eq!(
        *embedder.calls.lock().expect("calls lock should not be poisoned"),
        vec![2, 2]
    );
}

#[tokio::test]
async fn dimension_mismatch_counts_as_embedding_failure() {
    let mut docs = documents(4);
    docs[3].text = "Event: WIDE".to_string();
    let embedder = FakeEmbedder {
        dimension_override: Some(5),
        ..FakeEmbedder::default()
    };
    let mut collection = FakeCollection::default();

    let summary = indexer(2, 3)
        .with_expected_dimension(Some(2))
        .index(&docs, &embedder, &mut collection)
        .await;

    assert_eq!(summary.indexed(), 2);
    let failures: Vec<_> = summary.failed_batches().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0.range, 2..4);
    assert!(failures[0].1.to_string().contains("expected 2"));
}

#[tokio::test]
async fn first_batch_fixes_dimension_when_unset() {
    let mut docs = documents(4);
    docs[2].text = "Event: WIDE".to_string();
    let embedder = FakeEmbedder {
        dimension_override: Some(3),
        ..FakeEmbedder::default()
    };
    let mut collection = FakeCollection::default();

    let summary = indexer(2, 1)
        .index(&docs, &embedder, &mut collection)
        .await;

    assert_eq!(summary.indexed(), 2);
    assert!(matches!(
        summary.batches[1].outcome,
        BatchOutcome::Failed {
            reason: BatchFailure::Embedding(_)
        }
    ));
}

#[tokio::test]
async fn empty_input_produces_empty_summary() {
    let embedder = FakeEmbedder::default();
    let mut collection = FakeCollection::default();

    let summary = indexer(100, 3)
        .index(&[], &embedder, &mut collection)
        .await;

    assert_eq!(summary, RunSummary::default());
    assert!(summary.is_complete());
    assert!(embedder.calls.lock().expect("calls lock should not be poisoned").is_empty());
}

#[test]
fn failure_reasons_display() {
    assert_eq!(
        BatchFailure::Embedding("timeout".to_string()).to_string(),
        "embedding failed: timeout"
    );
    assert_eq!(
        BatchFailure::Upsert {
            attempts: 3,
            last_error: "disk full".to_string()
        }
        .to_string(),
        "upsert failed after 3 attempts: disk full"
    );
}
