
use anyhow::{Context, Result};
use console::style;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::IndexerError;
use crate::config::Config;
use crate::database::{LanceCollection, SearchHit, VectorCollection};
use crate::embeddings::{Embedder, OllamaClient};
use crate::indexer::{BatchedIndexer, RetryPolicy, RunSummary};
use crate::records::{
    DedupReport, Document, DocumentBuilder, SkippedRecord, deduplicate, load_records,
};

/// Hits requested per verification query
pub const VERIFICATION_HITS: usize = 3;

/// Text embedded once before a run to learn the model's vector length
const DIMENSION_SAMPLE: &str = "dimension check";

/// Extra candidates fetched per requested hit when metadata filters apply
const FILTER_OVERFETCH: usize = 5;

const UNKNOWN: &str = "Unknown";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestOptions {
    /// Stop after building documents, without touching the model or collection
    pub dry_run: bool,
}

/// Records turned into documents, ready for indexing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreparedDocuments {
    pub total_records: usize,
    pub dedup: DedupReport,
    pub documents: Vec<Document>,
    pub skipped: Vec<SkippedRecord>,
}

/// Hits returned for one verification query
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationResult {
    pub query: String,
    pub hits: Vec<SearchHit>,
    pub error: Option<String>,
}

/// Everything an ingestion run did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
    pub total_records: usize,
    pub dedup: DedupReport,
    pub skipped: Vec<SkippedRecord>,
    pub summary: RunSummary,
    /// Collection size after the run; `None` when the collection was not opened or counted
    pub final_count: Option<u64>,
    pub verification: Vec<VerificationResult>,
    pub model: String,
    pub elapsed: Duration,
}

impl IngestReport {
    #[inline]
    pub fn indexed(&self) -> usize {
        self.summary.indexed()
    }

    /// Every verification query returned at least one hit
    #[inline]
    pub fn verification_passed(&self) -> bool {
        self.verification
            .iter()
            .all(|result| result.error.is_none() && !result.hits.is_empty())
    }
}

/// Load the configured source, fix identifiers and build documents
#[inline]
pub fn prepare_documents(config: &Config) -> crate::Result<PreparedDocuments> {
    let mut records = load_records(&config.source_path())?;

    if records.is_empty() {
        return Ok(PreparedDocuments::default());
    }

    let dedup = deduplicate(&mut records);
    let builder = DocumentBuilder::new(config.ingest.category_fields.clone());
    let built = builder.build_all(&records, config.ingest.skip_invalid_records)?;

    Ok(PreparedDocuments {
        total_records: records.len(),
        dedup,
        documents: built.documents,
        skipped: built.skipped,
    })
}

/// Index prepared documents, then run the verification queries
#[inline]
pub async fn index_prepared<E, C>(
    config: &Config,
    prepared: PreparedDocuments,
    embedder: &E,
    collection: &mut C,
) -> crate::Result<IngestReport>
where
    E: Embedder + ?Sized,
    C: VectorCollection + ?Sized,
{
    let started = Instant::now();

    let indexer = BatchedIndexer::new(
        config.ingest.batch_size,
        RetryPolicy::new(config.ingest.max_retries, config.ingest.backoff_unit()),
    )
    .with_embed_chunk_size(config.ollama.batch_size as usize)
    .with_expected_dimension(Some(config.ollama.embedding_dimension as usize));

    let summary = indexer
        .index(&prepared.documents, embedder, collection)
        .await;
    let final_count = match collection.count().await {
        Ok(count) => Some(count),
        Err(e) => {
            warn!("Failed to count collection documents: {}", e);
            None
        }
    };

    let verification = run_verification_queries(
        &config.ingest.verification_queries,
        &config.ingest.category_fields,
        embedder,
        &*collection,
    )
    .await;

    Ok(IngestReport {
        total_records: prepared.total_records,
        dedup: prepared.dedup,
        skipped: prepared.skipped,
        summary,
        final_count,
        verification,
        model: embedder.model_name().to_string(),
        elapsed: started.elapsed(),
    })
}

/// Full ingestion run against the configured Ollama model and LanceDB collection
#[inline]
pub async fn ingest(config: &Config, options: IngestOptions) -> Result<IngestReport> {
    let started = Instant::now();
    info!("Starting ingestion from {}", config.source_path().display());

    let prepared = prepare_documents(config).context("Failed to prepare documents")?;

    if prepared.total_records == 0 {
        warn!("No records found in {}", config.source_path().display());
        return Ok(IngestReport {
            model: config.ollama.model.clone(),
            elapsed: started.elapsed(),
            ..IngestReport::default()
        });
    }

    info!(
        "Prepared {} documents from {} records ({} skipped)",
        prepared.documents.len(),
        prepared.total_records,
        prepared.skipped.len()
    );

    if options.dry_run {
        info!("Dry run: not embedding or storing documents");
        let report = IngestReport {
            total_records: prepared.total_records,
            dedup: prepared.dedup,
            skipped: prepared.skipped,
            summary: RunSummary {
                total_documents: prepared.documents.len(),
                batches: Vec::new(),
            },
            model: config.ollama.model.clone(),
            elapsed: started.elapsed(),
            ..IngestReport::default()
        };
        return Ok(report);
    }

    let client =
        OllamaClient::new(&config.ollama).context("Failed to initialize Ollama client")?;
    client
        .health_check()
        .context("Embedding model is not available")?;

    let dimension = config.ollama.embedding_dimension as usize;
    check_model_dimension(&client, dimension)?;

    let mut collection = LanceCollection::open(
        &config.collection_path(),
        &config.ingest.collection_name,
        config.ingest.recreate,
    )
    .await
    .context("Failed to open collection")?;
    check_collection_dimension(&collection, dimension)?;

    let mut report = index_prepared(config, prepared, &client, &mut collection).await?;
    report.elapsed = started.elapsed();
    Ok(report)
}

/// Embed a sample text and require the model's vectors to have `expected` entries
#[inline]
pub fn check_model_dimension<E>(embedder: &E, expected: usize) -> crate::Result<()>
where
    E: Embedder + ?Sized,
{
    let actual = embed_query(embedder, DIMENSION_SAMPLE)?.len();
    if actual != expected {
        return Err(IndexerError::Config(format!(
            "Model '{}' produces {}-dimensional vectors but embedding_dimension is {}; \
             set it to {} (or pass --embedding-dimension {})",
            embedder.model_name(),
            actual,
            expected,
            actual,
            actual
        )));
    }
    debug!("Model '{}' produces {}-dimensional vectors", embedder.model_name(), actual);
    Ok(())
}

/// Refuse to index into an existing collection that stores vectors of another length
#[inline]
pub fn check_collection_dimension(
    collection: &LanceCollection,
    expected: usize,
) -> crate::Result<()> {
    match collection.vector_dimension() {
        Some(stored) if stored != expected => Err(IndexerError::Config(format!(
            "Collection '{}' stores {}-dimensional vectors but embedding_dimension is {}; \
             re-run with --recreate to rebuild it",
            collection.name(),
            stored,
            expected
        ))),
        _ => Ok(()),
    }
}

/// Run each query with `k = 3` and log what came back
#[inline]
pub async fn run_verification_queries<E, C>(
    queries: &[String],
    category_fields: &[String],
    embedder: &E,
    collection: &C,
) -> Vec<VerificationResult>
where
    E: Embedder + ?Sized,
    C: VectorCollection + ?Sized,
{
    let mut results = Vec::with_capacity(queries.len());

    for query in queries {
        info!("Verification query: '{}'", query);

        let outcome = match embed_query(embedder, query) {
            Ok(embedding) => collection.query(&embedding, VERIFICATION_HITS).await,
            Err(e) => Err(e),
        };

        let result = match outcome {
            Ok(hits) => {
                if hits.is_empty() {
                    warn!("No results for '{}'", query);
                }
                for (rank, hit) in hits.iter().enumerate() {
                    info!(
                        "  {}. {} | {} | {} | {}",
                        rank + 1,
                        metadata_text(hit, &["title"]),
                        metadata_text(hit, category_fields),
                        metadata_text(hit, &["location"]),
                        metadata_text(hit, &["date"])
                    );
                }
                VerificationResult {
                    query: query.clone(),
                    hits,
                    error: None,
                }
            }
            Err(e) => {
                warn!("Verification query '{}' failed: {}", query, e);
                VerificationResult {
                    query: query.clone(),
                    hits: Vec::new(),
                    error: Some(e.to_string()),
                }
            }
        };

        results.push(result);
    }

    results
}

/// Embed `query` and return the `limit` nearest hits matching every filter
#[inline]
pub async fn search_collection<E, C>(
    embedder: &E,
    collection: &C,
    query: &str,
    limit: usize,
    filters: &[(String, String)],
) -> crate::Result<Vec<SearchHit>>
where
    E: Embedder + ?Sized,
    C: VectorCollection + ?Sized,
{
    let embedding = embed_query(embedder, query)?;
    let candidates = if filters.is_empty() {
        limit
    } else {
        limit.saturating_mul(FILTER_OVERFETCH)
    };

    let hits = collection.query(&embedding, candidates).await?;
    debug!("Retrieved {} candidates for '{}'", hits.len(), query);

    Ok(hits
        .into_iter()
        .filter(|hit| matches_filters(hit, filters))
        .take(limit)
        .collect())
}

/// Search the configured collection and print the hits
#[inline]
pub async fn search(
    config: &Config,
    query: &str,
    limit: usize,
    filters: &[(String, String)],
) -> Result<Vec<SearchHit>> {
    let client =
        OllamaClient::new(&config.ollama).context("Failed to initialize Ollama client")?;
    let collection = LanceCollection::open(
        &config.collection_path(),
        &config.ingest.collection_name,
        false,
    )
    .await
    .context("Failed to open collection")?;

    let hits = search_collection(&client, &collection, query, limit, filters).await?;

    if hits.is_empty() {
        println!("No matching events for '{}'", query);
        return Ok(hits);
    }

    println!("{}", style(format!("Results for '{}':", query)).bold());
    for (rank, hit) in hits.iter().enumerate() {
        println!(
            "{}. {} ({:.3})",
            rank + 1,
            style(metadata_text(hit, &["title"])).cyan(),
            hit.similarity
        );
        println!(
            "   {} | {} | {}",
            metadata_text(hit, &config.ingest.category_fields),
            metadata_text(hit, &["location"]),
            metadata_text(hit, &["date"])
        );
    }

    Ok(hits)
}

/// Print collection size and model health
#[inline]
pub async fn show_status(config: &Config) -> Result<()> {
    println!("{}", style("Event Indexer Status").bold().cyan());
    println!("{}", "=".repeat(40));
    println!("Config directory: {}", config.get_base_dir().display());
    println!("Source: {}", config.source_path().display());
    println!(
        "Collection: {} at {}",
        config.ingest.collection_name,
        config.collection_path().display()
    );

    match LanceCollection::open(
        &config.collection_path(),
        &config.ingest.collection_name,
        false,
    )
    .await
    {
        Ok(collection) => match collection.count().await {
            Ok(count) => println!("  {} documents indexed", style(count).green()),
            Err(e) => println!("  {} {}", style("Failed to count documents:").red(), e),
        },
        Err(e) => println!("  {} {}", style("Failed to open collection:").red(), e),
    }

    println!("Model: {}", config.ollama.model);
    match OllamaClient::new(&config.ollama).map(|client| client.health_check()) {
        Ok(Ok(())) => println!(
            "  {}",
            style("Ollama is reachable and the model is available").green()
        ),
        Ok(Err(e)) | Err(e) => println!("  {} {:#}", style("Ollama is unhealthy:").yellow(), e),
    }

    Ok(())
}

/// Drop every document from the configured collection
#[inline]
pub async fn reset_collection(config: &Config) -> Result<()> {
    let collection = LanceCollection::open(
        &config.collection_path(),
        &config.ingest.collection_name,
        true,
    )
    .await
    .context("Failed to reset collection")?;

    info!("Collection '{}' reset", collection.name());
    println!(
        "Collection '{}' at {} is now empty",
        collection.name(),
        collection.path().display()
    );
    Ok(())
}

/// Parse a `key=value` metadata filter
#[inline]
pub fn parse_filter(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected key=value, got '{}'", raw)),
    }
}

/// Log the outcome of an ingestion run
#[inline]
pub fn log_report(report: &IngestReport) {
    info!("Ingestion summary");
    info!("  Model: {}", report.model);
    info!("  Records: {}", report.total_records);
    info!(
        "  Identifiers fixed: {} duplicate, {} missing",
        report.dedup.replaced_duplicates, report.dedup.assigned_missing
    );
    info!("  Skipped records: {}", report.skipped.len());
    info!(
        "  Indexed documents: {}/{}",
        report.indexed(),
        report.summary.total_documents
    );
    for (batch, reason) in report.summary.failed_batches() {
        warn!(
            "  Failed batch {} (documents {}..{}): {}",
            batch.index + 1,
            batch.range.start,
            batch.range.end,
            reason
        );
    }
    if let Some(count) = report.final_count {
        info!("  Collection size: {}", count);
    }
    info!("  Elapsed: {:.2?}", report.elapsed);

    if report.indexed() < report.total_records {
        warn!(
            "Only {} of {} records were indexed",
            report.indexed(),
            report.total_records
        );
    }
    if !report.verification_passed() {
        warn!("Some verification queries returned no results");
    }
}

fn embed_query<E: Embedder + ?Sized>(embedder: &E, query: &str) -> crate::Result<Vec<f32>> {
    embedder
        .embed(&[query.to_string()])
        .map_err(|e| IndexerError::Embedding(format!("{:#}", e)))?
        .pop()
        .ok_or_else(|| IndexerError::Embedding("model returned no embedding".to_string()))
}

fn matches_filters(hit: &SearchHit, filters: &[(String, String)]) -> bool {
    filters.iter().all(|(key, expected)| {
        hit.metadata
            .get(key)
            .is_some_and(|value| value.to_string() == *expected)
    })
}

/// First non-empty value among `fields`, or "Unknown"
fn metadata_text<S: AsRef<str>>(hit: &SearchHit, fields: &[S]) -> String {
    fields
        .iter()
        .filter_map(|field| hit.metadata.get(field.as_ref()))
        .map(ToString::to_string)
        .find(|text| !text.is_empty())
        .unwrap_or_else(|| UNKNOWN.to_string())
}
