// LanceDB vector collection
// Stores documents with their embeddings and metadata for similarity search

#[cfg(test)]
mod tests;

use arrow::array::{Array, FixedSizeListArray, Float32Array, RecordBatchIterator, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use futures::TryStreamExt;
use lancedb::{
    Connection, Table,
    query::{ExecutableQuery, QueryBase},
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{SearchHit, VectorCollection};
use crate::records::{Document, Metadata};
use crate::{IndexerError, Result};

const VECTOR_COLUMN: &str = "vector";

/// A named LanceDB table holding one row per document
pub struct LanceCollection {
    connection: Connection,
    path: PathBuf,
    name: String,
    /// Known once the table exists
    vector_dimension: Option<usize>,
}

impl std::fmt::Debug for LanceCollection {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanceCollection")
            .field("path", &self.path)
            .field("name", &self.name)
            .field("vector_dimension", &self.vector_dimension)
            .finish_non_exhaustive()
    }
}

impl LanceCollection {
    /// Open the collection `name` in the database at `path`.
    ///
    /// With `recreate` any existing table is dropped first; otherwise existing
    /// documents are kept and later upserts merge into them. The table itself is
    /// created on the first upsert, once the vector dimension is known.
    #[inline]
    pub async fn open(path: &Path, name: &str, recreate: bool) -> Result<Self> {
        debug!("Opening LanceDB collection '{}' at {:?}", name, path);

        std::fs::create_dir_all(path).map_err(|e| {
            IndexerError::Database(format!("Failed to create collection directory: {}", e))
        })?;

        let uri = format!("file://{}", path.display());
        let connection = lancedb::connect(&uri)
            .execute()
            .await
            .map_err(|e| IndexerError::Database(format!("Failed to connect to LanceDB: {}", e)))?;

        let mut collection = Self {
            connection,
            path: path.to_path_buf(),
            name: name.to_string(),
            vector_dimension: None,
        };

        if recreate {
            collection.recreate().await?;
        } else if collection.table_exists().await? {
            let dimension = collection.detect_vector_dimension().await?;
            info!(
                "Reusing collection '{}' ({} dimensions)",
                collection.name, dimension
            );
            collection.vector_dimension = Some(dimension);
        }

        Ok(collection)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Vector dimension of the stored documents, if any have been stored
    #[inline]
    pub fn vector_dimension(&self) -> Option<usize> {
        self.vector_dimension
    }

    async fn table_exists(&self) -> Result<bool> {
        let table_names = self
            .connection
            .table_names()
            .execute()
            .await
            .map_err(|e| IndexerError::Database(format!("Failed to list tables: {}", e)))?;

        Ok(table_names.contains(&self.name))
    }

    async fn open_table(&self) -> Result<Table> {
        self.connection
            .open_table(&self.name)
            .execute()
            .await
            .map_err(|e| IndexerError::Database(format!("Failed to open table: {}", e)))
    }

    async fn detect_vector_dimension(&self) -> Result<usize> {
        let schema = self
            .open_table()
            .await?
            .schema()
            .await
            .map_err(|e| IndexerError::Database(format!("Failed to get table schema: {}", e)))?;

        schema
            .fields()
            .iter()
            .find(|field| field.name() == VECTOR_COLUMN)
            .and_then(|field| match field.data_type() {
                DataType::FixedSizeList(_, size) => usize::try_from(*size).ok(),
                _ => None,
            })
            .ok_or_else(|| {
                IndexerError::Database(
                    "Could not find vector column or determine dimension".to_string(),
                )
            })
    }

    async fn create_table(&mut self, vector_dimension: usize) -> Result<()> {
        info!(
            "Creating collection '{}' with {} dimensions",
            self.name, vector_dimension
        );

        self.connection
            .create_empty_table(&self.name, create_schema(vector_dimension)?)
            .execute()
            .await
            .map_err(|e| IndexerError::Database(format!("Failed to create table: {}", e)))?;

        self.vector_dimension = Some(vector_dimension);
        Ok(())
    }

    async fn parse_search_results_stream(
        &self,
        mut results: lancedb::arrow::SendableRecordBatchStream,
    ) -> Result<Vec<SearchHit>> {
        let mut hits = Vec::new();

        while let Some(batch) = results
            .try_next()
            .await
            .map_err(|e| IndexerError::Database(format!("Failed to read result stream: {}", e)))?
        {
            hits.extend(parse_search_batch(&batch)?);
        }

        debug!("Parsed {} search results from stream", hits.len());
        Ok(hits)
    }
}

#[async_trait]
impl VectorCollection for LanceCollection {
    #[inline]
    async fn upsert(&mut self, documents: &[Document], embeddings: &[Vec<f32>]) -> Result<()> {
        if documents.len() != embeddings.len() {
            return Err(IndexerError::Database(format!(
                "Document and embedding counts differ: {} vs {}",
                documents.len(),
                embeddings.len()
            )));
        }

        let Some(first) = embeddings.first() else {
            debug!("No documents to upsert");
            return Ok(());
        };
        let vector_dimension = first.len();

        if let Some(position) = embeddings.iter().position(|e| e.len() != vector_dimension) {
            return Err(IndexerError::Database(format!(
                "Embedding {} has {} dimensions, expected {}",
                position,
                embeddings[position].len(),
                vector_dimension
            )));
        }

        match self.vector_dimension {
            Some(existing) if existing != vector_dimension => {
                return Err(IndexerError::Database(format!(
                    "Collection '{}' stores {}-dimensional vectors, got {}",
                    self.name, existing, vector_dimension
                )));
            }
            Some(_) => {}
            None => self.create_table(vector_dimension).await?,
        }

        let record_batch = create_record_batch(documents, embeddings, vector_dimension)?;
        let schema = record_batch.schema();
        let reader = RecordBatchIterator::new(std::iter::once(Ok(record_batch)), schema);

        let table = self.open_table().await?;
        let mut merge = table.merge_insert(&["id"]);
        merge
            .when_matched_update_all(None)
            .when_not_matched_insert_all();
        merge
            .execute(Box::new(reader))
            .await
            .map_err(|e| IndexerError::Database(format!("Failed to upsert documents: {}", e)))?;

        debug!(
            "Upserted {} documents into '{}'",
            documents.len(),
            self.name
        );
        Ok(())
    }

    #[inline]
    async fn query(&self, embedding: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        if self.vector_dimension.is_none() {
            warn!("Collection '{}' is empty, nothing to search", self.name);
            return Ok(Vec::new());
        }

        debug!("Searching '{}' for {} nearest documents", self.name, k);

        let results = self
            .open_table()
            .await?
            .vector_search(embedding)
            .map_err(|e| IndexerError::Database(format!("Failed to create vector search: {}", e)))?
            .column(VECTOR_COLUMN)
            .limit(k)
            .execute()
            .await
            .map_err(|e| IndexerError::Database(format!("Failed to execute search: {}", e)))?;

        self.parse_search_results_stream(results).await
    }

    #[inline]
    async fn count(&self) -> Result<u64> {
        if !self.table_exists().await? {
            return Ok(0);
        }

        let count = self
            .open_table()
            .await?
            .count_rows(None)
            .await
            .map_err(|e| IndexerError::Database(format!("Failed to count rows: {}", e)))?;

        Ok(count as u64)
    }

    #[inline]
    async fn recreate(&mut self) -> Result<()> {
        if self.table_exists().await? {
            info!("Dropping existing collection '{}'", self.name);
            self.connection
                .drop_table(&self.name)
                .await
                .map_err(|e| IndexerError::Database(format!("Failed to drop table: {}", e)))?;
        }

        self.vector_dimension = None;
        Ok(())
    }
}

fn create_schema(vector_dimension: usize) -> Result<Arc<Schema>> {
    let list_size = i32::try_from(vector_dimension).map_err(|_| {
        IndexerError::Database(format!("Vector dimension {} too large", vector_dimension))
    })?;

    Ok(Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("text", DataType::Utf8, false),
        Field::new("metadata", DataType::Utf8, false),
        Field::new("indexed_at", DataType::Utf8, false),
        Field::new(
            VECTOR_COLUMN,
            DataType::FixedSizeList(
                Arc::new(Field::new("item", DataType::Float32, false)),
                list_size,
            ),
            false,
        ),
    ])))
}

fn create_record_batch(
    documents: &[Document],
    embeddings: &[Vec<f32>],
    vector_dimension: usize,
) -> Result<RecordBatch> {
    let schema = create_schema(vector_dimension)?;
    let indexed_at = chrono::Utc::now().to_rfc3339();

    let ids: Vec<&str> = documents.iter().map(|d| d.id.as_str()).collect();
    let texts: Vec<&str> = documents.iter().map(|d| d.text.as_str()).collect();
    let metadata = documents
        .iter()
        .map(|d| serde_json::to_string(&d.metadata))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| IndexerError::Database(format!("Failed to encode metadata: {}", e)))?;
    let indexed_ats = vec![indexed_at.as_str(); documents.len()];

    let flat_values: Vec<f32> = embeddings.iter().flatten().copied().collect();
    let field = Arc::new(Field::new("item", DataType::Float32, false));
    let vector_array = FixedSizeListArray::try_new(
        field,
        i32::try_from(vector_dimension)
            .map_err(|_| IndexerError::Database("Vector dimension too large".to_string()))?,
        Arc::new(Float32Array::from(flat_values)),
        None,
    )
    .map_err(|e| IndexerError::Database(format!("Failed to create vector array: {}", e)))?;

    let arrays: Vec<Arc<dyn Array>> = vec![
        Arc::new(StringArray::from(ids)),
        Arc::new(StringArray::from(texts)),
        Arc::new(StringArray::from(metadata)),
        Arc::new(StringArray::from(indexed_ats)),
        Arc::new(vector_array),
    ];

    RecordBatch::try_new(schema, arrays)
        .map_err(|e| IndexerError::Database(format!("Failed to create record batch: {}", e)))
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .ok_or_else(|| IndexerError::Database(format!("Missing {} column", name)))?
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| IndexerError::Database(format!("Invalid {} column type", name)))
}

fn parse_search_batch(batch: &RecordBatch) -> Result<Vec<SearchHit>> {
    let ids = string_column(batch, "id")?;
    let texts = string_column(batch, "text")?;
    let metadata = string_column(batch, "metadata")?;

    let distances = batch
        .column_by_name("_distance")
        .and_then(|col| col.as_any().downcast_ref::<Float32Array>());

    (0..batch.num_rows())
        .map(|row| {
            let metadata: Metadata = serde_json::from_str(metadata.value(row)).map_err(|e| {
                IndexerError::Database(format!("Failed to decode stored metadata: {}", e))
            })?;

            let distance = distances.map_or(0.0, |d| if d.is_null(row) { 0.0 } else { d.value(row) });

            Ok(SearchHit {
                id: ids.value(row).to_string(),
                text: texts.value(row).to_string(),
                metadata,
                distance,
                similarity: 1.0 - distance,
            })
        })
        .collect()
}
