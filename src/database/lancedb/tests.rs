use super::*;
use crate::records::MetadataValue;
use tempfile::TempDir;

fn document(id: &str, text: &str) -> Document {
    let mut metadata = Metadata::new();
    metadata.insert("id".to_string(), MetadataValue::Text(id.to_string()));
    metadata.insert("capacity".to_string(), MetadataValue::Integer(120));
    Document {
        id: id.to_string(),
        text: text.to_string(),
        metadata,
    }
}

async fn open_collection(dir: &TempDir, recreate: bool) -> LanceCollection {
    LanceCollection::open(&dir.path().join("events_db"), "events", recreate)
        .await
        .expect("should open collection")
}

#[tokio::test]
async fn new_collection_is_empty() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let collection = open_collection(&temp_dir, false).await;

    assert_eq!(collection.name(), "events");
    assert_eq!(collection.vector_dimension(), None);
    assert_eq!(collection.count().await.expect("should count"), 0);

    let hits = collection
        .query(&[1.0, 0.0, 0.0], 3)
        .await
        .expect("query on empty collection should succeed");
    assert!(hits.is_empty());
}

#[tokio::test]
async fn upsert_then_query_nearest_first() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let mut collection = open_collection(&temp_dir, false).await;

    let documents = vec![
        document("a", "Event: Rust meetup"),
        document("b", "Event: Jazz night"),
        document("c", "Event: Farmers market"),
    ];
    let embeddings = vec![
        vec![1.0, 0.0, 0.0],
        vec![0.0, 1.0, 0.0],
        vec![0.0, 0.0, 1.0],
    ];

    collection
        .upsert(&documents, &embeddings)
        .await
        .expect("should upsert documents");

    assert_eq!(collection.vector_dimension(), Some(3));
    assert_eq!(collection.count().await.expect("should count"), 3);

    let hits = collection
        .query(&[0.0, 0.9, 0.1], 2)
        .await
        .expect("query should succeed");

    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].id, "b");
    assert_eq!(hits[0].text, "Event: Jazz night");
    assert_eq!(
        hits[0].metadata.get("capacity"),
        Some(&MetadataValue::Integer(120))
    );
    assert!(hits[0].distance <= hits[1].distance);
    assert!((hits[0].similarity - (1.0 - hits[0].distance)).abs() < f32::EPSILON);
}

#[tokio::test]
async fn upsert_replaces_existing_identifier() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let mut collection = open_collection(&temp_dir, false).await;

    collection
        .upsert(
            &[document("a", "old text"), document("b", "other")],
            &[vec![1.0, 0.0], vec![0.0, 1.0]],
        )
        .await
        .expect("should upsert documents");

    collection
        .upsert(&[document("a", "new text")], &[vec![1.0, 0.0]])
        .await
        .expect("should upsert replacement");

    assert_eq!(collection.count().await.expect("should count"), 2);

    let hits = collection
        .query(&[1.0, 0.0], 1)
        .await
        .expect("query should succeed");
    assert_eq!(hits[0].id, "a");
    assert_eq!(hits[0].text, "new text");
}

#[tokio::test]
async fn mismatched_lengths_write_nothing() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let mut collection = open_collection(&temp_dir, false).await;

    let result = collection
        .upsert(
            &[document("a", "one"), document("b", "two")],
            &[vec![1.0, 0.0]],
        )
        .await;

    assert!(matches!(result, Err(IndexerError::Database(_))));
    assert_eq!(collection.count().await.expect("should count"), 0);
}

#[tokio::test]
async fn dimension_change_is_rejected() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let mut collection = open_collection(&temp_dir, false).await;

    collection
        .upsert(&[document("a", "one")], &[vec![1.0, 0.0, 0.0]])
        .await
        .expect("should upsert documents");

    let result = collection
        .upsert(&[document("b", "two")], &[vec![1.0, 0.0]])
        .await;
    assert!(result.is_err());

    let ragged = collection
        .upsert(
            &[document("c", "three"), document("d", "four")],
            &[vec![1.0, 0.0, 0.0], vec![1.0]],
        )
        .await;
    assert!(ragged.is_err());

    assert_eq!(collection.count().await.expect("should count"), 1);
}

#[tokio::test]
async fn empty_upsert_is_a_no_op() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let mut collection = open_collection(&temp_dir, false).await;

    collection
        .upsert(&[], &[])
        .await
        .expect("empty upsert should succeed");

    assert_eq!(collection.vector_dimension(), None);
    assert_eq!(collection.count().await.expect("should count"), 0);
}

#[tokio::test]
async fn reopen_keeps_or_drops_documents() {
    let temp_dir = TempDir::new().expect("should create temp dir");

    {
        let mut collection = open_collection(&temp_dir, false).await;
        collection
            .upsert(&[document("a", "one")], &[vec![0.5, 0.5]])
            .await
            .expect("should upsert documents");
    }

    let reused = open_collection(&temp_dir, false).await;
    assert_eq!(reused.vector_dimension(), Some(2));
    assert_eq!(reused.count().await.expect("should count"), 1);
    drop(reused);

    let recreated = open_collection(&temp_dir, true).await;
    assert_eq!(recreated.vector_dimension(), None);
    assert_eq!(recreated.count().await.expect("should count"), 0);
}

#[tokio::test]
async fn recreate_drops_documents_and_dimension() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let mut collection = open_collection(&temp_dir, false).await;

    collection
        .upsert(&[document("a", "one")], &[vec![0.5, 0.5]])
        .await
        .expect("should upsert documents");

    collection.recreate().await.expect("should recreate");
    assert_eq!(collection.count().await.expect("should count"), 0);

    // A new dimension is accepted after recreation
    collection
        .upsert(&[document("b", "two")], &[vec![0.1, 0.2, 0.3, 0.4]])
        .await
        .expect("should upsert after recreate");
    assert_eq!(collection.vector_dimension(), Some(4));
}

#[test]
fn schema_has_fixed_size_vector() {
    let schema = create_schema(384).expect("should build schema");
    let field = schema
        .field_with_name(VECTOR_COLUMN)
        .expect("should have vector column");

    assert!(matches!(field.data_type(), DataType::FixedSizeList(_, 384)));
    assert!(schema.field_with_name("metadata").is_ok());
}
