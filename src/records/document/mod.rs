
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

use super::Record;
use crate::{IndexerError, Result};

/// Fields every record needs to produce a document
pub const REQUIRED_FIELDS: [&str; 3] = ["title", "location", "description"];

const UNKNOWN: &str = "Unknown";

/// Scalar metadata value accepted by the vector collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for MetadataValue {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(value) => write!(f, "{}", value),
            Self::Integer(value) => write!(f, "{}", value),
            Self::Float(value) => write!(f, "{}", value),
            Self::Text(value) => f.write_str(value),
        }
    }
}

/// Flattened record fields, ordered by name
pub type Metadata = BTreeMap<String, MetadataValue>;

/// Embedding-ready projection of a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    /// Text blob submitted to the embedding model
    pub text: String,
    pub metadata: Metadata,
}

/// A record that could not be turned into a document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRecord {
    pub id: String,
    pub missing_field: String,
}

/// Documents built from a record sequence, in input order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuiltDocuments {
    pub documents: Vec<Document>,
    pub skipped: Vec<SkippedRecord>,
}

/// Projects records into documents using a fixed text template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentBuilder {
    category_fields: Vec<String>,
}

impl Default for DocumentBuilder {
    #[inline]
    fn default() -> Self {
        Self::new(vec!["category".to_string(), "searchEventType".to_string()])
    }
}

impl DocumentBuilder {
    /// `category_fields` are tried in order for the "Type" line of the text blob
    #[inline]
    pub fn new(category_fields: Vec<String>) -> Self {
        Self { category_fields }
    }

    /// Build the document for one record with a unique identifier
    #[inline]
    pub fn build(&self, record: &Record) -> Result<Document> {
        let id = record.id();
        let [title, location, description] =
            REQUIRED_FIELDS.map(|field| required_text(record, &id, field));
        let (title, location, description) = (title?, location?, description?);

        if id.is_empty() {
            return Err(IndexerError::MissingField {
                record: format!("titled '{}'", title),
                field: super::ID_FIELD.to_string(),
            });
        }

        let category = self
            .category_fields
            .iter()
            .find_map(|field| optional_text(record, field))
            .unwrap_or_else(|| UNKNOWN.to_string());
        let date = optional_text(record, "date").unwrap_or_else(|| UNKNOWN.to_string());
        let organizer = optional_text(record, "organizer").unwrap_or_else(|| UNKNOWN.to_string());

        let text = format!(
            "Event: {title}\nType: {category}\nLocation: {location}\nDate: {date}\nOrganizer: {organizer}\nDescription: {description}"
        );

        Ok(Document {
            id,
            text,
            metadata: flatten_metadata(record.fields()),
        })
    }

    /// Build documents for every record, preserving order.
    ///
    /// With `skip_invalid` a record missing a required field is logged and
    /// reported in [`BuiltDocuments::skipped`]; otherwise the first such record
    /// fails the whole call.
    #[inline]
    pub fn build_all(&self, records: &[Record], skip_invalid: bool) -> Result<BuiltDocuments> {
        let mut built = BuiltDocuments {
            documents: Vec::with_capacity(records.len()),
            skipped: Vec::new(),
        };

        for record in records {
            match self.build(record) {
                Ok(document) => built.documents.push(document),
                Err(IndexerError::MissingField { record: id, field }) if skip_invalid => {
                    warn!("Skipping record {}: missing required field '{}'", id, field);
                    built.skipped.push(SkippedRecord {
                        id,
                        missing_field: field,
                    });
                }
                Err(e) => return Err(e),
            }
        }

        debug!(
            "Built {} documents, skipped {} records",
            built.documents.len(),
            built.skipped.len()
        );
        Ok(built)
    }
}

fn required_text(record: &Record, id: &str, field: &str) -> Result<String> {
    match record.get(field) {
        Some(value) if !value.is_null() => Ok(metadata_value(value).to_string()),
        _ => Err(IndexerError::MissingField {
            record: if id.is_empty() {
                "<unidentified>".to_string()
            } else {
                id.to_string()
            },
            field: field.to_string(),
        }),
    }
}

fn optional_text(record: &Record, field: &str) -> Option<String> {
    record
        .get(field)
        .filter(|value| !value.is_null())
        .map(|value| metadata_value(value).to_string())
        .filter(|text| !text.is_empty())
}

/// Flatten every field into a scalar: lists holding mappings become JSON text,
/// other lists are comma-joined, nested mappings become JSON text and null
/// becomes the empty string
#[inline]
pub fn flatten_metadata(fields: &Map<String, Value>) -> Metadata {
    fields
        .iter()
        .map(|(key, value)| (key.clone(), metadata_value(value)))
        .collect()
}

fn metadata_value(value: &Value) -> MetadataValue {
    match value {
        Value::Null => MetadataValue::Text(String::new()),
        Value::Bool(flag) => MetadataValue::Bool(*flag),
        Value::Number(number) => number.as_i64().map_or_else(
            || MetadataValue::Float(number.as_f64().unwrap_or_default()),
            MetadataValue::Integer,
        ),
        Value::String(text) => MetadataValue::Text(text.clone()),
        Value::Array(items) if items.iter().any(Value::is_object) => {
            MetadataValue::Text(value.to_string())
        }
        Value::Array(items) => MetadataValue::Text(items.iter().map(list_item_text).join(", ")),
        Value::Object(_) => MetadataValue::Text(value.to_string()),
    }
}

fn list_item_text(item: &Value) -> String {
    match item {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
