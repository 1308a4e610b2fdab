// Records module
// Raw JSON records and their projection into embedding-ready documents


pub mod dedup;
pub mod document;
pub mod loader;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use dedup::{DedupReport, deduplicate, deduplicate_with};
pub use document::{
    BuiltDocuments, Document, DocumentBuilder, Metadata, MetadataValue, SkippedRecord,
};
pub use loader::{RecordStore, load_records};

/// Field holding a record's identifier
pub const ID_FIELD: &str = "id";

/// One externally supplied entity, kept as the raw JSON mapping it was read from
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    #[inline]
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Declared identifier; numbers are rendered as text, anything else counts as missing
    #[inline]
    pub fn id(&self) -> String {
        match self.0.get(ID_FIELD) {
            Some(Value::String(id)) => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => String::new(),
        }
    }

    #[inline]
    pub fn set_id(&mut self, id: String) {
        self.0.insert(ID_FIELD.to_string(), Value::String(id));
    }

    #[inline]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    #[inline]
    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    #[inline]
    pub fn into_fields(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for Record {
    #[inline]
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}
