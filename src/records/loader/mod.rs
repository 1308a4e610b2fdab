
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

use super::Record;
use crate::{IndexerError, Result};

/// Read every record from a JSON file holding a top-level list of mappings
#[inline]
pub fn load_records(path: &Path) -> Result<Vec<Record>> {
    if !path.exists() {
        return Err(IndexerError::NotFound(path.display().to_string()));
    }

    let content = fs::read_to_string(path)?;
    let records = parse_records(&content)
        .map_err(|reason| IndexerError::Format(format!("{}: {}", path.display(), reason)))?;

    info!("Loaded {} records from {}", records.len(), path.display());
    Ok(records)
}

fn parse_records(content: &str) -> std::result::Result<Vec<Record>, String> {
    let value: Value =
        serde_json::from_str(content).map_err(|e| format!("invalid JSON: {}", e))?;

    let Value::Array(items) = value else {
        return Err(format!(
            "expected a list of records, found {}",
            kind_of(&value)
        ));
    };

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| match item {
            Value::Object(fields) => Ok(Record::new(fields)),
            other => Err(format!(
                "record {} is {}, expected a mapping",
                index,
                kind_of(&other)
            )),
        })
        .collect()
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a mapping",
    }
}

/// Records loaded from a source file, held as an immutable snapshot.
///
/// Readers take an `Arc` of the current snapshot; [`RecordStore::reload`] reads
/// the source completely before swapping, so a failed or in-progress reload never
/// exposes a partial list.
#[derive(Debug)]
pub struct RecordStore {
    source: PathBuf,
    snapshot: RwLock<Arc<[Record]>>,
}

impl RecordStore {
    #[inline]
    pub fn open<P: AsRef<Path>>(source: P) -> Result<Self> {
        let source = source.as_ref().to_path_buf();
        let records = load_records(&source)?;

        Ok(Self {
            source,
            snapshot: RwLock::new(records.into()),
        })
    }

    #[inline]
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Current snapshot; stays valid even if the store is reloaded afterwards
    #[inline]
    pub fn snapshot(&self) -> Arc<[Record]> {
        let guard = self.snapshot.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&*guard)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-read the source and swap in the new snapshot, returning its size.
    /// On error the previous snapshot is kept.
    #[inline]
    pub fn reload(&self) -> Result<usize> {
        let records: Arc<[Record]> = load_records(&self.source)?.into();
        let count = records.len();

        *self
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner) = records;

        debug!("Reloaded {} records from {}", count, self.source.display());
        Ok(count)
    }
}
