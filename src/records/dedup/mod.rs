#[cfg(test)]
mod tests;

use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, info};
use uuid::Uuid;

use super::{ID_FIELD, Record};

/// What the deduplicator changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupReport {
    /// Records whose declared identifier repeated an earlier one
    pub replaced_duplicates: usize,
    /// Records that had no usable identifier
    pub assigned_missing: usize,
}

impl DedupReport {
    #[inline]
    pub fn changed(&self) -> usize {
        self.replaced_duplicates + self.assigned_missing
    }
}

/// Give every record a unique, non-empty identifier using random UUIDs
#[inline]
pub fn deduplicate(records: &mut [Record]) -> DedupReport {
    deduplicate_with(records, || Uuid::new_v4().to_string())
}

/// Give every record a unique, non-empty identifier.
///
/// Records are visited in order and the first occurrence of an identifier keeps
/// it. Later duplicates and records without an identifier get a fresh one from
/// `generate`, redrawn until it is non-empty and unseen.
#[inline]
pub fn deduplicate_with<F>(records: &mut [Record], mut generate: F) -> DedupReport
where
    F: FnMut() -> String,
{
    let mut seen: HashSet<String> = HashSet::with_capacity(records.len());
    let mut report = DedupReport::default();

    for record in records.iter_mut() {
        let declared = record.id();

        if !declared.is_empty() && seen.insert(declared.clone()) {
            // Numeric identifiers are normalised to their text form
            if !matches!(record.get(ID_FIELD), Some(Value::String(_))) {
                record.set_id(declared);
            }
            continue;
        }

        let mut fresh = generate();
        while fresh.is_empty() || seen.contains(&fresh) {
            fresh = generate();
        }

        if declared.is_empty() {
            debug!("Assigned missing ID: {}", fresh);
            report.assigned_missing += 1;
        } else {
            debug!("Replacing duplicate ID: {} -> {}", declared, fresh);
            report.replaced_duplicates += 1;
        }

        record.set_id(fresh.clone());
        seen.insert(fresh);
    }

    if report.replaced_duplicates > 0 {
        info!("Fixed {} duplicate IDs", report.replaced_duplicates);
    }
    if report.assigned_missing > 0 {
        info!("Assigned {} missing IDs", report.assigned_missing);
    }

    report
}
