//! Document store abstraction used by every pipeline stage.
//!
//! The pipeline relies on a small set of collection primitives: bulk
//! set-if-absent, ordered full scan, upsert with nested increment, field
//! overwrite by identifier, grouped aggregation over one scalar field and
//! compound index creation. Everything else here is housekeeping.

pub mod in_memory;
pub mod sqlite;

pub use in_memory::InMemoryStore;
pub use sqlite::SqliteStore;

use crate::constants::ID_FIELD;
use crate::domain::{Document, FieldAggregate, IndexSpec};
use crate::error::{EtlError, Result};
use async_trait::async_trait;
use serde_json::{Number, Value};
use uuid::Uuid;

/// Storage trait for the collections read and written by the batch job
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Short engine name for logs
    fn engine(&self) -> &'static str;

    /// Delete every document in `collection`, returning how many were removed
    async fn clear(&self, collection: &str) -> Result<u64>;

    /// Append documents in order. Documents without `_id` get a fresh UUID.
    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> Result<usize>;

    /// Full scan in insertion order
    async fn find_all(&self, collection: &str) -> Result<Vec<Document>>;

    async fn find_by_id(&self, collection: &str, id: &str) -> Result<Option<Document>>;

    async fn count(&self, collection: &str) -> Result<u64>;

    /// Bulk conditional update: for every document, set each `(field, default)`
    /// where the field is absent or null. Returns the number of fields written.
    async fn set_if_absent(&self, collection: &str, defaults: &[(String, Value)]) -> Result<u64>;

    /// Upsert the document keyed by `id` and add `by` to the nested numeric
    /// field at `path`, creating the document, parents and counter as needed.
    async fn increment(&self, collection: &str, id: &str, path: &[&str], by: i64) -> Result<()>;

    /// Overwrite one top-level field. Returns false when no document matched.
    async fn set_field(&self, collection: &str, id: &str, field: &str, value: Value) -> Result<bool>;

    /// Overwrite `field` on every `(id, value)` pair in one call.
    /// Returns how many of the ids matched a document.
    async fn set_field_many(
        &self,
        collection: &str,
        field: &str,
        updates: Vec<(String, Value)>,
    ) -> Result<u64>;

    /// Average, sample standard deviation and document count for one field
    async fn aggregate_field(&self, collection: &str, field: &str) -> Result<FieldAggregate>;

    /// Create a compound index; creating an identical index again is a no-op
    async fn create_index(&self, collection: &str, spec: &IndexSpec) -> Result<()>;

    async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexSpec>>;

    /// Release the underlying connection. Later calls fail with `ConnectionClosed`.
    async fn close(&self) -> Result<()>;
}

/// Collection names end up in SQL identifiers: a letter followed by `[A-Za-z0-9_]`
pub fn validate_collection_name(name: &str) -> Result<()> {
    let valid = name.starts_with(|c: char| c.is_ascii_alphabetic())
        && !name.starts_with("sqlite_")
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(EtlError::InvalidCollection(name.to_string()))
    }
}

/// Field names end up inside quoted JSON path labels
pub fn validate_field_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('"') || name.contains('\'') {
        return Err(EtlError::InvalidUpdate(format!(
            "unsupported field name {name:?}"
        )));
    }
    Ok(())
}

/// String form of a document's `_id`
pub fn document_id(doc: &Document) -> Option<String> {
    match doc.get(ID_FIELD)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Returns the document's id, assigning a UUID v4 when it has none
pub fn ensure_id(doc: &mut Document) -> String {
    if let Some(id) = document_id(doc) {
        return id;
    }
    let id = Uuid::new_v4().to_string();
    doc.insert(ID_FIELD.to_string(), Value::String(id.clone()));
    id
}

pub fn is_absent(doc: &Document, field: &str) -> bool {
    matches!(doc.get(field), None | Some(Value::Null))
}

/// Add `by` to the numeric field at `path`, creating intermediate objects
/// and starting absent counters at zero.
pub fn increment_path(doc: &mut Document, path: &[&str], by: i64) -> Result<()> {
    let (last, parents) = path
        .split_last()
        .ok_or_else(|| EtlError::InvalidUpdate("empty increment path".to_string()))?;

    let mut current = doc;
    for segment in parents {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Document::new()));
        if entry.is_null() {
            *entry = Value::Object(Document::new());
        }
        current = entry.as_object_mut().ok_or_else(|| {
            EtlError::InvalidUpdate(format!("cannot create field inside non-object '{segment}'"))
        })?;
    }

    let slot = current.entry(last.to_string()).or_insert(Value::from(0));
    let next = match slot {
        Value::Null => Value::from(by),
        Value::Number(n) => add_number(n, by)?,
        other => {
            return Err(EtlError::InvalidUpdate(format!(
                "cannot increment non-numeric field '{last}' ({other})"
            )))
        }
    };
    *slot = next;
    Ok(())
}

fn add_number(n: &Number, by: i64) -> Result<Value> {
    if let Some(i) = n.as_i64() {
        if let Some(sum) = i.checked_add(by) {
            return Ok(Value::from(sum));
        }
    }
    let f = n.as_f64().unwrap_or_default() + by as f64;
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| EtlError::InvalidUpdate("increment produced a non-finite number".to_string()))
}

/// Two-pass mean and Bessel-corrected standard deviation over numeric values
pub fn summarize(values: &[f64], document_count: u64) -> FieldAggregate {
    let n = values.len();
    if n == 0 {
        return FieldAggregate {
            mean: None,
            stddev: None,
            count: document_count,
        };
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    let stddev = if n > 1 {
        let sum_sq: f64 = values.iter().map(|v| (v - mean) * (v - mean)).sum();
        Some((sum_sq / (n - 1) as f64).sqrt())
    } else {
        None
    };
    FieldAggregate {
        mean: Some(mean),
        stddev,
        count: document_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_increment_path_creates_parents_and_counter() {
        let mut d = doc(json!({"_id": "sex"}));
        increment_path(&mut d, &["sex", "0"], 1).unwrap();
        increment_path(&mut d, &["sex", "0"], 1).unwrap();
        increment_path(&mut d, &["sex", "1"], 3).unwrap();
        assert_eq!(Value::Object(d), json!({"_id": "sex", "sex": {"0": 2, "1": 3}}));
    }

    #[test]
    fn test_increment_path_rejects_non_numeric_target() {
        let mut d = doc(json!({"sex": {"0": "x"}}));
        let err = increment_path(&mut d, &["sex", "0"], 1).unwrap_err();
        assert!(matches!(err, EtlError::InvalidUpdate(_)));
    }

    #[test]
    fn test_ensure_id_keeps_existing_identifier() {
        let mut d = doc(json!({"_id": "abc"}));
        assert_eq!(ensure_id(&mut d), "abc");

        let mut fresh = Document::new();
        let id = ensure_id(&mut fresh);
        assert_eq!(document_id(&fresh), Some(id));
    }

    #[test]
    fn test_summarize_sample_stddev() {
        let agg = summarize(&[10.0, 20.0, 30.0], 3);
        assert_eq!(agg.mean, Some(20.0));
        assert!((agg.stddev.unwrap() - 10.0).abs() < 1e-12);
        assert_eq!(agg.count, 3);
    }

    #[test]
    fn test_summarize_single_value_has_no_stddev() {
        let agg = summarize(&[5.0], 4);
        assert_eq!(agg.mean, Some(5.0));
        assert_eq!(agg.stddev, None);
        assert_eq!(agg.count, 4);
    }

    #[test]
    fn test_collection_name_validation() {
        assert!(validate_collection_name("emb2_ParkinsonsDataset").is_ok());
        assert!(validate_collection_name("").is_err());
        assert!(validate_collection_name("drop table;").is_err());
        assert!(validate_collection_name("sqlite_master").is_err());
        assert!(validate_collection_name("_etl_indexes").is_err());
    }

    #[test]
    fn test_field_name_validation() {
        assert!(validate_field_name("Jitter(%)").is_ok());
        assert!(validate_field_name("subject#").is_ok());
        assert!(validate_field_name("bad\"name").is_err());
    }
}
