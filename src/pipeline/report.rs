use crate::constants::ID_FIELD;
use crate::domain::Document;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use uuid::Uuid;

/// Outcome of one stage within a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub number: u8,
    pub name: String,
    pub processed_count: usize,
    pub written_count: usize,
    pub duration_ms: u64,
    pub message: String,
}

/// Content hash of a derived collection, ignoring document identifiers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionFingerprint {
    pub documents: u64,
    pub sha256: String,
}

/// Summary of a complete run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub engine: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub reset_documents: u64,
    pub stages: Vec<StageRecord>,
    pub fingerprints: BTreeMap<String, CollectionFingerprint>,
}

impl RunReport {
    pub fn new(engine: &str) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            engine: engine.to_string(),
            started_at: Utc::now(),
            completed_at: None,
            reset_documents: 0,
            stages: Vec::new(),
            fingerprints: BTreeMap::new(),
        }
    }

    pub fn complete(&mut self) {
        self.completed_at = Some(Utc::now());
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.completed_at.map(|end| end - self.started_at)
    }

    /// Write the report as pretty JSON, creating parent directories
    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// SHA-256 over the documents in scan order, each serialized without `_id`.
///
/// Partition buckets get fresh identifiers every run, so identifiers are left
/// out to make two rebuilds from the same source comparable.
pub fn fingerprint(docs: &[Document]) -> Result<CollectionFingerprint> {
    let mut hasher = Sha256::new();
    for doc in docs {
        let mut doc = doc.clone();
        doc.remove(ID_FIELD);
        hasher.update(serde_json::to_vec(&doc)?);
        hasher.update(b"\n");
    }
    Ok(CollectionFingerprint {
        documents: docs.len() as u64,
        sha256: hex::encode(hasher.finalize()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_fingerprint_ignores_ids_but_not_content() {
        let a = vec![doc(json!({"_id": "1", "variable": "age", "count": 2}))];
        let b = vec![doc(json!({"_id": "2", "variable": "age", "count": 2}))];
        let c = vec![doc(json!({"_id": "1", "variable": "age", "count": 3}))];

        assert_eq!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
        assert_ne!(fingerprint(&a).unwrap(), fingerprint(&c).unwrap());
        assert_eq!(fingerprint(&a).unwrap().sha256.len(), 64);
    }

    #[test]
    fn test_fingerprint_depends_on_order() {
        let first = doc(json!({"v": 1}));
        let second = doc(json!({"v": 2}));
        let forward = fingerprint(&[first.clone(), second.clone()]).unwrap();
        let backward = fingerprint(&[second, first]).unwrap();
        assert_ne!(forward, backward);
    }

    #[test]
    fn test_report_written_as_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reports").join("run.json");
        let mut report = RunReport::new("memory");
        report.complete();
        report.write_json(&path).unwrap();

        let loaded: RunReport =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.run_id, report.run_id);
        assert!(loaded.completed_at.is_some());
        assert!(report.duration().is_some());
    }
}
