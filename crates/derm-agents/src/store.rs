//! Context store: durable key/record persistence for completed runs.
//!
//! Two record kinds live in the store:
//! - a [`DiagnosticBundle`] per run under [`bundle_key`], never overwritten;
//! - a single [`LatestContext`] under [`LATEST_KEY`], last-write-wins.
//!
//! Backends implement [`ContextStore`]. [`InMemoryContextStore`] is used in
//! tests and one-shot runs, [`FileContextStore`] keeps JSON files on disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::errors::StoreError;
use crate::types::{DiagnosticBundle, LatestContext};

/// Process-wide slot read by the follow-up path.
pub const LATEST_KEY: &str = "diagnoses/latest";

/// Key under which one run's bundle is stored.
pub fn bundle_key(patient_ref: &str, run_id: &Uuid) -> String {
    format!("patients/{patient_ref}/reports/{run_id}")
}

/// Check that `patient_ref` maps to exactly one key segment.
pub fn validate_patient_ref(patient_ref: &str) -> StoreResult<()> {
    if patient_ref.contains('/') {
        return Err(StoreError::InvalidKey(patient_ref.to_string()));
    }
    validate_key(&bundle_key(patient_ref, &Uuid::nil()))
}

/// A persisted record, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoredRecord {
    Bundle(DiagnosticBundle),
    LatestContext(LatestContext),
}

impl StoredRecord {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bundle(_) => "bundle",
            Self::LatestContext(_) => "latest_context",
        }
    }

    pub fn into_bundle(self, key: &str) -> Result<DiagnosticBundle, StoreError> {
        match self {
            Self::Bundle(b) => Ok(b),
            other => Err(StoreError::UnexpectedKind {
                key: key.to_string(),
                found: other.kind(),
            }),
        }
    }

    pub fn into_latest(self, key: &str) -> Result<LatestContext, StoreError> {
        match self {
            Self::LatestContext(c) => Ok(c),
            other => Err(StoreError::UnexpectedKind {
                key: key.to_string(),
                found: other.kind(),
            }),
        }
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Shared handle passed to every component that needs the store.
pub type SharedContextStore = Arc<dyn ContextStore>;

/// Key/record persistence.
///
/// Guarantees:
/// - `put(key, r)` followed by `get(key)` returns `Some(r)`.
/// - `get` on an absent key returns `Ok(None)`.
/// - No ordering or atomicity across keys.
#[async_trait]
pub trait ContextStore: Send + Sync {
    async fn put(&self, key: &str, record: &StoredRecord) -> StoreResult<()>;

    async fn get(&self, key: &str) -> StoreResult<Option<StoredRecord>>;
}

/// Read the latest-context slot, if any run has completed.
pub async fn load_latest(store: &dyn ContextStore) -> StoreResult<Option<LatestContext>> {
    match store.get(LATEST_KEY).await? {
        Some(record) => record.into_latest(LATEST_KEY).map(Some),
        None => Ok(None),
    }
}

/// Keys are `/`-separated relative paths of non-empty segments.
fn validate_key(key: &str) -> StoreResult<()> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key
            .split('/')
            .any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if bad {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

// ── In-memory ────────────────────────────────────────────────────────────────

/// In-memory store backed by a `HashMap<key, record>`.
#[derive(Debug, Default)]
pub struct InMemoryContextStore {
    records: RwLock<HashMap<String, StoredRecord>>,
    writes: AtomicUsize,
}

impl InMemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `put` calls so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// All keys currently held, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .records
            .read()
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ContextStore for InMemoryContextStore {
    async fn put(&self, key: &str, record: &StoredRecord) -> StoreResult<()> {
        validate_key(key)?;
        let mut records = self.records.write().map_err(|_| StoreError::LockPoisoned)?;
        records.insert(key.to_string(), record.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<StoredRecord>> {
        validate_key(key)?;
        let records = self.records.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(records.get(key).cloned())
    }
}

// ── File-backed ──────────────────────────────────────────────────────────────

/// One pretty-printed JSON file per key under a root directory.
///
/// Writes go to a temporary sibling first and are renamed into place, so a
/// reader never sees a half-written record.
#[derive(Debug, Clone)]
pub struct FileContextStore {
    root: PathBuf,
}

impl FileContextStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> StoreResult<PathBuf> {
        validate_key(key)?;
        let mut path = self.root.clone();
        let mut segments = key.split('/').peekable();
        while let Some(segment) = segments.next() {
            if segments.peek().is_some() {
                path.push(segment);
            } else {
                path.push(format!("{segment}.json"));
            }
        }
        Ok(path)
    }
}

#[async_trait]
impl ContextStore for FileContextStore {
    async fn put(&self, key: &str, record: &StoredRecord) -> StoreResult<()> {
        let path = self.path_for(key)?;
        let io_err = |source| StoreError::Io {
            key: key.to_string(),
            source,
        };

        let bytes = serde_json::to_vec_pretty(record).map_err(|source| StoreError::Serialization {
            key: key.to_string(),
            source,
        })?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let tmp = path.with_extension(format!("json.{}.tmp", Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &bytes).await.map_err(io_err)?;
        if let Err(source) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_err(source));
        }

        debug!(key, path = %path.display(), bytes = bytes.len(), "Stored record");
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<StoredRecord>> {
        let path = self.path_for(key)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    key: key.to_string(),
                    source,
                })
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Deserialization {
                key: key.to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use coordination::{arbitrate, ClassificationResult};

    use super::*;

    fn bundle() -> DiagnosticBundle {
        DiagnosticBundle {
            run_id: Uuid::new_v4(),
            patient_ref: "p-42".into(),
            image_ref: "https://img.example/x.png".into(),
            timestamp: Utc::now(),
            arbitration: arbitrate(
                ClassificationResult::new("Melanoma", 0.81),
                ClassificationResult::new("Benign keratosis", 0.64),
            ),
            verify_text: "v".into(),
            diagnosis_text: "d".into(),
            report_text: "r".into(),
            advisory_text: "a".into(),
        }
    }

    #[test]
    fn key_layout() {
        let id = Uuid::nil();
        assert_eq!(
            bundle_key("p-42", &id),
            "patients/p-42/reports/00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn rejects_traversal_and_absolute_keys() {
        for key in ["", "/etc/passwd", "a/../b", "a//b", "./a", "a\\b", "a/"] {
            assert!(validate_key(key).is_err(), "{key:?} should be rejected");
        }
        assert!(validate_key(LATEST_KEY).is_ok());
    }

    #[test]
    fn patient_ref_must_be_one_segment() {
        for patient_ref in ["", "a/b", "/p", "p/", ".", "..", "p\\1"] {
            assert!(
                validate_patient_ref(patient_ref).is_err(),
                "{patient_ref:?} should be rejected"
            );
        }
        for patient_ref in ["p-42", "patient.7", "A_1"] {
            assert!(validate_patient_ref(patient_ref).is_ok(), "{patient_ref:?}");
        }
    }

    #[test]
    fn records_are_tagged_by_kind() {
        let latest = StoredRecord::LatestContext(bundle().latest_context());
        let json = serde_json::to_value(&latest).unwrap();
        assert_eq!(json["kind"], "latest_context");
        assert_eq!(json["diagnosis_text"], "d");

        let json = serde_json::to_value(StoredRecord::Bundle(bundle())).unwrap();
        assert_eq!(json["kind"], "bundle");
    }

    #[tokio::test]
    async fn memory_store_put_get_and_count() {
        let store = InMemoryContextStore::new();
        assert!(store.get(LATEST_KEY).await.unwrap().is_none());

        let record = StoredRecord::Bundle(bundle());
        store.put("patients/p/reports/1", &record).await.unwrap();
        assert_eq!(store.get("patients/p/reports/1").await.unwrap(), Some(record));
        assert_eq!(store.write_count(), 1);
        assert_eq!(store.keys(), ["patients/p/reports/1"]);
    }

    #[tokio::test]
    async fn load_latest_rejects_wrong_kind() {
        let store = InMemoryContextStore::new();
        store
            .put(LATEST_KEY, &StoredRecord::Bundle(bundle()))
            .await
            .unwrap();
        let err = load_latest(&store).await.unwrap_err();
        assert!(matches!(err, StoreError::UnexpectedKind { found: "bundle", .. }));
    }

    #[tokio::test]
    async fn file_store_roundtrip_and_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileContextStore::new(dir.path());

        let b = bundle();
        let key = bundle_key(&b.patient_ref, &b.run_id);
        store.put(&key, &StoredRecord::Bundle(b.clone())).await.unwrap();
        let loaded = store.get(&key).await.unwrap().unwrap().into_bundle(&key).unwrap();
        assert_eq!(loaded, b);

        let first = LatestContext {
            diagnosis_text: "first".into(),
            report_text: String::new(),
            advisory_text: String::new(),
        };
        let second = b.latest_context();
        store.put(LATEST_KEY, &StoredRecord::LatestContext(first)).await.unwrap();
        store.put(LATEST_KEY, &StoredRecord::LatestContext(second.clone())).await.unwrap();
        assert_eq!(load_latest(&store).await.unwrap(), Some(second));

        assert!(dir.path().join("diagnoses").join("latest.json").exists());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("diagnoses"))
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn file_store_missing_key_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileContextStore::new(dir.path());
        assert!(store.get("patients/nobody/reports/x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_store_reports_corrupt_records() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("diagnoses")).unwrap();
        std::fs::write(dir.path().join("diagnoses/latest.json"), b"{not json").unwrap();
        let store = FileContextStore::new(dir.path());
        let err = store.get(LATEST_KEY).await.unwrap_err();
        assert!(matches!(err, StoreError::Deserialization { .. }));
    }
}
