//! Authoritative embedding store.
//!
//! The store is the system-of-record mapping identifier -> embedding plus
//! minimal metadata. The engine reads it wholesale during rebuilds and writes
//! single rows during enrollment; it never serves queries directly.
//!
//! `CsvStore` keeps one CSV file with the embedding base64-encoded as
//! little-endian f32 bytes. Rows whose embedding cannot be decoded are
//! surfaced with `embedding: None` so the builder can skip and count them
//! instead of aborting the rebuild.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One enrolled face row.
#[derive(Debug, Clone)]
pub struct StoredFace {
    /// Unique record identifier (a filename in practice).
    pub identifier: String,
    /// Decoded embedding, or `None` when the stored blob is missing or
    /// undecodable.
    pub embedding: Option<Vec<f32>>,
    /// Free-form label shown alongside match results.
    pub label: Option<String>,
    pub enrolled_at: DateTime<Utc>,
}

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Record not found: {0}")]
    NotFound(String),
}

/// Read/write interface to the embedding store.
///
/// A trait boundary so the builder and matcher can be exercised against an
/// in-memory double in tests.
pub trait EmbeddingStore: Send + Sync {
    /// Scan every row in batches of at most `batch_size`.
    fn scan(&self, batch_size: usize) -> Result<Box<dyn Iterator<Item = Result<Vec<StoredFace>, StoreError>> + '_>, StoreError>;

    /// Insert or overwrite a row. Duplicate identifiers overwrite.
    fn put(&self, face: StoredFace) -> Result<(), StoreError>;

    /// Fetch one row by identifier.
    fn get(&self, identifier: &str) -> Result<StoredFace, StoreError>;

    /// Number of rows currently stored.
    fn len(&self) -> Result<usize, StoreError>;
}

/// On-disk CSV row shape.
#[derive(Debug, Serialize, Deserialize)]
struct CsvRow {
    identifier: String,
    enrolled_at: DateTime<Utc>,
    label: Option<String>,
    embedding: String,
}

impl CsvRow {
    fn from_face(face: &StoredFace) -> Self {
        Self {
            identifier: face.identifier.clone(),
            enrolled_at: face.enrolled_at,
            label: face.label.clone(),
            embedding: face
                .embedding
                .as_ref()
                .map(|e| encode_embedding(e))
                .unwrap_or_default(),
        }
    }

    fn into_face(self) -> StoredFace {
        StoredFace {
            embedding: decode_embedding(&self.embedding),
            identifier: self.identifier,
            label: self.label,
            enrolled_at: self.enrolled_at,
        }
    }
}

fn encode_embedding(embedding: &[f32]) -> String {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for &value in embedding {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    STANDARD.encode(bytes)
}

fn decode_embedding(encoded: &str) -> Option<Vec<f32>> {
    if encoded.is_empty() {
        return None;
    }
    let bytes = STANDARD.decode(encoded).ok()?;
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes(c.try_into().expect("4-byte chunk")))
            .collect(),
    )
}

/// CSV-file-backed store.
pub struct CsvStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles in `put`.
    write_lock: Mutex<()>,
}

impl CsvStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    fn read_all(&self) -> Result<Vec<StoredFace>, StoreError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let mut reader = csv::Reader::from_path(&self.path)?;
        let mut rows = Vec::new();
        for record in reader.deserialize::<CsvRow>() {
            rows.push(record?.into_face());
        }
        Ok(rows)
    }

    fn write_all(&self, rows: &[StoredFace]) -> Result<(), StoreError> {
        let temp_path = self.path.with_extension("csv.tmp");

        {
            let mut writer = csv::Writer::from_path(&temp_path)?;
            for face in rows {
                writer.serialize(CsvRow::from_face(face))?;
            }
            writer.flush()?;
        }

        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

impl EmbeddingStore for CsvStore {
    fn scan(
        &self,
        batch_size: usize,
    ) -> Result<Box<dyn Iterator<Item = Result<Vec<StoredFace>, StoreError>> + '_>, StoreError>
    {
        if !self.path.exists() {
            return Ok(Box::new(std::iter::empty()));
        }

        let reader = csv::Reader::from_path(&self.path)?;
        Ok(Box::new(BatchIter {
            records: reader.into_deserialize(),
            batch_size: batch_size.max(1),
        }))
    }

    fn put(&self, face: StoredFace) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().expect("store write lock");

        let mut rows = self.read_all()?;
        match rows.iter_mut().find(|r| r.identifier == face.identifier) {
            Some(existing) => *existing = face,
            None => rows.push(face),
        }
        self.write_all(&rows)
    }

    fn get(&self, identifier: &str) -> Result<StoredFace, StoreError> {
        self.read_all()?
            .into_iter()
            .find(|r| r.identifier == identifier)
            .ok_or_else(|| StoreError::NotFound(identifier.to_string()))
    }

    fn len(&self) -> Result<usize, StoreError> {
        Ok(self.read_all()?.len())
    }
}

/// Batched row iterator over a CSV deserialize stream.
struct BatchIter {
    records: csv::DeserializeRecordsIntoIter<std::fs::File, CsvRow>,
    batch_size: usize,
}

impl Iterator for BatchIter {
    type Item = Result<Vec<StoredFace>, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut batch = Vec::with_capacity(self.batch_size);
        for record in self.records.by_ref() {
            match record {
                Ok(row) => batch.push(row.into_face()),
                Err(e) => return Some(Err(e.into())),
            }
            if batch.len() >= self.batch_size {
                return Some(Ok(batch));
            }
        }

        if batch.is_empty() {
            None
        } else {
            Some(Ok(batch))
        }
    }
}

/// In-memory store used by tests and as a scan fixture.
#[derive(Default)]
pub struct MemStore {
    rows: Mutex<Vec<StoredFace>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: Vec<StoredFace>) -> Self {
        Self {
            rows: Mutex::new(rows),
        }
    }
}

impl EmbeddingStore for MemStore {
    fn scan(
        &self,
        batch_size: usize,
    ) -> Result<Box<dyn Iterator<Item = Result<Vec<StoredFace>, StoreError>> + '_>, StoreError>
    {
        let rows = self.rows.lock().expect("mem store lock").clone();
        let batch_size = batch_size.max(1);
        let mut batches: VecDeque<Vec<StoredFace>> = VecDeque::new();
        for chunk in rows.chunks(batch_size) {
            batches.push_back(chunk.to_vec());
        }
        Ok(Box::new(batches.into_iter().map(Ok)))
    }

    fn put(&self, face: StoredFace) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().expect("mem store lock");
        match rows.iter_mut().find(|r| r.identifier == face.identifier) {
            Some(existing) => *existing = face,
            None => rows.push(face),
        }
        Ok(())
    }

    fn get(&self, identifier: &str) -> Result<StoredFace, StoreError> {
        self.rows
            .lock()
            .expect("mem store lock")
            .iter()
            .find(|r| r.identifier == identifier)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(identifier.to_string()))
    }

    fn len(&self) -> Result<usize, StoreError> {
        Ok(self.rows.lock().expect("mem store lock").len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(identifier: &str, embedding: Option<Vec<f32>>) -> StoredFace {
        StoredFace {
            identifier: identifier.to_string(),
            embedding,
            label: Some(format!("label-{identifier}")),
            enrolled_at: Utc::now(),
        }
    }

    #[test]
    fn test_embedding_codec_round_trip() {
        let embedding = vec![0.0f32, -1.5, 3.25, f32::MIN_POSITIVE];
        let encoded = encode_embedding(&embedding);
        assert_eq!(decode_embedding(&encoded).unwrap(), embedding);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_embedding("").is_none());
        assert!(decode_embedding("not base64!!!").is_none());
        // Valid base64 but not a multiple of 4 bytes.
        assert!(decode_embedding(&STANDARD.encode([1u8, 2, 3])).is_none());
    }

    #[test]
    fn test_csv_put_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path().join("faces.csv"));

        store.put(face("alice.jpg", Some(vec![1.0, 2.0, 3.0]))).unwrap();
        store.put(face("bob.jpg", Some(vec![4.0, 5.0, 6.0]))).unwrap();

        assert_eq!(store.len().unwrap(), 2);

        let row = store.get("alice.jpg").unwrap();
        assert_eq!(row.embedding.unwrap(), vec![1.0, 2.0, 3.0]);
        assert_eq!(row.label.as_deref(), Some("label-alice.jpg"));
    }

    #[test]
    fn test_csv_duplicate_identifier_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path().join("faces.csv"));

        store.put(face("alice.jpg", Some(vec![1.0]))).unwrap();
        store.put(face("alice.jpg", Some(vec![9.0]))).unwrap();

        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(store.get("alice.jpg").unwrap().embedding.unwrap(), vec![9.0]);
    }

    #[test]
    fn test_csv_get_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path().join("faces.csv"));

        let result = store.get("nobody.jpg");
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_csv_scan_batches() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path().join("faces.csv"));

        for i in 0..7 {
            store.put(face(&format!("face-{i}.jpg"), Some(vec![i as f32]))).unwrap();
        }

        let batches: Vec<_> = store
            .scan(3)
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 3);
        assert_eq!(batches[1].len(), 3);
        assert_eq!(batches[2].len(), 1);

        // Scan order matches insertion order.
        assert_eq!(batches[0][0].identifier, "face-0.jpg");
        assert_eq!(batches[2][0].identifier, "face-6.jpg");
    }

    #[test]
    fn test_csv_scan_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path().join("faces.csv"));

        let batches: Vec<_> = store.scan(10).unwrap().collect();
        assert!(batches.is_empty());
    }

    #[test]
    fn test_missing_embedding_survives_round_trip_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path().join("faces.csv"));

        store.put(face("broken.jpg", None)).unwrap();
        let row = store.get("broken.jpg").unwrap();
        assert!(row.embedding.is_none());
    }

    #[test]
    fn test_mem_store_behaves_like_csv_store() {
        let store = MemStore::new();
        store.put(face("a", Some(vec![1.0]))).unwrap();
        store.put(face("a", Some(vec![2.0]))).unwrap();
        store.put(face("b", None)).unwrap();

        assert_eq!(store.len().unwrap(), 2);
        assert_eq!(store.get("a").unwrap().embedding.unwrap(), vec![2.0]);

        let batches: Vec<_> = store
            .scan(1)
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(batches.len(), 2);
    }
}
