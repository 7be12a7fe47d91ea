//! Full index reconstruction from the embedding store.
//!
//! The builder is the only code path that mutates a `VectorIndex`. It scans
//! the store in batches, appends vectors and identifiers in lock-step so the
//! positional alignment holds by construction, and hands back a fresh pair
//! for the cache to adopt. A failed rebuild never touches live state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::index::VectorIndex;
use crate::store::{EmbeddingStore, StoreError};

/// Default number of rows read from the store per batch.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Errors that abort a rebuild.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Store error during rebuild: {0}")]
    Store(#[from] StoreError),

    #[error("Rebuild cancelled")]
    Cancelled,
}

/// Summary of one rebuild run.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    /// Total rows read from the store.
    pub rows_scanned: usize,
    /// Rows whose vectors made it into the index.
    pub rows_indexed: usize,
    /// Rows skipped because the stored embedding was missing or undecodable.
    pub skipped_missing: usize,
    /// Rows skipped because the embedding had the wrong dimension.
    pub skipped_dimension: usize,
    /// Final vector count of the freshly built index.
    pub vector_count: usize,
}

/// A freshly built, aligned index/identifier pair plus its report.
///
/// `labels[i]` belongs to `identifiers[i]`; both are appended together with
/// the vector so queries can resolve them by position alone.
pub struct RebuildOutput {
    pub index: VectorIndex,
    pub identifiers: Vec<String>,
    pub labels: Vec<Option<String>>,
    pub report: BuildReport,
}

/// Rebuilds the similarity index from the authoritative store.
pub struct IndexBuilder {
    store: Arc<dyn EmbeddingStore>,
    dimensions: usize,
    batch_size: usize,
}

impl IndexBuilder {
    pub fn new(store: Arc<dyn EmbeddingStore>, dimensions: usize, batch_size: usize) -> Self {
        Self {
            store,
            dimensions,
            batch_size: batch_size.max(1),
        }
    }

    /// Progress callback variant of `rebuild` used by the CLI; `on_batch`
    /// receives the running scanned-row count after each batch.
    pub fn rebuild_with_progress(
        &self,
        cancel: Option<&AtomicBool>,
        mut on_batch: impl FnMut(usize),
    ) -> Result<RebuildOutput, BuildError> {
        let mut index = VectorIndex::new(self.dimensions);
        let mut identifiers = Vec::new();
        let mut labels = Vec::new();
        let mut report = BuildReport {
            rows_scanned: 0,
            rows_indexed: 0,
            skipped_missing: 0,
            skipped_dimension: 0,
            vector_count: 0,
        };

        for batch in self.store.scan(self.batch_size)? {
            if let Some(flag) = cancel {
                if flag.load(Ordering::Relaxed) {
                    log::warn!(
                        "rebuild cancelled after {} rows scanned",
                        report.rows_scanned
                    );
                    return Err(BuildError::Cancelled);
                }
            }

            let batch = batch?;
            for face in batch {
                report.rows_scanned += 1;

                let embedding = match face.embedding {
                    Some(e) => e,
                    None => {
                        log::debug!("skipping '{}': no embedding stored", face.identifier);
                        report.skipped_missing += 1;
                        continue;
                    }
                };

                if embedding.len() != self.dimensions {
                    log::warn!(
                        "skipping '{}': embedding has {} dimensions, index expects {}",
                        face.identifier,
                        embedding.len(),
                        self.dimensions
                    );
                    report.skipped_dimension += 1;
                    continue;
                }

                // Vector, identifier, and label are appended together so
                // position alignment holds by construction.
                index
                    .push(&embedding)
                    .expect("dimension validated above");
                identifiers.push(face.identifier);
                labels.push(face.label);
                report.rows_indexed += 1;
            }

            on_batch(report.rows_scanned);
        }

        report.vector_count = index.vector_count();
        debug_assert_eq!(report.vector_count, identifiers.len());
        debug_assert_eq!(identifiers.len(), labels.len());

        log::info!(
            "rebuild complete: {} scanned, {} indexed, {} missing, {} wrong-dimension",
            report.rows_scanned,
            report.rows_indexed,
            report.skipped_missing,
            report.skipped_dimension
        );

        Ok(RebuildOutput {
            index,
            identifiers,
            labels,
            report,
        })
    }

    /// Read every row from the store and build a fresh index/identifier
    /// pair. Invalid rows are skipped and counted; store read failures abort
    /// the whole rebuild.
    pub fn rebuild(&self, cancel: Option<&AtomicBool>) -> Result<RebuildOutput, BuildError> {
        self.rebuild_with_progress(cancel, |_| {})
    }
}
