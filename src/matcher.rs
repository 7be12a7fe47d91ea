//! High-level matching service: extract -> search -> score -> enrich.
//!
//! Read paths never mutate the store or the index. The rebuild path builds a
//! fresh pair, persists it, then hands it to the cache for atomic adoption.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use image::DynamicImage;
use serde::Serialize;

use crate::builder::{BuildError, BuildReport, IndexBuilder};
use crate::cache::{CacheError, IndexCache, IndexSource, IndexedSet};
use crate::face::{ExtractError, FaceEncoder};
use crate::index::IndexError;
use crate::persist::{encoder_id_hash, IndexFiles, PersistError};
use crate::store::{EmbeddingStore, StoreError, StoredFace};

/// Default calibration threshold `T` for similarity scoring.
pub const DEFAULT_THRESHOLD: f32 = 0.6;

/// Default number of results returned by a search.
pub const DEFAULT_TOP_K: usize = 50;

/// One ranked match, as exposed to the presentation layer.
#[derive(Debug, Clone, Serialize)]
pub struct MatchResult {
    pub identifier: String,
    /// Raw squared L2 distance.
    pub distance: f32,
    /// 0-100, one decimal of precision.
    pub similarity_percent: f32,
    /// 1-based rank within this result set.
    pub rank: usize,
    /// Label captured into the index at the last rebuild, when the record
    /// was enrolled with one.
    pub label: Option<String>,
}

/// Errors surfaced by the matching service.
///
/// "No face detected", "no similar faces" (an empty Ok result), and "search
/// unavailable" are three distinct outcomes for the caller to render.
#[derive(Debug, thiserror::Error)]
pub enum MatchError {
    #[error(transparent)]
    NoFace(#[from] ExtractError),

    #[error("Search unavailable: {0}")]
    Unavailable(#[from] CacheError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Rebuild failed: {0}")]
    Build(#[from] BuildError),

    #[error("Index persistence failed: {0}")]
    Persist(#[from] PersistError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Convert a squared L2 distance into a user-facing similarity percentage.
///
/// Linear, clamped mapping: distance 0 maps to 100%, distance >= `threshold`
/// maps to 0%. The formula is a product-visible contract; the percentages it
/// produces are shown to end users and must not drift.
pub fn similarity_percent(distance: f32, threshold: f32) -> f32 {
    let percent = (100.0 * (1.0 - distance / threshold)).max(0.0);
    round1(percent)
}

/// Round to one decimal of precision, the precision the API promises.
fn round1(value: f32) -> f32 {
    (value * 10.0).round() / 10.0
}

/// Matching engine facade over extractor, cache, builder, and store.
pub struct Matcher {
    encoder: FaceEncoder,
    cache: Arc<IndexCache>,
    builder: IndexBuilder,
    files: IndexFiles,
    store: Arc<dyn EmbeddingStore>,
    threshold: f32,
    encoder_hash: [u8; 32],
}

impl Matcher {
    pub fn new(
        encoder: FaceEncoder,
        cache: Arc<IndexCache>,
        builder: IndexBuilder,
        files: IndexFiles,
        store: Arc<dyn EmbeddingStore>,
        threshold: f32,
        encoder_id: &str,
    ) -> Self {
        Self {
            encoder,
            cache,
            builder,
            files,
            store,
            threshold,
            encoder_hash: encoder_id_hash(encoder_id),
        }
    }

    /// Find the `top_k` most similar enrolled faces for an embedding.
    ///
    /// Triggers the lazy index build on cold start. Results are ordered by
    /// descending similarity (ascending distance), ranked from 1. Identifier
    /// and label both resolve from the in-memory pair; a warm query performs
    /// no store reads.
    pub fn find_similar(
        &self,
        embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<MatchResult>, MatchError> {
        let set = self.cache.get()?;
        let neighbors = set.index.search(embedding, top_k)?;

        let mut results = Vec::with_capacity(neighbors.len());
        for neighbor in neighbors {
            // Out-of-range positions can only happen under a consistency
            // violation; drop the result and keep the query alive.
            let identifier = match set.identifiers.get(neighbor.position) {
                Some(id) => id.clone(),
                None => {
                    log::error!(
                        "search hit position {} outside identifier list (len {}); dropping result",
                        neighbor.position,
                        set.identifiers.len()
                    );
                    continue;
                }
            };

            let label = set.labels.get(neighbor.position).cloned().flatten();

            results.push(MatchResult {
                identifier,
                distance: neighbor.distance,
                similarity_percent: similarity_percent(neighbor.distance, self.threshold),
                rank: results.len() + 1,
                label,
            });
        }

        Ok(results)
    }

    /// Extract a face from the image and search for it.
    ///
    /// `MatchError::NoFace` is distinct from an empty result list so the
    /// caller can render "no face detected" rather than "no matches".
    pub fn extract_and_find_similar(
        &self,
        image: &DynamicImage,
        top_k: usize,
    ) -> Result<Vec<MatchResult>, MatchError> {
        let embedding = self.encoder.extract(image)?;
        self.find_similar(&embedding, top_k)
    }

    /// Extract a face and enroll it in the store under `identifier`.
    ///
    /// The index does not change until the next rebuild; callers that need
    /// the new face searchable immediately follow up with `rebuild_index`.
    pub fn enroll(
        &self,
        image: &DynamicImage,
        identifier: &str,
        label: Option<String>,
    ) -> Result<Vec<f32>, MatchError> {
        let embedding = self.encoder.extract(image)?;
        self.store.put(StoredFace {
            identifier: identifier.to_string(),
            embedding: Some(embedding.clone()),
            label,
            enrolled_at: chrono::Utc::now(),
        })?;
        log::info!("enrolled '{identifier}'");
        Ok(embedding)
    }

    /// Rebuild the index from the store, persist the new pair, and adopt it.
    ///
    /// A failed rebuild leaves both the on-disk pair and the live cache
    /// untouched.
    pub fn rebuild_index(
        &self,
        cancel: Option<&AtomicBool>,
    ) -> Result<BuildReport, MatchError> {
        self.rebuild_index_with_progress(cancel, |_| {})
    }

    /// `rebuild_index` with a per-batch progress callback for the CLI.
    pub fn rebuild_index_with_progress(
        &self,
        cancel: Option<&AtomicBool>,
        on_batch: impl FnMut(usize),
    ) -> Result<BuildReport, MatchError> {
        let output = self.builder.rebuild_with_progress(cancel, on_batch)?;

        self.files.save(
            &output.index,
            &output.identifiers,
            &output.labels,
            &self.encoder_hash,
        )?;

        self.cache.adopt(IndexedSet {
            index: output.index,
            identifiers: output.identifiers,
            labels: output.labels,
        })?;

        Ok(output.report)
    }

    /// True enrolled count per the store, and the live indexed count.
    pub fn stats(&self) -> Result<MatcherStats, MatchError> {
        let enrolled = self.store.len()?;
        let indexed = if self.cache.is_ready() {
            self.cache.get()?.index.vector_count()
        } else {
            0
        };
        Ok(MatcherStats { enrolled, indexed })
    }
}

#[derive(Debug, Serialize)]
pub struct MatcherStats {
    pub enrolled: usize,
    pub indexed: usize,
}

/// Cache source backed by the persisted pair, falling back to a full
/// rebuild when the pair is absent or corrupt.
pub struct DiskSource {
    files: IndexFiles,
    builder: IndexBuilder,
    dimensions: usize,
    encoder_hash: [u8; 32],
}

impl DiskSource {
    pub fn new(
        files: IndexFiles,
        builder: IndexBuilder,
        dimensions: usize,
        encoder_id: &str,
    ) -> Self {
        Self {
            files,
            builder,
            dimensions,
            encoder_hash: encoder_id_hash(encoder_id),
        }
    }

    fn rebuild_from_store(&self) -> Result<IndexedSet, CacheError> {
        let output = self
            .builder
            .rebuild(None)
            .map_err(|e| CacheError::LoadFailed(e.to_string()))?;

        if let Err(e) = self.files.save(
            &output.index,
            &output.identifiers,
            &output.labels,
            &self.encoder_hash,
        ) {
            // The rebuilt pair is still good; persistence is retried on the
            // next rebuild.
            log::warn!("could not persist rebuilt index: {e}");
        }

        Ok(IndexedSet {
            index: output.index,
            identifiers: output.identifiers,
            labels: output.labels,
        })
    }
}

impl IndexSource for DiskSource {
    fn load(&self) -> Result<IndexedSet, CacheError> {
        if !self.files.exists() && !self.files.is_partial() {
            log::info!("no persisted index, building from store");
            return self.rebuild_from_store();
        }

        match self.files.load(&self.encoder_hash, self.dimensions) {
            Ok((index, identifiers, labels)) => {
                log::info!("loaded {} vectors from persisted index", index.vector_count());
                Ok(IndexedSet {
                    index,
                    identifiers,
                    labels,
                })
            }
            Err(e) => {
                // Serving a possibly-wrong index is worse than the cost of a
                // rebuild.
                log::error!("persisted index unusable ({e}), forcing rebuild");
                self.rebuild_from_store()
            }
        }
    }
}
