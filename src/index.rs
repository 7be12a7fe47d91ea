//! In-memory vector index with nearest-neighbor search.
//!
//! Stores face embeddings in a flat, positionally-addressed buffer. Position
//! `i` corresponds to the `i`-th vector appended, which callers align 1:1
//! with an identifier list built in lock-step (see `builder`).

use rayon::prelude::*;

/// A nearest-neighbor hit: position of the stored vector plus its distance
/// to the query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// Position of the matched vector (insertion order, 0-based).
    pub position: usize,
    /// Squared Euclidean distance to the query.
    pub distance: f32,
}

/// Append-only in-memory index over fixed-dimension embeddings.
///
/// The distance metric is **squared** Euclidean (L2) distance; score
/// normalization is the matcher's job, not the index's. The index is never
/// mutated by query paths: it is populated by the builder and then published
/// read-only through the cache.
pub struct VectorIndex {
    /// Row-major vector storage, `count * dimensions` values.
    data: Vec<f32>,
    dimensions: usize,
    count: usize,
}

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

impl VectorIndex {
    /// Create a new empty index with the given embedding dimensions.
    pub fn new(dimensions: usize) -> Self {
        Self {
            data: Vec::new(),
            dimensions,
            count: 0,
        }
    }

    /// Create an index with pre-allocated capacity (in vectors).
    pub fn with_capacity(dimensions: usize, capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(dimensions * capacity),
            dimensions,
            count: 0,
        }
    }

    /// Get the expected embedding dimensions.
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Get the number of vectors in the index.
    pub fn vector_count(&self) -> usize {
        self.count
    }

    /// Check if the index is empty.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Append a single vector. Its position is the current vector count.
    ///
    /// Rejects wrong-dimension vectors without modifying the index.
    pub fn push(&mut self, vector: &[f32]) -> Result<usize, IndexError> {
        if vector.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: vector.len(),
            });
        }

        self.data.extend_from_slice(vector);
        let position = self.count;
        self.count += 1;
        Ok(position)
    }

    /// Append vectors in order, assigning sequential positions.
    ///
    /// All vectors are validated before any is appended, so a dimension
    /// mismatch leaves `vector_count()` unchanged.
    pub fn add(&mut self, vectors: &[Vec<f32>]) -> Result<(), IndexError> {
        for v in vectors {
            if v.len() != self.dimensions {
                return Err(IndexError::DimensionMismatch {
                    expected: self.dimensions,
                    got: v.len(),
                });
            }
        }

        for v in vectors {
            self.data.extend_from_slice(v);
        }
        self.count += vectors.len();
        Ok(())
    }

    /// Get the vector stored at `position`, if any.
    pub fn vector_at(&self, position: usize) -> Option<&[f32]> {
        if position >= self.count {
            return None;
        }
        let start = position * self.dimensions;
        Some(&self.data[start..start + self.dimensions])
    }

    /// Iterate over all stored vectors in position order.
    pub fn iter(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.dimensions)
    }

    /// Find the `k` nearest stored vectors to `query`.
    ///
    /// Results are ordered by ascending squared L2 distance. An empty index
    /// returns an empty list; `k` larger than the vector count returns all
    /// entries.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, IndexError> {
        if query.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: query.len(),
            });
        }

        if self.count == 0 || k == 0 {
            return Ok(Vec::new());
        }

        let mut results: Vec<Neighbor> = self
            .data
            .par_chunks_exact(self.dimensions)
            .enumerate()
            .map(|(position, stored)| Neighbor {
                position,
                distance: squared_l2(query, stored),
            })
            .collect();

        // Ascending distance; ties broken by position for determinism.
        results.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.position.cmp(&b.position))
        });

        results.truncate(k);
        Ok(results)
    }
}

/// Squared Euclidean distance between two equal-length vectors.
fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_index() {
        let index = VectorIndex::new(128);
        assert_eq!(index.dimensions(), 128);
        assert!(index.is_empty());
        assert_eq!(index.vector_count(), 0);
    }

    #[test]
    fn test_push_assigns_sequential_positions() {
        let mut index = VectorIndex::new(2);
        assert_eq!(index.push(&[1.0, 0.0]).unwrap(), 0);
        assert_eq!(index.push(&[0.0, 1.0]).unwrap(), 1);
        assert_eq!(index.vector_count(), 2);
        assert_eq!(index.vector_at(0).unwrap(), &[1.0, 0.0]);
        assert_eq!(index.vector_at(1).unwrap(), &[0.0, 1.0]);
    }

    #[test]
    fn test_push_dimension_mismatch_leaves_count_unchanged() {
        let mut index = VectorIndex::new(128);
        let wrong = vec![0.5f32; 64];

        let result = index.push(&wrong);
        assert!(matches!(
            result,
            Err(IndexError::DimensionMismatch {
                expected: 128,
                got: 64
            })
        ));
        assert_eq!(index.vector_count(), 0);
    }

    #[test]
    fn test_add_batch_validates_before_appending() {
        let mut index = VectorIndex::new(2);
        let batch = vec![vec![1.0, 0.0], vec![1.0, 0.0, 0.0]];

        assert!(index.add(&batch).is_err());
        assert_eq!(index.vector_count(), 0);

        let good = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        index.add(&good).unwrap();
        assert_eq!(index.vector_count(), 2);
    }

    #[test]
    fn test_search_empty_index_returns_empty() {
        let index = VectorIndex::new(2);
        let results = index.search(&[0.0, 0.0], 10).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_search_query_dimension_mismatch() {
        let index = VectorIndex::new(2);
        let result = index.search(&[0.0, 0.0, 0.0], 10);
        assert!(matches!(result, Err(IndexError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_search_known_squared_distances() {
        let mut index = VectorIndex::new(2);
        index.push(&[0.0, 0.0]).unwrap();
        index.push(&[3.0, 4.0]).unwrap();

        let results = index.search(&[0.0, 0.0], 10).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].position, 0);
        assert_eq!(results[0].distance, 0.0);
        assert_eq!(results[1].position, 1);
        assert_eq!(results[1].distance, 25.0);
    }

    #[test]
    fn test_search_k_exceeds_count_returns_all() {
        let mut index = VectorIndex::new(2);
        index.push(&[0.0, 0.0]).unwrap();
        index.push(&[1.0, 0.0]).unwrap();
        index.push(&[2.0, 0.0]).unwrap();

        let results = index.search(&[0.0, 0.0], 10).unwrap();
        assert_eq!(results.len(), 3);
    }

    #[test]
    fn test_search_orders_by_ascending_distance() {
        let mut index = VectorIndex::new(2);
        index.push(&[5.0, 0.0]).unwrap();
        index.push(&[1.0, 0.0]).unwrap();
        index.push(&[3.0, 0.0]).unwrap();

        let results = index.search(&[0.0, 0.0], 3).unwrap();
        assert_eq!(results[0].position, 1);
        assert_eq!(results[1].position, 2);
        assert_eq!(results[2].position, 0);
        assert!(results[0].distance <= results[1].distance);
        assert!(results[1].distance <= results[2].distance);
    }

    #[test]
    fn test_search_truncates_to_k() {
        let mut index = VectorIndex::new(2);
        for i in 0..10 {
            index.push(&[i as f32, 0.0]).unwrap();
        }

        let results = index.search(&[0.0, 0.0], 3).unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].position, 0);
    }

    #[test]
    fn test_search_deterministic() {
        let mut index = VectorIndex::new(3);
        for i in 0..50 {
            index
                .push(&[i as f32 * 0.1, (50 - i) as f32 * 0.1, 1.0])
                .unwrap();
        }

        let query = [2.0, 2.0, 1.0];
        let first = index.search(&query, 10).unwrap();
        let second = index.search(&query, 10).unwrap();
        assert_eq!(first, second);
    }
}
