//! In-memory vector index with cosine similarity search.

use tracing::{debug, info};

use crate::Embedding;
use crate::error::{EmbeddingError, Result};
use crate::similarity::rank_top_k;

/// One stored vector together with the item it was computed from.
///
/// Entries are never mutated after insertion.
#[derive(Debug, Clone)]
pub struct IndexedVector<T> {
    /// The embedding vector, stored as given.
    pub vector: Embedding,

    /// The indexed item.
    pub item: T,
}

/// A search hit borrowed from the index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHit<'a, T> {
    /// The matched item.
    pub item: &'a T,

    /// Cosine similarity against the query vector.
    pub similarity: f32,
}

/// An in-memory store of `(vector, item)` pairs.
///
/// All vectors share one dimensionality. Unless the index was created with
/// [`VectorIndex::with_dimension`], the dimensionality is fixed by the first
/// insertion and forgotten again on [`VectorIndex::clear`].
pub struct VectorIndex<T> {
    entries: Vec<IndexedVector<T>>,
    fixed_dimension: Option<usize>,
    dimension: Option<usize>,
}

impl<T> VectorIndex<T> {
    /// Create an empty index that adopts the dimension of its first vector.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            fixed_dimension: None,
            dimension: None,
        }
    }

    /// Create an empty index that only accepts vectors of `dimension`.
    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            entries: Vec::new(),
            fixed_dimension: Some(dimension),
            dimension: Some(dimension),
        }
    }

    /// Dimension of stored vectors, if known.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    /// Get the number of entries in the index.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the index is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over stored entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &IndexedVector<T>> {
        self.entries.iter()
    }

    /// Append items to the index.
    ///
    /// Either every item is added or, on a dimension mismatch, none is.
    /// There is no deduplication: adding the same item twice stores it twice.
    pub fn add(&mut self, items: Vec<(Embedding, T)>) -> Result<()> {
        let dimension = check_batch(self.dimension, &items)?;
        let count = items.len();
        self.append(dimension, items);
        debug!("Added {count} vectors to index");
        Ok(())
    }

    /// Remove every entry matching `stale`, then append `items`.
    ///
    /// Validation happens before anything is removed, so a rejected batch
    /// leaves the index untouched. Returns the number of removed entries.
    pub fn replace<F>(&mut self, items: Vec<(Embedding, T)>, stale: F) -> Result<usize>
    where
        F: Fn(&T) -> bool,
    {
        let remaining = self
            .entries
            .iter()
            .filter(|entry| !stale(&entry.item))
            .count();
        // An index emptied by the replacement may take a new dimension.
        let base = if remaining == 0 {
            self.fixed_dimension
        } else {
            self.dimension
        };
        let dimension = check_batch(base, &items)?;

        let removed = self.entries.len() - remaining;
        self.entries.retain(|entry| !stale(&entry.item));
        let count = items.len();
        self.append(dimension, items);
        debug!("Replaced {removed} vectors with {count} new ones");
        Ok(removed)
    }

    /// Return up to `k` entries ranked by descending cosine similarity.
    ///
    /// Ties keep insertion order. An empty index yields an empty result for
    /// any query; otherwise the query must match the index dimension.
    pub fn query(&self, vector: &[f32], k: usize) -> Result<Vec<SearchHit<'_, T>>> {
        if self.entries.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        if let Some(expected) = self.dimension {
            if vector.len() != expected {
                return Err(EmbeddingError::DimensionMismatch {
                    expected,
                    actual: vector.len(),
                });
            }
        }

        let ranked = rank_top_k(
            vector,
            self.entries.iter().map(|entry| entry.vector.as_slice()),
            k,
        )?;

        Ok(ranked
            .into_iter()
            .map(|(position, similarity)| SearchHit {
                item: &self.entries[position].item,
                similarity,
            })
            .collect())
    }

    /// Discard all entries.
    pub fn clear(&mut self) {
        let count = self.entries.len();
        self.entries.clear();
        self.dimension = self.fixed_dimension;
        info!("Cleared vector index ({count} entries)");
    }

    fn append(&mut self, dimension: Option<usize>, items: Vec<(Embedding, T)>) {
        self.dimension = dimension;
        self.entries.extend(
            items
                .into_iter()
                .map(|(vector, item)| IndexedVector { vector, item }),
        );
    }
}

/// Check that every vector in `items` matches `dimension`, adopting the
/// first vector's length when no dimension is known yet.
fn check_batch<T>(dimension: Option<usize>, items: &[(Embedding, T)]) -> Result<Option<usize>> {
    let mut dimension = dimension;
    for (vector, _) in items {
        match dimension {
            Some(expected) if vector.len() != expected => {
                return Err(EmbeddingError::DimensionMismatch {
                    expected,
                    actual: vector.len(),
                });
            }
            Some(_) => {}
            None => dimension = Some(vector.len()),
        }
    }
    Ok(dimension)
}

impl<T> Default for VectorIndex<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn labels(hits: &[SearchHit<'_, &'static str>]) -> Vec<&'static str> {
        hits.iter().map(|hit| *hit.item).collect()
    }

    #[test]
    fn test_index_search() {
        let mut index = VectorIndex::new();
        index
            .add(vec![
                (vec![1.0, 0.0, 0.0], "a"),
                (vec![0.0, 1.0, 0.0], "b"),
                (vec![0.7, 0.7, 0.0], "c"),
            ])
            .unwrap();

        let results = index.query(&[1.0, 0.0, 0.0], 2).unwrap();

        assert_eq!(labels(&results), vec!["a", "c"]);
        assert!((results[0].similarity - 1.0).abs() < 1e-6);
        assert!(results[0].similarity >= results[1].similarity);
    }

    #[test]
    fn test_query_returns_min_k_n() {
        let mut index = VectorIndex::new();
        index
            .add(vec![(vec![1.0, 0.0], "a"), (vec![0.0, 1.0], "b")])
            .unwrap();

        assert_eq!(index.query(&[1.0, 1.0], 5).unwrap().len(), 2);
        assert_eq!(index.query(&[1.0, 1.0], 1).unwrap().len(), 1);
    }

    #[test]
    fn test_empty_index_returns_nothing() {
        let index: VectorIndex<&str> = VectorIndex::with_dimension(3);
        assert!(index.query(&[1.0, 0.0, 0.0], 5).unwrap().is_empty());
        // Even a malformed query is harmless against an empty index.
        assert!(index.query(&[1.0], 5).unwrap().is_empty());
    }

    #[test]
    fn test_ties_keep_insertion_order() {
        let mut index = VectorIndex::new();
        index
            .add(vec![
                (vec![1.0, 0.0], "first"),
                (vec![0.0, 1.0], "other"),
                (vec![1.0, 0.0], "second"),
            ])
            .unwrap();

        let results = index.query(&[1.0, 0.0], 3).unwrap();
        assert_eq!(labels(&results), vec!["first", "second", "other"]);
    }

    #[test]
    fn test_add_has_no_dedup() {
        let mut index = VectorIndex::new();
        index.add(vec![(vec![1.0, 0.0], "a")]).unwrap();
        index.add(vec![(vec![1.0, 0.0], "a")]).unwrap();
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_dimension_mismatch_rejects_whole_batch() {
        let mut index = VectorIndex::with_dimension(3);
        let result = index.add(vec![(vec![1.0, 0.0, 0.0], "ok"), (vec![1.0, 0.0], "bad")]);
        assert!(matches!(
            result,
            Err(EmbeddingError::DimensionMismatch {
                expected: 3,
                actual: 2
            })
        ));
        assert!(index.is_empty());
    }

    #[test]
    fn test_query_dimension_mismatch_is_an_error() {
        let mut index = VectorIndex::new();
        index.add(vec![(vec![1.0, 0.0, 0.0], "a")]).unwrap();
        assert!(index.query(&[1.0, 0.0], 1).is_err());
    }

    #[test]
    fn test_clear_resets_adopted_dimension() {
        let mut index = VectorIndex::new();
        index.add(vec![(vec![1.0, 0.0, 0.0], "a")]).unwrap();
        assert_eq!(index.dimension(), Some(3));

        index.clear();
        assert!(index.is_empty());
        assert_eq!(index.dimension(), None);

        index.add(vec![(vec![1.0, 0.0], "b")]).unwrap();
        assert_eq!(index.dimension(), Some(2));
    }

    #[test]
    fn test_replace_drops_stale_entries() {
        let mut index = VectorIndex::new();
        index
            .add(vec![
                (vec![1.0, 0.0], ("one.rs", 0)),
                (vec![0.0, 1.0], ("two.rs", 0)),
                (vec![1.0, 1.0], ("one.rs", 1)),
            ])
            .unwrap();

        let removed = index
            .replace(vec![(vec![0.5, 0.5], ("one.rs", 0))], |(source, _)| {
                *source == "one.rs"
            })
            .unwrap();

        assert_eq!(removed, 2);
        let items: Vec<(&str, i32)> = index.iter().map(|entry| entry.item).collect();
        assert_eq!(items, vec![("two.rs", 0), ("one.rs", 0)]);
    }
}
