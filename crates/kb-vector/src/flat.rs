//! Exact brute-force index.

use kb_embeddings::model::squared_l2;

use crate::error::VectorError;
use crate::index::{check_dimension, compare_neighbors, IndexKind, Neighbor, VectorIndex};

/// Flat index: a contiguous slot-major buffer scanned on every query.
pub struct FlatIndex {
    dimension: usize,
    data: Vec<f32>,
}

impl FlatIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            data: Vec::new(),
        }
    }
}

impl VectorIndex for FlatIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::Flat
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn len(&self) -> usize {
        if self.dimension == 0 {
            0
        } else {
            self.data.len() / self.dimension
        }
    }

    fn add(&mut self, values: &[f32]) -> Result<usize, VectorError> {
        check_dimension(self.dimension, values)?;
        let slot = self.len();
        self.data.extend_from_slice(values);
        Ok(slot)
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, VectorError> {
        check_dimension(self.dimension, query)?;
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let mut hits: Vec<Neighbor> = self
            .data
            .chunks_exact(self.dimension)
            .enumerate()
            .map(|(slot, v)| Neighbor::new(slot, squared_l2(query, v)))
            .collect();

        if k < hits.len() {
            hits.select_nth_unstable_by(k - 1, compare_neighbors);
            hits.truncate(k);
        }
        hits.sort_by(compare_neighbors);
        Ok(hits)
    }

    fn vector(&self, slot: usize) -> Option<&[f32]> {
        let start = slot.checked_mul(self.dimension)?;
        self.data.get(start..start + self.dimension)
    }

    fn raw(&self) -> &[f32] {
        &self.data
    }

    fn clear(&mut self) -> Result<(), VectorError> {
        self.data = Vec::new();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn random_vector(dim: usize) -> Vec<f32> {
        let mut rng = rand::rng();
        (0..dim).map(|_| rng.random()).collect()
    }

    #[test]
    fn test_add_and_search_exact() {
        let mut index = FlatIndex::new(2);
        index.add(&[0.0, 0.0]).unwrap();
        index.add(&[1.0, 0.0]).unwrap();
        index.add(&[5.0, 5.0]).unwrap();

        let hits = index.search(&[0.9, 0.0], 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].slot, 1);
        assert_eq!(hits[1].slot, 0);
        assert!((hits[0].distance - 0.01).abs() < 1e-6);
    }

    #[test]
    fn test_ties_broken_by_insertion_order() {
        let mut index = FlatIndex::new(2);
        for _ in 0..5 {
            index.add(&[1.0, 1.0]).unwrap();
        }
        let hits = index.search(&[1.0, 1.0], 3).unwrap();
        let slots: Vec<usize> = hits.iter().map(|h| h.slot).collect();
        assert_eq!(slots, vec![0, 1, 2]);
    }

    #[test]
    fn test_search_sorted_and_bounded() {
        let mut index = FlatIndex::new(16);
        for _ in 0..50 {
            index.add(&random_vector(16)).unwrap();
        }
        let hits = index.search(&random_vector(16), 10).unwrap();
        assert_eq!(hits.len(), 10);
        for pair in hits.windows(2) {
            assert!(pair[0].distance <= pair[1].distance);
        }

        let all = index.search(&random_vector(16), 500).unwrap();
        assert_eq!(all.len(), 50);
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut index = FlatIndex::new(4);
        assert!(matches!(
            index.add(&[1.0]),
            Err(VectorError::DimensionMismatch { .. })
        ));
        assert!(index.search(&[1.0], 1).is_err());
    }

    #[test]
    fn test_clear_releases() {
        let mut index = FlatIndex::new(2);
        index.add(&[1.0, 2.0]).unwrap();
        index.clear().unwrap();
        assert!(index.is_empty());
        assert_eq!(index.raw().len(), 0);
        assert_eq!(index.vector(0), None);
    }
}
