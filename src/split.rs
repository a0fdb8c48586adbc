//! Random train/validation/test partitioning.

use rand::seq::SliceRandom;
use rand::Rng;
use rand::rngs::StdRng;
use std::sync::Arc;
use thiserror::Error;

use crate::dataset::{Dataset, DatasetError};

pub const TRAIN_VAL: [f64; 2] = [0.9, 0.1];
pub const TRAIN_VAL_TEST: [f64; 3] = [0.8, 0.1, 0.1];

#[derive(Error, Debug, PartialEq)]
pub enum SplitError {
    #[error("No split ratios given")]
    Empty,
    #[error("Invalid split ratio {0}")]
    InvalidRatio(f64),
    #[error("Split ratios {0:?} sum to more than 1")]
    Oversubscribed(Vec<f64>),
}

/// Which partition the data module produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SplitScheme {
    /// 90/10 train/validation, no test split.
    TrainVal,
    /// 80/10/10 train/validation/test.
    #[default]
    TrainValTest,
}

impl SplitScheme {
    pub fn ratios(self) -> &'static [f64] {
        match self {
            SplitScheme::TrainVal => &TRAIN_VAL,
            SplitScheme::TrainValTest => &TRAIN_VAL_TEST,
        }
    }

    pub fn has_test(self) -> bool {
        matches!(self, SplitScheme::TrainValTest)
    }
}

/// Split sizes for `n` rows: `floor(n * ratio)` each, with the rounding
/// remainder added to the first split.
pub fn split_lengths(n: usize, ratios: &[f64]) -> Result<Vec<usize>, SplitError> {
    if ratios.is_empty() {
        return Err(SplitError::Empty);
    }
    if let Some(&bad) = ratios.iter().find(|r| !r.is_finite() || **r < 0.0) {
        return Err(SplitError::InvalidRatio(bad));
    }

    let mut lengths: Vec<usize> = ratios.iter().map(|&r| (n as f64 * r) as usize).collect();
    let assigned: usize = lengths.iter().sum();
    if assigned > n {
        return Err(SplitError::Oversubscribed(ratios.to_vec()));
    }
    lengths[0] += n - assigned;
    Ok(lengths)
}

/// Shuffle `0..n` once and cut it into consecutive pieces of `lengths`.
pub fn random_split<R: Rng + ?Sized>(n: usize, ratios: &[f64], rng: &mut R) -> Result<Vec<Vec<usize>>, SplitError> {
    let lengths = split_lengths(n, ratios)?;

    let mut indices: Vec<usize> = (0..n).collect();
    indices.shuffle(rng);

    let mut rest = indices.as_slice();
    let splits = lengths
        .iter()
        .map(|&len| {
            let (head, tail) = rest.split_at(len);
            rest = tail;
            head.to_vec()
        })
        .collect();

    tracing::debug!(?lengths, total = n, "dataset split");
    Ok(splits)
}

/// A view of `dataset` restricted to the given indices.
pub struct Subset<D> {
    dataset: Arc<D>,
    indices: Arc<[usize]>,
}

impl<D> Clone for Subset<D> {
    fn clone(&self) -> Self {
        Self {
            dataset: Arc::clone(&self.dataset),
            indices: Arc::clone(&self.indices),
        }
    }
}

impl<D: Dataset> Subset<D> {
    pub fn new(dataset: Arc<D>, indices: Vec<usize>) -> Self {
        Self {
            dataset,
            indices: indices.into(),
        }
    }

    /// Indices into the parent dataset, in subset order.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn dataset(&self) -> &D {
        &self.dataset
    }
}

impl<D: Dataset> Dataset for Subset<D> {
    type Item = D::Item;

    fn len(&self) -> usize {
        self.indices.len()
    }

    fn get(&self, index: usize, rng: &mut StdRng) -> Result<D::Item, DatasetError> {
        let parent = *self.indices.get(index).ok_or(DatasetError::IndexOutOfRange {
            index,
            len: self.indices.len(),
        })?;
        self.dataset.get(parent, rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::tests::{table, FakeSampler};
    use crate::dataset::TripletDataset;
    use rand::SeedableRng;
    use std::collections::HashSet;

    #[test]
    fn test_three_way_lengths() {
        assert_eq!(split_lengths(100, &TRAIN_VAL_TEST).unwrap(), vec![80, 10, 10]);
    }

    #[test]
    fn test_remainder_goes_to_first_split() {
        assert_eq!(split_lengths(101, &TRAIN_VAL).unwrap(), vec![91, 10]);
        assert_eq!(split_lengths(7, &TRAIN_VAL_TEST).unwrap(), vec![7, 0, 0]);
        assert_eq!(split_lengths(0, &TRAIN_VAL).unwrap(), vec![0, 0]);
    }

    #[test]
    fn test_lengths_always_sum_to_n() {
        for n in 0..500 {
            for ratios in [&TRAIN_VAL[..], &TRAIN_VAL_TEST[..], &[0.33, 0.33, 0.33][..]] {
                let lengths = split_lengths(n, ratios).unwrap();
                assert_eq!(lengths.iter().sum::<usize>(), n);
            }
        }
    }

    #[test]
    fn test_invalid_ratios() {
        assert_eq!(split_lengths(10, &[]), Err(SplitError::Empty));
        assert_eq!(split_lengths(10, &[0.5, -0.1]), Err(SplitError::InvalidRatio(-0.1)));
        assert!(matches!(split_lengths(10, &[0.9, 0.9]), Err(SplitError::Oversubscribed(_))));
    }

    #[test]
    fn test_random_split_partitions_indices() {
        let mut rng = StdRng::seed_from_u64(42);
        let splits = random_split(250, &TRAIN_VAL_TEST, &mut rng).unwrap();
        assert_eq!(splits.iter().map(Vec::len).collect::<Vec<_>>(), vec![200, 25, 25]);

        let mut seen = HashSet::new();
        for split in &splits {
            for &i in split {
                assert!(seen.insert(i), "index {i} assigned twice");
            }
        }
        assert_eq!(seen, (0..250).collect::<HashSet<_>>());
    }

    #[test]
    fn test_random_split_seeded_is_reproducible() {
        let a = random_split(50, &TRAIN_VAL, &mut StdRng::seed_from_u64(1)).unwrap();
        let b = random_split(50, &TRAIN_VAL, &mut StdRng::seed_from_u64(1)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_subset_maps_indices() {
        let ds = Arc::new(TripletDataset::new(table(10), Arc::new(FakeSampler { len: 3 })));
        let subset = Subset::new(ds, vec![7, 2]);
        assert_eq!(subset.len(), 2);

        let mut rng = StdRng::seed_from_u64(0);
        let item = subset.get(0, &mut rng).unwrap();
        assert_eq!(item.anchor.into_f32()[0], 7.0);
        assert!(matches!(
            subset.get(2, &mut rng),
            Err(DatasetError::IndexOutOfRange { index: 2, len: 2 })
        ));
    }
}
