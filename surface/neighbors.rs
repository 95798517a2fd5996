//! # Neighbor Location and Grouping
//!
//! Brute-force k-nearest-neighbor ranking over the normalized training matrix,
//! and the grouping of query points that share an identical neighbor set.
//!
//! The ranking key is `sum(|a_i - b_i|^N)`. The N-th root is never taken: it is
//! monotone, so the order (and hence the neighbor set) is the same either way.
//! Raw key values are never exposed as distances.
//!
//! A `Neighborhood` is the canonical, sorted index set. Two query points whose
//! nearest neighbors are the same training rows, discovered in any order,
//! produce equal keys and therefore share one fitted model.

use ahash::{AHashMap, RandomState};
use ndarray::{ArrayView1, ArrayView2};
use std::fmt;
use thiserror::Error;

// Fixed hasher keys so neighborhood seeds are reproducible from run to run.
const SEED_HASH_KEYS: [u64; 4] = [
    0x9E37_79B9_7F4A_7C15,
    0xBF58_476D_1CE4_E5B9,
    0x94D0_49BB_1331_11EB,
    0x2545_F491_4F6C_DD1D,
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LocateError {
    #[error("Cannot search for neighbors in an empty training set.")]
    EmptyTrainingSet,

    #[error("Query point has {found} covariates, but training points have {expected}.")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("At least one neighbor must be requested.")]
    ZeroNeighbors,
}

/// An unordered set of training-row indices, stored sorted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Neighborhood(Vec<usize>);

impl Neighborhood {
    /// Canonicalizes `indices` (sorts and removes duplicates).
    pub fn from_indices(mut indices: Vec<usize>) -> Self {
        indices.sort_unstable();
        indices.dedup();
        Self(indices)
    }

    pub fn members(&self) -> &[usize] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Derives this neighborhood's RNG seed from the run's base seed.
    ///
    /// The result depends only on the base seed and the index set, so every
    /// worker that fits this neighborhood draws the same random stream.
    pub fn derive_seed(&self, base_seed: u64) -> u64 {
        let [k0, k1, k2, k3] = SEED_HASH_KEYS;
        RandomState::with_seeds(k0, k1, k2, k3).hash_one((base_seed, &self.0))
    }
}

impl fmt::Display for Neighborhood {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for idx in &self.0 {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{idx}")?;
            first = false;
        }
        Ok(())
    }
}

/// The ranking key between two points: `sum(|a_i - b_i|^power)`.
pub fn power_sum_distance(a: ArrayView1<f64>, b: ArrayView1<f64>, power: u32) -> f64 {
    let exponent = i32::try_from(power).unwrap_or(i32::MAX);
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| (x - y).abs().powi(exponent))
        .sum()
}

/// Returns the indices of the `k` training rows nearest `query`, nearest first.
///
/// Ties keep their original row order. When `k` is at least the number of
/// training rows, every index is returned in row order.
pub fn nearest_indices(
    training: ArrayView2<f64>,
    query: ArrayView1<f64>,
    k: usize,
    power: u32,
) -> Result<Vec<usize>, LocateError> {
    let n = training.nrows();
    if n == 0 {
        return Err(LocateError::EmptyTrainingSet);
    }
    if training.ncols() != query.len() {
        return Err(LocateError::DimensionMismatch {
            expected: training.ncols(),
            found: query.len(),
        });
    }
    if k == 0 {
        return Err(LocateError::ZeroNeighbors);
    }
    if k >= n {
        return Ok((0..n).collect());
    }

    let distances: Vec<f64> = training
        .rows()
        .into_iter()
        .map(|row| power_sum_distance(row, query, power))
        .collect();
    let mut order: Vec<usize> = (0..n).collect();
    // `sort_by` is stable, which is what breaks ties by row order.
    order.sort_by(|&a, &b| distances[a].total_cmp(&distances[b]));
    order.truncate(k);
    Ok(order)
}

/// The canonical neighborhood of `query`.
pub fn locate(
    training: ArrayView2<f64>,
    query: ArrayView1<f64>,
    k: usize,
    power: u32,
) -> Result<Neighborhood, LocateError> {
    nearest_indices(training, query, k, power).map(Neighborhood::from_indices)
}

/// Query points bucketed by neighborhood, in first-seen order.
#[derive(Debug, Default)]
pub struct NeighborhoodGroups {
    index: AHashMap<Neighborhood, usize>,
    groups: Vec<(Neighborhood, Vec<usize>)>,
}

impl NeighborhoodGroups {
    pub fn new() -> Self {
        Self::default()
    }

    /// Files query point `query` under `key`.
    pub fn insert(&mut self, key: Neighborhood, query: usize) {
        match self.index.get(&key) {
            Some(&slot) => self.groups[slot].1.push(query),
            None => {
                self.index.insert(key.clone(), self.groups.len());
                self.groups.push((key, vec![query]));
            }
        }
    }

    /// Number of distinct neighborhoods.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Neighborhood, &[usize])> {
        self.groups
            .iter()
            .map(|(key, members)| (key, members.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn finds_nearest_rows_first() {
        let training = array![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [5.0, 5.0]];
        let nearest = nearest_indices(training.view(), array![0.9, 0.1].view(), 2, 2).unwrap();
        assert_eq!(nearest, vec![1, 0]);
    }

    #[test]
    fn ties_keep_row_order() {
        let training = array![[1.0], [-1.0], [1.0], [3.0]];
        let nearest = nearest_indices(training.view(), array![0.0].view(), 3, 2).unwrap();
        assert_eq!(nearest, vec![0, 1, 2]);
    }

    #[test]
    fn odd_powers_rank_by_magnitude() {
        let training = array![[-3.0], [1.0], [2.0]];
        let nearest = nearest_indices(training.view(), array![0.0].view(), 1, 3).unwrap();
        assert_eq!(nearest, vec![1]);
    }

    #[test]
    fn k_at_least_n_returns_everything() {
        let training = array![[3.0], [1.0], [2.0]];
        let nearest = nearest_indices(training.view(), array![0.0].view(), 7, 2).unwrap();
        assert_eq!(nearest, vec![0, 1, 2]);
    }

    #[test]
    fn empty_and_mismatched_inputs_fail() {
        let empty = ndarray::Array2::<f64>::zeros((0, 2));
        assert_eq!(
            nearest_indices(empty.view(), array![0.0, 0.0].view(), 1, 2),
            Err(LocateError::EmptyTrainingSet)
        );
        let training = array![[0.0, 0.0]];
        assert_eq!(
            nearest_indices(training.view(), array![0.0].view(), 1, 2),
            Err(LocateError::DimensionMismatch {
                expected: 2,
                found: 1
            })
        );
    }

    #[test]
    fn neighborhood_identity_ignores_discovery_order() {
        let a = Neighborhood::from_indices(vec![4, 1, 3]);
        let b = Neighborhood::from_indices(vec![3, 4, 1]);
        assert_eq!(a, b);
        assert_eq!(a.members(), &[1, 3, 4]);
        assert_eq!(a.derive_seed(7), b.derive_seed(7));
        assert_eq!(a.to_string(), "1 3 4");
    }

    #[test]
    fn groups_collect_queries_sharing_a_neighborhood() {
        let mut groups = NeighborhoodGroups::new();
        groups.insert(Neighborhood::from_indices(vec![0, 1]), 0);
        groups.insert(Neighborhood::from_indices(vec![2, 3]), 1);
        groups.insert(Neighborhood::from_indices(vec![1, 0]), 2);
        assert_eq!(groups.len(), 2);
        let collected: Vec<(Vec<usize>, Vec<usize>)> = groups
            .iter()
            .map(|(key, members)| (key.members().to_vec(), members.to_vec()))
            .collect();
        assert_eq!(
            collected,
            vec![(vec![0, 1], vec![0, 2]), (vec![2, 3], vec![1])]
        );
    }
}
