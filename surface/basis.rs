//! # Monomial Basis
//!
//! Every local surface in this crate is a polynomial of total degree `d` over
//! `m` normalized covariates. Its terms are all combinations-with-replacement
//! of `[1, x_1, ..., x_m]` taken `d` at a time, in lexicographic order. Index
//! `0` stands for the constant `1`, so the combination `[0, 0, 2]` is `x_2` and
//! `[1, 2, 2]` is `x_1 * x_2^2`. The first term is always the constant, and
//! terms come grouped by ascending total degree.
//!
//! The solver builds its design matrix from a `MonomialBasis` and the evaluator
//! expands query points through the very same value, so coefficient `i` always
//! multiplies monomial `i`.

use itertools::Itertools;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use thiserror::Error;

/// The largest number of monomials a single local model may carry.
pub const MAX_MONOMIALS: usize = 1 << 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BasisError {
    #[error(
        "A degree-{degree} polynomial over {variables} variables needs more than {max} monomials."
    )]
    TooManyMonomials {
        variables: usize,
        degree: usize,
        max: usize,
    },

    #[error("Point has {found} coordinates, but the basis was built for {expected} variables.")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("No basis of degree {degree}; candidate degrees stop at {max}.")]
    DegreeOutOfRange { degree: usize, max: usize },
}

/// Returns `C(variables + degree, degree)`, the number of monomials of total
/// degree at most `degree`, or `None` on overflow.
pub fn monomial_count(variables: usize, degree: usize) -> Option<usize> {
    let mut count: u128 = 1;
    for i in 1..=degree as u128 {
        // C(m+i, i) = C(m+i-1, i-1) * (m+i) / i stays integral at every step.
        count = count.checked_mul(variables as u128 + i)? / i;
    }
    usize::try_from(count).ok()
}

/// The ordered monomial terms of a polynomial of fixed degree and dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonomialBasis {
    variables: usize,
    degree: usize,
    terms: Vec<Vec<usize>>,
}

impl MonomialBasis {
    pub fn new(variables: usize, degree: usize) -> Result<Self, BasisError> {
        let too_many = BasisError::TooManyMonomials {
            variables,
            degree,
            max: MAX_MONOMIALS,
        };
        let count = monomial_count(variables, degree).ok_or_else(|| too_many.clone())?;
        if count > MAX_MONOMIALS {
            return Err(too_many);
        }

        let terms: Vec<Vec<usize>> = if degree == 0 {
            vec![Vec::new()]
        } else {
            (0..=variables)
                .combinations_with_replacement(degree)
                .collect()
        };
        debug_assert_eq!(terms.len(), count);

        Ok(Self {
            variables,
            degree,
            terms,
        })
    }

    pub fn variables(&self) -> usize {
        self.variables
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    /// Number of monomials, `C(m + d, d)`.
    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Total degree of monomial `term`.
    pub fn term_degree(&self, term: usize) -> usize {
        self.terms[term].iter().filter(|&&idx| idx != 0).count()
    }

    /// Values of every monomial at `point`.
    pub fn expand(&self, point: ArrayView1<f64>) -> Result<Array1<f64>, BasisError> {
        self.check_dimension(point.len())?;
        Ok(self.expand_unchecked(point))
    }

    /// Builds the `[n_points, len()]` design matrix, one expanded row per point.
    pub fn design_matrix(&self, points: ArrayView2<f64>) -> Result<Array2<f64>, BasisError> {
        self.check_dimension(points.ncols())?;
        let mut design = Array2::zeros((points.nrows(), self.len()));
        for (mut row, point) in design.rows_mut().into_iter().zip(points.rows()) {
            row.assign(&self.expand_unchecked(point));
        }
        Ok(design)
    }

    fn check_dimension(&self, found: usize) -> Result<(), BasisError> {
        if found != self.variables {
            return Err(BasisError::DimensionMismatch {
                expected: self.variables,
                found,
            });
        }
        Ok(())
    }

    fn expand_unchecked(&self, point: ArrayView1<f64>) -> Array1<f64> {
        self.terms
            .iter()
            .map(|term| {
                term.iter()
                    .filter(|&&idx| idx != 0)
                    .map(|&idx| point[idx - 1])
                    .product::<f64>()
            })
            .collect()
    }
}

/// One basis per candidate degree `0..=max_degree`, built once per run.
#[derive(Debug, Clone)]
pub struct BasisSet {
    bases: Vec<MonomialBasis>,
}

impl BasisSet {
    pub fn new(variables: usize, max_degree: usize) -> Result<Self, BasisError> {
        let bases = (0..=max_degree)
            .map(|degree| MonomialBasis::new(variables, degree))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { bases })
    }

    pub fn max_degree(&self) -> usize {
        self.bases.len() - 1
    }

    /// The basis of `degree`, if it is within the set.
    pub fn get(&self, degree: usize) -> Option<&MonomialBasis> {
        self.bases.get(degree)
    }

    pub fn basis(&self, degree: usize) -> Result<&MonomialBasis, BasisError> {
        self.get(degree).ok_or(BasisError::DegreeOutOfRange {
            degree,
            max: self.max_degree(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn monomial_count_matches_binomial() {
        assert_eq!(monomial_count(3, 0), Some(1));
        assert_eq!(monomial_count(3, 2), Some(10));
        assert_eq!(monomial_count(2, 3), Some(10));
        assert_eq!(monomial_count(0, 4), Some(1));
        assert_eq!(monomial_count(5, 3), Some(56));
    }

    #[test]
    fn terms_are_ordered_like_combinations_with_replacement() {
        let basis = MonomialBasis::new(2, 2).unwrap();
        assert_eq!(basis.len(), 6);
        // 1, x1, x2, x1^2, x1*x2, x2^2
        let values = basis.expand(array![2.0, 3.0].view()).unwrap();
        assert_eq!(values, array![1.0, 2.0, 3.0, 4.0, 6.0, 9.0]);
        let degrees: Vec<usize> = (0..basis.len()).map(|t| basis.term_degree(t)).collect();
        assert_eq!(degrees, vec![0, 1, 1, 2, 2, 2]);
    }

    #[test]
    fn degree_zero_basis_is_the_constant() {
        let basis = MonomialBasis::new(4, 0).unwrap();
        assert_eq!(basis.len(), 1);
        let values = basis.expand(array![5.0, 6.0, 7.0, 8.0].view()).unwrap();
        assert_eq!(values, array![1.0]);
    }

    #[test]
    fn design_matrix_rows_follow_points() {
        let basis = MonomialBasis::new(1, 3).unwrap();
        let points = array![[1.0], [2.0], [-1.0]];
        let design = basis.design_matrix(points.view()).unwrap();
        assert_eq!(
            design,
            array![
                [1.0, 1.0, 1.0, 1.0],
                [1.0, 2.0, 4.0, 8.0],
                [1.0, -1.0, 1.0, -1.0]
            ]
        );
    }

    #[test]
    fn dimension_mismatch_is_reported() {
        let basis = MonomialBasis::new(3, 1).unwrap();
        let err = basis.expand(array![1.0, 2.0].view()).unwrap_err();
        assert_eq!(
            err,
            BasisError::DimensionMismatch {
                expected: 3,
                found: 2
            }
        );
    }

    #[test]
    fn basis_set_covers_every_candidate_degree() {
        let set = BasisSet::new(3, 2).unwrap();
        assert_eq!(set.max_degree(), 2);
        assert_eq!(set.get(0).unwrap().len(), 1);
        assert_eq!(set.get(1).unwrap().len(), 4);
        assert_eq!(set.get(2).unwrap().len(), 10);
        assert!(set.get(3).is_none());
        assert_eq!(
            set.basis(3).unwrap_err(),
            BasisError::DegreeOutOfRange { degree: 3, max: 2 }
        );
    }

    #[test]
    fn oversized_bases_are_rejected() {
        assert!(matches!(
            MonomialBasis::new(40, 8),
            Err(BasisError::TooManyMonomials { .. })
        ));
    }
}
