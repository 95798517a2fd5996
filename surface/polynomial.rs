//! Fitted local surfaces and their evaluation.

use crate::surface::basis::{BasisError, MonomialBasis};
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SurfaceError {
    #[error(
        "A degree-{degree} model over {variables} variables needs {expected} coefficients, but {found} were given."
    )]
    CoefficientCountMismatch {
        degree: usize,
        variables: usize,
        expected: usize,
        found: usize,
    },

    #[error("Model has degree {model}, but was evaluated with a degree-{basis} basis.")]
    DegreeMismatch { model: usize, basis: usize },

    #[error(transparent)]
    Basis(#[from] BasisError),
}

/// Inclusive clamp applied to every prediction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutputBounds {
    pub lower: f64,
    pub upper: f64,
}

impl Default for OutputBounds {
    fn default() -> Self {
        Self {
            lower: 0.0,
            upper: 1.0,
        }
    }
}

impl OutputBounds {
    /// Clamps `value` into `[lower, upper]`. A NaN lands on the lower bound.
    pub fn clamp(&self, value: f64) -> f64 {
        value.max(self.lower).min(self.upper)
    }
}

/// A polynomial surface fit to one neighborhood.
///
/// The coefficient vector always has exactly `C(m + degree, degree)` entries,
/// ordered like the terms of the `MonomialBasis` of the same degree.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalModel {
    degree: usize,
    coefficients: Array1<f64>,
}

impl LocalModel {
    /// Wraps `coefficients` for `basis`, rejecting any length other than the
    /// basis's monomial count.
    pub fn new(basis: &MonomialBasis, coefficients: Array1<f64>) -> Result<Self, SurfaceError> {
        if coefficients.len() != basis.len() {
            return Err(SurfaceError::CoefficientCountMismatch {
                degree: basis.degree(),
                variables: basis.variables(),
                expected: basis.len(),
                found: coefficients.len(),
            });
        }
        Ok(Self {
            degree: basis.degree(),
            coefficients,
        })
    }

    /// The degree-0 model: the mean of `targets`.
    pub fn mean(targets: ArrayView1<f64>) -> Self {
        Self {
            degree: 0,
            coefficients: Array1::from_elem(1, targets.mean().unwrap_or(0.0)),
        }
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    pub fn coefficients(&self) -> ArrayView1<'_, f64> {
        self.coefficients.view()
    }

    /// Evaluates the surface at `point`. `basis` must have the model's degree;
    /// degree-0 models ignore it and return their single coefficient.
    pub fn evaluate(
        &self,
        basis: &MonomialBasis,
        point: ArrayView1<f64>,
    ) -> Result<f64, SurfaceError> {
        if self.degree == 0 {
            return Ok(self.coefficients[0]);
        }
        if basis.degree() != self.degree {
            return Err(SurfaceError::DegreeMismatch {
                model: self.degree,
                basis: basis.degree(),
            });
        }
        let monomials = basis.expand(point)?;
        Ok(monomials.dot(&self.coefficients))
    }

    /// Evaluates the surface and clamps the result into `bounds`.
    pub fn predict(
        &self,
        basis: &MonomialBasis,
        point: ArrayView1<f64>,
        bounds: &OutputBounds,
    ) -> Result<f64, SurfaceError> {
        Ok(bounds.clamp(self.evaluate(basis, point)?))
    }

    /// Number of nonzero coefficients for each total degree `0..=degree`.
    pub fn degree_counts(&self, basis: &MonomialBasis) -> Vec<usize> {
        let mut counts = vec![0; self.degree + 1];
        if self.degree == 0 {
            counts[0] = usize::from(self.coefficients[0] != 0.0);
            return counts;
        }
        for (term, &c) in self.coefficients.iter().enumerate() {
            if c != 0.0 {
                counts[basis.term_degree(term)] += 1;
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn coefficient_count_is_enforced() {
        let basis = MonomialBasis::new(2, 2).unwrap();
        let err = LocalModel::new(&basis, array![1.0, 2.0, 3.0]).unwrap_err();
        assert_eq!(
            err,
            SurfaceError::CoefficientCountMismatch {
                degree: 2,
                variables: 2,
                expected: 6,
                found: 3
            }
        );
    }

    #[test]
    fn evaluates_in_basis_order() {
        let basis = MonomialBasis::new(2, 2).unwrap();
        // 1 + 2*x1 - x2 + 0.5*x1*x2
        let model = LocalModel::new(&basis, array![1.0, 2.0, -1.0, 0.0, 0.5, 0.0]).unwrap();
        let z = model.evaluate(&basis, array![2.0, 4.0].view()).unwrap();
        assert_abs_diff_eq!(z, 1.0 + 4.0 - 4.0 + 4.0, epsilon = 1e-12);
    }

    #[test]
    fn mean_model_returns_average() {
        let model = LocalModel::mean(array![1.0, 3.0, 5.0, 7.0].view());
        let basis = MonomialBasis::new(3, 0).unwrap();
        assert_eq!(model.degree(), 0);
        assert_eq!(
            model.evaluate(&basis, array![9.0, 9.0, 9.0].view()).unwrap(),
            4.0
        );
    }

    #[test]
    fn predictions_are_clamped() {
        let basis = MonomialBasis::new(1, 1).unwrap();
        let model = LocalModel::new(&basis, array![0.5, 10.0]).unwrap();
        let bounds = OutputBounds::default();
        assert_eq!(model.predict(&basis, array![1.0].view(), &bounds).unwrap(), 1.0);
        assert_eq!(model.predict(&basis, array![-1.0].view(), &bounds).unwrap(), 0.0);
        assert_eq!(model.predict(&basis, array![0.0].view(), &bounds).unwrap(), 0.5);
        assert_eq!(bounds.clamp(f64::NAN), 0.0);
    }

    #[test]
    fn wrong_basis_degree_is_rejected() {
        let quadratic = MonomialBasis::new(1, 2).unwrap();
        let linear = MonomialBasis::new(1, 1).unwrap();
        let model = LocalModel::new(&quadratic, array![1.0, 1.0, 1.0]).unwrap();
        assert!(matches!(
            model.evaluate(&linear, array![1.0].view()),
            Err(SurfaceError::DegreeMismatch { model: 2, basis: 1 })
        ));
    }

    #[test]
    fn degree_counts_tally_nonzero_terms() {
        let basis = MonomialBasis::new(2, 2).unwrap();
        let model = LocalModel::new(&basis, array![1.0, 0.0, 2.0, 3.0, 0.0, 4.0]).unwrap();
        assert_eq!(model.degree_counts(&basis), vec![1, 1, 2]);
    }
}
