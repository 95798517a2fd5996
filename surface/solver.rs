//! # Coefficient Solver
//!
//! Fits the coefficients of one local polynomial surface to a neighborhood's
//! normalized covariates and targets.
//!
//! 1. Degree 0 is the target mean, always; it never reaches term selection.
//! 2. A design matrix with full column rank (decided from its singular values,
//!    never a determinant, which underflows long before rank is lost) is solved
//!    by ordinary least squares through the normal equations. A failure there
//!    is a genuine numerical error and is returned as such.
//! 3. Otherwise the system is underdetermined. Targets are centered on their
//!    mean, at most `rows - 1` non-constant monomials are chosen by a
//!    `TermSelection`, the reduced system is solved by least squares, the
//!    solution is scattered back into the full coefficient vector, and the mean
//!    is restored into the constant coefficient.

use crate::surface::basis::{BasisError, MonomialBasis};
use crate::surface::lasso::{self, LassoSettings, TermSearch};
use crate::surface::polynomial::{LocalModel, SurfaceError};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use ndarray_linalg::error::LinalgError;
use ndarray_linalg::{LeastSquaresSvd, SVD, Solve};
use rand::Rng;
use rand::seq::index;
use thiserror::Error;

/// How monomials are chosen when the local system is underdetermined.
#[derive(Debug, Clone, PartialEq)]
pub enum TermSelection<'a> {
    /// No selection: the minimum-norm least-squares solution over every monomial.
    MinimumNorm,
    /// L1-penalized regression with an adaptive penalty search.
    Lasso(LassoSettings),
    /// A uniformly random subset of `rows - 1` monomials plus the constant.
    Random,
    /// The monomials with the largest summed absolute coefficients across the
    /// given prior fits (cross-validation folds of the same neighborhood).
    /// Falls back to `Random` when no prior fit has the right shape.
    FrequencyWeighted(&'a [Array1<f64>]),
}

/// Which branch of the solver produced a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolvePath {
    Mean,
    FullRank,
    /// Underdetermined; `selected` non-constant monomials were kept.
    Sparse { selected: usize },
    MinimumNorm,
    /// The L1 search could not meet its target; the model is the target mean.
    Degraded,
}

/// A fitted surface and how it was obtained.
#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceFit {
    pub model: LocalModel,
    pub path: SolvePath,
}

#[derive(Error, Debug)]
pub enum SolverError {
    #[error("Cannot fit a surface to an empty set of points.")]
    NoPoints,

    #[error("Got {points} points but {targets} target values.")]
    ShapeMismatch { points: usize, targets: usize },

    #[error(transparent)]
    Basis(#[from] BasisError),

    #[error(transparent)]
    Surface(#[from] SurfaceError),

    #[error("A linear solve failed on a system believed to be full rank: {0}")]
    Numerical(#[source] LinalgError),

    /// A rank test or least-squares decomposition of a candidate system failed.
    #[error("Decomposition of a {rows} x {columns} candidate system failed: {source}")]
    Decomposition {
        rows: usize,
        columns: usize,
        #[source]
        source: LinalgError,
    },

    #[error(
        "The {columns} selected monomials have rank {rank} over {rows} points; the reduced system is singular."
    )]
    SingularReducedSystem {
        rows: usize,
        columns: usize,
        rank: usize,
    },
}

impl SolverError {
    /// Whether this failure should abort the caller rather than be scored
    /// as a failed candidate. Only a broken solve of a full-rank system is.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Numerical(_))
    }
}

/// Numerical rank: singular values above `s_max * max(rows, cols) * eps`.
pub fn numerical_rank(matrix: &Array2<f64>) -> Result<usize, LinalgError> {
    if matrix.is_empty() {
        return Ok(0);
    }
    let (rows, cols) = matrix.dim();
    let (_, singular_values, _) = matrix.svd(false, false)?;
    let largest = singular_values.iter().cloned().fold(0.0_f64, f64::max);
    let tolerance = largest * rows.max(cols) as f64 * f64::EPSILON;
    Ok(singular_values.iter().filter(|&&v| v > tolerance).count())
}

/// Fits a surface of `basis.degree()` to `points` and `targets`.
pub fn fit_surface(
    points: ArrayView2<f64>,
    targets: ArrayView1<f64>,
    basis: &MonomialBasis,
    selection: &TermSelection<'_>,
    rng: &mut impl Rng,
) -> Result<SurfaceFit, SolverError> {
    let rows = points.nrows();
    if rows == 0 {
        return Err(SolverError::NoPoints);
    }
    if targets.len() != rows {
        return Err(SolverError::ShapeMismatch {
            points: rows,
            targets: targets.len(),
        });
    }

    if basis.degree() == 0 {
        return Ok(SurfaceFit {
            model: LocalModel::mean(targets),
            path: SolvePath::Mean,
        });
    }

    let design = basis.design_matrix(points)?;
    let columns = design.ncols();
    let decomposition = |source| SolverError::Decomposition {
        rows,
        columns,
        source,
    };
    if rows >= columns && numerical_rank(&design).map_err(decomposition)? == columns {
        let design_t = design.t();
        let gram = design_t.dot(&design);
        let moments = design_t.dot(&targets);
        let coefficients = gram.solve(&moments).map_err(SolverError::Numerical)?;
        return Ok(SurfaceFit {
            model: LocalModel::new(basis, coefficients)?,
            path: SolvePath::FullRank,
        });
    }

    let mean = targets.mean().unwrap_or(0.0);
    let centered = &targets - mean;
    let budget = (rows - 1).min(columns - 1);

    let (columns_kept, path) = match selection {
        TermSelection::MinimumNorm => {
            let mut coefficients = design
                .least_squares(&centered)
                .map_err(decomposition)?
                .solution;
            coefficients[0] += mean;
            return Ok(SurfaceFit {
                model: LocalModel::new(basis, coefficients)?,
                path: SolvePath::MinimumNorm,
            });
        }
        TermSelection::Lasso(settings) => {
            let candidates = design.slice(s![.., 1..]);
            match lasso::select_terms(candidates, centered.view(), budget, budget, settings) {
                TermSearch::Selected(kept) => {
                    let kept: Vec<usize> = kept.into_iter().map(|j| j + 1).collect();
                    let selected = kept.len();
                    (kept, SolvePath::Sparse { selected })
                }
                TermSearch::Exhausted { last_penalty } => {
                    log::debug!(
                        "Lasso search exhausted at penalty {last_penalty:.3e}; using the mean of {rows} points"
                    );
                    return Ok(SurfaceFit {
                        model: LocalModel::mean(targets),
                        path: SolvePath::Degraded,
                    });
                }
            }
        }
        TermSelection::Random => random_terms(columns, budget, rng),
        TermSelection::FrequencyWeighted(prior) => {
            match frequency_weighted_terms(prior, columns, budget) {
                Some(kept) => kept,
                None => random_terms(columns, budget, rng),
            }
        }
    };

    let mut coefficients = Array1::zeros(columns);
    if !columns_kept.is_empty() {
        let reduced = design.select(Axis(1), &columns_kept);
        let rank = numerical_rank(&reduced).map_err(decomposition)?;
        if rank < columns_kept.len() {
            return Err(SolverError::SingularReducedSystem {
                rows,
                columns: columns_kept.len(),
                rank,
            });
        }
        let solved = reduced.least_squares(&centered).map_err(decomposition)?;
        for (&column, &value) in columns_kept.iter().zip(solved.solution.iter()) {
            coefficients[column] = value;
        }
    }
    coefficients[0] += mean;

    Ok(SurfaceFit {
        model: LocalModel::new(basis, coefficients)?,
        path,
    })
}

/// The constant plus `budget` distinct non-constant monomials drawn uniformly.
fn random_terms(columns: usize, budget: usize, rng: &mut impl Rng) -> (Vec<usize>, SolvePath) {
    let mut kept: Vec<usize> = index::sample(rng, columns - 1, budget)
        .into_iter()
        .map(|j| j + 1)
        .collect();
    kept.sort_unstable();
    kept.insert(0, 0);
    (kept, SolvePath::Sparse { selected: budget })
}

/// The constant plus up to `budget` non-constant monomials ranked by summed
/// absolute coefficient across `prior`. Returns `None` when no prior fit
/// matches `columns` or every aggregate is zero.
fn frequency_weighted_terms(
    prior: &[Array1<f64>],
    columns: usize,
    budget: usize,
) -> Option<(Vec<usize>, SolvePath)> {
    let mut weights = Array1::<f64>::zeros(columns);
    let mut used = 0usize;
    for coefficients in prior.iter().filter(|c| c.len() == columns) {
        weights.zip_mut_with(coefficients, |w, &c| *w += c.abs());
        used += 1;
    }
    if used == 0 {
        return None;
    }

    let mut ranked: Vec<usize> = (1..columns).filter(|&j| weights[j] > 0.0).collect();
    if ranked.is_empty() {
        return None;
    }
    ranked.sort_by(|&a, &b| weights[b].total_cmp(&weights[a]));
    ranked.truncate(budget);
    ranked.sort_unstable();

    let selected = ranked.len();
    let mut kept = Vec::with_capacity(selected + 1);
    kept.push(0);
    kept.extend(ranked);
    Some((kept, SolvePath::Sparse { selected }))
}
