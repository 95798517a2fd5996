//! # Degree Selection by Cross-Validation
//!
//! Each trial shuffles the point indices and deals them into `F` folds, fold
//! `f` taking every `F`-th shuffled index starting at `f`. Every candidate
//! degree `0..=max_degree` is fit on each fold's complement and scored by the
//! squared error it makes on the held-out fold. Errors accumulate across folds
//! and trials; the degree with the smallest total wins, the lowest degree
//! winning ties.
//!
//! A candidate that cannot be fit scores `FAILED_FIT_SSE` for that fold rather
//! than aborting the search. Only a numerical failure of a system believed to
//! be full rank is propagated.

use crate::surface::basis::{BasisSet, MonomialBasis};
use crate::surface::solver::{self, SolverError, TermSelection};
use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use rand::Rng;
use rand::seq::SliceRandom;

/// Held-out error charged to a candidate fit that failed.
pub const FAILED_FIT_SSE: f64 = 1e30;

/// How points are split and how often.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FoldScheme {
    /// Requested fold count. Clamped to `2..=n`; `None` is leave-one-out.
    pub folds: Option<usize>,
    /// Independent shuffles.
    pub trials: usize,
    /// Fits attempted per fold under random term selection; the best is kept.
    pub attempts: usize,
}

impl FoldScheme {
    pub fn leave_one_out() -> Self {
        Self {
            folds: None,
            trials: 1,
            attempts: 1,
        }
    }

    fn fold_count(&self, points: usize) -> usize {
        self.folds.unwrap_or(points).clamp(2, points.max(2))
    }
}

/// The chosen degree and the evidence behind it.
#[derive(Debug, Clone, PartialEq)]
pub struct DegreeSelection {
    pub degree: usize,
    /// Total held-out error per candidate degree. Empty when selection was skipped.
    pub sse_trace: Vec<f64>,
    /// Best coefficients of every fold fit at the chosen degree.
    pub fold_coefficients: Vec<Array1<f64>>,
    /// Fold fits that scored the failure penalty, across all degrees.
    pub penalized_fits: usize,
    /// Calls into the coefficient solver made while selecting.
    pub candidate_fits: usize,
}

impl DegreeSelection {
    /// Selection for sets too small to split.
    pub fn constant() -> Self {
        Self {
            degree: 0,
            sse_trace: Vec::new(),
            fold_coefficients: Vec::new(),
            penalized_fits: 0,
            candidate_fits: 0,
        }
    }
}

/// One fold fit's score.
struct CandidateFit {
    sse: f64,
    coefficients: Array1<f64>,
}

fn fit_candidate(
    points: ArrayView2<f64>,
    targets: ArrayView1<f64>,
    train: &[usize],
    test: &[usize],
    basis: &MonomialBasis,
    selection: &TermSelection<'_>,
    rng: &mut impl Rng,
) -> Result<CandidateFit, SolverError> {
    let train_points = points.select(Axis(0), train);
    let train_targets = targets.select(Axis(0), train);
    let fit = solver::fit_surface(
        train_points.view(),
        train_targets.view(),
        basis,
        selection,
        rng,
    )?;

    let mut sse = 0.0;
    for &row in test {
        let predicted = fit.model.evaluate(basis, points.row(row))?;
        sse += (predicted - targets[row]).powi(2);
    }
    if !sse.is_finite() {
        sse = FAILED_FIT_SSE;
    }
    Ok(CandidateFit {
        sse,
        coefficients: fit.model.coefficients().to_owned(),
    })
}

/// Chooses a degree in `0..=bases.max_degree()` for `points` and `targets`.
pub fn select_degree(
    points: ArrayView2<f64>,
    targets: ArrayView1<f64>,
    bases: &BasisSet,
    scheme: &FoldScheme,
    selection: &TermSelection<'_>,
    rng: &mut impl Rng,
) -> Result<DegreeSelection, SolverError> {
    let n = points.nrows();
    if n < 2 {
        return Ok(DegreeSelection::constant());
    }

    let fold_count = scheme.fold_count(n);
    let attempts = match selection {
        TermSelection::Random => scheme.attempts.max(1),
        _ => 1,
    };
    let degrees = bases.max_degree() + 1;
    let mut totals = vec![0.0; degrees];
    let mut coefficients: Vec<Vec<Array1<f64>>> = vec![Vec::new(); degrees];
    let mut penalized_fits = 0;
    let mut candidate_fits = 0;

    let mut order: Vec<usize> = (0..n).collect();
    for _ in 0..scheme.trials {
        order.shuffle(rng);
        let folds: Vec<Vec<usize>> = (0..fold_count)
            .map(|f| order.iter().skip(f).step_by(fold_count).copied().collect())
            .collect();

        for degree in 0..degrees {
            let Some(basis) = bases.get(degree) else {
                break;
            };
            for (held_out, test) in folds.iter().enumerate() {
                let train: Vec<usize> = folds
                    .iter()
                    .enumerate()
                    .filter(|&(f, _)| f != held_out)
                    .flat_map(|(_, fold)| fold.iter().copied())
                    .collect();

                let mut best: Option<CandidateFit> = None;
                for _ in 0..attempts {
                    candidate_fits += 1;
                    match fit_candidate(
                        points, targets, &train, test, basis, selection, rng,
                    ) {
                        Ok(fit) => {
                            if best.as_ref().is_none_or(|b| fit.sse < b.sse) {
                                best = Some(fit);
                            }
                        }
                        Err(err) if err.is_fatal() => return Err(err),
                        Err(err) => {
                            log::debug!("Degree {degree} candidate failed on fold {held_out}: {err}");
                        }
                    }
                }

                match best {
                    Some(fit) => {
                        totals[degree] += fit.sse;
                        coefficients[degree].push(fit.coefficients);
                    }
                    None => {
                        totals[degree] += FAILED_FIT_SSE;
                        penalized_fits += 1;
                    }
                }
            }
        }
    }

    let mut degree = 0;
    for (d, &total) in totals.iter().enumerate() {
        if total < totals[degree] {
            degree = d;
        }
    }

    Ok(DegreeSelection {
        degree,
        sse_trace: totals,
        fold_coefficients: coefficients.swap_remove(degree),
        penalized_fits,
        candidate_fits,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::lasso::LassoSettings;
    use ndarray::{Array1, Array2, array};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn line(n: usize) -> (Array2<f64>, Array1<f64>) {
        let points = Array2::from_shape_fn((n, 1), |(i, _)| i as f64 / n as f64);
        let targets = points.column(0).mapv(|x| 0.2 + 0.5 * x);
        (points, targets)
    }

    #[test]
    fn exact_linear_data_prefers_degree_one() {
        let (points, targets) = line(8);
        let bases = BasisSet::new(1, 1).unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        let selection = select_degree(
            points.view(),
            targets.view(),
            &bases,
            &FoldScheme::leave_one_out(),
            &TermSelection::MinimumNorm,
            &mut rng,
        )
        .unwrap();
        assert_eq!(selection.degree, 1);
        assert_eq!(selection.sse_trace.len(), 2);
        assert!(selection.sse_trace[1] < 1e-20);
        assert_eq!(selection.fold_coefficients.len(), 8);
    }

    #[test]
    fn constant_data_keeps_degree_zero() {
        let points = array![[0.0, 1.0], [1.0, 0.0], [0.5, 0.5], [0.2, 0.9], [0.8, 0.3]];
        let targets = Array1::from_elem(5, 0.5);
        let bases = BasisSet::new(2, 2).unwrap();
        let mut rng = StdRng::seed_from_u64(9);
        let selection = select_degree(
            points.view(),
            targets.view(),
            &bases,
            &FoldScheme::leave_one_out(),
            &TermSelection::Lasso(LassoSettings::default()),
            &mut rng,
        )
        .unwrap();
        assert_eq!(selection.degree, 0);
        assert_eq!(selection.sse_trace[0], 0.0);
    }

    #[test]
    fn tiny_sets_skip_selection() {
        let points = array![[0.3]];
        let targets = array![0.5];
        let bases = BasisSet::new(1, 3).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let selection = select_degree(
            points.view(),
            targets.view(),
            &bases,
            &FoldScheme::leave_one_out(),
            &TermSelection::Random,
            &mut rng,
        )
        .unwrap();
        assert_eq!(selection, DegreeSelection::constant());
    }

    #[test]
    fn same_seed_same_selection() {
        let (points, mut targets) = line(12);
        targets[3] += 0.1;
        targets[7] -= 0.05;
        let bases = BasisSet::new(1, 3).unwrap();
        let scheme = FoldScheme {
            folds: Some(4),
            trials: 3,
            attempts: 2,
        };
        let run = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            select_degree(
                points.view(),
                targets.view(),
                &bases,
                &scheme,
                &TermSelection::Random,
                &mut rng,
            )
            .unwrap()
        };
        assert_eq!(run(17), run(17));
        assert_eq!(run(17).fold_coefficients.len(), 12);
    }

    #[test]
    fn unfittable_candidates_score_the_penalty() {
        // A zero covariate leaves the degree-1 reduced system singular on every fold.
        let points = array![[0.1, 0.0], [0.4, 0.0], [0.6, 0.0], [0.9, 0.0]];
        let targets = array![0.2, 0.3, 0.5, 0.6];
        let bases = BasisSet::new(2, 1).unwrap();
        let mut rng = StdRng::seed_from_u64(21);
        let selection = select_degree(
            points.view(),
            targets.view(),
            &bases,
            &FoldScheme::leave_one_out(),
            &TermSelection::Random,
            &mut rng,
        )
        .unwrap();
        assert_eq!(selection.penalized_fits, 4);
        assert!(selection.sse_trace[1] >= FAILED_FIT_SSE);
        assert!(selection.sse_trace[0] < 1.0);
        assert_eq!(selection.degree, 0);
        assert_eq!(selection.fold_coefficients.len(), 4);
        assert_eq!(selection.candidate_fits, 8);
    }

    #[test]
    fn fold_count_is_clamped_to_the_point_count() {
        let scheme = FoldScheme {
            folds: Some(10),
            trials: 1,
            attempts: 1,
        };
        assert_eq!(scheme.fold_count(4), 4);
        assert_eq!(FoldScheme::leave_one_out().fold_count(6), 6);
        assert_eq!(scheme.fold_count(2), 2);
    }
}
