//! L1-penalized term selection for underdetermined local systems.
//!
//! `fit_lasso` minimizes `(1/2n)||y - b - Xw||^2 + alpha * ||w||_1` by cyclic
//! coordinate descent on mean-centered columns (the intercept `b` is implicit).
//! `select_terms` searches over `alpha` until the number of surviving columns
//! lands in a target range.

use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Coefficient changes below this end the coordinate descent.
const CONVERGENCE_TOLERANCE: f64 = 1e-10;

/// Hard cap on penalty adjustments in one search.
const MAX_PENALTY_STEPS: usize = 512;

/// Parameters of the adaptive penalty search.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LassoSettings {
    /// Penalty the search starts from, and restarts from after relaxing its target.
    pub initial_penalty: f64,
    /// Below this penalty the target range is relaxed (or the search gives up).
    pub min_penalty: f64,
    /// Coordinate-descent sweeps per fit.
    pub max_iterations: usize,
}

impl Default for LassoSettings {
    fn default() -> Self {
        Self {
            initial_penalty: 1.0,
            min_penalty: 2f64.powi(-9),
            max_iterations: 4096,
        }
    }
}

/// Outcome of `select_terms`.
#[derive(Debug, Clone, PartialEq)]
pub enum TermSearch {
    /// Column indices with nonzero L1 coefficients, ascending.
    Selected(Vec<usize>),
    /// The penalty underflowed with nothing left to relax, or the search ran
    /// out of steps. The caller degrades to the mean.
    Exhausted { last_penalty: f64 },
}

fn soft_threshold(value: f64, threshold: f64) -> f64 {
    if value > threshold {
        value - threshold
    } else if value < -threshold {
        value + threshold
    } else {
        0.0
    }
}

/// Fits L1-penalized least squares with an implicit intercept.
pub fn fit_lasso(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    alpha: f64,
    max_iterations: usize,
) -> Array1<f64> {
    let (n, p) = x.dim();
    let mut w = Array1::zeros(p);
    if n == 0 || p == 0 {
        return w;
    }

    let x_mean = x.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(p));
    let x_c = &x - &x_mean.insert_axis(Axis(0));
    let y_c = &y - y.mean().unwrap_or(0.0);
    let col_norms: Vec<f64> = x_c.columns().into_iter().map(|c| c.dot(&c)).collect();
    let lambda = alpha * n as f64;

    let mut residual = y_c;
    for _ in 0..max_iterations {
        let mut max_change: f64 = 0.0;
        for j in 0..p {
            if col_norms[j] < 1e-15 {
                continue;
            }
            let column = x_c.column(j);
            let old = w[j];
            let rho = column.dot(&residual) + col_norms[j] * old;
            let updated = soft_threshold(rho, lambda) / col_norms[j];
            if updated != old {
                residual.scaled_add(old - updated, &column);
                w[j] = updated;
                max_change = max_change.max((updated - old).abs());
            }
        }
        if max_change < CONVERGENCE_TOLERANCE {
            break;
        }
    }
    w
}

fn nonzero_columns(w: &Array1<f64>) -> Vec<usize> {
    w.iter()
        .enumerate()
        .filter(|&(_, &c)| c != 0.0)
        .map(|(j, _)| j)
        .collect()
}

/// Searches the penalty until between `low` and `high` columns survive.
///
/// Too few survivors halve the penalty; too many multiply it by 1.5, so the
/// search never revisits a value. When the penalty drops below the minimum
/// the lower target is relaxed by one and the search restarts; once `low`
/// reaches one the search is exhausted.
pub fn select_terms(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    low: usize,
    high: usize,
    settings: &LassoSettings,
) -> TermSearch {
    let high = high.min(x.ncols());
    let mut low = low.min(high);
    let mut alpha = settings.initial_penalty;
    let mut selected = nonzero_columns(&fit_lasso(x, y, alpha, settings.max_iterations));

    for _ in 0..MAX_PENALTY_STEPS {
        let count = selected.len();
        if count >= low && count <= high {
            log::trace!("Lasso kept {count} terms with penalty {alpha:.3e} (target {low}..={high})");
            return TermSearch::Selected(selected);
        }

        alpha /= 2.0;
        if count > high {
            alpha *= 3.0;
        }
        if alpha < settings.min_penalty {
            if low > 1 {
                low -= 1;
                alpha = settings.initial_penalty;
            } else {
                return TermSearch::Exhausted {
                    last_penalty: alpha,
                };
            }
        }
        selected = nonzero_columns(&fit_lasso(x, y, alpha, settings.max_iterations));
    }

    TermSearch::Exhausted {
        last_penalty: alpha,
    }
}
