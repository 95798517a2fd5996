//! # Feature Normalization
//!
//! Covariates arrive in wildly different units (elevation in metres, slope in
//! degrees, reflectances in `[0, 1]`). Before any distance is measured they are
//! mapped through `((v - shift) * scale) ^ flatten`, column by column.
//!
//! - `shift` is the training mean of each column, or, when a flatten exponent
//!   is requested, the minimum over training and query points together so that
//!   every shifted value is non-negative before the fractional power.
//! - `scale` is either user supplied or the reciprocal of the training
//!   standard deviation.
//! - `flatten` is a sublinear exponent in `(0, 1]` that compresses skewed
//!   covariates; `1` leaves values untouched.
//!
//! The parameters are computed once per run and applied identically, and
//! without state, to every training and query vector.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// User-facing normalization settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformConfig {
    /// Explicit per-covariate multipliers. Defaults to `1 / std` of the training data.
    #[serde(default)]
    pub scale: Option<Vec<f64>>,
    /// Sublinear exponent in `(0, 1]`. When set, covariates are shifted to be non-negative.
    #[serde(default)]
    pub flatten: Option<f64>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NormalizeError {
    #[error("An explicit scale of length {found} was given for {expected} covariates.")]
    ScaleLengthMismatch { expected: usize, found: usize },

    #[error("Cannot derive normalization parameters from an empty training set.")]
    EmptyTrainingSet,

    #[error("Training data has {training} covariates but query data has {query}.")]
    ColumnMismatch { training: usize, query: usize },
}

/// Shift, scale and flatten parameters for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTransform {
    shift: Array1<f64>,
    scale: Array1<f64>,
    flatten: f64,
}

impl FeatureTransform {
    /// Derives the run's parameters from the raw training and query covariates.
    pub fn fit(
        training: ArrayView2<f64>,
        query: ArrayView2<f64>,
        config: &TransformConfig,
    ) -> Result<Self, NormalizeError> {
        let m = training.ncols();
        if training.nrows() == 0 {
            return Err(NormalizeError::EmptyTrainingSet);
        }
        if query.ncols() != m {
            return Err(NormalizeError::ColumnMismatch {
                training: m,
                query: query.ncols(),
            });
        }

        let shift = match config.flatten {
            Some(_) => Zip::from(&column_minimum(training))
                .and(&column_minimum(query))
                .map_collect(|&a, &b| a.min(b)),
            None => training
                .mean_axis(Axis(0))
                .ok_or(NormalizeError::EmptyTrainingSet)?,
        };

        let scale = match &config.scale {
            Some(explicit) => {
                if explicit.len() != m {
                    return Err(NormalizeError::ScaleLengthMismatch {
                        expected: m,
                        found: explicit.len(),
                    });
                }
                Array1::from_vec(explicit.clone())
            }
            None => training
                .std_axis(Axis(0), 0.0)
                .iter()
                .enumerate()
                .map(|(column, &sd)| {
                    if sd > 0.0 && sd.is_finite() {
                        1.0 / sd
                    } else {
                        log::warn!(
                            "Covariate {column} has zero spread in the training data; leaving it unscaled."
                        );
                        1.0
                    }
                })
                .collect(),
        };

        let flatten = config.flatten.unwrap_or(1.0);
        log::info!("Normalization shift: {shift}");
        log::info!("Normalization scale: {scale}");
        log::info!("Normalization flatten exponent: {flatten}");

        Ok(Self {
            shift,
            scale,
            flatten,
        })
    }

    pub fn shift(&self) -> ArrayView1<'_, f64> {
        self.shift.view()
    }

    pub fn scale(&self) -> ArrayView1<'_, f64> {
        self.scale.view()
    }

    pub fn flatten(&self) -> f64 {
        self.flatten
    }

    /// Transforms a single covariate vector.
    pub fn apply(&self, row: ArrayView1<f64>) -> Array1<f64> {
        let flatten = self.flatten;
        Zip::from(&row)
            .and(&self.shift)
            .and(&self.scale)
            .map_collect(|&v, &shift, &scale| {
                let scaled = (v - shift) * scale;
                if flatten == 1.0 {
                    scaled
                } else {
                    scaled.powf(flatten)
                }
            })
    }

    /// Transforms every row of `rows`.
    pub fn apply_rows(&self, rows: ArrayView2<f64>) -> Array2<f64> {
        let mut out = Array2::zeros(rows.raw_dim());
        for (mut target, row) in out.rows_mut().into_iter().zip(rows.rows()) {
            target.assign(&self.apply(row));
        }
        out
    }
}

fn column_minimum(values: ArrayView2<f64>) -> Array1<f64> {
    values.fold_axis(Axis(0), f64::INFINITY, |&acc, &v| acc.min(v))
}
