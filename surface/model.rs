use crate::surface::basis::{MAX_MONOMIALS, monomial_count};
use crate::surface::crossval::FoldScheme;
use crate::surface::data::TableLayout;
use crate::surface::lasso::LassoSettings;
use crate::surface::normalize::TransformConfig;
use crate::surface::polynomial::OutputBounds;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

// --- Public Data Structures ---
// A run is described entirely by a `RunConfig`, which is saved to and loaded
// from human-readable TOML.

/// How each neighborhood's model degree is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelKind {
    /// Degree 0 everywhere: the mean of the k nearest targets.
    NeighborAverage,
    /// Cross-validation inside every neighborhood.
    LocalAdaptive,
    /// One cross-validated degree for the whole training set.
    GlobalAdaptive,
}

/// What the solver does when a local system is underdetermined.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum Sparsification {
    /// Minimum-norm least squares over every monomial.
    None,
    /// L1-penalized term selection.
    Lasso(LassoSettings),
    /// Random term subsets, each cross-validation fold tried `trials` times.
    Random { trials: usize },
}

/// Fold count and repetition of one cross-validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossValidation {
    /// `None` means leave-one-out.
    #[serde(default)]
    pub folds: Option<usize>,
    pub trials: usize,
}

impl CrossValidation {
    pub fn local_default() -> Self {
        Self {
            folds: None,
            trials: 1,
        }
    }

    pub fn global_default() -> Self {
        Self {
            folds: Some(10),
            trials: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum ExecutionStrategy {
    /// One in-memory neighborhood table, one fit per distinct neighborhood.
    SingleProcess,
    /// Queries split across a worker pool; `None` uses one worker per core.
    Distributed {
        #[serde(default)]
        workers: Option<usize>,
    },
}

/// The complete description of a prediction run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub model: ModelKind,
    /// Neighborhood size `k`.
    pub neighbors: usize,
    /// Highest candidate polynomial degree.
    pub max_degree: usize,
    /// Exponent `N` of the power-sum distance.
    pub distance_exponent: u32,
    pub sparsification: Sparsification,
    pub local_cv: CrossValidation,
    pub global_cv: CrossValidation,
    pub bounds: OutputBounds,
    pub transform: TransformConfig,
    pub layout: TableLayout,
    pub execution: ExecutionStrategy,
    /// Base seed. Drawn from entropy (and logged) when absent.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub show_progress: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            model: ModelKind::LocalAdaptive,
            neighbors: 10,
            max_degree: 3,
            distance_exponent: 2,
            sparsification: Sparsification::None,
            local_cv: CrossValidation::local_default(),
            global_cv: CrossValidation::global_default(),
            bounds: OutputBounds::default(),
            transform: TransformConfig::default(),
            layout: TableLayout::default(),
            execution: ExecutionStrategy::SingleProcess,
            seed: None,
            show_progress: false,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML config file: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize config to TOML format: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("An explicit scale of length {found} was given for {expected} covariates.")]
    ScaleLengthMismatch { expected: usize, found: usize },
    #[error(
        "Scale entry {index} is {value}; every scale must be finite and nonzero, and positive when a flatten exponent is set."
    )]
    InvalidScale { index: usize, value: f64 },
    #[error("Flatten exponent {0} is outside (0, 1].")]
    InvalidFlatten(f64),
    #[error("Output bounds [{lower}, {upper}] are not a finite, ordered range.")]
    InvalidBounds { lower: f64, upper: f64 },
    #[error("Neighborhood size must be at least 1.")]
    ZeroNeighbors,
    #[error("Distance exponent must be at least 1.")]
    ZeroDistanceExponent,
    #[error("Cross-validation needs at least 2 folds, got {0}.")]
    TooFewFolds(usize),
    #[error("Cross-validation needs at least 1 trial.")]
    ZeroTrials,
    #[error("Random sparsification needs at least 1 trial per fold.")]
    ZeroRandomTrials,
    #[error(
        "Lasso penalties must satisfy 0 < minimum ({min}) <= initial ({initial}), with at least one iteration."
    )]
    InvalidLasso { min: f64, initial: f64 },
    #[error(
        "Degree {degree} over {variables} covariates needs more than {max} monomials; lower the maximum degree."
    )]
    DegreeTooLarge {
        degree: usize,
        variables: usize,
        max: usize,
    },
}

impl RunConfig {
    /// Checks every setting against a run with `covariates` columns.
    pub fn validate(&self, covariates: usize) -> Result<(), ConfigError> {
        if let Some(scale) = &self.transform.scale {
            if scale.len() != covariates {
                return Err(ConfigError::ScaleLengthMismatch {
                    expected: covariates,
                    found: scale.len(),
                });
            }
            // Flattening raises shifted values to a fractional power, which
            // needs them non-negative.
            let positive = self.transform.flatten.is_some();
            if let Some((index, &value)) = scale
                .iter()
                .enumerate()
                .find(|&(_, &v)| !v.is_finite() || v == 0.0 || (positive && v < 0.0))
            {
                return Err(ConfigError::InvalidScale { index, value });
            }
        }
        if let Some(flatten) = self.transform.flatten {
            if !(flatten > 0.0 && flatten <= 1.0) {
                return Err(ConfigError::InvalidFlatten(flatten));
            }
        }

        let OutputBounds { lower, upper } = self.bounds;
        if !(lower.is_finite() && upper.is_finite() && lower <= upper) {
            return Err(ConfigError::InvalidBounds { lower, upper });
        }
        if self.neighbors == 0 {
            return Err(ConfigError::ZeroNeighbors);
        }
        if self.distance_exponent == 0 {
            return Err(ConfigError::ZeroDistanceExponent);
        }

        for cv in [self.local_cv, self.global_cv] {
            if let Some(folds) = cv.folds {
                if folds < 2 {
                    return Err(ConfigError::TooFewFolds(folds));
                }
            }
            if cv.trials == 0 {
                return Err(ConfigError::ZeroTrials);
            }
        }

        match self.sparsification {
            Sparsification::None => {}
            Sparsification::Random { trials } => {
                if trials == 0 {
                    return Err(ConfigError::ZeroRandomTrials);
                }
            }
            Sparsification::Lasso(settings) => {
                let valid = settings.min_penalty > 0.0
                    && settings.min_penalty <= settings.initial_penalty
                    && settings.initial_penalty.is_finite()
                    && settings.max_iterations > 0;
                if !valid {
                    return Err(ConfigError::InvalidLasso {
                        min: settings.min_penalty,
                        initial: settings.initial_penalty,
                    });
                }
            }
        }

        let degree = self.candidate_max_degree();
        match monomial_count(covariates, degree) {
            Some(count) if count <= MAX_MONOMIALS => Ok(()),
            _ => Err(ConfigError::DegreeTooLarge {
                degree,
                variables: covariates,
                max: MAX_MONOMIALS,
            }),
        }
    }

    /// The highest degree any neighborhood may be fit with.
    pub fn candidate_max_degree(&self) -> usize {
        match self.model {
            ModelKind::NeighborAverage => 0,
            ModelKind::LocalAdaptive | ModelKind::GlobalAdaptive => self.max_degree,
        }
    }

    /// Fold scheme for `cv` under this run's sparsification.
    pub fn fold_scheme(&self, cv: CrossValidation) -> FoldScheme {
        let attempts = match self.sparsification {
            Sparsification::Random { trials } => trials,
            _ => 1,
        };
        FoldScheme {
            folds: cv.folds,
            trials: cv.trials,
            attempts,
        }
    }

    /// Saves the configuration to a file in a human-readable TOML format.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Loads a configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        let config = toml::from_str(&toml_string)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_are_valid() {
        assert!(RunConfig::default().validate(4).is_ok());
    }

    #[test]
    fn save_and_load_preserve_every_setting() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.toml");
        let config = RunConfig {
            model: ModelKind::GlobalAdaptive,
            neighbors: 25,
            sparsification: Sparsification::Lasso(LassoSettings::default()),
            execution: ExecutionStrategy::Distributed { workers: Some(3) },
            transform: TransformConfig {
                scale: Some(vec![1.0, 0.5]),
                flatten: Some(0.5),
            },
            seed: Some(1234),
            ..RunConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(RunConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn scale_length_must_match_covariates() {
        let config = RunConfig {
            transform: TransformConfig {
                scale: Some(vec![1.0, 2.0]),
                flatten: None,
            },
            ..RunConfig::default()
        };
        assert!(matches!(
            config.validate(3),
            Err(ConfigError::ScaleLengthMismatch {
                expected: 3,
                found: 2
            })
        ));
        assert!(config.validate(2).is_ok());
    }

    #[test]
    fn flattening_requires_positive_scales() {
        let mut config = RunConfig {
            transform: TransformConfig {
                scale: Some(vec![-1.0, -1.0]),
                flatten: None,
            },
            ..RunConfig::default()
        };
        assert!(config.validate(2).is_ok());

        config.transform.flatten = Some(0.5);
        assert!(matches!(
            config.validate(2),
            Err(ConfigError::InvalidScale { index: 0, value }) if value == -1.0
        ));

        config.transform.scale = Some(vec![2.0, 0.5]);
        assert!(config.validate(2).is_ok());
    }

    #[test]
    fn out_of_range_settings_are_rejected() {
        let flat = RunConfig {
            transform: TransformConfig {
                scale: None,
                flatten: Some(1.5),
            },
            ..RunConfig::default()
        };
        assert!(matches!(flat.validate(2), Err(ConfigError::InvalidFlatten(_))));

        let bounds = RunConfig {
            bounds: OutputBounds {
                lower: 1.0,
                upper: 0.0,
            },
            ..RunConfig::default()
        };
        assert!(matches!(bounds.validate(2), Err(ConfigError::InvalidBounds { .. })));

        let folds = RunConfig {
            global_cv: CrossValidation {
                folds: Some(1),
                trials: 3,
            },
            ..RunConfig::default()
        };
        assert!(matches!(folds.validate(2), Err(ConfigError::TooFewFolds(1))));

        let huge = RunConfig {
            max_degree: 12,
            ..RunConfig::default()
        };
        assert!(matches!(huge.validate(40), Err(ConfigError::DegreeTooLarge { .. })));
    }

    #[test]
    fn neighbor_average_never_needs_more_than_the_constant() {
        let config = RunConfig {
            model: ModelKind::NeighborAverage,
            max_degree: 50,
            ..RunConfig::default()
        };
        assert_eq!(config.candidate_max_degree(), 0);
        assert!(config.validate(100).is_ok());
    }

    #[test]
    fn random_trials_become_fold_attempts() {
        let config = RunConfig {
            sparsification: Sparsification::Random { trials: 4 },
            ..RunConfig::default()
        };
        let scheme = config.fold_scheme(config.global_cv);
        assert_eq!(scheme.attempts, 4);
        assert_eq!(scheme.folds, Some(10));
        assert_eq!(scheme.trials, 10);
    }
}
