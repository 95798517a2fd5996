//! Per-run diagnostics context.
//!
//! Every partition of a run returns its own `Diagnostics`; the coordinator
//! merges them. Nothing here is global or shared between workers.

use crate::surface::neighbors::Neighborhood;
use crate::surface::solver::{SolvePath, SolverError};
use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

// =============================================================================
// Fallback Records
// =============================================================================

/// Why a neighborhood's points were predicted with the degree-0 mean instead
/// of the model its selector asked for.
#[derive(Debug, Clone, PartialEq)]
pub enum FitFallback {
    /// The L1 penalty search could not meet its term target.
    PenaltyExhausted,
    /// The selected monomials did not span a full-rank reduced system.
    SingularReducedSystem { columns: usize, rank: usize },
    /// A linear solve failed on a system believed to be full rank.
    Numerical(String),
    /// Any other solver failure (a failed decomposition, or a dimension or
    /// coefficient-count inconsistency).
    Failed(String),
}

impl FitFallback {
    /// Maps a solver error from a final fit to its fallback record.
    pub fn from_solver_error(err: &SolverError) -> Self {
        match err {
            SolverError::SingularReducedSystem { columns, rank, .. } => {
                Self::SingularReducedSystem {
                    columns: *columns,
                    rank: *rank,
                }
            }
            SolverError::Numerical(inner) => Self::Numerical(inner.to_string()),
            other => Self::Failed(other.to_string()),
        }
    }
}

impl fmt::Display for FitFallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PenaltyExhausted => write!(f, "lasso penalty search exhausted"),
            Self::SingularReducedSystem { columns, rank } => {
                write!(f, "reduced system of {columns} columns has rank {rank}")
            }
            Self::Numerical(msg) => write!(f, "numerical failure: {msg}"),
            Self::Failed(msg) => write!(f, "fit failed: {msg}"),
        }
    }
}

// =============================================================================
// Reports
// =============================================================================

/// What happened while modeling one neighborhood.
#[derive(Debug, Clone, PartialEq)]
pub struct NeighborhoodReport {
    pub key: Neighborhood,
    /// Query points predicted with this neighborhood's model.
    pub members: usize,
    /// Degree of the model actually used (0 after a fallback).
    pub degree: usize,
    /// Held-out error per candidate degree; empty when no selection ran.
    pub sse_trace: Vec<f64>,
    /// Nonzero coefficients per total degree of the model used.
    pub degree_counts: Vec<usize>,
    pub path: SolvePath,
    pub fallback: Option<FitFallback>,
    /// Cross-validation fold fits that scored the failure penalty.
    pub penalized_fits: usize,
    /// Solver calls made for this neighborhood, selection included. A selection
    /// that aborted contributes nothing.
    pub solver_calls: usize,
}

/// The one-off degree selection of a global-adaptive run.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalSelection {
    pub degree: usize,
    pub sse_trace: Vec<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Diagnostics {
    pub neighborhoods: Vec<NeighborhoodReport>,
    pub global_selection: Option<GlobalSelection>,
}

impl Diagnostics {
    pub fn record(&mut self, report: NeighborhoodReport) {
        self.neighborhoods.push(report);
    }

    /// Folds a partition's diagnostics into this one.
    pub fn merge(&mut self, other: Diagnostics) {
        self.neighborhoods.extend(other.neighborhoods);
        if self.global_selection.is_none() {
            self.global_selection = other.global_selection;
        }
    }

    /// Number of neighborhood models fit, one per report.
    pub fn models_fitted(&self) -> usize {
        self.neighborhoods.len()
    }

    /// Total solver calls across every neighborhood.
    pub fn solver_calls(&self) -> usize {
        self.neighborhoods.iter().map(|r| r.solver_calls).sum()
    }

    pub fn penalized_fits(&self) -> usize {
        self.neighborhoods.iter().map(|r| r.penalized_fits).sum()
    }

    pub fn fallbacks(&self) -> impl Iterator<Item = (&Neighborhood, &FitFallback)> {
        self.neighborhoods
            .iter()
            .filter_map(|r| r.fallback.as_ref().map(|f| (&r.key, f)))
    }

    /// Number of neighborhoods modeled at each degree, indexed by degree.
    pub fn degree_histogram(&self) -> Vec<usize> {
        let top = self
            .neighborhoods
            .iter()
            .map(|r| r.degree)
            .max()
            .unwrap_or(0);
        let mut histogram = vec![0; top + 1];
        for report in &self.neighborhoods {
            histogram[report.degree] += 1;
        }
        histogram
    }

    /// Writes one comma-joined SSE trace per neighborhood.
    pub fn write_sse_trace(&self, path: &Path) -> io::Result<()> {
        let mut file = BufWriter::new(File::create(path)?);
        for report in &self.neighborhoods {
            writeln!(file, "{}", join(&report.sse_trace))?;
        }
        file.flush()
    }

    /// Writes one comma-joined nonzero-monomial count per degree, per neighborhood.
    pub fn write_degree_counts(&self, path: &Path) -> io::Result<()> {
        let mut file = BufWriter::new(File::create(path)?);
        for report in &self.neighborhoods {
            writeln!(file, "{}", join(&report.degree_counts))?;
        }
        file.flush()
    }
}

fn join<T: fmt::Display>(values: &[T]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
