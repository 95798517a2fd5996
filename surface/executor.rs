//! # Execution Coordinator
//!
//! Drives a whole prediction run:
//!
//! 1. Validate the configuration against the data and derive the normalization.
//! 2. For a global-adaptive run, choose one degree over the full training set.
//! 3. Split the queries into partitions. Each partition locates every query's
//!    neighborhood, groups queries by neighborhood, fits exactly one model per
//!    distinct neighborhood it owns, and evaluates every member against it.
//! 4. Concatenate partition outputs and merge their diagnostics.
//!
//! A single-process run is one partition covering every query. A distributed
//! run hands contiguous partitions to a rayon pool; a neighborhood that shows
//! up in two partitions is fit twice, with identical results, because every
//! neighborhood's random stream is derived from the base seed and its own key.
//!
//! A neighborhood whose fit fails is logged and predicted with its target
//! mean. Configuration and data problems abort before any fitting begins.

use crate::surface::basis::{BasisError, BasisSet};
use crate::surface::crossval::{self, DegreeSelection};
use crate::surface::data::{self, DataError, Prediction, QuerySet, TrainingSet};
use crate::surface::diagnostics::{Diagnostics, FitFallback, GlobalSelection, NeighborhoodReport};
use crate::surface::model::{ConfigError, ExecutionStrategy, ModelKind, RunConfig, Sparsification};
use crate::surface::neighbors::{self, LocateError, Neighborhood, NeighborhoodGroups};
use crate::surface::normalize::{FeatureTransform, NormalizeError};
use crate::surface::polynomial::{LocalModel, SurfaceError};
use crate::surface::solver::{self, SolvePath, SolverError, TermSelection};
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use rayon::prelude::*;
use std::ops::Range;
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Invalid input data: {0}")]
    Data(#[from] DataError),
    #[error("Normalization failed: {0}")]
    Normalize(#[from] NormalizeError),
    #[error("Neighbor search failed: {0}")]
    Locate(#[from] LocateError),
    #[error(transparent)]
    Basis(#[from] BasisError),
    #[error("A fitted model is inconsistent with its basis: {0}")]
    Surface(#[from] SurfaceError),
    #[error("Global degree selection failed: {0}")]
    GlobalSelection(#[source] SolverError),
    #[error("Failed to start the worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("A global-adaptive neighborhood was fit before the global degree was selected.")]
    MissingGlobalSelection,
}

/// Output of a completed run.
#[derive(Debug, Clone)]
pub struct PredictionRun {
    /// One prediction per query, in query order.
    pub predictions: Vec<Prediction>,
    pub diagnostics: Diagnostics,
    /// Seed every random choice of the run derives from; reusing it repeats the run.
    pub base_seed: u64,
}

/// Read-only state shared by every partition.
struct RunContext<'a> {
    config: &'a RunConfig,
    training: ArrayView2<'a, f64>,
    targets: ArrayView1<'a, f64>,
    queries: ArrayView2<'a, f64>,
    coordinates: ArrayView2<'a, f64>,
    bases: &'a BasisSet,
    base_seed: u64,
    global: Option<&'a DegreeSelection>,
    progress: Option<&'a ProgressBar>,
}

/// Predicts every point of `query` from `training`.
pub fn run_prediction(
    training: &TrainingSet,
    query: &QuerySet,
    config: &RunConfig,
) -> Result<PredictionRun, RunError> {
    let start = Instant::now();
    data::check_compatible(training, query)?;
    if training.is_empty() {
        return Err(LocateError::EmptyTrainingSet.into());
    }
    let covariates = training.covariates.ncols();
    config.validate(covariates)?;

    let transform = FeatureTransform::fit(
        training.covariates.view(),
        query.covariates.view(),
        &config.transform,
    )?;
    let training_rows = transform.apply_rows(training.covariates.view());
    let query_rows = transform.apply_rows(query.covariates.view());
    let bases = BasisSet::new(covariates, config.candidate_max_degree())?;

    let base_seed = config
        .seed
        .unwrap_or_else(|| StdRng::from_entropy().next_u64());
    log::info!("Base seed: {base_seed}");

    let global = match config.model {
        ModelKind::GlobalAdaptive => {
            let mut rng = StdRng::seed_from_u64(base_seed);
            let selection = crossval::select_degree(
                training_rows.view(),
                training.targets.view(),
                &bases,
                &config.fold_scheme(config.global_cv),
                &term_selection(config.sparsification, None),
                &mut rng,
            )
            .map_err(RunError::GlobalSelection)?;
            log::info!(
                "Global degree {} selected (SSE by degree: {:?}, {} penalized fold fits)",
                selection.degree,
                selection.sse_trace,
                selection.penalized_fits
            );
            Some(selection)
        }
        ModelKind::NeighborAverage | ModelKind::LocalAdaptive => None,
    };

    let progress = config.show_progress.then(|| progress_bar(query.len()));
    let context = RunContext {
        config,
        training: training_rows.view(),
        targets: training.targets.view(),
        queries: query_rows.view(),
        coordinates: query.coordinates.view(),
        bases: &bases,
        base_seed,
        global: global.as_ref(),
        progress: progress.as_ref(),
    };

    let outputs = match config.execution {
        ExecutionStrategy::SingleProcess => vec![process_partition(&context, 0..query.len())?],
        ExecutionStrategy::Distributed { workers } => {
            let workers = workers.unwrap_or_else(num_cpus::get).max(1);
            let partitions = partition(query.len(), workers);
            log::info!(
                "Distributing {} queries over {} partitions on {workers} workers",
                query.len(),
                partitions.len()
            );
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .build()?;
            pool.install(|| {
                partitions
                    .into_par_iter()
                    .map(|range| process_partition(&context, range))
                    .collect::<Result<Vec<_>, RunError>>()
            })?
        }
    };

    let mut diagnostics = Diagnostics::default();
    diagnostics.global_selection = global.map(|g| GlobalSelection {
        degree: g.degree,
        sse_trace: g.sse_trace,
    });
    let mut predictions = Vec::with_capacity(query.len());
    for (partition_predictions, partition_diagnostics) in outputs {
        predictions.extend(partition_predictions);
        diagnostics.merge(partition_diagnostics);
    }

    if let Some(bar) = progress {
        bar.finish_and_clear();
    }
    let fallbacks = diagnostics.fallbacks().count();
    if fallbacks > 0 {
        log::warn!("{fallbacks} neighborhoods fell back to their target mean");
    }
    let penalized = diagnostics.penalized_fits();
    if penalized > 0 {
        log::info!("{penalized} cross-validation fold fits could not be solved and were penalized");
    }
    log::info!(
        "Predicted {} points from {} neighborhood models in {:.2?} (degree histogram {:?})",
        predictions.len(),
        diagnostics.models_fitted(),
        start.elapsed(),
        diagnostics.degree_histogram()
    );

    Ok(PredictionRun {
        predictions,
        diagnostics,
        base_seed,
    })
}

/// Splits `0..len` into at most `parts` contiguous, non-empty ranges.
fn partition(len: usize, parts: usize) -> Vec<Range<usize>> {
    if len == 0 {
        return Vec::new();
    }
    let chunk = len.div_ceil(parts.max(1));
    (0..len)
        .step_by(chunk)
        .map(|start| start..(start + chunk).min(len))
        .collect()
}

fn progress_bar(len: usize) -> ProgressBar {
    let bar = ProgressBar::new(len as u64);
    if let Ok(style) =
        ProgressStyle::with_template("> Predicting [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
    {
        bar.set_style(style.progress_chars("█▉▊▋▌▍▎▏ "));
    }
    bar
}

/// How the final fit of a neighborhood picks monomials.
fn term_selection(
    sparsification: Sparsification,
    prior: Option<&[Array1<f64>]>,
) -> TermSelection<'_> {
    match sparsification {
        Sparsification::None => TermSelection::MinimumNorm,
        Sparsification::Lasso(settings) => TermSelection::Lasso(settings),
        Sparsification::Random { .. } => match prior {
            Some(folds) if !folds.is_empty() => TermSelection::FrequencyWeighted(folds),
            _ => TermSelection::Random,
        },
    }
}

/// Locates, groups, fits and evaluates the queries in `range`.
fn process_partition(
    context: &RunContext<'_>,
    range: Range<usize>,
) -> Result<(Vec<Prediction>, Diagnostics), RunError> {
    let config = context.config;
    let mut groups = NeighborhoodGroups::new();
    for q in range.clone() {
        let key = neighbors::locate(
            context.training,
            context.queries.row(q),
            config.neighbors,
            config.distance_exponent,
        )?;
        groups.insert(key, q);
    }
    log::debug!(
        "Queries {range:?} share {} distinct neighborhoods",
        groups.len()
    );

    let mut slots: Vec<Option<Prediction>> = vec![None; range.len()];
    let mut diagnostics = Diagnostics::default();
    for (key, members) in groups.iter() {
        let (model, mut report) = fit_neighborhood(context, key)?;
        let basis = context.bases.basis(model.degree())?;
        for &q in members {
            let z = model.predict(basis, context.queries.row(q), &config.bounds)?;
            slots[q - range.start] = Some(Prediction {
                x: context.coordinates[[q, 0]],
                y: context.coordinates[[q, 1]],
                z,
                degree: model.degree(),
            });
        }
        report.members = members.len();
        diagnostics.record(report);
        if let Some(bar) = context.progress {
            bar.inc(members.len() as u64);
        }
    }

    Ok((slots.into_iter().flatten().collect(), diagnostics))
}

/// Selects a degree for one neighborhood and fits its model.
///
/// Solver failures never escape: they are logged, recorded in the report, and
/// replaced by the neighborhood's target mean.
fn fit_neighborhood(
    context: &RunContext<'_>,
    key: &Neighborhood,
) -> Result<(LocalModel, NeighborhoodReport), RunError> {
    let config = context.config;
    let points = context.training.select(Axis(0), key.members());
    let targets = context.targets.select(Axis(0), key.members());
    let mut rng = StdRng::seed_from_u64(key.derive_seed(context.base_seed));
    let mut report = NeighborhoodReport {
        key: key.clone(),
        members: 0,
        degree: 0,
        // Only local selection reports a trace; the global one is reported once.
        sse_trace: Vec::new(),
        degree_counts: Vec::new(),
        path: SolvePath::Mean,
        fallback: None,
        penalized_fits: 0,
        solver_calls: 0,
    };

    let local;
    let selection = match (config.model, context.global) {
        (ModelKind::GlobalAdaptive, Some(global)) => global,
        (ModelKind::GlobalAdaptive, None) => return Err(RunError::MissingGlobalSelection),
        (ModelKind::LocalAdaptive, _) => {
            let chosen = crossval::select_degree(
                points.view(),
                targets.view(),
                context.bases,
                &config.fold_scheme(config.local_cv),
                &term_selection(config.sparsification, None),
                &mut rng,
            );
            match chosen {
                Ok(chosen) => {
                    report.sse_trace = chosen.sse_trace.clone();
                    report.penalized_fits = chosen.penalized_fits;
                    report.solver_calls = chosen.candidate_fits;
                    local = chosen;
                    &local
                }
                Err(err) => {
                    log::error!("Degree selection for neighborhood [{key}] failed: {err}");
                    return Ok(fall_back(report, targets.view(), &err));
                }
            }
        }
        (ModelKind::NeighborAverage, _) => {
            local = DegreeSelection::constant();
            &local
        }
    };
    if report.penalized_fits > 0 {
        log::debug!(
            "Neighborhood [{key}]: {} fold fits scored the failure penalty",
            report.penalized_fits
        );
    }

    let basis = context.bases.basis(selection.degree)?;
    report.solver_calls += 1;
    let fit = solver::fit_surface(
        points.view(),
        targets.view(),
        basis,
        &term_selection(config.sparsification, Some(selection.fold_coefficients.as_slice())),
        &mut rng,
    );
    let fit = match fit {
        Ok(fit) => fit,
        Err(err) => {
            if err.is_fatal() {
                log::error!("Fit for neighborhood [{key}] failed: {err}");
            } else {
                log::warn!("Fit for neighborhood [{key}] fell back to the mean: {err}");
            }
            return Ok(fall_back(report, targets.view(), &err));
        }
    };

    if fit.path == SolvePath::Degraded {
        log::warn!(
            "Lasso selection for neighborhood [{key}] at degree {} degraded to the mean",
            selection.degree
        );
        report.fallback = Some(FitFallback::PenaltyExhausted);
    }
    log::debug!(
        "Neighborhood [{key}]: degree {} via {:?}",
        fit.model.degree(),
        fit.path
    );

    let used_basis = context.bases.basis(fit.model.degree())?;
    report.degree = fit.model.degree();
    report.degree_counts = fit.model.degree_counts(used_basis);
    report.path = fit.path;
    Ok((fit.model, report))
}

/// Replaces a failed fit with the target mean and records why.
fn fall_back(
    mut report: NeighborhoodReport,
    targets: ArrayView1<f64>,
    err: &SolverError,
) -> (LocalModel, NeighborhoodReport) {
    let model = LocalModel::mean(targets);
    report.degree = 0;
    report.degree_counts = vec![usize::from(model.coefficients()[0] != 0.0)];
    report.path = SolvePath::Mean;
    report.fallback = Some(FitFallback::from_solver_error(err));
    (model, report)
}
