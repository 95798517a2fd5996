use hyppo::surface::data::{
    QuerySet, TableLayout, TrainingSet, load_query_data, load_training_data, write_predictions,
};
use hyppo::surface::lasso::LassoSettings;
use hyppo::surface::model::{CrossValidation, ExecutionStrategy, Sparsification};
use hyppo::surface::polynomial::OutputBounds;
use hyppo::{ModelKind, RunConfig, run_prediction};
use ndarray::{Array1, Array2, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use std::fmt::Write as _;
use std::fs;
use tempfile::tempdir;

fn surface(x: f64, y: f64) -> f64 {
    0.2 + 0.3 * x + 0.2 * y * y
}

/// A 15 x 15 grid over the unit square with lightly noisy targets.
fn noisy_grid(seed: u64) -> TrainingSet {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, 0.01).unwrap();
    let side = 15;
    let coordinates = Array2::from_shape_fn((side * side, 2), |(i, j)| {
        let index = if j == 0 { i % side } else { i / side };
        index as f64 / (side - 1) as f64
    });
    let targets: Array1<f64> = coordinates
        .axis_iter(Axis(0))
        .map(|p| surface(p[0], p[1]) + noise.sample(&mut rng))
        .collect();
    TrainingSet {
        covariates: coordinates.clone(),
        coordinates,
        targets,
    }
}

fn interior_queries() -> QuerySet {
    let coordinates = Array2::from_shape_fn((16, 2), |(i, j)| {
        let index = if j == 0 { i % 4 } else { i / 4 };
        0.2 + 0.2 * index as f64 + 0.03
    });
    QuerySet {
        covariates: coordinates.clone(),
        coordinates,
    }
}

#[test]
fn local_adaptive_fits_track_a_smooth_surface() {
    let training = noisy_grid(2024);
    let query = interior_queries();
    let config = RunConfig {
        neighbors: 20,
        max_degree: 2,
        seed: Some(9),
        ..RunConfig::default()
    };
    let run = run_prediction(&training, &query, &config).unwrap();

    assert_eq!(run.predictions.len(), query.len());
    let mean_error = run
        .predictions
        .iter()
        .map(|p| (p.z - surface(p.x, p.y)).abs())
        .sum::<f64>()
        / run.predictions.len() as f64;
    assert!(mean_error < 0.03, "mean absolute error {mean_error}");
    assert!(run.predictions.iter().any(|p| p.degree > 0));
}

#[test]
fn every_model_kind_and_sparsification_yields_a_full_bounded_table() {
    let training = noisy_grid(7);
    let query = interior_queries();
    let bounds = OutputBounds {
        lower: 0.3,
        upper: 0.6,
    };
    for model in [
        ModelKind::NeighborAverage,
        ModelKind::LocalAdaptive,
        ModelKind::GlobalAdaptive,
    ] {
        for sparsification in [
            Sparsification::None,
            Sparsification::Lasso(LassoSettings::default()),
            Sparsification::Random { trials: 2 },
        ] {
            let config = RunConfig {
                model,
                neighbors: 8,
                max_degree: 3,
                sparsification,
                global_cv: CrossValidation {
                    folds: Some(5),
                    trials: 2,
                },
                bounds,
                seed: Some(1),
                ..RunConfig::default()
            };
            let run = run_prediction(&training, &query, &config).unwrap();
            assert_eq!(run.predictions.len(), query.len());
            for p in &run.predictions {
                assert!((bounds.lower..=bounds.upper).contains(&p.z), "{p:?}");
            }
            if model == ModelKind::NeighborAverage {
                assert!(run.predictions.iter().all(|p| p.degree == 0));
            }
        }
    }
}

#[test]
fn distributed_global_runs_match_single_process_runs() {
    let training = noisy_grid(3);
    let query = interior_queries();
    let base = RunConfig {
        model: ModelKind::GlobalAdaptive,
        neighbors: 10,
        sparsification: Sparsification::Random { trials: 3 },
        global_cv: CrossValidation {
            folds: Some(4),
            trials: 2,
        },
        seed: Some(55),
        ..RunConfig::default()
    };
    let single = run_prediction(&training, &query, &base).unwrap();
    let distributed = run_prediction(
        &training,
        &query,
        &RunConfig {
            execution: ExecutionStrategy::Distributed { workers: Some(4) },
            ..base.clone()
        },
    )
    .unwrap();

    assert_eq!(single.predictions, distributed.predictions);
    assert_eq!(
        single.diagnostics.global_selection,
        distributed.diagnostics.global_selection
    );
}

#[test]
fn tables_on_disk_flow_through_to_a_prediction_file() {
    let dir = tempdir().unwrap();
    let training_path = dir.path().join("train.csv");
    let query_path = dir.path().join("eval.csv");
    let out_path = dir.path().join("out.csv");

    let training = noisy_grid(11);
    let mut text = String::from("x,y,z,elevation,wetness\n");
    for (i, p) in training.coordinates.axis_iter(Axis(0)).enumerate() {
        let (x, y) = (p[0], p[1]);
        writeln!(text, "{x},{y},{},{},{}", training.targets[i], 100.0 * x, x + y).unwrap();
    }
    fs::write(&training_path, text).unwrap();
    fs::write(&query_path, "x,y,elevation,wetness\n0.5,0.5,50,1.0\n0.1,0.9,10,1.0\n").unwrap();

    let layout = TableLayout::default();
    let training = load_training_data(&training_path, &layout).unwrap();
    let query = load_query_data(&query_path, &layout).unwrap();
    assert_eq!(training.covariates.ncols(), 2);

    let config = RunConfig {
        neighbors: 12,
        max_degree: 2,
        seed: Some(4),
        ..RunConfig::default()
    };
    let run = run_prediction(&training, &query, &config).unwrap();
    write_predictions(&out_path, &run.predictions).unwrap();

    let written = fs::read_to_string(&out_path).unwrap();
    let mut lines = written.lines();
    assert_eq!(lines.next(), Some("x,y,predicted_z,degree_used"));
    let rows: Vec<&str> = lines.collect();
    assert_eq!(rows.len(), 2);
    assert!(rows[0].starts_with("0.5,0.5,"));
    assert!(rows[1].starts_with("0.1,0.9,"));

    let sse_path = dir.path().join("sse.txt");
    run.diagnostics.write_sse_trace(&sse_path).unwrap();
    let traces = fs::read_to_string(&sse_path).unwrap();
    assert_eq!(traces.lines().count(), run.diagnostics.models_fitted());
    assert!(traces.lines().all(|line| line.split(',').count() == 3));
}
