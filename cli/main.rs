#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process;

use hyppo::surface::data::{load_query_data, load_training_data, write_predictions};
use hyppo::surface::lasso::LassoSettings;
use hyppo::surface::model::{ExecutionStrategy, ModelKind, RunConfig, Sparsification};
use hyppo::{run_prediction, PredictionRun};

#[derive(Clone, Copy, ValueEnum)]
pub enum ModelKindCli {
    /// Mean of the k nearest targets
    Knn,
    /// Per-neighborhood cross-validated degree
    Hyppo,
    /// One cross-validated degree for the whole training set
    Sbm,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum SparsifyCli {
    None,
    Lasso,
    Random,
}

#[derive(Args)]
pub struct PredictArgs {
    /// Training table: x, y, target, covariates...
    #[arg(long, short = 't')]
    pub train: PathBuf,

    /// Query table: x, y, covariates...
    #[arg(long, short = 'e')]
    pub eval: PathBuf,

    /// Output table (x,y,predicted_z,degree_used)
    #[arg(long, short = 'o', default_value = "predictions.csv")]
    pub out: PathBuf,

    /// Start from a saved TOML configuration; flags given explicitly override it
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long, short = 'm', value_enum)]
    pub model: Option<ModelKindCli>,

    /// Neighborhood size
    #[arg(long, short = 'k')]
    pub neighbors: Option<usize>,

    /// Highest candidate polynomial degree
    #[arg(long, short = 'D')]
    pub degree: Option<usize>,

    /// Exponent of the power-sum distance
    #[arg(long, short = 'N')]
    pub norm: Option<u32>,

    #[arg(long, value_enum)]
    pub sparsify: Option<SparsifyCli>,

    /// Fits per fold under random sparsification
    #[arg(long)]
    pub random_trials: Option<usize>,

    /// Lower clamp for predictions
    #[arg(long, short = 'b', allow_hyphen_values = true)]
    pub lower_bound: Option<f64>,

    /// Upper clamp for predictions
    #[arg(long, short = 'B', allow_hyphen_values = true)]
    pub upper_bound: Option<f64>,

    /// Column of the target in the training table
    #[arg(long, short = 'i')]
    pub dep_index: Option<usize>,

    /// First covariate column once the target is removed
    #[arg(long, short = 's')]
    pub skip_vars: Option<usize>,

    /// Number of covariate columns (default: all remaining)
    #[arg(long, short = 'v')]
    pub variables: Option<usize>,

    #[arg(long, short = 'd')]
    pub delimiter: Option<char>,

    /// Input tables have no header row
    #[arg(long)]
    pub no_header: bool,

    /// Explicit per-covariate scale, comma separated
    #[arg(long, short = 'S', value_delimiter = ',')]
    pub scale: Option<Vec<f64>>,

    /// Sublinear exponent in (0, 1] applied after scaling
    #[arg(long, short = 'F')]
    pub flatten: Option<f64>,

    #[arg(long)]
    pub seed: Option<u64>,

    /// Split queries across a worker pool (0 = one worker per core)
    #[arg(long, short = 'p')]
    pub parallel: Option<usize>,

    /// Write each neighborhood's cross-validation SSE trace here
    #[arg(long, short = 'E')]
    pub error_file: Option<PathBuf>,

    /// Write each neighborhood's nonzero-monomial counts by degree here
    #[arg(long, short = 'C')]
    pub degree_count_file: Option<PathBuf>,

    #[arg(long)]
    pub progress: bool,
}

#[derive(Parser)]
#[command(
    name = "hyppo",
    about = "Adaptive local polynomial regression for gridded prediction",
    long_about = "Predicts a scalar surface at query points from scattered training observations \
                 by fitting a cross-validated polynomial to each query's nearest neighbors."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Predict query points from training points
    Predict(PredictArgs),

    /// Write the default configuration as TOML
    WriteConfig {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Predict(args)) => predict(args),
        Some(Commands::WriteConfig { path }) => RunConfig::default()
            .save(&path)
            .map_err(|err| Box::new(err) as Box<dyn std::error::Error>),
        None => {
            let _ = Cli::command().print_help();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn build_config(args: &PredictArgs) -> Result<RunConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => RunConfig::load(path)?,
        None => RunConfig::default(),
    };

    if let Some(model) = args.model {
        config.model = match model {
            ModelKindCli::Knn => ModelKind::NeighborAverage,
            ModelKindCli::Hyppo => ModelKind::LocalAdaptive,
            ModelKindCli::Sbm => ModelKind::GlobalAdaptive,
        };
    }
    if let Some(k) = args.neighbors {
        config.neighbors = k;
    }
    if let Some(degree) = args.degree {
        config.max_degree = degree;
    }
    if let Some(norm) = args.norm {
        config.distance_exponent = norm;
    }
    match args.sparsify {
        Some(SparsifyCli::None) => config.sparsification = Sparsification::None,
        Some(SparsifyCli::Lasso) => {
            config.sparsification = Sparsification::Lasso(LassoSettings::default())
        }
        Some(SparsifyCli::Random) => {
            config.sparsification = Sparsification::Random {
                trials: args.random_trials.unwrap_or(1),
            }
        }
        None => {
            if let (Some(trials), Sparsification::Random { .. }) =
                (args.random_trials, config.sparsification)
            {
                config.sparsification = Sparsification::Random { trials };
            }
        }
    }
    if let Some(lower) = args.lower_bound {
        config.bounds.lower = lower;
    }
    if let Some(upper) = args.upper_bound {
        config.bounds.upper = upper;
    }
    if let Some(column) = args.dep_index {
        config.layout.target_column = column;
    }
    if let Some(skip) = args.skip_vars {
        config.layout.skip_covariates = skip;
    }
    if let Some(count) = args.variables {
        config.layout.covariate_count = (count > 0).then_some(count);
    }
    if let Some(delimiter) = args.delimiter {
        config.layout.delimiter = delimiter;
    }
    if args.no_header {
        config.layout.has_header = false;
    }
    if let Some(scale) = &args.scale {
        config.transform.scale = Some(scale.clone());
    }
    if let Some(flatten) = args.flatten {
        config.transform.flatten = Some(flatten);
    }
    if let Some(seed) = args.seed {
        config.seed = Some(seed);
    }
    if let Some(workers) = args.parallel {
        config.execution = ExecutionStrategy::Distributed {
            workers: (workers > 0).then_some(workers),
        };
    }
    if args.progress {
        config.show_progress = true;
    }
    Ok(config)
}

pub fn predict(args: PredictArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = build_config(&args)?;
    let training = load_training_data(&args.train, &config.layout)?;
    let query = load_query_data(&args.eval, &config.layout)?;

    let PredictionRun {
        predictions,
        diagnostics,
        base_seed,
    } = run_prediction(&training, &query, &config)?;

    write_predictions(&args.out, &predictions)?;
    log::info!(
        "Wrote {} predictions to {} (rerun with --seed {base_seed} to reproduce)",
        predictions.len(),
        args.out.display()
    );

    if let Some(path) = &args.error_file {
        diagnostics.write_sse_trace(path)?;
        log::info!("Wrote SSE traces to {}", path.display());
    }
    if let Some(path) = &args.degree_count_file {
        diagnostics.write_degree_counts(path)?;
        log::info!("Wrote degree counts to {}", path.display());
    }
    Ok(())
}
