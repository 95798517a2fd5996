//! # Table Loading and Writing
//!
//! Training and query points arrive as delimited text tables, one point per
//! row, every cell numeric:
//!
//! - training: `x, y, z, c_1, ..., c_m` (the target `z` sits at
//!   `TableLayout::target_column`, index 2 by default);
//! - query: the same columns without the target.
//!
//! Once the target is removed both tables share one layout. `x` and `y` are
//! always the first two columns and are carried through to the output. The
//! covariates are a contiguous run of columns starting at `skip_covariates`;
//! the default skips the coordinates themselves, while `skip_covariates = 0`
//! treats them as covariates too.
//!
//! Failures here are user-input errors, reported with the row and column at
//! fault.

use ndarray::{Array1, Array2, Axis, ShapeError, s};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::ops::Range;
use std::path::Path;
use thiserror::Error;

/// Column arrangement shared by training and query tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableLayout {
    pub delimiter: char,
    pub has_header: bool,
    /// Index of the target column in the training table.
    pub target_column: usize,
    /// First covariate column, counted after the target is removed.
    pub skip_covariates: usize,
    /// Number of covariate columns. `None` takes every remaining column.
    #[serde(default)]
    pub covariate_count: Option<usize>,
}

impl Default for TableLayout {
    fn default() -> Self {
        Self {
            delimiter: ',',
            has_header: true,
            target_column: 2,
            skip_covariates: 2,
            covariate_count: None,
        }
    }
}

#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Error from the CSV reader or writer: {0}")]
    Csv(#[from] csv::Error),
    #[error("Delimiter {0:?} is not a single-byte character.")]
    Delimiter(char),
    #[error("Row {row}, column {column}: '{value}' is not a number.")]
    Parse {
        row: usize,
        column: usize,
        value: String,
    },
    #[error("Row {row}, column {column}: non-finite values (NaN or Infinity) are not allowed.")]
    NonFinite { row: usize, column: usize },
    #[error("Row {row} has {found} columns, but the first row has {expected}.")]
    RaggedRow {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("The {0} table contains no data rows.")]
    EmptyTable(&'static str),
    #[error(
        "A table of {width} columns cannot supply coordinates and covariates starting at column {skip} (count {count:?})."
    )]
    ColumnLayout {
        width: usize,
        skip: usize,
        count: Option<usize>,
    },
    #[error("Target column {column} is outside a training table of {width} columns.")]
    TargetColumn { column: usize, width: usize },
    #[error("Training data has {training} covariates, but query data has {query}.")]
    WidthMismatch { training: usize, query: usize },
    #[error("The {table} coordinates have {found} columns; exactly 2 (x, y) are required.")]
    CoordinateColumns { table: &'static str, found: usize },
    #[error("The {table} {part} have {found} rows, but its covariates have {expected}.")]
    RowCountMismatch {
        table: &'static str,
        part: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("Internal shape error while assembling a table: {0}")]
    Shape(#[from] ShapeError),
}

/// Observed points with known targets.
#[derive(Debug, Clone)]
pub struct TrainingSet {
    /// `[n, 2]` bookkeeping coordinates.
    pub coordinates: Array2<f64>,
    /// `[n, m]` raw covariates.
    pub covariates: Array2<f64>,
    pub targets: Array1<f64>,
}

impl TrainingSet {
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Points to predict.
#[derive(Debug, Clone)]
pub struct QuerySet {
    pub coordinates: Array2<f64>,
    pub covariates: Array2<f64>,
}

impl QuerySet {
    pub fn len(&self) -> usize {
        self.coordinates.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.coordinates.nrows() == 0
    }
}

/// One output row.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub x: f64,
    pub y: f64,
    #[serde(rename = "predicted_z")]
    pub z: f64,
    #[serde(rename = "degree_used")]
    pub degree: usize,
}

pub fn load_training_data(path: &Path, layout: &TableLayout) -> Result<TrainingSet, DataError> {
    read_training_data(File::open(path)?, layout)
}

pub fn load_query_data(path: &Path, layout: &TableLayout) -> Result<QuerySet, DataError> {
    read_query_data(File::open(path)?, layout)
}

pub fn read_training_data<R: Read>(
    reader: R,
    layout: &TableLayout,
) -> Result<TrainingSet, DataError> {
    let table = read_table(reader, layout, "training")?;
    let width = table.ncols();
    if layout.target_column >= width {
        return Err(DataError::TargetColumn {
            column: layout.target_column,
            width,
        });
    }

    let targets = table.column(layout.target_column).to_owned();
    let kept: Vec<usize> = (0..width).filter(|&c| c != layout.target_column).collect();
    let rest = table.select(Axis(1), &kept);
    let (coordinates, covariates) = split_columns(rest, layout)?;
    log::info!(
        "Loaded {} training points with {} covariates",
        targets.len(),
        covariates.ncols()
    );
    Ok(TrainingSet {
        coordinates,
        covariates,
        targets,
    })
}

pub fn read_query_data<R: Read>(reader: R, layout: &TableLayout) -> Result<QuerySet, DataError> {
    let table = read_table(reader, layout, "query")?;
    let (coordinates, covariates) = split_columns(table, layout)?;
    log::info!(
        "Loaded {} query points with {} covariates",
        coordinates.nrows(),
        covariates.ncols()
    );
    Ok(QuerySet {
        coordinates,
        covariates,
    })
}

/// Fails unless each set is internally consistent (two coordinate columns,
/// one coordinate row and target per covariate row) and both sets carry the
/// same number of covariates.
pub fn check_compatible(training: &TrainingSet, query: &QuerySet) -> Result<(), DataError> {
    check_rows(
        "training",
        &training.coordinates,
        &training.covariates,
        Some(training.targets.len()),
    )?;
    check_rows("query", &query.coordinates, &query.covariates, None)?;

    let (training, query) = (training.covariates.ncols(), query.covariates.ncols());
    if training != query {
        return Err(DataError::WidthMismatch { training, query });
    }
    Ok(())
}

fn check_rows(
    table: &'static str,
    coordinates: &Array2<f64>,
    covariates: &Array2<f64>,
    targets: Option<usize>,
) -> Result<(), DataError> {
    if coordinates.ncols() != 2 {
        return Err(DataError::CoordinateColumns {
            table,
            found: coordinates.ncols(),
        });
    }
    let expected = covariates.nrows();
    let parts = [("coordinates", Some(coordinates.nrows())), ("targets", targets)];
    for (part, rows) in parts {
        match rows {
            Some(found) if found != expected => {
                return Err(DataError::RowCountMismatch {
                    table,
                    part,
                    expected,
                    found,
                });
            }
            _ => {}
        }
    }
    Ok(())
}

/// Writes `predictions` as `x,y,predicted_z,degree_used`.
pub fn write_predictions(path: &Path, predictions: &[Prediction]) -> Result<(), DataError> {
    write_predictions_to(File::create(path)?, predictions)
}

pub fn write_predictions_to<W: Write>(
    writer: W,
    predictions: &[Prediction],
) -> Result<(), DataError> {
    let mut out = csv::Writer::from_writer(writer);
    for prediction in predictions {
        out.serialize(prediction)?;
    }
    out.flush()?;
    Ok(())
}

fn read_table<R: Read>(
    reader: R,
    layout: &TableLayout,
    name: &'static str,
) -> Result<Array2<f64>, DataError> {
    let delimiter = u8::try_from(layout.delimiter)
        .map_err(|_| DataError::Delimiter(layout.delimiter))?;
    let mut csv_reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(layout.has_header)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut values = Vec::new();
    let mut width = None;
    let mut rows = 0;
    for (index, record) in csv_reader.records().enumerate() {
        let record = record?;
        let row = index + 1;
        if record.iter().all(str::is_empty) {
            continue;
        }
        let expected = *width.get_or_insert(record.len());
        if record.len() != expected {
            return Err(DataError::RaggedRow {
                row,
                expected,
                found: record.len(),
            });
        }
        for (column, cell) in record.iter().enumerate() {
            let value: f64 = cell.parse().map_err(|_| DataError::Parse {
                row,
                column,
                value: cell.to_string(),
            })?;
            if !value.is_finite() {
                return Err(DataError::NonFinite { row, column });
            }
            values.push(value);
        }
        rows += 1;
    }

    match width {
        Some(width) if rows > 0 => Ok(Array2::from_shape_vec((rows, width), values)?),
        _ => Err(DataError::EmptyTable(name)),
    }
}

fn covariate_range(width: usize, layout: &TableLayout) -> Result<Range<usize>, DataError> {
    let start = layout.skip_covariates;
    let end = match layout.covariate_count {
        Some(count) => start.saturating_add(count),
        None => width,
    };
    if width < 2 || start >= end || end > width {
        return Err(DataError::ColumnLayout {
            width,
            skip: layout.skip_covariates,
            count: layout.covariate_count,
        });
    }
    Ok(start..end)
}

fn split_columns(
    table: Array2<f64>,
    layout: &TableLayout,
) -> Result<(Array2<f64>, Array2<f64>), DataError> {
    let range = covariate_range(table.ncols(), layout)?;
    let coordinates = table.slice(s![.., 0..2]).to_owned();
    let covariates = table.slice(s![.., range]).to_owned();
    Ok((coordinates, covariates))
}
