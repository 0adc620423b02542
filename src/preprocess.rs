// Date split, target selection and z-scoring of the feature matrices.
use chrono::NaiveDateTime;
use ndarray::{s, Array1, Array2, Axis};

use crate::error::PipelineError;
use crate::io::Record;

/// Added to every column std so constant features do not divide by zero.
pub const STD_EPSILON: f64 = 1e-8;

/// Records partitioned by time, each part in join-table order.
#[derive(Debug, Default)]
pub struct DatasetSplit {
    pub train: Vec<Record>,
    pub validation: Vec<Record>,
    pub test: Vec<Record>,
}

/// Split records at two instants. Timestamps equal to either cutoff land in validation.
pub fn split(records: Vec<Record>, cutoff1: NaiveDateTime, cutoff2: NaiveDateTime) -> DatasetSplit {
    let mut out = DatasetSplit::default();
    for r in records {
        if r.timestamp < cutoff1 {
            out.train.push(r);
        } else if r.timestamp > cutoff2 {
            out.test.push(r);
        } else {
            out.validation.push(r);
        }
    }
    out
}

/// Gather irradiance rows for `records` and keep only the `columns`, in order.
pub fn select_targets(
    irradiance: &Array2<f64>,
    records: &[Record],
    columns: &[usize],
) -> Result<Array2<f64>, PipelineError> {
    let (n_rows, n_cols) = irradiance.dim();
    if let Some(&index) = columns.iter().find(|&&c| c >= n_cols) {
        return Err(PipelineError::TargetIndex { axis: "column", index, len: n_cols });
    }
    if let Some(r) = records.iter().find(|r| r.irradiance_index >= n_rows) {
        return Err(PipelineError::TargetIndex {
            axis: "row",
            index: r.irradiance_index,
            len: n_rows,
        });
    }

    Ok(Array2::from_shape_fn((records.len(), columns.len()), |(i, j)| {
        irradiance[(records[i].irradiance_index, columns[j])]
    }))
}

/// Per-column statistics of the training features.
#[derive(Debug, Clone)]
pub struct Standardizer {
    pub mean: Array1<f64>,
    pub std: Array1<f64>,
}

impl Standardizer {
    pub fn fit(train: &Array2<f64>) -> Result<Self, PipelineError> {
        let mean = train
            .mean_axis(Axis(0))
            .ok_or(PipelineError::EmptyTrainingSet)?;
        let std = train.std_axis(Axis(0), 0.0) + STD_EPSILON;
        Ok(Standardizer { mean, std })
    }

    /// z-score `features` with the training statistics and append a bias column of ones.
    pub fn transform(&self, features: &Array2<f64>) -> Result<Array2<f64>, PipelineError> {
        let cols = self.mean.len();
        if features.ncols() != cols {
            return Err(PipelineError::Shape {
                context: "standardize",
                expected: cols,
                found: features.ncols(),
            });
        }
        let z = (features - &self.mean) / &self.std;
        let mut out = Array2::ones((features.nrows(), cols + 1));
        out.slice_mut(s![.., ..cols]).assign(&z);
        Ok(out)
    }
}
