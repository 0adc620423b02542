// Error types shared by every stage of the pipeline.
use std::io;
use std::path::PathBuf;

use ndarray_npy::{ReadNpyError, ReadNpzError, WriteNpzError};
use thiserror::Error;

/// Why a single channel image could not be turned into a 2D f64 array.
#[derive(Error, Debug)]
pub enum ImageError {
    #[error("cannot open file: {0}")]
    Open(#[source] io::Error),
    #[error("cannot read npz archive: {0}")]
    Npz(#[source] ReadNpzError),
    #[error("archive has no array named '{0}'")]
    MissingArray(&'static str),
    #[error("unsupported element type")]
    UnsupportedDtype,
    #[error("expected a 2D array, found {0} dimensions")]
    NotTwoDimensional(usize),
    #[error("image has no pixels")]
    Empty,
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("malformed join table line {line}: {reason} (`{content}`)")]
    Parse {
        line: u64,
        content: String,
        reason: String,
    },
    #[error("failed to load {reference} for {record}: {source}")]
    Load {
        reference: PathBuf,
        record: String,
        #[source]
        source: ImageError,
    },
    #[error("cannot solve least squares for a {rows}x{cols} design matrix (rank {rank}): {reason}")]
    SingularSystem {
        rows: usize,
        cols: usize,
        rank: usize,
        reason: String,
    },
    #[error("shape mismatch in {context}: expected {expected}, found {found}")]
    Shape {
        context: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("{axis} index {index} out of range for irradiance array with {len} {axis}s")]
    TargetIndex {
        axis: &'static str,
        index: usize,
        len: usize,
    },
    #[error("training split is empty, cannot compute feature statistics")]
    EmptyTrainingSet,
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("failed to read array {path}: {source}")]
    Npy {
        path: PathBuf,
        #[source]
        source: ReadNpyError,
    },
    #[error("failed to write feature cache {path}: {source}")]
    CacheWrite {
        path: PathBuf,
        #[source]
        source: WriteNpzError,
    },
    #[error("could not start worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}
