// Wires parsing, splitting, feature extraction, regression and evaluation into one batch run.
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use linfa::Dataset;
use log::{debug, info};
use ndarray::{Array1, Ix2};
use serde::Serialize;

use crate::cache::{self, cache_key, CachedFeatures};
use crate::error::PipelineError;
use crate::eval::{mask_and_zero, relative_error, scale, validity_mask};
use crate::features::FeatureExtractor;
use crate::io::{load_irradiance, load_join_table, Irradiance, Record};
use crate::model::LinearModel;
use crate::preprocess::{select_targets, split, DatasetSplit, Standardizer};

/// Features as records, selected irradiance channels as targets.
pub type SplitData = Dataset<f64, f64, Ix2>;

/// EVE lines 0-12 and 14.
pub const DEFAULT_TARGETS: [usize; 14] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 14];
pub const DEFAULT_SCALE: f64 = 1e6;
pub const DEFAULT_WORKERS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Parse,
    Split,
    CacheHit,
    Extract,
    CacheStore,
    Standardize,
    Fit,
    Predict,
    Evaluate,
    Report,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Parse => "PARSE",
            Stage::Split => "SPLIT",
            Stage::CacheHit => "CACHE_HIT",
            Stage::Extract => "EXTRACT",
            Stage::CacheStore => "CACHE_STORE",
            Stage::Standardize => "STANDARDIZE",
            Stage::Fit => "FIT",
            Stage::Predict => "PREDICT",
            Stage::Evaluate => "EVALUATE",
            Stage::Report => "REPORT",
        };
        f.write_str(name)
    }
}

fn enter(stage: Stage) {
    info!("[{stage}]");
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub base_dir: PathBuf,
    pub join_table: PathBuf,
    pub irradiance_dir: PathBuf,
    pub train_val_cutoff: NaiveDateTime,
    pub val_test_cutoff: NaiveDateTime,
    pub target_indices: Vec<usize>,
    /// Multiplies every raw irradiance value before masking and fitting.
    pub scale: f64,
    /// `None` disables the feature cache.
    pub cache_path: Option<PathBuf>,
    pub workers: usize,
}

impl PipelineConfig {
    /// Defaults laid out under `base_dir`: `join.csv`, `EVE/`, cache `precache.npz`.
    pub fn new(
        base_dir: impl Into<PathBuf>,
        train_val_cutoff: NaiveDateTime,
        val_test_cutoff: NaiveDateTime,
    ) -> Self {
        let base_dir = base_dir.into();
        PipelineConfig {
            join_table: base_dir.join("join.csv"),
            irradiance_dir: base_dir.join("EVE"),
            base_dir,
            train_val_cutoff,
            val_test_cutoff,
            target_indices: DEFAULT_TARGETS.to_vec(),
            scale: DEFAULT_SCALE,
            cache_path: Some(PathBuf::from("precache.npz")),
            workers: DEFAULT_WORKERS,
        }
    }
}

/// One evaluated EVE channel.
#[derive(Debug, Clone, Serialize)]
pub struct ReportRow {
    pub name: String,
    pub wavelength_angstrom: i64,
    pub relative_error_pct: f64,
}

#[derive(Debug)]
pub struct Report {
    pub rows: Vec<ReportRow>,
    pub validation_errors: Array1<f64>,
}

impl Report {
    pub fn write_csv(&self, path: &Path) -> Result<(), PipelineError> {
        let mut wtr = csv::Writer::from_path(path)?;
        for row in &self.rows {
            wtr.serialize(row)?;
        }
        wtr.flush().map_err(|source| PipelineError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "SDO/AIA + SDO/HMI -> SDO/EVE")?;
        for row in &self.rows {
            writeln!(
                f,
                "{:>10} ({:3}A): {:.1}%",
                row.name, row.wavelength_angstrom, row.relative_error_pct
            )?;
        }
        Ok(())
    }
}

fn mean_finite(values: &Array1<f64>) -> f64 {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    finite.iter().sum::<f64>() / finite.len() as f64
}

fn extract_features(
    config: &PipelineConfig,
    channels: &[String],
    irradiance: &Irradiance,
    split: &DatasetSplit,
) -> Result<CachedFeatures, PipelineError> {
    let key = cache_key(channels, &config.target_indices, split);
    if let Some(path) = &config.cache_path {
        if let Some(cached) = cache::load(path, &key)? {
            enter(Stage::CacheHit);
            return Ok(cached);
        }
    }

    enter(Stage::Extract);
    let extractor = FeatureExtractor::new(config.workers, channels.len())?;
    let build = |label: &str, records: &[Record]| -> Result<SplitData, PipelineError> {
        let y = select_targets(&irradiance.values, records, &config.target_indices)?;
        let x = extractor.extract_split(label, records)?;
        Ok(Dataset::new(x, y))
    };
    let cached = CachedFeatures {
        train: build("Train", &split.train)?,
        validation: build("Val", &split.validation)?,
        test: build("Test", &split.test)?,
    };

    if let Some(path) = &config.cache_path {
        enter(Stage::CacheStore);
        cache::store(path, &key, &cached)?;
    }
    Ok(cached)
}

/// Run the whole batch. Any failure aborts before a report exists.
pub fn run(config: &PipelineConfig) -> Result<Report, PipelineError> {
    enter(Stage::Parse);
    let table = load_join_table(&config.join_table, &config.base_dir)?;
    let irradiance = load_irradiance(&config.irradiance_dir)?;
    info!(
        "{} records with targets, {} channels: {}",
        table.records.len(),
        table.channels.len(),
        table.channels.join(",")
    );
    if let Some(&index) = config
        .target_indices
        .iter()
        .find(|&&i| i >= irradiance.wavelengths.len())
    {
        return Err(PipelineError::TargetIndex {
            axis: "wavelength",
            index,
            len: irradiance.wavelengths.len(),
        });
    }

    enter(Stage::Split);
    let parts = split(table.records, config.train_val_cutoff, config.val_test_cutoff);
    info!(
        "Train {} / Val {} / Test {}",
        parts.train.len(),
        parts.validation.len(),
        parts.test.len()
    );

    let data = extract_features(config, &table.channels, &irradiance, &parts)?;

    let y_train = scale(data.train.targets(), config.scale);
    let y_val = scale(data.validation.targets(), config.scale);
    let y_test = scale(data.test.targets(), config.scale);
    let (mask_train, mask_val, mask_test) = (
        validity_mask(&y_train),
        validity_mask(&y_val),
        validity_mask(&y_test),
    );
    let y_train = mask_and_zero(&y_train, &mask_train);
    let y_val = mask_and_zero(&y_val, &mask_val);

    enter(Stage::Standardize);
    let standardizer = Standardizer::fit(data.train.records())?;
    let x_train = standardizer.transform(data.train.records())?;
    let x_val = standardizer.transform(data.validation.records())?;
    let x_test = standardizer.transform(data.test.records())?;

    enter(Stage::Fit);
    let model = LinearModel::fit(&x_train, &y_train)?;
    debug!("Weight matrix shape {:?}", model.weights().dim());

    enter(Stage::Predict);
    let y_val_hat = model.predict(&x_val)?;
    let y_test_hat = model.predict(&x_test)?;

    enter(Stage::Evaluate);
    let validation_errors = relative_error(&y_val_hat, &y_val, &mask_val)?;
    let test_errors = relative_error(&y_test_hat, &y_test, &mask_test)?;
    info!("Validation mean relative error {:.1}%", mean_finite(&validation_errors));

    enter(Stage::Report);
    let rows = config
        .target_indices
        .iter()
        .zip(test_errors.iter())
        .map(|(&idx, &err)| ReportRow {
            name: irradiance
                .names
                .get(idx)
                .cloned()
                .unwrap_or_else(|| format!("ch{idx}")),
            wavelength_angstrom: (irradiance.wavelengths[idx] * 10.0) as i64,
            relative_error_pct: err,
        })
        .collect();

    Ok(Report {
        rows,
        validation_errors,
    })
}
