// Reduce every channel image of a record to four summary statistics.
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use ndarray::{Array1, Array2};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::PipelineError;
use crate::io::{load_channel_image, Record};

/// mean, std, mean |x|, std |x|
pub const STATS_PER_CHANNEL: usize = 4;

fn mean_std(values: &Array2<f64>) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.sum() / n;
    let var = values.fold(0.0, |acc, &v| acc + (v - mean) * (v - mean)) / n;
    (mean, var.sqrt())
}

/// Population statistics of one image and of its absolute values.
pub fn channel_stats(image: &Array2<f64>) -> [f64; STATS_PER_CHANNEL] {
    let (mean, std) = mean_std(image);
    let (abs_mean, abs_std) = mean_std(&image.mapv(f64::abs));
    [mean, std, abs_mean, abs_std]
}

/// Feature vector of one record, channels concatenated in reference order.
pub fn extract(record: &Record) -> Result<Array1<f64>, PipelineError> {
    debug!("{}", record.timestamp);
    let mut vals = Vec::with_capacity(STATS_PER_CHANNEL * record.channel_refs.len());
    for reference in &record.channel_refs {
        let image = load_channel_image(reference).map_err(|source| PipelineError::Load {
            reference: reference.clone(),
            record: record.to_string(),
            source,
        })?;
        vals.extend(channel_stats(&image));
    }
    Ok(Array1::from(vals))
}

/// Runs `extract` over whole splits on a fixed-size worker pool.
pub struct FeatureExtractor {
    pool: ThreadPool,
    channels: usize,
}

impl FeatureExtractor {
    pub fn new(workers: usize, channels: usize) -> Result<Self, PipelineError> {
        info!("Initializing FeatureExtractor with {} workers", workers);
        let pool = ThreadPoolBuilder::new().num_threads(workers).build()?;
        Ok(FeatureExtractor { pool, channels })
    }

    pub fn n_features(&self) -> usize {
        STATS_PER_CHANNEL * self.channels
    }

    /// Feature matrix for `records`, row i belonging to `records[i]`.
    /// The first failing record aborts the whole split.
    pub fn extract_split(
        &self,
        label: &str,
        records: &[Record],
    ) -> Result<Array2<f64>, PipelineError> {
        if let Some(r) = records.iter().find(|r| r.channel_refs.len() != self.channels) {
            return Err(PipelineError::Shape {
                context: "channel references per record",
                expected: self.channels,
                found: r.channel_refs.len(),
            });
        }
        info!("{}: extracting features for {} records", label, records.len());

        let progress = ProgressBar::new(records.len() as u64);
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
        ) {
            progress.set_style(style.progress_chars("#>-"));
        }

        let rows: Vec<Array1<f64>> = self.pool.install(|| {
            records
                .par_iter()
                .map(|r| {
                    let row = extract(r);
                    progress.inc(1);
                    row
                })
                .collect::<Result<_, _>>()
        })?;
        progress.finish_and_clear();

        let cols = self.n_features();
        let flat: Vec<f64> = rows.iter().flat_map(|row| row.iter().copied()).collect();
        Array2::from_shape_vec((rows.len(), cols), flat).map_err(|_| PipelineError::Shape {
            context: "feature matrix",
            expected: rows.len() * cols,
            found: rows.iter().map(|r| r.len()).sum(),
        })
    }
}
