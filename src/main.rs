//! Put the modules together: parse, extract image features, fit, and report EVE errors
use std::error::Error;
use std::path::{Path, PathBuf};

mod cache;
mod error;
mod eval;
mod features;
mod io;
mod model;
mod pipeline;
mod preprocess;

use chrono::{NaiveDate, NaiveDateTime};
use clap::Parser;
use log::info;
use pipeline::{run, PipelineConfig, ReportRow};
use plotters::prelude::*;

#[derive(Parser, Debug)]
#[command(about = "Predict SDO/EVE irradiance from SDO/AIA + SDO/HMI image statistics")]
struct Cli {
    /// Dataset root; channel references in the join table are relative to it
    #[arg(long, default_value = ".")]
    base_dir: PathBuf,
    /// Join table (default: <base-dir>/join.csv)
    #[arg(long)]
    join_table: Option<PathBuf>,
    /// Directory holding irradiance.npy, wavelength.npy and name.txt (default: <base-dir>/EVE)
    #[arg(long)]
    irradiance_dir: Option<PathBuf>,
    #[arg(long, default_value = "2012-06-30", value_parser = parse_cutoff)]
    train_val_cutoff: NaiveDateTime,
    #[arg(long, default_value = "2013-06-30", value_parser = parse_cutoff)]
    val_test_cutoff: NaiveDateTime,
    /// EVE channel indices to predict, in report order
    #[arg(long, value_delimiter = ',', default_value = "0,1,2,3,4,5,6,7,8,9,10,11,12,14")]
    targets: Vec<usize>,
    #[arg(long, default_value_t = pipeline::DEFAULT_SCALE)]
    scale: f64,
    #[arg(long, default_value = "precache.npz")]
    cache: PathBuf,
    /// Always recompute features and never write the cache
    #[arg(long)]
    no_cache: bool,
    #[arg(long, default_value_t = pipeline::DEFAULT_WORKERS)]
    workers: usize,
    /// Save a bar chart of the test errors to this PNG
    #[arg(long)]
    plot: Option<PathBuf>,
    /// Save the report rows as CSV
    #[arg(long)]
    report_csv: Option<PathBuf>,
}

/// Cutoffs are given as dates and mean midnight of that day.
fn parse_cutoff(s: &str) -> Result<NaiveDateTime, String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| format!("expected YYYY-MM-DD: {e}"))?
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| format!("no midnight on {s}"))
}

impl Cli {
    fn into_config(self) -> PipelineConfig {
        let mut config =
            PipelineConfig::new(self.base_dir, self.train_val_cutoff, self.val_test_cutoff);
        if let Some(path) = self.join_table {
            config.join_table = path;
        }
        if let Some(dir) = self.irradiance_dir {
            config.irradiance_dir = dir;
        }
        config.target_indices = self.targets;
        config.scale = self.scale;
        config.cache_path = if self.no_cache { None } else { Some(self.cache) };
        config.workers = self.workers;
        config
    }
}

/// Draws a horizontal bar chart of the per-channel test errors
/// input: report rows and the output PNG path
/// output: none (writes the PNG)
/// logic: channels without a valid error are drawn as empty rows; x range runs from 0 to the
/// largest finite error plus padding; one bar per channel labelled with its name and wavelength
fn plot_errors(rows: &[ReportRow], path: &Path) -> Result<(), Box<dyn Error>> {
    let labels: Vec<String> = rows
        .iter()
        .map(|r| format!("{} ({}A)", r.name, r.wavelength_angstrom))
        .collect();
    let count = rows.len();

    let max_x = rows
        .iter()
        .map(|r| r.relative_error_pct)
        .filter(|e| e.is_finite())
        .fold(0.0_f64, f64::max);
    let x_range = 0.0..(max_x * 1.1).max(1.0);

    let root = BitMapBackend::new(path, (1000, 600)).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .caption("SDO/AIA + SDO/HMI -> SDO/EVE test error", ("sans-serif", 24))
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(200)
        .build_cartesian_2d(x_range, 0..count)?;

    chart
        .configure_mesh()
        .disable_mesh()
        .y_labels(count)
        .y_label_formatter(&|idx| labels.get(*idx).cloned().unwrap_or_default())
        .x_desc("Relative error (%)")
        .y_desc("EVE channel")
        .draw()?;

    chart.draw_series(
        rows.iter()
            .enumerate()
            .filter(|(_, r)| r.relative_error_pct.is_finite())
            .map(|(i, r)| {
                Rectangle::new([(0.0, i), (r.relative_error_pct, i + 1)], BLUE.mix(0.5).filled())
            }),
    )?;

    root.present()?;
    Ok(())
}

/// parse CLI, run the pipeline, print the report and optional artifacts
/// input: command line flags (see `Cli`)
/// output: report on stdout, optional PNG/CSV
/// logic: any pipeline error ends the run before anything is printed
fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let plot = cli.plot.clone();
    let report_csv = cli.report_csv.clone();
    let config = cli.into_config();

    let report = run(&config)?;
    info!("Validation errors per channel (%): {:.1}", report.validation_errors);
    print!("{report}");

    if let Some(path) = report_csv {
        report.write_csv(&path)?;
        println!("Wrote {}", path.display());
    }
    if let Some(path) = plot {
        plot_errors(&report.rows, &path)?;
        println!("Wrote {}", path.display());
    }

    Ok(())
}

// end tests
