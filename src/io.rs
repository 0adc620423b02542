// Module for loading the join table, the EVE irradiance arrays and the per-channel AIA/HMI images.
use std::fmt;
use std::fs::{self, File};
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use csv::{ReaderBuilder, StringRecord, Trim};
use log::warn;
use ndarray::{Array, Array1, Array2, ArrayD, Dimension, Ix2};
use ndarray_npy::{read_npy, NpzReader, ReadNpyError, ReadNpzError, ReadableElement};

use crate::error::{ImageError, PipelineError};

/// Irradiance field value marking a row without an EVE measurement.
pub const MISSING_MARKER: &str = "None";
pub const TIMESTAMP_FMT: &str = "%Y-%m-%d %H:%M:%S";
/// Name of the array stored inside every channel image archive.
pub const IMAGE_KEY: &str = "x";
/// irradiance index, sample index, timestamp
const LEADING_FIELDS: usize = 3;

/// One row of the join table.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub irradiance_index: usize,
    pub sample_index: usize,
    pub timestamp: NaiveDateTime,
    pub channel_refs: Vec<PathBuf>,
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sample {} at {}", self.sample_index, self.timestamp)
    }
}

/// Parsed join table: channel names from the header plus the records that have a target.
#[derive(Debug)]
pub struct JoinTable {
    pub channels: Vec<String>,
    pub records: Vec<Record>,
}

/// EVE spectrum: one row per irradiance index, one column per spectral line.
#[derive(Debug)]
pub struct Irradiance {
    pub values: Array2<f64>,
    pub wavelengths: Array1<f64>,
    pub names: Vec<String>,
}

fn parse_error(raw: &StringRecord, reason: String) -> PipelineError {
    PipelineError::Parse {
        line: raw.position().map(|p| p.line()).unwrap_or(0),
        content: raw.iter().collect::<Vec<_>>().join(","),
        reason,
    }
}

fn parse_index(raw: &StringRecord, field: usize, what: &str) -> Result<usize, PipelineError> {
    let value = &raw[field];
    value
        .parse()
        .map_err(|e| parse_error(raw, format!("bad {what} '{value}': {e}")))
}

fn parse_record(raw: &StringRecord, base_dir: &Path) -> Result<Record, PipelineError> {
    let irradiance_index = parse_index(raw, 0, "irradiance index")?;
    let sample_index = parse_index(raw, 1, "sample index")?;
    let stamp = &raw[2];
    let timestamp = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FMT)
        .map_err(|e| parse_error(raw, format!("bad timestamp '{stamp}': {e}")))?;
    let channel_refs = raw
        .iter()
        .skip(LEADING_FIELDS)
        .map(|r| base_dir.join(r))
        .collect();

    Ok(Record {
        irradiance_index,
        sample_index,
        timestamp,
        channel_refs,
    })
}

/// Parse a join table. Rows whose irradiance index is `None` are dropped,
/// every other malformed row aborts the parse.
pub fn parse_join_table<R: Read>(
    reader: R,
    base_dir: &Path,
) -> Result<JoinTable, PipelineError> {
    let mut rdr = ReaderBuilder::new()
        .delimiter(b',')
        .flexible(true)
        .has_headers(true)
        .trim(Trim::All)
        .from_reader(reader);

    let headers = rdr.headers()?.clone();
    if headers.len() < LEADING_FIELDS {
        return Err(PipelineError::Parse {
            line: 1,
            content: headers.iter().collect::<Vec<_>>().join(","),
            reason: format!("header needs at least {LEADING_FIELDS} fields"),
        });
    }
    let channels = headers
        .iter()
        .skip(LEADING_FIELDS)
        .map(str::to_owned)
        .collect();
    let expected_len = headers.len();

    let mut records = Vec::new();
    for result in rdr.records() {
        let raw: StringRecord = result?;

        if raw.iter().all(|f| f.is_empty()) {
            continue;
        }
        if raw.get(0) == Some(MISSING_MARKER) {
            continue;
        }
        if raw.len() != expected_len {
            return Err(parse_error(
                &raw,
                format!("expected {} fields, found {}", expected_len, raw.len()),
            ));
        }
        records.push(parse_record(&raw, base_dir)?);
    }

    Ok(JoinTable { channels, records })
}

pub fn load_join_table(path: &Path, base_dir: &Path) -> Result<JoinTable, PipelineError> {
    let file = File::open(path).map_err(|source| PipelineError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_join_table(file, base_dir)
}

/// Read a `.npy` array as f64, accepting f32 payloads too.
fn read_npy_f64<D: Dimension>(path: &Path) -> Result<Array<f64, D>, PipelineError> {
    let npy_err = |source: ReadNpyError| PipelineError::Npy {
        path: path.to_path_buf(),
        source,
    };
    match read_npy::<_, Array<f64, D>>(path) {
        Err(ReadNpyError::WrongDescriptor(_)) => read_npy::<_, Array<f32, D>>(path)
            .map(|a| a.mapv(f64::from))
            .map_err(npy_err),
        other => other.map_err(npy_err),
    }
}

/// Load `irradiance.npy`, `wavelength.npy` and `name.txt` from the EVE directory.
pub fn load_irradiance(dir: &Path) -> Result<Irradiance, PipelineError> {
    let values = read_npy_f64(&dir.join("irradiance.npy"))?;
    let wavelengths = read_npy_f64(&dir.join("wavelength.npy"))?;

    let names_path = dir.join("name.txt");
    let names = match fs::read_to_string(&names_path) {
        Ok(text) => text.lines().map(|l| l.trim().to_owned()).collect(),
        Err(e) => {
            warn!("No channel names at {} ({e}), using indices", names_path.display());
            (0..wavelengths.len()).map(|i| format!("ch{i}")).collect()
        }
    };

    Ok(Irradiance {
        values,
        wavelengths,
        names,
    })
}

/// Position of `name` in an npz archive, with or without the `.npy` suffix.
pub fn find_array<R: Read + Seek>(
    npz: &mut NpzReader<R>,
    name: &str,
) -> Result<Option<usize>, ReadNpzError> {
    Ok(npz
        .names()?
        .iter()
        .position(|n| n == name || n.strip_suffix(".npy") == Some(name)))
}

type DtypeReader = fn(&mut NpzReader<File>, usize) -> Result<ArrayD<f64>, ReadNpzError>;

fn read_converted<T>(npz: &mut NpzReader<File>, index: usize) -> Result<ArrayD<f64>, ReadNpzError>
where
    T: ReadableElement + Copy + Into<f64>,
{
    let raw: ArrayD<T> = npz.by_index(index)?;
    Ok(raw.mapv(Into::into))
}

const DTYPE_READERS: [DtypeReader; 6] = [
    read_converted::<f64>,
    read_converted::<f32>,
    read_converted::<i32>,
    read_converted::<i16>,
    read_converted::<u16>,
    read_converted::<u8>,
];

fn read_any_dtype(npz: &mut NpzReader<File>, index: usize) -> Result<ArrayD<f64>, ImageError> {
    for read in DTYPE_READERS {
        match read(npz, index) {
            Err(ReadNpzError::Npy(ReadNpyError::WrongDescriptor(_))) => continue,
            other => return other.map_err(ImageError::Npz),
        }
    }
    Err(ImageError::UnsupportedDtype)
}

/// Load the `x` array of one channel image archive as a 2D f64 array.
pub fn load_channel_image(path: &Path) -> Result<Array2<f64>, ImageError> {
    let file = File::open(path).map_err(ImageError::Open)?;
    let mut npz = NpzReader::new(file).map_err(ImageError::Npz)?;
    let index = find_array(&mut npz, IMAGE_KEY)
        .map_err(ImageError::Npz)?
        .ok_or(ImageError::MissingArray(IMAGE_KEY))?;

    let image = read_any_dtype(&mut npz, index)?;
    let ndim = image.ndim();
    let image = image
        .into_dimensionality::<Ix2>()
        .map_err(|_| ImageError::NotTwoDimensional(ndim))?;
    if image.is_empty() {
        return Err(ImageError::Empty);
    }
    Ok(image)
}
