// Feature/target cache stored as a single .npz artifact, keyed by a content hash.
use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use linfa::Dataset;
use log::{info, warn};
use ndarray::{Array1, Array2, Ix2};
use ndarray_npy::{NpzReader, NpzWriter, ReadNpzError, WriteNpzError};
use sha2::{Digest, Sha256};

use crate::error::PipelineError;
use crate::features::STATS_PER_CHANNEL;
use crate::io::find_array;
use crate::pipeline::SplitData;
use crate::preprocess::DatasetSplit;

/// Bump when the per-channel statistics change.
pub const FEATURE_SCHEME_VERSION: u32 = 1;
const KEY_NAME: &str = "key";

/// Extracted features and raw (unscaled, unmasked) targets for all three splits.
pub struct CachedFeatures {
    pub train: SplitData,
    pub validation: SplitData,
    pub test: SplitData,
}

impl CachedFeatures {
    fn arrays(&self) -> [(&'static str, &Array2<f64>); 6] {
        [
            ("x_train", self.train.records()),
            ("x_val", self.validation.records()),
            ("x_test", self.test.records()),
            ("y_train", self.train.targets()),
            ("y_val", self.validation.targets()),
            ("y_test", self.test.targets()),
        ]
    }
}

/// SHA-256 over everything the cached matrices depend on.
pub fn cache_key(channels: &[String], target_indices: &[usize], split: &DatasetSplit) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(FEATURE_SCHEME_VERSION.to_le_bytes());
    hasher.update((STATS_PER_CHANNEL as u64).to_le_bytes());
    for c in channels {
        hasher.update(c.as_bytes());
        hasher.update([0u8]);
    }
    for &t in target_indices {
        hasher.update((t as u64).to_le_bytes());
    }
    for (label, records) in [
        ("train", &split.train),
        ("validation", &split.validation),
        ("test", &split.test),
    ] {
        hasher.update(label.as_bytes());
        hasher.update((records.len() as u64).to_le_bytes());
        for r in records {
            hasher.update((r.irradiance_index as u64).to_le_bytes());
            hasher.update((r.sample_index as u64).to_le_bytes());
            hasher.update(r.timestamp.to_string().as_bytes());
            for reference in &r.channel_refs {
                hasher.update(reference.to_string_lossy().as_bytes());
                hasher.update([0u8]);
            }
        }
    }
    hasher.finalize().to_vec()
}

fn read_matrix(
    npz: &mut NpzReader<File>,
    name: &str,
) -> Result<Option<Array2<f64>>, ReadNpzError> {
    match find_array(npz, name)? {
        Some(index) => Ok(Some(npz.by_index::<_, Ix2>(index)?)),
        None => Ok(None),
    }
}

fn read_cached(
    npz: &mut NpzReader<File>,
    path: &Path,
    key: &[u8],
) -> Result<Option<CachedFeatures>, ReadNpzError> {
    let stored: Option<Array1<u8>> = match find_array(npz, KEY_NAME)? {
        Some(index) => Some(npz.by_index(index)?),
        None => None,
    };
    if !stored.map_or(false, |k| k.iter().eq(key.iter())) {
        info!("Cache {} was built for other inputs, recomputing", path.display());
        return Ok(None);
    }

    let (Some(x_train), Some(x_val), Some(x_test), Some(y_train), Some(y_val), Some(y_test)) = (
        read_matrix(npz, "x_train")?,
        read_matrix(npz, "x_val")?,
        read_matrix(npz, "x_test")?,
        read_matrix(npz, "y_train")?,
        read_matrix(npz, "y_val")?,
        read_matrix(npz, "y_test")?,
    ) else {
        warn!("Cache {} is missing arrays, recomputing", path.display());
        return Ok(None);
    };

    Ok(Some(CachedFeatures {
        train: Dataset::new(x_train, y_train),
        validation: Dataset::new(x_val, y_val),
        test: Dataset::new(x_test, y_test),
    }))
}

/// Load the cache at `path` if it exists and was written for `key`.
/// A cache that cannot be read is treated like a missing one.
pub fn load(path: &Path, key: &[u8]) -> Result<Option<CachedFeatures>, PipelineError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(PipelineError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let cached = NpzReader::new(file).and_then(|mut npz| read_cached(&mut npz, path, key));
    match cached {
        Ok(Some(cached)) => {
            info!("Loaded cached features from {} ({})", path.display(), hex::encode(key));
            Ok(Some(cached))
        }
        Ok(None) => Ok(None),
        Err(e) => {
            warn!("Cache {} is unreadable ({e}), recomputing", path.display());
            Ok(None)
        }
    }
}

/// Sibling path the archive is written to before it replaces `path`.
fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

pub fn store(path: &Path, key: &[u8], cached: &CachedFeatures) -> Result<(), PipelineError> {
    let staging = staging_path(path);
    let file = File::create(&staging).map_err(|source| PipelineError::Io {
        path: staging.clone(),
        source,
    })?;
    let write_err = |source: WriteNpzError| PipelineError::CacheWrite {
        path: staging.clone(),
        source,
    };

    let mut npz = NpzWriter::new(file);
    npz.add_array(KEY_NAME, &Array1::from(key.to_vec()))
        .map_err(write_err)?;
    for (name, array) in cached.arrays() {
        npz.add_array(name, array).map_err(write_err)?;
    }
    npz.finish().map_err(write_err)?;

    // readers only ever see a complete archive
    fs::rename(&staging, path).map_err(|source| PipelineError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    info!("Wrote feature cache {} ({})", path.display(), hex::encode(key));
    Ok(())
}
