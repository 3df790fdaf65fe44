//! Parameter initializer strategies.
//!
//! Every parameter table in the model is built through an [`Init`] value so
//! the two initialization sources the architecture needs, a seeded
//! truncated normal and a fixed matrix read from disk, are selected per
//! table at construction time instead of being hardcoded per table name.

use crate::error::{LbertError, Result};
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Initializer strategy for a `[rows, cols]` parameter matrix.
#[derive(Debug, Clone)]
pub enum Init {
    /// Normal(0, stddev) with samples beyond two standard deviations
    /// redrawn.
    TruncatedNormal {
        /// Standard deviation of the underlying normal.
        stddev: f32,
    },
    /// Initial values read from a tab-separated embedding file. The table
    /// remains an ordinary parameter afterwards; only its starting values
    /// come from disk.
    FromTsvFile {
        /// Path of the embedding file.
        path: PathBuf,
    },
}

impl Init {
    /// Materialize the matrix on `device`. The `seed` feeds the random
    /// strategy and is ignored by the file-backed one.
    pub fn build(&self, rows: usize, cols: usize, seed: u64, device: &Device) -> Result<Tensor> {
        let data = match self {
            Init::TruncatedNormal { stddev } => truncated_normal(rows * cols, *stddev, seed),
            Init::FromTsvFile { path } => load_embedding_tsv(path, rows, cols)?,
        };
        Ok(Tensor::from_vec(data, (rows, cols), device)?)
    }
}

/// Draw `count` samples from Normal(0, stddev), redrawing anything whose
/// magnitude exceeds two standard deviations.
pub fn truncated_normal(count: usize, stddev: f32, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    // stddev 0 would make Normal::new fail; an all-zero table is the only
    // sensible reading of it.
    if stddev == 0.0 {
        return vec![0.0; count];
    }
    let normal = Normal::new(0.0f32, stddev).expect("stddev checked above");
    let bound = 2.0 * stddev;
    let mut out = Vec::with_capacity(count);
    while out.len() < count {
        let v = normal.sample(&mut rng);
        if v.abs() <= bound {
            out.push(v);
        }
    }
    out
}

/// Load a cluster-embedding matrix from a tab-separated file.
///
/// One line per cluster id in ascending order starting at 0. Field 1 is
/// the id and is ignored; field 2 is a comma-separated float vector of
/// length `cols`. Any malformed row, width mismatch, or row-count mismatch
/// is a fatal [`LbertError::EmbeddingFile`] error.
pub fn load_embedding_tsv(path: &Path, rows: usize, cols: usize) -> Result<Vec<f32>> {
    let file = std::fs::File::open(path).map_err(|e| {
        LbertError::EmbeddingFile(format!("cannot open {}: {e}", path.display()))
    })?;
    let reader = BufReader::new(file);

    let mut data = Vec::with_capacity(rows * cols);
    let mut row = 0usize;
    for line in reader.lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        if row >= rows {
            return Err(LbertError::EmbeddingFile(format!(
                "{}: more than {rows} rows",
                path.display()
            )));
        }
        let vector = line.split('\t').nth(1).ok_or_else(|| {
            LbertError::EmbeddingFile(format!(
                "{}: row {row} has no tab-separated vector field",
                path.display()
            ))
        })?;

        let start = data.len();
        for field in vector.split(',') {
            let value: f32 = field.trim().parse().map_err(|_| {
                LbertError::EmbeddingFile(format!(
                    "{}: row {row} has a malformed float `{}`",
                    path.display(),
                    field.trim()
                ))
            })?;
            data.push(value);
        }
        let width = data.len() - start;
        if width != cols {
            return Err(LbertError::EmbeddingFile(format!(
                "{}: row {row} has width {width}, expected {cols}",
                path.display()
            )));
        }
        row += 1;
    }

    if row != rows {
        return Err(LbertError::EmbeddingFile(format!(
            "{}: found {row} rows, expected {rows}",
            path.display()
        )));
    }
    Ok(data)
}

/// Derives one seed per initializer call from a single model-level seed.
///
/// Keeps initialization reproducible without mutating any process-wide
/// random state.
#[derive(Debug)]
pub struct SeedStream {
    base: u64,
    counter: u64,
}

impl SeedStream {
    /// Create a stream rooted at `base`.
    pub fn new(base: u64) -> Self {
        Self { base, counter: 0 }
    }

    /// Next derived seed.
    pub fn next_seed(&mut self) -> u64 {
        self.counter += 1;
        self.base ^ self.counter.wrapping_mul(0x9E37_79B9_7F4A_7C15)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tsv(name: &str, lines: &[&str]) -> PathBuf {
        let path = std::env::temp_dir().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        path
    }

    #[test]
    fn truncated_normal_is_seeded_and_bounded() {
        let a = truncated_normal(1000, 0.02, 7);
        let b = truncated_normal(1000, 0.02, 7);
        let c = truncated_normal(1000, 0.02, 8);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.iter().all(|v| v.abs() <= 0.04));
    }

    #[test]
    fn seed_stream_is_deterministic() {
        let mut s1 = SeedStream::new(1);
        let mut s2 = SeedStream::new(1);
        assert_eq!(s1.next_seed(), s2.next_seed());
        assert_ne!(s1.next_seed(), s1.next_seed());
    }

    #[test]
    fn loads_well_formed_tsv() {
        let path = write_tsv("lbert_tsv_ok.tsv", &["0\t1.0,2.0,3.0", "1\t-1.0, 0.5 ,0.25"]);
        let data = load_embedding_tsv(&path, 2, 3).unwrap();
        assert_eq!(data, vec![1.0, 2.0, 3.0, -1.0, 0.5, 0.25]);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn rejects_width_mismatch() {
        let path = write_tsv("lbert_tsv_width.tsv", &["0\t1.0,2.0"]);
        assert!(load_embedding_tsv(&path, 1, 3).is_err());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn rejects_malformed_float() {
        let path = write_tsv("lbert_tsv_float.tsv", &["0\t1.0,abc,3.0"]);
        assert!(load_embedding_tsv(&path, 1, 3).is_err());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn rejects_row_count_mismatch() {
        let path = write_tsv("lbert_tsv_rows.tsv", &["0\t1.0,2.0,3.0"]);
        assert!(load_embedding_tsv(&path, 2, 3).is_err());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn rejects_missing_file() {
        let path = Path::new("/nonexistent/embedding.tsv");
        assert!(load_embedding_tsv(path, 1, 1).is_err());
    }

    #[test]
    fn init_builds_table_on_device() {
        let init = Init::TruncatedNormal { stddev: 0.02 };
        let t = init.build(4, 8, 3, &candle_core::Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[4, 8]);
    }
}
