//! Orbit file persistence
//!
//! Reference and offline orbits persist as two whitespace-separated float
//! columns (X, Y), one row per BPM, rewritten wholesale on every update.

use std::{
    fs::File,
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

#[derive(Debug, thiserror::Error)]
pub enum FilingError {
    #[error("can't open orbit file {1:?}")]
    Open(#[source] std::io::Error, PathBuf),
    #[error("can't create orbit file {1:?}")]
    Create(#[source] std::io::Error, PathBuf),
    #[error("orbit file {0:?}: malformed row {1}")]
    Parse(PathBuf, usize),
    #[error("orbit file {path:?}: expected {expected} rows, found {found}")]
    Rows {
        path: PathBuf,
        expected: usize,
        found: usize,
    },
    #[error("orbit file error")]
    IO(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FilingError>;

/// Reads an `n_bpm`-row orbit file into its `(x, y)` columns
pub fn load_orbit(path: impl AsRef<Path>, n_bpm: usize) -> Result<(Vec<f64>, Vec<f64>)> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| FilingError::Open(e, path.to_path_buf()))?;
    let mut x = Vec::with_capacity(n_bpm);
    let mut y = Vec::with_capacity(n_bpm);
    for (row, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let mut columns = line.split_whitespace().map(str::parse::<f64>);
        match (columns.next(), columns.next()) {
            (Some(Ok(column_x)), Some(Ok(column_y))) => {
                x.push(column_x);
                y.push(column_y);
            }
            _ => return Err(FilingError::Parse(path.to_path_buf(), row)),
        }
    }
    if x.len() != n_bpm {
        return Err(FilingError::Rows {
            path: path.to_path_buf(),
            expected: n_bpm,
            found: x.len(),
        });
    }
    Ok((x, y))
}

/// Rewrites an orbit file from its `(x, y)` columns
pub fn save_orbit(path: impl AsRef<Path>, x: &[f64], y: &[f64]) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|e| FilingError::Create(e, path.to_path_buf()))?;
    let mut writer = BufWriter::new(file);
    for (column_x, column_y) in x.iter().zip(y) {
        writeln!(writer, "{column_x:+.9e} {column_y:+.9e}")?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reference.orb");
        let x = vec![1.25, -0.5, 0.0];
        let y = vec![0.0, 3.5e-3, -2.0];
        save_orbit(&path, &x, &y).unwrap();
        let (rx, ry) = load_orbit(&path, 3).unwrap();
        assert_eq!(rx, x);
        assert_eq!(ry, y);
    }

    #[test]
    fn row_count_checked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reference.orb");
        save_orbit(&path, &[1.0, 2.0], &[0.0, 0.0]).unwrap();
        assert!(matches!(
            load_orbit(&path, 3),
            Err(FilingError::Rows { expected: 3, found: 2, .. })
        ));
    }

    #[test]
    fn malformed_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reference.orb");
        std::fs::write(&path, "0.0 0.0\nnot a number\n").unwrap();
        assert!(matches!(
            load_orbit(&path, 2),
            Err(FilingError::Parse(_, 1))
        ));
    }
}
