//! Response matrix file persistence
//!
//! The matrix persists as ASCII floats, one row of `n_corr` columns per
//! BPM-plane row, rewritten wholesale on every set and on measurement
//! completion.

use std::{
    fs::File,
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

#[derive(Debug, thiserror::Error)]
pub enum FilingError {
    #[error("can't open matrix file {1:?}")]
    Open(#[source] std::io::Error, PathBuf),
    #[error("can't create matrix file {1:?}")]
    Create(#[source] std::io::Error, PathBuf),
    #[error("matrix file {0:?}: malformed row {1}")]
    Parse(PathBuf, usize),
    #[error("matrix file {path:?}: expected {expected} rows of {columns} columns, found {found}")]
    Shape {
        path: PathBuf,
        expected: usize,
        columns: usize,
        found: usize,
    },
    #[error("matrix file error")]
    IO(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FilingError>;

/// Reads a `(n_rows, n_cols)` matrix file into row-major order
pub fn load_matrix(path: impl AsRef<Path>, n_rows: usize, n_cols: usize) -> Result<Vec<f64>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| FilingError::Open(e, path.to_path_buf()))?;
    let mut values = Vec::with_capacity(n_rows * n_cols);
    let mut rows = 0;
    for (row, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let columns: Vec<f64> = line
            .split_whitespace()
            .map(str::parse::<f64>)
            .collect::<std::result::Result<Vec<f64>, _>>()
            .map_err(|_| FilingError::Parse(path.to_path_buf(), row))?;
        if columns.len() != n_cols {
            return Err(FilingError::Parse(path.to_path_buf(), row));
        }
        values.extend(columns);
        rows += 1;
    }
    if rows != n_rows {
        return Err(FilingError::Shape {
            path: path.to_path_buf(),
            expected: n_rows,
            columns: n_cols,
            found: rows,
        });
    }
    Ok(values)
}

/// Rewrites a matrix file from row-major `values`
pub fn save_matrix(path: impl AsRef<Path>, n_cols: usize, values: &[f64]) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|e| FilingError::Create(e, path.to_path_buf()))?;
    let mut writer = BufWriter::new(file);
    for row in values.chunks(n_cols) {
        let columns: Vec<String> = row.iter().map(|value| format!("{value:+.9e}")).collect();
        writeln!(writer, "{}", columns.join(" "))?;
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
        let path = dir.path().join("respmat.dat");
        let values: Vec<f64> = (0..12).map(|v| v as f64 * 0.25).collect();
        save_matrix(&path, 3, &values).unwrap();
        assert_eq!(load_matrix(&path, 4, 3).unwrap(), values);
    }

    #[test]
    fn shape_checked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("respmat.dat");
        save_matrix(&path, 3, &[0f64; 12]).unwrap();
        assert!(matches!(
            load_matrix(&path, 5, 3),
            Err(FilingError::Shape { expected: 5, found: 4, .. })
        ));
        assert!(matches!(
            load_matrix(&path, 4, 4),
            Err(FilingError::Parse(_, 0))
        ));
    }
}
