/*!
# SOFB response matrix

The measured sensitivity of the orbit to corrector kicks and its regularized
pseudo-inverse.

[RespMat] keeps the dense `(2 * n_bpm, n_corr)` sensitivity matrix paired at
all times with its pseudo-inverse and singular value vector. Every change to
the matrix, to an enable mask or to the regularization constants recomputes
the pair synchronously; a failed recomputation (SVD divergence, non-finite
result, empty selection) restores the previous state atomically, so the pair
is never observed half updated.

Inverse entries of disabled BPM planes and correctors are exactly zero.
*/

use nalgebra::{DMatrix, DVector, SVD};

use interface::{MatrixSource, RoleError};
use log::{info, warn};

pub mod filing;

/// Enable mask groups
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MaskGroup {
    BpmX,
    BpmY,
    Ch,
    Cv,
    Rf,
}

#[derive(Debug, thiserror::Error)]
pub enum RespMatError {
    #[error("expected {expected} elements, found {found}")]
    SizeMismatch { expected: usize, found: usize },
    #[error("selection leaves no BPM plane or no corrector enabled")]
    NoItemsSelected,
    #[error("SVD failed to converge")]
    NumericalFailure,
    #[error("non-finite values in the computed inverse")]
    NonFinite,
    #[error("matrix file error")]
    Filing(#[from] filing::FilingError),
}

pub type Result<T> = std::result::Result<T, RespMatError>;

/// Response matrix with its derived pseudo-inverse
#[derive(Debug, Clone)]
pub struct RespMat {
    n_bpm: usize,
    n_ch: usize,
    n_cv: usize,
    rf: bool,
    mat: DMatrix<f64>,
    inv: DMatrix<f64>,
    singular_values: Vec<f64>,
    bpm_x: Vec<bool>,
    bpm_y: Vec<bool>,
    ch: Vec<bool>,
    cv: Vec<bool>,
    rf_enabled: bool,
    min_singular_value: f64,
    tikhonov: f64,
    path: Option<std::path::PathBuf>,
}

impl RespMat {
    /// Creates a zero matrix with every BPM plane and corrector enabled
    pub fn new(n_bpm: usize, n_ch: usize, n_cv: usize, rf: bool) -> Self {
        let n_corr = n_ch + n_cv + rf as usize;
        Self {
            n_bpm,
            n_ch,
            n_cv,
            rf,
            mat: DMatrix::zeros(2 * n_bpm, n_corr),
            inv: DMatrix::zeros(n_corr, 2 * n_bpm),
            singular_values: Vec::new(),
            bpm_x: vec![true; n_bpm],
            bpm_y: vec![true; n_bpm],
            ch: vec![true; n_ch],
            cv: vec![true; n_cv],
            rf_enabled: rf,
            min_singular_value: 0.2,
            tikhonov: 0f64,
            path: None,
        }
    }
    /// Attaches the persistence file, reloading it when readable
    ///
    /// A missing or rejected file logs a warning and keeps the zero matrix.
    pub fn with_path(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        let path = path.into();
        self.path = Some(path.clone());
        match filing::load_matrix(&path, 2 * self.n_bpm, self.n_corr()) {
            Ok(values) => {
                if let Err(e) = self.set_matrix(values) {
                    warn!("persisted response matrix rejected: {e}");
                }
            }
            Err(e) => warn!("response matrix not reloaded: {e}"),
        }
        self
    }
    pub fn n_bpm(&self) -> usize {
        self.n_bpm
    }
    pub fn n_corr(&self) -> usize {
        self.n_ch + self.n_cv + self.rf as usize
    }
    /// Row-major flattened matrix
    pub fn matrix(&self) -> Vec<f64> {
        self.mat.row_iter().flat_map(|row| row.iter().copied().collect::<Vec<f64>>()).collect()
    }
    /// Row-major flattened pseudo-inverse
    pub fn inverse(&self) -> Vec<f64> {
        self.inv.row_iter().flat_map(|row| row.iter().copied().collect::<Vec<f64>>()).collect()
    }
    /// Singular values of the enabled sub-block, largest first
    pub fn singular_values(&self) -> &[f64] {
        &self.singular_values
    }
    /// Number of singular values above the cutoff
    pub fn n_singular_values(&self) -> usize {
        self.singular_values
            .iter()
            .filter(|&&s| s > self.min_singular_value)
            .count()
    }
    pub fn min_singular_value(&self) -> f64 {
        self.min_singular_value
    }
    pub fn tikhonov(&self) -> f64 {
        self.tikhonov
    }
    pub fn enable_mask(&self, group: MaskGroup) -> Vec<bool> {
        match group {
            MaskGroup::BpmX => self.bpm_x.clone(),
            MaskGroup::BpmY => self.bpm_y.clone(),
            MaskGroup::Ch => self.ch.clone(),
            MaskGroup::Cv => self.cv.clone(),
            MaskGroup::Rf => vec![self.rf_enabled],
        }
    }

    /// Replaces the matrix with a row-major flattened one
    ///
    /// The previous matrix/inverse pair is restored on any recompute
    /// failure; on success the matrix persists to the attached file.
    pub fn set_matrix(&mut self, values: Vec<f64>) -> Result<()> {
        let expected = 2 * self.n_bpm * self.n_corr();
        if values.len() != expected {
            return Err(RespMatError::SizeMismatch {
                expected,
                found: values.len(),
            });
        }
        let n_corr = self.n_corr();
        self.commit(|state| {
            state.mat = DMatrix::from_row_slice(2 * state.n_bpm, n_corr, &values);
        })?;
        self.persist();
        Ok(())
    }

    /// Replaces one enable mask
    ///
    /// Fails without mutation when the new selection leaves no BPM plane or
    /// no corrector enabled.
    pub fn set_enable_mask(&mut self, group: MaskGroup, mask: Vec<bool>) -> Result<()> {
        let expected = match group {
            MaskGroup::BpmX | MaskGroup::BpmY => self.n_bpm,
            MaskGroup::Ch => self.n_ch,
            MaskGroup::Cv => self.n_cv,
            MaskGroup::Rf => 1,
        };
        if mask.len() != expected {
            return Err(RespMatError::SizeMismatch {
                expected,
                found: mask.len(),
            });
        }
        self.commit(|state| match group {
            MaskGroup::BpmX => state.bpm_x = mask,
            MaskGroup::BpmY => state.bpm_y = mask,
            MaskGroup::Ch => state.ch = mask,
            MaskGroup::Cv => state.cv = mask,
            MaskGroup::Rf => state.rf_enabled = state.rf && mask[0],
        })
    }

    /// Singular value cutoff; values at or below it are not inverted
    pub fn set_min_singular_value(&mut self, value: f64) -> Result<()> {
        self.commit(|state| state.min_singular_value = value)
    }
    /// Tikhonov damping constant, `0` inverts the singular values directly
    pub fn set_tikhonov(&mut self, value: f64) -> Result<()> {
        self.commit(|state| state.tikhonov = value)
    }

    /// Maps an orbit error to the corrective kick vector `-(inverse * orbit)`
    ///
    /// Pure function, no state mutation.
    pub fn calc_kicks(&self, orbit: &[f64]) -> Result<Vec<f64>> {
        if orbit.len() != 2 * self.n_bpm {
            return Err(RespMatError::SizeMismatch {
                expected: 2 * self.n_bpm,
                found: orbit.len(),
            });
        }
        let kicks = -(&self.inv * DVector::from_column_slice(orbit));
        Ok(kicks.iter().copied().collect())
    }

    fn enabled_rows(&self) -> Vec<usize> {
        self.bpm_x
            .iter()
            .enumerate()
            .filter_map(|(idx, &on)| on.then_some(idx))
            .chain(
                self.bpm_y
                    .iter()
                    .enumerate()
                    .filter_map(|(idx, &on)| on.then_some(self.n_bpm + idx)),
            )
            .collect()
    }
    fn enabled_cols(&self) -> Vec<usize> {
        let mut cols: Vec<usize> = self
            .ch
            .iter()
            .enumerate()
            .filter_map(|(idx, &on)| on.then_some(idx))
            .chain(
                self.cv
                    .iter()
                    .enumerate()
                    .filter_map(|(idx, &on)| on.then_some(self.n_ch + idx)),
            )
            .collect();
        if self.rf && self.rf_enabled {
            cols.push(self.n_ch + self.n_cv);
        }
        cols
    }

    /// Applies `mutate`, recomputes the pseudo-inverse and rolls the whole
    /// state back on failure
    fn commit(&mut self, mutate: impl FnOnce(&mut Self)) -> Result<()> {
        let backup = self.clone();
        mutate(self);
        if let Err(e) = self.recompute() {
            *self = backup;
            warn!("response matrix update rejected: {e}");
            return Err(e);
        }
        Ok(())
    }

    fn recompute(&mut self) -> Result<()> {
        let rows = self.enabled_rows();
        let cols = self.enabled_cols();
        if rows.is_empty() || cols.is_empty() {
            return Err(RespMatError::NoItemsSelected);
        }
        let sub = DMatrix::from_fn(rows.len(), cols.len(), |i, j| self.mat[(rows[i], cols[j])]);
        let svd = SVD::try_new(sub, true, true, f64::EPSILON, 250)
            .ok_or(RespMatError::NumericalFailure)?;
        let sigma = &svd.singular_values;
        let sigma_inv = DVector::from_iterator(
            sigma.len(),
            sigma.iter().map(|&s| {
                if s > self.min_singular_value {
                    if self.tikhonov > 0f64 {
                        s / (s * s + self.tikhonov * self.tikhonov)
                    } else {
                        1f64 / s
                    }
                } else {
                    0f64
                }
            }),
        );
        let (u, v_t) = (
            svd.u.as_ref().ok_or(RespMatError::NumericalFailure)?,
            svd.v_t.as_ref().ok_or(RespMatError::NumericalFailure)?,
        );
        let pinv = v_t.transpose() * DMatrix::from_diagonal(&sigma_inv) * u.transpose();
        if !pinv.iter().all(|value| value.is_finite()) {
            return Err(RespMatError::NonFinite);
        }
        // scatter into the zero-padded full inverse: disabled rows/columns
        // stay exactly zero
        let mut inv = DMatrix::zeros(self.n_corr(), 2 * self.n_bpm);
        for (j, &col) in cols.iter().enumerate() {
            for (i, &row) in rows.iter().enumerate() {
                inv[(col, row)] = pinv[(j, i)];
            }
        }
        self.inv = inv;
        self.singular_values = sigma.iter().copied().collect();
        info!(
            "response matrix recomputed: {} of {} singular values inverted",
            self.n_singular_values(),
            self.singular_values.len()
        );
        Ok(())
    }

    fn persist(&self) {
        if let Some(path) = &self.path {
            if let Err(e) = filing::save_matrix(path, self.n_corr(), &self.matrix()) {
                warn!("response matrix not persisted: {e}");
            }
        }
    }
}

impl MatrixSource for RespMat {
    fn n_corr(&self) -> usize {
        RespMat::n_corr(self)
    }
    fn enabled_correctors(&self) -> Vec<bool> {
        let mut enabled = self.ch.clone();
        enabled.extend_from_slice(&self.cv);
        if self.rf {
            enabled.push(self.rf_enabled);
        }
        enabled
    }
    fn kicks(&self, orbit: &[f64]) -> std::result::Result<Vec<f64>, RoleError> {
        self.calc_kicks(orbit).map_err(|e| match e {
            RespMatError::SizeMismatch { expected, found } => {
                RoleError::SizeMismatch { expected, found }
            }
            e => RoleError::Rejected(e.to_string()),
        })
    }
    fn set_matrix(&mut self, values: Vec<f64>) -> std::result::Result<(), RoleError> {
        RespMat::set_matrix(self, values).map_err(|e| match e {
            RespMatError::SizeMismatch { expected, found } => {
                RoleError::SizeMismatch { expected, found }
            }
            e => RoleError::Rejected(e.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_like(n_bpm: usize, n_ch: usize, n_cv: usize) -> RespMat {
        let mut respmat = RespMat::new(n_bpm, n_ch, n_cv, false);
        let n_corr = respmat.n_corr();
        let mut values = vec![0f64; 2 * n_bpm * n_corr];
        for corr in 0..n_corr {
            values[corr * n_corr + corr] = 1f64;
        }
        respmat.set_matrix(values).unwrap();
        respmat
    }

    #[test]
    fn set_matrix_size_checked() {
        let mut respmat = RespMat::new(4, 1, 1, false);
        let before = respmat.matrix();
        assert!(matches!(
            respmat.set_matrix(vec![0f64; 3]),
            Err(RespMatError::SizeMismatch { expected: 16, found: 3 })
        ));
        assert_eq!(respmat.matrix(), before);
    }

    #[test]
    fn matrix_round_trip() {
        let mut respmat = RespMat::new(2, 2, 1, false);
        let values: Vec<f64> = (1..=12).map(|v| v as f64).collect();
        respmat.set_matrix(values.clone()).unwrap();
        assert_eq!(respmat.matrix(), values);
    }

    #[test]
    fn pseudo_inverse_of_identity_block() {
        let respmat = identity_like(1, 1, 1);
        // kicks = -(inverse * orbit)
        let kicks = respmat.calc_kicks(&[1.0, 0.0]).unwrap();
        assert!((kicks[0] + 1.0).abs() < 1e-12);
        assert!(kicks[1].abs() < 1e-12);
    }

    #[test]
    fn reconstruction_invariant() {
        // M * pinv(M) * M ~ M on the enabled sub-block
        let mut respmat = RespMat::new(2, 2, 2, false);
        respmat.set_min_singular_value(1e-9).unwrap();
        respmat
            .set_matrix(vec![
                1.0, 0.5, 0.0, 0.1, //
                0.2, 1.0, 0.3, 0.0, //
                0.0, 0.1, 1.0, 0.4, //
                0.3, 0.0, 0.2, 1.0, //
            ])
            .unwrap();
        let m = DMatrix::from_row_slice(4, 4, &respmat.matrix());
        let pinv = DMatrix::from_row_slice(4, 4, &respmat.inverse());
        let reconstructed = &m * &pinv * &m;
        assert!((&reconstructed - &m).amax() < 1e-9);
    }

    #[test]
    fn disabled_entries_are_exactly_zero() {
        let mut respmat = identity_like(2, 2, 2);
        respmat.set_min_singular_value(1e-9).unwrap();
        respmat
            .set_enable_mask(MaskGroup::Ch, vec![true, false])
            .unwrap();
        respmat.set_enable_mask(MaskGroup::BpmY, vec![false, false]).unwrap();
        let inverse = respmat.inverse();
        let n_rows = 2 * respmat.n_bpm();
        // corrector 1 disabled: its whole inverse row is zero
        assert!(inverse[n_rows..2 * n_rows].iter().all(|&v| v == 0.0));
        // Y plane disabled: last two columns of every row are zero
        for row in inverse.chunks(n_rows) {
            assert!(row[2..].iter().all(|&v| v == 0.0));
        }
    }

    #[test]
    fn empty_selection_rejected() {
        let mut respmat = identity_like(2, 2, 2);
        respmat
            .set_enable_mask(MaskGroup::Ch, vec![false, false])
            .unwrap();
        let result = respmat.set_enable_mask(MaskGroup::Cv, vec![false, false]);
        assert!(matches!(result, Err(RespMatError::NoItemsSelected)));
        // prior mask untouched
        assert_eq!(respmat.enable_mask(MaskGroup::Cv), vec![true, true]);
    }

    #[test]
    fn calc_kicks_size_checked() {
        let respmat = identity_like(2, 2, 2);
        assert!(matches!(
            respmat.calc_kicks(&[0.0; 3]),
            Err(RespMatError::SizeMismatch { expected: 4, found: 3 })
        ));
    }

    #[test]
    fn singular_value_cutoff_regularizes() {
        let mut respmat = RespMat::new(1, 2, 0, false);
        respmat.set_min_singular_value(1e-3).unwrap();
        // rank-deficient: both correctors drive the same orbit
        respmat.set_matrix(vec![1.0, 1.0, 0.0, 0.0]).unwrap();
        assert_eq!(respmat.n_singular_values(), 1);
        let kicks = respmat.calc_kicks(&[1.0, 0.0]).unwrap();
        // minimum norm solution splits the kick evenly
        assert!((kicks[0] - kicks[1]).abs() < 1e-12);
        assert!((kicks[0] + 0.5).abs() < 1e-12);
    }

    #[test]
    fn tikhonov_damps_the_inversion() {
        let mut respmat = RespMat::new(1, 1, 0, false);
        respmat.set_min_singular_value(1e-6).unwrap();
        respmat.set_matrix(vec![2.0, 0.0]).unwrap();
        respmat.set_tikhonov(1.0).unwrap();
        let kicks = respmat.calc_kicks(&[1.0, 0.0]).unwrap();
        // s / (s^2 + 1) = 2 / 5 instead of 1 / 2
        assert!((kicks[0] + 0.4).abs() < 1e-12);
    }

    #[test]
    fn persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("respmat.dat");
        let values: Vec<f64> = (1..=8).map(|v| v as f64).collect();
        {
            let mut respmat = RespMat::new(2, 2, 0, false).with_path(&path);
            respmat.set_matrix(values.clone()).unwrap();
        }
        let respmat = RespMat::new(2, 2, 0, false).with_path(&path);
        assert_eq!(respmat.matrix(), values);
    }
}
