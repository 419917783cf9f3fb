//! BPM position calibration
//!
//! The raw difference-over-sum ratios map to physical positions either
//! through the linear `kx`/`ky` gains or, when the electronics have been
//! bench calibrated, through a pair of 15-term odd polynomials per plane.

use serde::{Deserialize, Serialize};

use crate::BpmError;

/// 15-term odd polynomial in two difference-over-sum ratios
///
/// The terms are `d^(2a+1) * t^(2b)` for every pair `(a, b)` with
/// `2a + 1 + 2b <= 9`, ordered by increasing `a` then `b`: `d` is the ratio
/// of the evaluated plane, `t` the ratio of the other plane. Odd symmetry in
/// `d` guarantees a centered beam decodes to zero regardless of the other
/// plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OddPolynomial {
    coeffs: Vec<f64>,
}

impl OddPolynomial {
    pub const N_TERMS: usize = 15;
    pub const DEGREE: u32 = 9;

    pub fn new(coeffs: Vec<f64>) -> std::result::Result<Self, BpmError> {
        if coeffs.len() != Self::N_TERMS {
            return Err(BpmError::Polynomial {
                expected: Self::N_TERMS,
                found: coeffs.len(),
            });
        }
        Ok(Self { coeffs })
    }
    /// Polynomial reduced to `gain * d`
    pub fn linear(gain: f64) -> Self {
        let mut coeffs = vec![0f64; Self::N_TERMS];
        coeffs[0] = gain;
        Self { coeffs }
    }
    pub fn coeffs(&self) -> &[f64] {
        &self.coeffs
    }
    /// Evaluates the polynomial at `(d, t)`
    pub fn eval(&self, d: f64, t: f64) -> f64 {
        let mut value = 0f64;
        let mut k = 0;
        for a in 0..=(Self::DEGREE - 1) / 2 {
            let d_odd = d.powi(2 * a as i32 + 1);
            let mut b = 0;
            while 2 * a + 1 + 2 * b <= Self::DEGREE {
                value += self.coeffs[k] * d_odd * t.powi(2 * b as i32);
                k += 1;
                b += 1;
            }
        }
        value
    }
}

/// Bench-measured polynomial calibration, one polynomial per plane
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolynomialPair {
    /// Horizontal plane, odd in `d1 = (A - B) / (A + B)`
    pub x: OddPolynomial,
    /// Vertical plane, odd in `d2 = (D - C) / (D + C)`
    pub y: OddPolynomial,
}

/// Per-BPM calibration constants
///
/// Positions are in micrometers; `ksum` scales the summed electrode
/// amplitude to the machine current units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BpmCalibration {
    pub kx: f64,
    pub ky: f64,
    pub ksum: f64,
    /// Mechanical offset of the electrical center [um]
    pub offset_x: f64,
    pub offset_y: f64,
    /// Polynomial calibration, linear gains apply when absent
    pub polynomial: Option<PolynomialPair>,
}

impl Default for BpmCalibration {
    fn default() -> Self {
        Self {
            kx: 8_000f64,
            ky: 8_000f64,
            ksum: 1f64,
            offset_x: 0f64,
            offset_y: 0f64,
            polynomial: None,
        }
    }
}

impl BpmCalibration {
    /// Maps the difference-over-sum ratios to `(x, y)` positions [um]
    pub fn position(&self, d1: f64, d2: f64) -> (f64, f64) {
        match &self.polynomial {
            Some(PolynomialPair { x, y }) => {
                (x.eval(d1, d2) - self.offset_x, y.eval(d2, d1) - self.offset_y)
            }
            None => (self.kx * d1 - self.offset_x, self.ky * d2 - self.offset_y),
        }
    }
}
