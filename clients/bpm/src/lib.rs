/*!
# SOFB beam position monitor client

Decoding, smoothing and aggregation of the beam position monitors into the
orbit error vector consumed by the feedback loop.

Each monitor is owned by a [BpmReader] that decodes the raw device samples
into a calibrated `(x, y, sum)` triple for the active [AcquisitionMode] and
feeds a fixed-capacity smoothing buffer. [OrbitAcquisition] aggregates every
reader into the `2 * n_bpm` orbit vector (X plane then Y plane) relative to
the reference orbit, runs the periodic refresh task and owns the
acquisition-mode state machine.

A disconnected or misbehaving monitor degrades its two vector elements to
the reference value and raises a status bit; it never aborts the read.
*/

use std::path::PathBuf;

mod calibration;
pub use calibration::{BpmCalibration, OddPolynomial, PolynomialPair};
mod decode;
pub use decode::{decode_single_pass, SampleWindow};
mod smoothing;
pub use smoothing::{SmoothBuffer, SmoothMethod};
mod reader;
pub use reader::{BpmHandles, BpmReader};
mod acquisition;
pub use acquisition::{AcqSettings, OrbitAcquisition, OrbitEvent, OrbitStatus};
pub mod filing;

/// Orbit acquisition mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum AcquisitionMode {
    /// Orbit read from file, no hardware access
    #[default]
    Offline,
    /// Periodic closed-orbit samples from the position electronics
    SlowOrbit,
    /// Turn-by-turn position waveforms (ring)
    MultiTurn,
    /// Raw antenna waveforms decoded per beam passage (transport line)
    SinglePass,
}
impl AcquisitionMode {
    /// `true` when samples come from the machine
    pub fn is_live(self) -> bool {
        !matches!(self, AcquisitionMode::Offline)
    }
    /// `true` when a hardware trigger drives new samples
    pub fn is_triggered(self) -> bool {
        matches!(self, AcquisitionMode::MultiTurn | AcquisitionMode::SinglePass)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BpmError {
    #[error("no new sample available")]
    NotReady,
    #[error("device disconnected")]
    Disconnected,
    #[error("not enough samples ({found} available, {min} required)")]
    TooFewSamples { found: usize, min: usize },
    #[error("degenerate electrode sum")]
    ZeroSum,
    #[error("calibration polynomial expects {expected} coefficients, found {found}")]
    Polynomial { expected: usize, found: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum AcquisitionError {
    #[error("expected a vector of length {expected}, found {found}")]
    SizeMismatch { expected: usize, found: usize },
    #[error("orbit file error")]
    Filing(#[from] filing::FilingError),
    #[error("no beam position monitor defined")]
    NoBpm,
}

pub type Result<T> = std::result::Result<T, AcquisitionError>;

pub(crate) fn orbit_file(dir: &std::path::Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.orb"))
}
