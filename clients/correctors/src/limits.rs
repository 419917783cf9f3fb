//! Per-group kick limits
//!
//! Each corrector group carries an absolute kick ceiling, a delta-kick
//! ceiling per correction and the operator gain factor applied ahead of the
//! ceilings.

use serde::{Deserialize, Serialize};

use crate::CorrKind;

/// Safety limits of one corrector group
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroupLimits {
    /// Absolute kick ceiling [urad], [Hz] for the RF group
    pub max_kick: f64,
    /// Largest delta applied in one correction
    pub max_delta_kick: f64,
    /// Operator gain [%], first clipping stage
    pub gain_pct: f64,
}

impl GroupLimits {
    pub fn new(max_kick: f64, max_delta_kick: f64) -> Self {
        Self {
            max_kick,
            max_delta_kick,
            gain_pct: 100f64,
        }
    }
}

/// Limits of every corrector group
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KickLimits {
    pub ch: GroupLimits,
    pub cv: GroupLimits,
    pub rf: GroupLimits,
    pub septum: GroupLimits,
}

impl Default for KickLimits {
    fn default() -> Self {
        Self {
            ch: GroupLimits::new(300f64, 50f64),
            cv: GroupLimits::new(300f64, 50f64),
            rf: GroupLimits::new(10_000f64, 500f64),
            septum: GroupLimits::new(1_000f64, 100f64),
        }
    }
}

impl KickLimits {
    pub fn group(&self, kind: CorrKind) -> &GroupLimits {
        match kind {
            CorrKind::Ch => &self.ch,
            CorrKind::Cv => &self.cv,
            CorrKind::Rf => &self.rf,
            CorrKind::Septum => &self.septum,
        }
    }
    pub fn group_mut(&mut self, kind: CorrKind) -> &mut GroupLimits {
        match kind {
            CorrKind::Ch => &mut self.ch,
            CorrKind::Cv => &mut self.cv,
            CorrKind::Rf => &mut self.rf,
            CorrKind::Septum => &mut self.septum,
        }
    }
}
