//! SOFB configuration
//!
//! One explicit configuration object, constructed once per accelerator
//! section and passed by shared reference to every component that needs it.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sofb_clients_bpm::AcqSettings;
use sofb_clients_correctors::{CorrKind, KickLimits};

/// SOFB configuration of one accelerator section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SofbConfig {
    pub bpm_names: Vec<String>,
    pub ch_names: Vec<String>,
    pub cv_names: Vec<String>,
    /// A ring corrects the path length with an RF frequency kick
    pub rf: bool,
    pub acquisition: AcqSettings,
    /// Corrector strength polling rate [Hz]
    pub strength_poll_rate: f64,
    /// Status aggregation refresh rate [Hz]
    pub status_rate: f64,
    /// Closed loop correction rate [Hz]
    pub loop_rate: f64,
    pub limits: KickLimits,
    /// Response matrix measurement deltas: [urad] for magnets, [Hz] for RF
    pub meas_delta_ch: f64,
    pub meas_delta_cv: f64,
    pub meas_delta_rf: f64,
    /// Settle delay before the synchronizing trigger [ms]
    pub settle_ms: u64,
    /// Synchronized corrector application
    pub sync: bool,
}

impl Default for SofbConfig {
    fn default() -> Self {
        Self {
            bpm_names: Vec::new(),
            ch_names: Vec::new(),
            cv_names: Vec::new(),
            rf: true,
            acquisition: AcqSettings::default(),
            strength_poll_rate: 2f64,
            status_rate: 2f64,
            loop_rate: 1f64,
            limits: KickLimits::default(),
            meas_delta_ch: 15f64,
            meas_delta_cv: 15f64,
            meas_delta_rf: 80f64,
            settle_ms: 50,
            sync: false,
        }
    }
}

impl SofbConfig {
    pub fn n_bpm(&self) -> usize {
        self.bpm_names.len()
    }
    pub fn n_corr(&self) -> usize {
        self.ch_names.len() + self.cv_names.len() + self.rf as usize
    }
    /// Corrector kinds in bench order `[CH...][CV...][RF]`
    pub fn corrector_kinds(&self) -> Vec<CorrKind> {
        let mut kinds = vec![CorrKind::Ch; self.ch_names.len()];
        kinds.extend(vec![CorrKind::Cv; self.cv_names.len()]);
        if self.rf {
            kinds.push(CorrKind::Rf);
        }
        kinds
    }
    /// Measurement delta of every corrector, bench order
    pub fn meas_deltas(&self) -> Vec<f64> {
        self.corrector_kinds()
            .into_iter()
            .map(|kind| match kind {
                CorrKind::Ch => self.meas_delta_ch,
                CorrKind::Cv => self.meas_delta_cv,
                _ => self.meas_delta_rf,
            })
            .collect()
    }
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
    pub fn poll_period(&self) -> Duration {
        Duration::from_secs_f64(1f64 / self.strength_poll_rate.max(1e-3))
    }
    pub fn status_period(&self) -> Duration {
        Duration::from_secs_f64(1f64 / self.status_rate.max(1e-3))
    }
}
