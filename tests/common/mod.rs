//! Soft device rig shared by the integration tests
//!
//! Builds a full [Sofb] against in-memory devices. Corrector setpoint and
//! readback share one device, the way a settled power supply reads back its
//! own setpoint. An optional physics task closes the loop outside the
//! engine: it maps the corrector strengths through a response matrix onto
//! the BPM position devices.

#![allow(dead_code)]

use std::time::Duration;

use interface::mock::SoftDevice;
use sofb::prelude::*;

pub struct SoftRig {
    pub bpm_x: Vec<SoftDevice>,
    pub bpm_y: Vec<SoftDevice>,
    /// Setpoint and readback of each corrector, bench order
    pub corr: Vec<SoftDevice>,
    pub corr_power: Vec<SoftDevice>,
    pub corr_mode: Vec<SoftDevice>,
    pub event: SoftDevice,
    pub trigger: SoftDevice,
    pub dir: tempfile::TempDir,
}

impl SoftRig {
    pub fn corr_strengths(&self) -> Vec<f64> {
        self.corr
            .iter()
            .map(|device| device.read().and_then(|value| value.as_f64()).unwrap_or(0.0))
            .collect()
    }
    /// Spawns the toy accelerator: `positions = base + matrix * kicks`
    ///
    /// `matrix` is row-major `(2 * n_bpm, n_corr)`, rows X plane then Y
    /// plane, `base` the uncorrected orbit.
    pub fn spawn_physics(&self, matrix: Vec<f64>, base: Vec<f64>) -> tokio::task::JoinHandle<()> {
        let bpm_x = self.bpm_x.clone();
        let bpm_y = self.bpm_y.clone();
        let corr = self.corr.clone();
        let n_bpm = bpm_x.len();
        let n_corr = corr.len();
        tokio::spawn(async move {
            loop {
                let kicks: Vec<f64> = corr
                    .iter()
                    .map(|device| device.read().and_then(|value| value.as_f64()).unwrap_or(0.0))
                    .collect();
                for row in 0..2 * n_bpm {
                    let response: f64 = (0..n_corr)
                        .map(|col| matrix[row * n_corr + col] * kicks[col])
                        .sum();
                    let position = base[row] + response;
                    if row < n_bpm {
                        bpm_x[row].set_value(position);
                    } else {
                        bpm_y[row - n_bpm].set_value(position);
                    }
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
    }
}

pub fn config(n_bpm: usize, n_ch: usize, n_cv: usize, rf: bool, dir: &std::path::Path) -> SofbConfig {
    SofbConfig {
        bpm_names: (0..n_bpm).map(|idx| format!("bpm-{idx:02}")).collect(),
        ch_names: (0..n_ch).map(|idx| format!("ch-{idx:02}")).collect(),
        cv_names: (0..n_cv).map(|idx| format!("cv-{idx:02}")).collect(),
        rf,
        acquisition: AcqSettings {
            rate: 200f64,
            smooth_n_pts: 2,
            data_dir: dir.to_path_buf(),
            ..Default::default()
        },
        loop_rate: 50f64,
        settle_ms: 0,
        ..Default::default()
    }
}

/// Builds a started-from-scratch engine over soft devices
pub fn rig(n_bpm: usize, n_ch: usize, n_cv: usize, rf: bool) -> (Sofb, SoftRig) {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let config = config(n_bpm, n_ch, n_cv, rf, dir.path());
    let bpm_x: Vec<SoftDevice> = (0..n_bpm).map(|_| SoftDevice::new(0f64)).collect();
    let bpm_y: Vec<SoftDevice> = (0..n_bpm).map(|_| SoftDevice::new(0f64)).collect();
    let bpms = bpm_x
        .iter()
        .zip(&bpm_y)
        .map(|(x, y)| BpmHandles {
            pos_x: x.handle(),
            pos_y: y.handle(),
            sum: SoftDevice::new(1f64).handle(),
            turns_x: SoftDevice::new(vec![0f64; 8]).handle(),
            turns_y: SoftDevice::new(vec![0f64; 8]).handle(),
            turns_sum: SoftDevice::new(vec![1f64; 8]).handle(),
            antennas: [
                SoftDevice::new(vec![1f64; 16]).handle(),
                SoftDevice::new(vec![1f64; 16]).handle(),
                SoftDevice::new(vec![1f64; 16]).handle(),
                SoftDevice::new(vec![1f64; 16]).handle(),
            ],
            acq_count: SoftDevice::new(0f64).handle(),
            acq_ctrl: SoftDevice::new(0f64).handle(),
        })
        .collect();
    let n_corr = config.n_corr();
    let corr: Vec<SoftDevice> = (0..n_corr).map(|_| SoftDevice::new(0f64)).collect();
    let corr_power: Vec<SoftDevice> = (0..n_corr).map(|_| SoftDevice::new(1f64)).collect();
    let corr_mode: Vec<SoftDevice> = (0..n_corr).map(|_| SoftDevice::new(0f64)).collect();
    let correctors = corr
        .iter()
        .zip(&corr_power)
        .zip(&corr_mode)
        .map(|((strength, power), mode)| CorrectorHandles {
            setpoint: strength.handle(),
            readback: strength.handle(),
            reference: SoftDevice::new(0f64).handle(),
            power: power.handle(),
            op_mode: mode.handle(),
        })
        .collect();
    let event = SoftDevice::new(0f64);
    let trigger = SoftDevice::new(0f64);
    let devices = SofbDevices {
        bpms,
        correctors,
        timing_event: event.handle(),
        timing_trigger: trigger.handle(),
    };
    let sofb = Sofb::new(&config, devices).unwrap();
    (
        sofb,
        SoftRig {
            bpm_x,
            bpm_y,
            corr,
            corr_power,
            corr_mode,
            event,
            trigger,
            dir,
        },
    )
}

/// Waits until `predicate` holds, panicking after `timeout`
pub async fn wait_for(timeout: Duration, what: &str, mut predicate: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !predicate() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
