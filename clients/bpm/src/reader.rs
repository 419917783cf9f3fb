//! Per-BPM device reader
//!
//! A [BpmReader] owns the device handles of one monitor, decodes the raw
//! samples of the active acquisition mode into a calibrated `(x, y, sum)`
//! triple and maintains the smoothing buffers sampled by the orbit
//! aggregation.

use std::sync::Mutex;

use interface::{Handle, Value};
use log::warn;

use crate::{
    decode::decode_single_pass, AcquisitionMode, BpmCalibration, BpmError, SampleWindow,
    SmoothBuffer, SmoothMethod,
};

/// Device handles of one monitor
///
/// Scalars serve the slow closed-orbit mode, waveforms the triggered modes;
/// `acq_count` advances with every completed triggered acquisition and
/// `acq_ctrl` receives the mode configuration fields.
pub struct BpmHandles {
    pub pos_x: Handle,
    pub pos_y: Handle,
    pub sum: Handle,
    pub turns_x: Handle,
    pub turns_y: Handle,
    pub turns_sum: Handle,
    /// Antenna bursts, ordered `[A, B, C, D]`
    pub antennas: [Handle; 4],
    pub acq_count: Handle,
    pub acq_ctrl: Handle,
}

struct ReaderState {
    x: SmoothBuffer,
    y: SmoothBuffer,
    sum: SmoothBuffer,
    sample_window: SampleWindow,
    turn_window: SampleWindow,
    last_count: Option<f64>,
    enabled: bool,
    ok: bool,
}

/// One beam position monitor
pub struct BpmReader {
    name: String,
    handles: BpmHandles,
    calibration: BpmCalibration,
    state: Mutex<ReaderState>,
}

impl BpmReader {
    pub fn new(name: impl Into<String>, handles: BpmHandles) -> Self {
        Self {
            name: name.into(),
            handles,
            calibration: BpmCalibration::default(),
            state: Mutex::new(ReaderState {
                x: SmoothBuffer::new(1, SmoothMethod::Mean),
                y: SmoothBuffer::new(1, SmoothMethod::Mean),
                sum: SmoothBuffer::new(1, SmoothMethod::Mean),
                sample_window: SampleWindow::default(),
                turn_window: SampleWindow {
                    min_samples: 1,
                    ..Default::default()
                },
                last_count: None,
                enabled: true,
                ok: true,
            }),
        }
    }
    /// Replaces the default calibration
    pub fn with_calibration(mut self, calibration: BpmCalibration) -> Self {
        self.calibration = calibration;
        self
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn calibration(&self) -> &BpmCalibration {
        &self.calibration
    }
    /// Connectivity of every handle the given mode reads
    pub fn connected(&self, mode: AcquisitionMode) -> bool {
        match mode {
            AcquisitionMode::Offline => true,
            AcquisitionMode::SlowOrbit => {
                self.handles.pos_x.connected()
                    && self.handles.pos_y.connected()
                    && self.handles.sum.connected()
            }
            AcquisitionMode::MultiTurn => {
                self.handles.turns_x.connected()
                    && self.handles.turns_y.connected()
                    && self.handles.acq_count.connected()
            }
            AcquisitionMode::SinglePass => {
                self.handles.antennas.iter().all(|antenna| antenna.connected())
                    && self.handles.acq_count.connected()
            }
        }
    }
    pub fn enabled(&self) -> bool {
        self.state.lock().unwrap().enabled
    }
    pub fn set_enabled(&self, enabled: bool) {
        self.state.lock().unwrap().enabled = enabled;
    }
    /// `true` while the last acquisition decoded cleanly
    pub fn ok(&self) -> bool {
        self.state.lock().unwrap().ok
    }

    /// Pushes the acquisition parameters of `mode` to the electronics
    ///
    /// Required on every mode change; returns `false` when the control
    /// point is disconnected.
    pub fn configure(&self, mode: AcquisitionMode) -> bool {
        if !self.handles.acq_ctrl.connected() {
            warn!("{}: acquisition control disconnected, not configured", self.name);
            return false;
        }
        for &(field, value) in acq_params(mode) {
            self.handles.acq_ctrl.put_config(field, Value::Scalar(value));
        }
        self.state.lock().unwrap().last_count = None;
        true
    }
    /// Starts or stops the triggered acquisition engine
    pub fn set_acquire(&self, run: bool) {
        self.handles
            .acq_ctrl
            .put_config("Acquire", Value::Scalar(run as u8 as f64));
    }

    /// Decodes one `(x, y, sum)` triple for `mode`
    pub fn read(&self, mode: AcquisitionMode) -> std::result::Result<(f64, f64, f64), BpmError> {
        if !self.connected(mode) {
            return Err(BpmError::Disconnected);
        }
        match mode {
            AcquisitionMode::Offline => Err(BpmError::NotReady),
            AcquisitionMode::SlowOrbit => {
                let x = scalar(&self.handles.pos_x)?;
                let y = scalar(&self.handles.pos_y)?;
                let sum = scalar(&self.handles.sum)?;
                Ok((x, y, self.calibration.ksum * sum))
            }
            AcquisitionMode::MultiTurn => {
                self.fresh_sample()?;
                let turn_window = self.state.lock().unwrap().turn_window;
                let x = turn_average(&self.handles.turns_x, &turn_window)?;
                let y = turn_average(&self.handles.turns_y, &turn_window)?;
                let sum = turn_average(&self.handles.turns_sum, &turn_window)?;
                Ok((x, y, self.calibration.ksum * sum))
            }
            AcquisitionMode::SinglePass => {
                self.fresh_sample()?;
                let bursts = self
                    .handles
                    .antennas
                    .iter()
                    .map(|antenna| {
                        antenna
                            .read()
                            .and_then(|value| value.as_slice().map(<[f64]>::to_vec))
                            .ok_or(BpmError::Disconnected)
                    })
                    .collect::<std::result::Result<Vec<Vec<f64>>, BpmError>>()?;
                let sample_window = self.state.lock().unwrap().sample_window;
                decode_single_pass(
                    [&bursts[0], &bursts[1], &bursts[2], &bursts[3]],
                    &sample_window,
                    &self.calibration,
                )
            }
        }
    }

    /// Acquisition tick: decode and append into the smoothing buffers
    pub fn acquire(&self, mode: AcquisitionMode) {
        if !self.enabled() {
            return;
        }
        match self.read(mode) {
            Ok((x, y, sum)) => {
                let mut state = self.state.lock().unwrap();
                state.x.push(x);
                state.y.push(y);
                state.sum.push(sum);
                state.ok = true;
            }
            Err(BpmError::NotReady) => (),
            Err(e) => {
                let mut state = self.state.lock().unwrap();
                if state.ok {
                    warn!("{}: acquisition degraded: {}", self.name, e);
                }
                state.ok = false;
            }
        }
    }

    /// Smoothed `(x, y)` positions, `None` per plane while its buffer is empty
    pub fn smoothed(&self) -> (Option<f64>, Option<f64>) {
        let state = self.state.lock().unwrap();
        (state.x.value(), state.y.value())
    }
    /// Smoothed sum signal
    pub fn smoothed_sum(&self) -> Option<f64> {
        self.state.lock().unwrap().sum.value()
    }
    /// Clears every smoothing buffer atomically
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.x.clear();
        state.y.clear();
        state.sum.clear();
    }
    /// Resizes the smoothing buffers, clearing them
    pub fn set_smoothing(&self, n_pts: usize, method: SmoothMethod) {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        for buffer in [&mut state.x, &mut state.y, &mut state.sum] {
            buffer.set_capacity(n_pts);
            buffer.set_method(method);
        }
    }
    /// Single-pass sample window; clears the smoothing buffers
    pub fn set_sample_window(&self, window: SampleWindow) {
        let mut state = self.state.lock().unwrap();
        state.sample_window = window;
        state.x.clear();
        state.y.clear();
        state.sum.clear();
    }
    /// Multi-turn averaging window; clears the smoothing buffers
    pub fn set_turn_window(&self, window: SampleWindow) {
        let mut state = self.state.lock().unwrap();
        state.turn_window = window;
        state.x.clear();
        state.y.clear();
        state.sum.clear();
    }

    fn fresh_sample(&self) -> std::result::Result<(), BpmError> {
        let count = scalar(&self.handles.acq_count)?;
        let mut state = self.state.lock().unwrap();
        if state.last_count == Some(count) {
            return Err(BpmError::NotReady);
        }
        state.last_count = Some(count);
        Ok(())
    }
}

fn scalar(handle: &Handle) -> std::result::Result<f64, BpmError> {
    handle
        .read()
        .and_then(|value| value.as_f64())
        .ok_or(BpmError::Disconnected)
}

fn turn_average(
    handle: &Handle,
    window: &SampleWindow,
) -> std::result::Result<f64, BpmError> {
    let turns = handle
        .read()
        .and_then(|value| value.as_slice().map(<[f64]>::to_vec))
        .ok_or(BpmError::Disconnected)?;
    let selected = window.slice(&turns);
    if selected.len() < window.min_samples {
        return Err(BpmError::TooFewSamples {
            found: selected.len(),
            min: window.min_samples,
        });
    }
    Ok(selected.iter().sum::<f64>() / selected.len() as f64)
}

fn acq_params(mode: AcquisitionMode) -> &'static [(&'static str, f64)] {
    match mode {
        AcquisitionMode::Offline => &[],
        AcquisitionMode::SlowOrbit => &[("Channel", 0.0), ("TriggerType", 0.0)],
        AcquisitionMode::MultiTurn => &[
            ("Channel", 1.0),
            ("TriggerType", 1.0),
            ("NrSamplesPre", 0.0),
            ("NrSamplesPost", 2_000.0),
            ("NrShots", 1.0),
        ],
        AcquisitionMode::SinglePass => &[
            ("Channel", 2.0),
            ("TriggerType", 1.0),
            ("NrSamplesPre", 0.0),
            ("NrSamplesPost", 400.0),
            ("NrShots", 1.0),
            ("SwitchingMode", 0.0),
        ],
    }
}
