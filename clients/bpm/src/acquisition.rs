//! Orbit acquisition
//!
//! [OrbitAcquisition] aggregates every [BpmReader] into the orbit error
//! vector, owns the acquisition-mode state machine and runs the periodic
//! refresh task that keeps the smoothing buffers filled.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use interface::{Notifier, OrbitSource, StatusBits};
use log::{debug, info, warn};
use sofb_clients_timing::{EventTiming, TriggerConfig, TriggerSource};
use tokio::sync::watch;

use crate::{
    filing, orbit_file, AcquisitionError, AcquisitionMode, BpmReader, Result, SmoothMethod,
};

/// Acquisition state change events
#[derive(Debug, Clone, PartialEq)]
pub enum OrbitEvent {
    ModeChanged(AcquisitionMode),
    ReferenceUpdated,
    OfflineOrbitUpdated,
    SmoothingReset,
}

/// Orbit acquisition settings
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AcqSettings {
    /// Periodic tick rate [Hz]
    pub rate: f64,
    /// Tick rate divisor while a hardware trigger drives new samples
    pub triggered_divisor: u32,
    pub smooth_n_pts: usize,
    pub smooth_method: SmoothMethod,
    /// Directory of the persisted reference and offline orbits
    pub data_dir: std::path::PathBuf,
}

impl Default for AcqSettings {
    fn default() -> Self {
        Self {
            rate: 10f64,
            triggered_divisor: 10,
            smooth_n_pts: 10,
            smooth_method: SmoothMethod::default(),
            data_dir: ".".into(),
        }
    }
}

/// Per-BPM status masks, a raised bit flags a problem
#[derive(Debug, Clone)]
pub struct OrbitStatus {
    pub connected: StatusBits,
    pub enabled: StatusBits,
    pub ok: StatusBits,
}

impl OrbitStatus {
    pub fn all_clear(&self) -> bool {
        self.connected.all_clear() && self.enabled.all_clear() && self.ok.all_clear()
    }
}

struct Orbits {
    mode: AcquisitionMode,
    reference: (Vec<f64>, Vec<f64>),
    offline: (Vec<f64>, Vec<f64>),
}

/// Beam position monitor aggregation
pub struct OrbitAcquisition {
    readers: Vec<BpmReader>,
    timing: Arc<EventTiming>,
    settings: AcqSettings,
    shared: Mutex<Orbits>,
    events: Notifier<OrbitEvent>,
}

impl OrbitAcquisition {
    /// Creates the aggregation, reloading the persisted orbits
    ///
    /// Missing or malformed orbit files log a warning and default to zero.
    /// The acquisition mode always restarts [Offline](AcquisitionMode::Offline).
    pub fn new(
        readers: Vec<BpmReader>,
        timing: Arc<EventTiming>,
        settings: AcqSettings,
    ) -> Result<Self> {
        if readers.is_empty() {
            return Err(AcquisitionError::NoBpm);
        }
        let n_bpm = readers.len();
        for reader in &readers {
            reader.set_smoothing(settings.smooth_n_pts, settings.smooth_method);
        }
        let reference = load_or_zero(&settings.data_dir, "reference", n_bpm);
        let offline = load_or_zero(&settings.data_dir, "offline", n_bpm);
        Ok(Self {
            readers,
            timing,
            settings,
            shared: Mutex::new(Orbits {
                mode: AcquisitionMode::default(),
                reference,
                offline,
            }),
            events: Notifier::new(),
        })
    }
    pub fn n_bpm(&self) -> usize {
        self.readers.len()
    }
    pub fn readers(&self) -> &[BpmReader] {
        &self.readers
    }
    pub fn mode(&self) -> AcquisitionMode {
        self.shared.lock().unwrap().mode
    }
    /// Registers an acquisition event subscriber
    pub fn subscribe(&self) -> flume::Receiver<OrbitEvent> {
        self.events.subscribe()
    }

    /// Switches the acquisition mode
    ///
    /// Stops a prior triggered acquisition, reconfigures every reader and
    /// the timing event generator for the new mode, clears the smoothing
    /// buffers and restarts.
    pub fn set_mode(&self, mode: AcquisitionMode) {
        let prior = {
            let mut shared = self.shared.lock().unwrap();
            std::mem::replace(&mut shared.mode, mode)
        };
        if prior == mode {
            return;
        }
        if prior.is_triggered() {
            for reader in &self.readers {
                reader.set_acquire(false);
            }
        }
        if mode.is_live() {
            for reader in &self.readers {
                reader.configure(mode);
            }
        }
        if mode.is_triggered() {
            self.timing.configure(trigger_for(mode));
            for reader in &self.readers {
                reader.set_acquire(true);
            }
        }
        self.reset_smoothing();
        info!("acquisition mode {prior:?} -> {mode:?}");
        self.events.notify(OrbitEvent::ModeChanged(mode));
    }

    /// Overrides the trigger programming of the active mode
    pub fn set_trigger(&self, config: TriggerConfig) -> bool {
        self.timing.configure(config)
    }

    /// Reference orbit `(x, y)` columns [um]
    pub fn reference(&self) -> (Vec<f64>, Vec<f64>) {
        self.shared.lock().unwrap().reference.clone()
    }
    /// Replaces and persists the reference orbit; clears the smoothing buffers
    pub fn set_reference(&self, x: Vec<f64>, y: Vec<f64>) -> Result<()> {
        self.set_orbit_columns(x, y, "reference")?;
        self.events.notify(OrbitEvent::ReferenceUpdated);
        Ok(())
    }
    pub fn offline_orbit(&self) -> (Vec<f64>, Vec<f64>) {
        self.shared.lock().unwrap().offline.clone()
    }
    /// Replaces and persists the offline orbit
    pub fn set_offline_orbit(&self, x: Vec<f64>, y: Vec<f64>) -> Result<()> {
        self.set_orbit_columns(x, y, "offline")?;
        self.events.notify(OrbitEvent::OfflineOrbitUpdated);
        Ok(())
    }

    fn set_orbit_columns(&self, x: Vec<f64>, y: Vec<f64>, which: &str) -> Result<()> {
        let n_bpm = self.n_bpm();
        for column in [&x, &y] {
            if column.len() != n_bpm {
                return Err(AcquisitionError::SizeMismatch {
                    expected: n_bpm,
                    found: column.len(),
                });
            }
        }
        filing::save_orbit(orbit_file(&self.settings.data_dir, which), &x, &y)?;
        {
            let mut shared = self.shared.lock().unwrap();
            match which {
                "reference" => shared.reference = (x, y),
                _ => shared.offline = (x, y),
            }
        }
        if which == "reference" {
            self.reset_smoothing();
        }
        Ok(())
    }

    /// Clears every smoothing buffer
    pub fn reset_smoothing(&self) {
        for reader in &self.readers {
            reader.reset();
        }
        self.events.notify(OrbitEvent::SmoothingReset);
    }
    /// Resizes every smoothing buffer, clearing them
    pub fn set_smoothing(&self, n_pts: usize, method: SmoothMethod) {
        for reader in &self.readers {
            reader.set_smoothing(n_pts, method);
        }
        self.events.notify(OrbitEvent::SmoothingReset);
    }

    /// Per-BPM connectivity/enabled/ok status for the active mode
    pub fn status(&self) -> OrbitStatus {
        let mode = self.mode();
        let n_bpm = self.n_bpm();
        let mut status = OrbitStatus {
            connected: StatusBits::new(n_bpm),
            enabled: StatusBits::new(n_bpm),
            ok: StatusBits::new(n_bpm),
        };
        for (idx, reader) in self.readers.iter().enumerate() {
            status.connected.set(idx, !reader.connected(mode));
            status.enabled.set(idx, !reader.enabled());
            status.ok.set(idx, !reader.ok());
        }
        status
    }

    /// One smoothing window at the current tick rate
    pub fn smoothing_window(&self) -> Duration {
        let period = self.tick_period(self.mode());
        period.mul_f64(self.settings.smooth_n_pts as f64)
    }

    fn tick_period(&self, mode: AcquisitionMode) -> Duration {
        let rate = if mode.is_triggered() {
            self.settings.rate / self.settings.triggered_divisor.max(1) as f64
        } else {
            self.settings.rate
        };
        Duration::from_secs_f64(1f64 / rate.max(1e-3))
    }

    /// The orbit error vector, X plane then Y plane, relative to the
    /// reference orbit
    ///
    /// Offline mode returns the offline orbit minus the reference. With
    /// `reset`, the smoothing buffers are cleared, the call waits one
    /// smoothing window and then polls for up to three more windows for a
    /// sample per plane; a plane still empty after that falls back to the
    /// reference value.
    pub async fn get_orbit(&self, reset: bool) -> Vec<f64> {
        let mode = self.mode();
        if !mode.is_live() {
            let shared = self.shared.lock().unwrap();
            let (ref_x, ref_y) = &shared.reference;
            let (off_x, off_y) = &shared.offline;
            return off_x
                .iter()
                .zip(ref_x)
                .chain(off_y.iter().zip(ref_y))
                .map(|(offline, reference)| offline - reference)
                .collect();
        }
        if reset {
            self.reset_smoothing();
            let window = self.smoothing_window();
            tokio::time::sleep(window).await;
            let poll = self.tick_period(mode);
            let deadline = tokio::time::Instant::now() + window.mul_f64(3f64);
            while tokio::time::Instant::now() < deadline {
                let filled = self
                    .readers
                    .iter()
                    .filter(|reader| reader.enabled() && reader.connected(mode))
                    .all(|reader| {
                        let (x, y) = reader.smoothed();
                        x.is_some() && y.is_some()
                    });
                if filled {
                    break;
                }
                tokio::time::sleep(poll).await;
            }
        }
        let shared = self.shared.lock().unwrap();
        let (ref_x, ref_y) = &shared.reference;
        let mut orbit = vec![0f64; 2 * self.n_bpm()];
        let n_bpm = self.n_bpm();
        for (idx, reader) in self.readers.iter().enumerate() {
            let (x, y) = if reader.enabled() {
                reader.smoothed()
            } else {
                (None, None)
            };
            orbit[idx] = match x {
                Some(x) => x - ref_x[idx],
                None => {
                    substituted(reader, "X", reset);
                    0f64
                }
            };
            orbit[n_bpm + idx] = match y {
                Some(y) => y - ref_y[idx],
                None => {
                    substituted(reader, "Y", reset);
                    0f64
                }
            };
        }
        orbit
    }

    /// Periodic refresh task, one tick per acquisition period
    ///
    /// Triggered modes tick slower since a hardware trigger drives new
    /// samples. Exits when `shutdown` flips to `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let mode = self.mode();
            tokio::select! {
                _ = tokio::time::sleep(self.tick_period(mode)) => {
                    if mode.is_live() {
                        for reader in &self.readers {
                            reader.acquire(mode);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

fn substituted(reader: &BpmReader, plane: &str, reset: bool) {
    if reader.enabled() {
        if reset {
            warn!(
                "{}: no {plane} sample after reset window, substituting reference",
                reader.name()
            );
        } else {
            debug!("{}: no {plane} sample, substituting reference", reader.name());
        }
    }
}

fn load_or_zero(dir: &std::path::Path, which: &str, n_bpm: usize) -> (Vec<f64>, Vec<f64>) {
    match filing::load_orbit(orbit_file(dir, which), n_bpm) {
        Ok(columns) => columns,
        Err(e) => {
            warn!("{which} orbit not reloaded, defaulting to zero: {e}");
            (vec![0f64; n_bpm], vec![0f64; n_bpm])
        }
    }
}

fn trigger_for(mode: AcquisitionMode) -> TriggerConfig {
    match mode {
        // sample the very first beam passage
        AcquisitionMode::SinglePass => TriggerConfig {
            source: TriggerSource::Injection,
            delay: 0f64,
            n_pulses: 1,
        },
        // let the injected beam settle before the turn-by-turn burst
        _ => TriggerConfig {
            source: TriggerSource::Injection,
            delay: 100f64,
            n_pulses: 1,
        },
    }
}

#[async_trait]
impl OrbitSource for OrbitAcquisition {
    fn n_bpm(&self) -> usize {
        self.readers.len()
    }
    fn is_live(&self) -> bool {
        self.mode().is_live()
    }
    async fn orbit(&self, reset: bool) -> Vec<f64> {
        self.get_orbit(reset).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::tests::{soft_bpm, SoftBpm};
    use interface::mock::SoftDevice;

    struct Devices {
        pos_x: SoftDevice,
        pos_y: SoftDevice,
        acq_ctrl: SoftDevice,
    }

    fn acquisition(n_bpm: usize) -> (OrbitAcquisition, Vec<Devices>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let timing = Arc::new(sofb_clients_timing::EventTiming::new(
            SoftDevice::new(0f64).handle(),
            SoftDevice::new(0f64).handle(),
        ));
        let mut readers = Vec::new();
        let mut soft = Vec::new();
        for idx in 0..n_bpm {
            let SoftBpm {
                reader,
                pos_x,
                pos_y,
                acq_ctrl,
                ..
            } = soft_bpm(&format!("bpm-{idx:02}"));
            readers.push(reader);
            soft.push(Devices {
                pos_x,
                pos_y,
                acq_ctrl,
            });
        }
        let settings = AcqSettings {
            rate: 100f64,
            smooth_n_pts: 2,
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        (
            OrbitAcquisition::new(readers, timing, settings).unwrap(),
            soft,
            dir,
        )
    }

    #[tokio::test]
    async fn offline_orbit_is_offline_minus_reference() {
        let (acq, _soft, _dir) = acquisition(2);
        acq.set_reference(vec![1.0, 1.0], vec![0.0, 0.0]).unwrap();
        acq.set_offline_orbit(vec![3.0, 1.0], vec![0.5, 0.0]).unwrap();
        assert_eq!(acq.get_orbit(false).await, vec![2.0, 0.0, 0.5, 0.0]);
    }

    #[tokio::test]
    async fn degraded_bpm_substitutes_reference() {
        let (acq, soft, _dir) = acquisition(3);
        acq.set_mode(AcquisitionMode::SlowOrbit);
        for bpm in &soft {
            bpm.pos_x.set_value(2.0);
            bpm.pos_y.set_value(-1.0);
        }
        soft[1].pos_x.set_connected(false);
        soft[1].pos_y.set_connected(false);
        for reader in acq.readers() {
            reader.acquire(AcquisitionMode::SlowOrbit);
        }
        let orbit = acq.get_orbit(false).await;
        assert_eq!(orbit, vec![2.0, 0.0, 2.0, -1.0, 0.0, -1.0]);
        let status = acq.status();
        assert!(status.connected.get(1));
        assert!(!status.connected.get(0));
    }

    #[tokio::test]
    async fn orbit_is_idempotent_without_new_samples() {
        let (acq, soft, _dir) = acquisition(2);
        acq.set_mode(AcquisitionMode::SlowOrbit);
        for bpm in &soft {
            bpm.pos_x.set_value(1.5);
            bpm.pos_y.set_value(0.5);
        }
        for reader in acq.readers() {
            reader.acquire(AcquisitionMode::SlowOrbit);
        }
        let first = acq.get_orbit(false).await;
        let second = acq.get_orbit(false).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn mode_change_reconfigures_and_restarts() {
        let (acq, soft, _dir) = acquisition(2);
        acq.set_mode(AcquisitionMode::SinglePass);
        assert_eq!(
            soft[0].acq_ctrl.config_value("Channel"),
            Some(interface::Value::Scalar(2.0))
        );
        assert_eq!(
            soft[0].acq_ctrl.config_value("Acquire"),
            Some(interface::Value::Scalar(1.0))
        );
        acq.set_mode(AcquisitionMode::SlowOrbit);
        assert_eq!(
            soft[0].acq_ctrl.config_value("Acquire"),
            Some(interface::Value::Scalar(0.0))
        );
        assert_eq!(
            soft[0].acq_ctrl.config_value("Channel"),
            Some(interface::Value::Scalar(0.0))
        );
    }

    #[tokio::test]
    async fn reference_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let settings = AcqSettings {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let timing = || {
            Arc::new(sofb_clients_timing::EventTiming::new(
                SoftDevice::new(0f64).handle(),
                SoftDevice::new(0f64).handle(),
            ))
        };
        let readers = || vec![soft_bpm("bpm-00").reader, soft_bpm("bpm-01").reader];
        let acq = OrbitAcquisition::new(readers(), timing(), settings.clone()).unwrap();
        acq.set_reference(vec![1.0, 2.0], vec![-1.0, -2.0]).unwrap();
        drop(acq);
        let acq = OrbitAcquisition::new(readers(), timing(), settings).unwrap();
        assert_eq!(acq.reference(), (vec![1.0, 2.0], vec![-1.0, -2.0]));
    }
}
