/*!
# SOFB corrector bench

Actuation of the corrector magnets and the RF frequency under the per-group
safety limits.

[CorrectorBench] owns one [Corrector] per actuator, ordered
`[CH...][CV...][RF]`. Delta kicks pass through three clipping stages before
actuation: the operator gain factor, a proportional scale-back when the
largest delta exceeds its group ceiling, and a single whole-group factor
guaranteeing no actuator leaves its absolute range. A group whose current
strength already exceeds the absolute ceiling is rejected wholesale.

Application is partial-failure: a disconnected, unpowered or mis-moded
corrector is skipped with an error log while the others proceed. With
hardware synchronization enabled the setpoints are staged and only take
effect after one shared timing trigger, so every corrector changes on the
same accelerator turn.
*/

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use interface::{CorrectorSink, Handle, RoleError, StatusBits, Value};
use log::{error, info, warn};
use sofb_clients_timing::EventTiming;
use tokio::sync::watch;

mod limits;
pub use limits::{GroupLimits, KickLimits};

/// Corrector operation modes
pub const OP_MODE_SLOW_REF: f64 = 0f64;
pub const OP_MODE_SLOW_REF_SYNC: f64 = 1f64;

/// Corrector kind, one safety group each
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CorrKind {
    Ch,
    Cv,
    Rf,
    Septum,
}

/// Slice selector of a correction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum Subset {
    Ch,
    Cv,
    Rf,
    #[default]
    All,
}

impl Subset {
    /// `true` when the subset covers the given corrector kind
    ///
    /// Pulsed septa are excluded from every closed-loop selection.
    pub fn selects(self, kind: CorrKind) -> bool {
        match self {
            Subset::All => kind != CorrKind::Septum,
            Subset::Ch => kind == CorrKind::Ch,
            Subset::Cv => kind == CorrKind::Cv,
            Subset::Rf => kind == CorrKind::Rf,
        }
    }
}

/// Device handles of one corrector
pub struct CorrectorHandles {
    pub setpoint: Handle,
    pub readback: Handle,
    /// Fallback strength served while the readback is unreachable
    pub reference: Handle,
    pub power: Handle,
    pub op_mode: Handle,
}

/// One corrector power supply (or the RF frequency)
pub struct Corrector {
    name: String,
    kind: CorrKind,
    handles: CorrectorHandles,
}

impl Corrector {
    pub fn new(name: impl Into<String>, kind: CorrKind, handles: CorrectorHandles) -> Self {
        Self {
            name: name.into(),
            kind,
            handles,
        }
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn kind(&self) -> CorrKind {
        self.kind
    }
    pub fn connected(&self) -> bool {
        self.handles.setpoint.connected() && self.handles.readback.connected()
    }
    pub fn powered(&self) -> bool {
        self.handles
            .power
            .read()
            .and_then(|value| value.as_f64())
            .map(|power| power > 0.5)
            .unwrap_or(false)
    }
    pub fn op_mode(&self) -> Option<f64> {
        self.handles.op_mode.read().and_then(|value| value.as_f64())
    }
    /// Readback strength, `None` when unreachable
    pub fn strength(&self) -> Option<f64> {
        self.handles.readback.read().and_then(|value| value.as_f64())
    }
    pub fn reference_strength(&self) -> Option<f64> {
        self.handles.reference.read().and_then(|value| value.as_f64())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CorrectorError {
    #[error("expected a kick vector of length {expected}, found {found}")]
    SizeMismatch { expected: usize, found: usize },
}

pub type Result<T> = std::result::Result<T, CorrectorError>;

/// Outcome of the safety clipping stages
#[derive(Debug, Clone, PartialEq)]
pub struct ClipReport {
    /// The clipped delta-kick vector
    pub delta: Vec<f64>,
    /// Groups rejected wholesale for a pre-existing absolute excess
    pub rejected: Vec<CorrKind>,
    /// Scale factors applied per group, delta ceiling and absolute bound
    pub factors: Vec<(CorrKind, f64)>,
}

/// Per-corrector status masks, a raised bit flags a problem
#[derive(Debug, Clone)]
pub struct CorrStatus {
    pub connected: StatusBits,
    pub power: StatusBits,
    pub mode: StatusBits,
}

impl CorrStatus {
    pub fn all_clear(&self) -> bool {
        self.connected.all_clear() && self.power.all_clear() && self.mode.all_clear()
    }
}

/// The corrector actuator array
pub struct CorrectorBench {
    correctors: Vec<Corrector>,
    timing: Arc<EventTiming>,
    limits: Mutex<KickLimits>,
    sync: AtomicBool,
    /// Settle delay between staging and the synchronizing trigger
    settle: Duration,
    fallback: Mutex<Vec<bool>>,
    polled: Mutex<Vec<f64>>,
}

impl CorrectorBench {
    pub fn new(correctors: Vec<Corrector>, timing: Arc<EventTiming>) -> Self {
        let n_corr = correctors.len();
        Self {
            correctors,
            timing,
            limits: Mutex::new(KickLimits::default()),
            sync: AtomicBool::new(false),
            settle: Duration::from_millis(50),
            fallback: Mutex::new(vec![false; n_corr]),
            polled: Mutex::new(vec![0f64; n_corr]),
        }
    }
    /// Overrides the staging settle delay
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }
    /// Overrides the default kick limits
    pub fn with_limits(self, limits: KickLimits) -> Self {
        *self.limits.lock().unwrap() = limits;
        self
    }
    pub fn n_corr(&self) -> usize {
        self.correctors.len()
    }
    pub fn correctors(&self) -> &[Corrector] {
        &self.correctors
    }
    /// Kind of every corrector, bench order
    pub fn kinds(&self) -> Vec<CorrKind> {
        self.correctors.iter().map(Corrector::kind).collect()
    }
    pub fn limits(&self) -> KickLimits {
        *self.limits.lock().unwrap()
    }
    pub fn set_max_kick(&self, kind: CorrKind, value: f64) {
        self.limits.lock().unwrap().group_mut(kind).max_kick = value;
    }
    pub fn set_max_delta_kick(&self, kind: CorrKind, value: f64) {
        self.limits.lock().unwrap().group_mut(kind).max_delta_kick = value;
    }
    /// Operator gain factor, clamped to 0-100%
    pub fn set_gain(&self, kind: CorrKind, percent: f64) {
        self.limits.lock().unwrap().group_mut(kind).gain_pct = percent.clamp(0f64, 100f64);
    }
    /// Selects synchronized (timing-triggered) application
    pub fn set_sync(&self, sync: bool) {
        self.sync.store(sync, Ordering::SeqCst);
        info!(
            "corrector application {}",
            if sync { "synchronized" } else { "independent" }
        );
    }
    pub fn sync(&self) -> bool {
        self.sync.load(Ordering::SeqCst)
    }

    /// Current kick vector from readback
    ///
    /// A disconnected corrector serves its reference value instead, logged
    /// once per transition.
    pub fn read_strengths(&self) -> Vec<f64> {
        let mut fallback = self.fallback.lock().unwrap();
        self.correctors
            .iter()
            .enumerate()
            .map(|(idx, corrector)| match corrector.strength() {
                Some(strength) => {
                    fallback[idx] = false;
                    strength
                }
                None => {
                    if !fallback[idx] {
                        warn!(
                            "{}: readback unreachable, serving reference strength",
                            corrector.name()
                        );
                        fallback[idx] = true;
                    }
                    corrector.reference_strength().unwrap_or(0f64)
                }
            })
            .collect()
    }
    /// Last strength vector refreshed by the polling task
    pub fn polled_strengths(&self) -> Vec<f64> {
        self.polled.lock().unwrap().clone()
    }

    /// Clips a delta-kick vector against the per-group limits
    pub fn clip_deltas(&self, current: &[f64], delta: &[f64]) -> Result<ClipReport> {
        for vector in [current, delta] {
            if vector.len() != self.n_corr() {
                return Err(CorrectorError::SizeMismatch {
                    expected: self.n_corr(),
                    found: vector.len(),
                });
            }
        }
        let limits = self.limits();
        let mut clipped = delta.to_vec();
        let mut report = ClipReport {
            delta: Vec::new(),
            rejected: Vec::new(),
            factors: Vec::new(),
        };
        for kind in [CorrKind::Ch, CorrKind::Cv, CorrKind::Rf, CorrKind::Septum] {
            let group: Vec<usize> = self
                .correctors
                .iter()
                .enumerate()
                .filter_map(|(idx, corrector)| (corrector.kind() == kind).then_some(idx))
                .collect();
            if group.is_empty() {
                continue;
            }
            let bounds = limits.group(kind);
            // 1. a pre-existing absolute excess rejects the whole group
            if group.iter().any(|&idx| current[idx].abs() > bounds.max_kick) {
                error!(
                    "{kind:?} group rejected: a corrector already exceeds {} before correction",
                    bounds.max_kick
                );
                group.iter().for_each(|&idx| clipped[idx] = 0f64);
                report.rejected.push(kind);
                continue;
            }
            // 2. operator gain
            let gain = bounds.gain_pct / 100f64;
            group.iter().for_each(|&idx| clipped[idx] *= gain);
            // 3. proportional scale-back of the largest delta
            let largest = group
                .iter()
                .map(|&idx| clipped[idx].abs())
                .fold(0f64, f64::max);
            if largest > bounds.max_delta_kick {
                let factor = bounds.max_delta_kick / largest;
                group.iter().for_each(|&idx| clipped[idx] *= factor);
                report.factors.push((kind, factor));
                warn!("{kind:?} delta kicks scaled by {factor:.3}");
            }
            // 4. one factor keeping every resulting kick inside the range
            let mut factor = 1f64;
            for &idx in &group {
                if clipped[idx] != 0f64 {
                    let headroom = if clipped[idx] > 0f64 {
                        (bounds.max_kick - current[idx]) / clipped[idx]
                    } else {
                        (-bounds.max_kick - current[idx]) / clipped[idx]
                    };
                    factor = factor.min(headroom.max(0f64));
                }
            }
            if factor < 1f64 {
                group.iter().for_each(|&idx| clipped[idx] *= factor);
                report.factors.push((kind, factor));
                warn!("{kind:?} kicks scaled by {factor:.3} to hold the absolute range");
            }
        }
        report.delta = clipped;
        Ok(report)
    }

    /// Applies an absolute kick vector
    ///
    /// Degraded correctors are skipped with an error log, the others
    /// proceed. With synchronization enabled the setpoints are staged, the
    /// settle delay elapses and one timing trigger fires.
    pub async fn apply_kicks(&self, kicks: &[f64]) -> Result<()> {
        if kicks.len() != self.n_corr() {
            return Err(CorrectorError::SizeMismatch {
                expected: self.n_corr(),
                found: kicks.len(),
            });
        }
        let sync = self.sync();
        let expected_mode = if sync {
            OP_MODE_SLOW_REF_SYNC
        } else {
            OP_MODE_SLOW_REF
        };
        let mut staged = false;
        for (corrector, &kick) in self.correctors.iter().zip(kicks) {
            if !corrector.connected() {
                error!("{}: disconnected, kick not applied", corrector.name());
                continue;
            }
            if !corrector.powered() {
                error!("{}: power supply off, kick not applied", corrector.name());
                continue;
            }
            if corrector.op_mode() != Some(expected_mode) {
                error!(
                    "{}: wrong operation mode, kick not applied",
                    corrector.name()
                );
                continue;
            }
            corrector.handles.setpoint.write(Value::Scalar(kick), false);
            staged = true;
        }
        if sync && staged {
            tokio::time::sleep(self.settle).await;
            self.timing.trigger();
        }
        Ok(())
    }

    /// Powers the correctors on and commands the operation mode required by
    /// the synchronization setting
    ///
    /// No-op returning `false` when any corrector is disconnected.
    pub fn configure(&self) -> bool {
        if let Some(corrector) = self.correctors.iter().find(|corrector| !corrector.connected()) {
            error!("{}: disconnected, bench not configured", corrector.name());
            return false;
        }
        let op_mode = if self.sync() {
            OP_MODE_SLOW_REF_SYNC
        } else {
            OP_MODE_SLOW_REF
        };
        for corrector in &self.correctors {
            corrector.handles.power.write(Value::Scalar(1f64), true);
            corrector.handles.op_mode.write(Value::Scalar(op_mode), true);
        }
        info!("corrector bench configured, op mode {op_mode}");
        true
    }

    /// Per-corrector connectivity/power/mode status
    pub fn status(&self) -> CorrStatus {
        let n_corr = self.n_corr();
        let expected_mode = if self.sync() {
            OP_MODE_SLOW_REF_SYNC
        } else {
            OP_MODE_SLOW_REF
        };
        let mut status = CorrStatus {
            connected: StatusBits::new(n_corr),
            power: StatusBits::new(n_corr),
            mode: StatusBits::new(n_corr),
        };
        for (idx, corrector) in self.correctors.iter().enumerate() {
            status.connected.set(idx, !corrector.connected());
            status.power.set(idx, !corrector.powered());
            status.mode.set(idx, corrector.op_mode() != Some(expected_mode));
        }
        status
    }

    /// Strength polling task, one refresh per period
    pub async fn run(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(period) => {
                    let strengths = self.read_strengths();
                    *self.polled.lock().unwrap() = strengths;
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

#[cfg(test)]
mod tests {
    use super::*;
    use interface::mock::SoftDevice;

    pub(crate) struct SoftCorrector {
        pub setpoint: SoftDevice,
        pub readback: SoftDevice,
        pub reference: SoftDevice,
        pub power: SoftDevice,
        pub op_mode: SoftDevice,
    }

    pub(crate) fn soft_corrector(
        name: &str,
        kind: CorrKind,
    ) -> (Corrector, SoftCorrector) {
        let soft = SoftCorrector {
            setpoint: SoftDevice::new(0f64),
            readback: SoftDevice::new(0f64),
            reference: SoftDevice::new(0f64),
            power: SoftDevice::new(1f64),
            op_mode: SoftDevice::new(OP_MODE_SLOW_REF),
        };
        let corrector = Corrector::new(
            name,
            kind,
            CorrectorHandles {
                setpoint: soft.setpoint.handle(),
                readback: soft.readback.handle(),
                reference: soft.reference.handle(),
                power: soft.power.handle(),
                op_mode: soft.op_mode.handle(),
            },
        );
        (corrector, soft)
    }

    pub(crate) fn bench(kinds: &[CorrKind]) -> (CorrectorBench, Vec<SoftCorrector>, SoftDevice) {
        let mut correctors = Vec::new();
        let mut soft = Vec::new();
        for (idx, &kind) in kinds.iter().enumerate() {
            let (corrector, devices) = soft_corrector(&format!("corr-{idx:02}"), kind);
            correctors.push(corrector);
            soft.push(devices);
        }
        let trigger = SoftDevice::new(0f64);
        let timing = Arc::new(EventTiming::new(
            SoftDevice::new(0f64).handle(),
            trigger.handle(),
        ));
        let bench =
            CorrectorBench::new(correctors, timing).with_settle(Duration::from_millis(0));
        (bench, soft, trigger)
    }

    #[test]
    fn symmetric_delta_scale_back() {
        let (bench, _, _) = bench(&[CorrKind::Ch, CorrKind::Ch]);
        bench.set_max_delta_kick(CorrKind::Ch, 5f64);
        let report = bench.clip_deltas(&[0.0, 0.0], &[10.0, 10.0]).unwrap();
        assert_eq!(report.delta, vec![5.0, 5.0]);
        assert_eq!(report.factors, vec![(CorrKind::Ch, 0.5)]);
        assert!(report.rejected.is_empty());
    }

    #[test]
    fn preexisting_excess_rejects_group() {
        let (bench, _, _) = bench(&[CorrKind::Ch, CorrKind::Ch, CorrKind::Cv]);
        bench.set_max_kick(CorrKind::Ch, 300f64);
        let report = bench
            .clip_deltas(&[400.0, 0.0, 0.0], &[1.0, 1.0, 2.0])
            .unwrap();
        // CH rejected wholesale, CV untouched
        assert_eq!(report.delta, vec![0.0, 0.0, 2.0]);
        assert_eq!(report.rejected, vec![CorrKind::Ch]);
    }

    #[test]
    fn absolute_range_bound_scales_whole_group() {
        let (bench, _, _) = bench(&[CorrKind::Ch, CorrKind::Ch]);
        bench.set_max_kick(CorrKind::Ch, 300f64);
        bench.set_max_delta_kick(CorrKind::Ch, 50f64);
        let report = bench.clip_deltas(&[295.0, 0.0], &[10.0, 10.0]).unwrap();
        // headroom of the first corrector bounds the group: (300-295)/10
        assert_eq!(report.delta, vec![5.0, 5.0]);
        assert_eq!(report.factors, vec![(CorrKind::Ch, 0.5)]);
    }

    #[test]
    fn negative_deltas_honor_the_lower_bound() {
        let (bench, _, _) = bench(&[CorrKind::Cv]);
        bench.set_max_kick(CorrKind::Cv, 100f64);
        bench.set_max_delta_kick(CorrKind::Cv, 100f64);
        let report = bench.clip_deltas(&[-90.0], &[-20.0]).unwrap();
        assert_eq!(report.delta, vec![-10.0]);
    }

    #[test]
    fn gain_is_the_first_stage() {
        let (bench, _, _) = bench(&[CorrKind::Ch]);
        bench.set_gain(CorrKind::Ch, 50f64);
        bench.set_max_delta_kick(CorrKind::Ch, 100f64);
        let report = bench.clip_deltas(&[0.0], &[40.0]).unwrap();
        assert_eq!(report.delta, vec![20.0]);
        assert!(report.factors.is_empty());
    }

    #[tokio::test]
    async fn partial_failure_application() {
        let (bench, soft, _) = bench(&[CorrKind::Ch, CorrKind::Ch]);
        soft[0].setpoint.set_connected(false);
        bench.apply_kicks(&[1.0, 2.0]).await.unwrap();
        assert!(soft[0].setpoint.last_write().is_none());
        assert_eq!(soft[1].setpoint.last_write(), Some(Value::Scalar(2.0)));
    }

    #[tokio::test]
    async fn synchronized_application_triggers_once() {
        let (bench, soft, trigger) = bench(&[CorrKind::Ch, CorrKind::Cv]);
        bench.set_sync(true);
        assert!(bench.configure());
        bench.apply_kicks(&[1.0, -1.0]).await.unwrap();
        assert_eq!(soft[0].setpoint.last_write(), Some(Value::Scalar(1.0)));
        assert_eq!(soft[1].setpoint.last_write(), Some(Value::Scalar(-1.0)));
        assert_eq!(trigger.writes().len(), 1);
    }

    #[tokio::test]
    async fn wrong_mode_is_skipped_in_sync() {
        let (bench, soft, trigger) = bench(&[CorrKind::Ch, CorrKind::Ch]);
        bench.set_sync(true);
        soft[0].op_mode.set_value(OP_MODE_SLOW_REF_SYNC);
        // second corrector left in independent mode
        bench.apply_kicks(&[1.0, 2.0]).await.unwrap();
        assert_eq!(soft[0].setpoint.last_write(), Some(Value::Scalar(1.0)));
        assert!(soft[1].setpoint.last_write().is_none());
        assert_eq!(trigger.writes().len(), 1);
    }

    #[test]
    fn configure_requires_full_connectivity() {
        let (bench, soft, _) = bench(&[CorrKind::Ch, CorrKind::Cv]);
        soft[1].readback.set_connected(false);
        assert!(!bench.configure());
        assert!(soft[0].power.last_write().is_none());
        soft[1].readback.set_connected(true);
        assert!(bench.configure());
        assert_eq!(soft[0].power.last_write(), Some(Value::Scalar(1.0)));
        assert_eq!(
            soft[0].op_mode.last_write(),
            Some(Value::Scalar(OP_MODE_SLOW_REF))
        );
    }

    #[test]
    fn strength_fallback_to_reference() {
        let (bench, soft, _) = bench(&[CorrKind::Ch, CorrKind::Ch]);
        soft[0].readback.set_value(3.0);
        soft[1].readback.set_connected(false);
        soft[1].reference.set_value(7.5);
        assert_eq!(bench.read_strengths(), vec![3.0, 7.5]);
        let status = bench.status();
        assert!(status.connected.get(1));
        assert!(!status.connected.get(0));
    }
}

#[async_trait]
impl CorrectorSink for CorrectorBench {
    fn n_corr(&self) -> usize {
        CorrectorBench::n_corr(self)
    }
    fn ready(&self) -> bool {
        let status = self.status();
        status.all_clear()
    }
    fn strengths(&self) -> Vec<f64> {
        self.read_strengths()
    }
    fn clip(&self, current: &[f64], delta: &[f64]) -> std::result::Result<Vec<f64>, RoleError> {
        self.clip_deltas(current, delta)
            .map(|report| report.delta)
            .map_err(|CorrectorError::SizeMismatch { expected, found }| RoleError::SizeMismatch {
                expected,
                found,
            })
    }
    async fn apply(&self, kicks: &[f64]) -> std::result::Result<(), RoleError> {
        self.apply_kicks(kicks).await.map_err(
            |CorrectorError::SizeMismatch { expected, found }| RoleError::SizeMismatch {
                expected,
                found,
            },
        )
    }
}
