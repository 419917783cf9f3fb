//! Feedback orchestration
//!
//! [FeedbackController] sequences the three activities of the correction
//! engine: single-shot calculate/apply, the continuous closed loop and the
//! response matrix measurement. At most one background task is alive at any
//! time; starting a second one is rejected with [FeedbackError::Busy],
//! never queued.
//!
//! Cancellation is cooperative: the closed loop checks once per iteration,
//! the measurement once per corrector, and both leave the last completed
//! step fully applied.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use interface::{print_info, CorrectorSink, MatrixSource, Notifier, OrbitSource, RoleError};
use log::{info, warn};
use sofb_clients_correctors::{CorrKind, Subset};

/// Orchestrator activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedbackState {
    #[default]
    Idle,
    CalculatingCorrection,
    Applying,
    ClosedLoopRunning,
    MeasuringRespMat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopState {
    #[default]
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MeasureState {
    #[default]
    Idle,
    Measuring,
    Completed,
    Aborted,
}

/// Feedback state change events
#[derive(Debug, Clone, PartialEq)]
pub enum FeedbackEvent {
    StateChanged(FeedbackState),
    CorrectionComputed,
    LoopClosed,
    LoopOpened,
    MeasurementProgress { corrector: usize, of: usize },
    MeasurementDone(MeasureState),
}

#[derive(Debug, thiserror::Error)]
pub enum FeedbackError {
    #[error("another background task is running")]
    Busy,
    #[error("acquisition mode is offline")]
    Offline,
    #[error("corrector bench is not ready")]
    NotReady,
    #[error("no correction computed yet")]
    NoCorrection,
    #[error("wiring mismatch: {0}")]
    Wiring(String),
    #[error(transparent)]
    Role(#[from] RoleError),
}

pub type Result<T> = std::result::Result<T, FeedbackError>;

/// One computed correction with the snapshots it was computed from
#[derive(Debug, Clone, PartialEq)]
pub struct Correction {
    pub delta: Vec<f64>,
    pub orbit: Vec<f64>,
    pub strengths: Vec<f64>,
}

#[derive(Debug)]
struct Shared {
    state: FeedbackState,
    loop_state: LoopState,
    measure_state: MeasureState,
    loop_period: Duration,
    last_correction: Option<Correction>,
}

struct Inner<O, M, C> {
    orbit: Arc<O>,
    matrix: Arc<tokio::sync::Mutex<M>>,
    correctors: Arc<C>,
    kinds: Vec<CorrKind>,
    meas_deltas: Vec<f64>,
    shared: Mutex<Shared>,
    cancel: AtomicBool,
    events: Notifier<FeedbackEvent>,
}

/// The feedback orchestrator
pub struct FeedbackController<O, M, C> {
    inner: Arc<Inner<O, M, C>>,
}

impl<O, M, C> Clone for FeedbackController<O, M, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<O, M, C> FeedbackController<O, M, C>
where
    O: OrbitSource + 'static,
    M: MatrixSource + 'static,
    C: CorrectorSink + 'static,
{
    /// Wires the orchestrator to its three roles
    ///
    /// Fails fast on any size disagreement between the roles; the matrix is
    /// probed with a zero orbit so an orbit/matrix mismatch surfaces here
    /// rather than in the first correction.
    pub fn new(
        orbit: Arc<O>,
        matrix: M,
        correctors: Arc<C>,
        kinds: Vec<CorrKind>,
        meas_deltas: Vec<f64>,
        loop_rate: f64,
    ) -> Result<Self> {
        let n_corr = matrix.n_corr();
        if correctors.n_corr() != n_corr {
            return Err(FeedbackError::Wiring(format!(
                "matrix drives {n_corr} correctors, bench holds {}",
                correctors.n_corr()
            )));
        }
        for (what, len) in [("kinds", kinds.len()), ("measurement deltas", meas_deltas.len())] {
            if len != n_corr {
                return Err(FeedbackError::Wiring(format!(
                    "{what} cover {len} correctors, expected {n_corr}"
                )));
            }
        }
        matrix.kicks(&vec![0f64; 2 * orbit.n_bpm()])?;
        Ok(Self {
            inner: Arc::new(Inner {
                orbit,
                matrix: Arc::new(tokio::sync::Mutex::new(matrix)),
                correctors,
                kinds,
                meas_deltas,
                shared: Mutex::new(Shared {
                    state: FeedbackState::default(),
                    loop_state: LoopState::default(),
                    measure_state: MeasureState::default(),
                    loop_period: Duration::from_secs_f64(1f64 / loop_rate.max(1e-3)),
                    last_correction: None,
                }),
                cancel: AtomicBool::new(false),
                events: Notifier::new(),
            }),
        })
    }

    /// Shared handle to the response matrix role
    pub fn matrix(&self) -> Arc<tokio::sync::Mutex<M>> {
        Arc::clone(&self.inner.matrix)
    }
    pub fn state(&self) -> FeedbackState {
        self.inner.shared.lock().unwrap().state
    }
    pub fn loop_state(&self) -> LoopState {
        self.inner.shared.lock().unwrap().loop_state
    }
    pub fn measure_state(&self) -> MeasureState {
        self.inner.shared.lock().unwrap().measure_state
    }
    pub fn last_correction(&self) -> Option<Correction> {
        self.inner.shared.lock().unwrap().last_correction.clone()
    }
    /// Registers a feedback event subscriber
    pub fn subscribe(&self) -> flume::Receiver<FeedbackEvent> {
        self.inner.events.subscribe()
    }
    /// Closed loop correction rate [Hz]
    pub fn set_loop_frequency(&self, hz: f64) {
        self.inner.shared.lock().unwrap().loop_period =
            Duration::from_secs_f64(1f64 / hz.max(1e-3));
    }

    fn claim(&self, state: FeedbackState) -> Result<()> {
        let mut shared = self.inner.shared.lock().unwrap();
        if shared.state != FeedbackState::Idle {
            warn!("{state:?} rejected: {:?} is running", shared.state);
            return Err(FeedbackError::Busy);
        }
        shared.state = state;
        drop(shared);
        self.inner.events.notify(FeedbackEvent::StateChanged(state));
        Ok(())
    }
    fn release(&self) {
        self.inner.shared.lock().unwrap().state = FeedbackState::Idle;
        self.inner
            .events
            .notify(FeedbackEvent::StateChanged(FeedbackState::Idle));
    }

    /// Computes a correction in the background and stores it for
    /// [apply_correction](FeedbackController::apply_correction)
    pub fn calc_correction(&self) -> Result<()> {
        self.claim(FeedbackState::CalculatingCorrection)?;
        let this = self.clone();
        tokio::spawn(async move {
            let strengths = this.inner.correctors.strengths();
            let orbit = this.inner.orbit.orbit(false).await;
            let kicks = this.inner.matrix.lock().await.kicks(&orbit);
            match kicks {
                Ok(delta) => {
                    this.inner.shared.lock().unwrap().last_correction = Some(Correction {
                        delta,
                        orbit,
                        strengths,
                    });
                    this.inner.events.notify(FeedbackEvent::CorrectionComputed);
                }
                Err(e) => print_info("correction not computed", Some(&e)),
            }
            this.release();
        });
        Ok(())
    }

    /// Applies a slice of the last computed correction in the background
    ///
    /// Requires a live acquisition mode, a ready corrector bench and no
    /// other background task.
    pub fn apply_correction(&self, subset: Subset) -> Result<()> {
        if !self.inner.orbit.is_live() {
            return Err(FeedbackError::Offline);
        }
        if !self.inner.correctors.ready() {
            return Err(FeedbackError::NotReady);
        }
        let delta = self
            .last_correction()
            .map(|correction| correction.delta)
            .ok_or(FeedbackError::NoCorrection)?;
        self.claim(FeedbackState::Applying)?;
        let this = self.clone();
        tokio::spawn(async move {
            let masked: Vec<f64> = delta
                .iter()
                .zip(&this.inner.kinds)
                .map(|(&delta, &kind)| if subset.selects(kind) { delta } else { 0f64 })
                .collect();
            if let Err(e) = this.correct(&masked).await {
                print_info("correction not applied", Some(&e));
            }
            this.release();
        });
        Ok(())
    }

    /// Closes the orbit correction loop
    pub fn close_loop(&self) -> Result<()> {
        if !self.inner.orbit.is_live() {
            return Err(FeedbackError::Offline);
        }
        if !self.inner.correctors.ready() {
            return Err(FeedbackError::NotReady);
        }
        self.claim(FeedbackState::ClosedLoopRunning)?;
        self.inner.cancel.store(false, Ordering::SeqCst);
        self.inner.shared.lock().unwrap().loop_state = LoopState::Closed;
        self.inner.events.notify(FeedbackEvent::LoopClosed);
        info!("orbit correction loop closed");
        let this = self.clone();
        tokio::spawn(async move { this.closed_loop_task().await });
        Ok(())
    }
    /// Requests the closed loop to open; the loop exits at its next
    /// iteration boundary
    pub fn open_loop(&self) {
        self.inner.cancel.store(true, Ordering::SeqCst);
    }

    /// Starts the response matrix measurement in the background
    pub fn start_measurement(&self) -> Result<()> {
        if !self.inner.orbit.is_live() {
            return Err(FeedbackError::Offline);
        }
        if !self.inner.correctors.ready() {
            return Err(FeedbackError::NotReady);
        }
        self.claim(FeedbackState::MeasuringRespMat)?;
        self.inner.cancel.store(false, Ordering::SeqCst);
        self.inner.shared.lock().unwrap().measure_state = MeasureState::Measuring;
        let this = self.clone();
        tokio::spawn(async move { this.measure_task().await });
        Ok(())
    }
    /// Requests the measurement to stop; checked once per corrector
    pub fn stop_measurement(&self) {
        self.inner.cancel.store(true, Ordering::SeqCst);
    }
    /// Clears a completed or aborted measurement back to idle
    pub fn reset_measurement(&self) -> Result<()> {
        let mut shared = self.inner.shared.lock().unwrap();
        if shared.state == FeedbackState::MeasuringRespMat {
            return Err(FeedbackError::Busy);
        }
        shared.measure_state = MeasureState::Idle;
        Ok(())
    }

    /// One correction step: clip the delta against the current strengths
    /// and actuate
    async fn correct(&self, delta: &[f64]) -> std::result::Result<(), RoleError> {
        let current = self.inner.correctors.strengths();
        let clipped = self.inner.correctors.clip(&current, delta)?;
        let target: Vec<f64> = current.iter().zip(&clipped).map(|(k, d)| k + d).collect();
        self.inner.correctors.apply(&target).await
    }

    async fn closed_loop_task(self) {
        loop {
            if self.inner.cancel.load(Ordering::SeqCst) {
                break;
            }
            if !self.inner.orbit.is_live() {
                warn!("acquisition went offline, opening the correction loop");
                break;
            }
            let start = tokio::time::Instant::now();
            let orbit = self.inner.orbit.orbit(false).await;
            let kicks = self.inner.matrix.lock().await.kicks(&orbit);
            match kicks {
                Ok(delta) => {
                    if let Err(e) = self.correct(&delta).await {
                        print_info("loop iteration not applied", Some(&e));
                    }
                }
                Err(e) => print_info("loop iteration not computed", Some(&e)),
            }
            let period = self.inner.shared.lock().unwrap().loop_period;
            let elapsed = start.elapsed();
            if elapsed > period {
                warn!(
                    "closed loop overrun: iteration took {:.1} ms of the {:.1} ms period",
                    elapsed.as_secs_f64() * 1e3,
                    period.as_secs_f64() * 1e3
                );
            } else {
                tokio::time::sleep(period - elapsed).await;
            }
        }
        self.inner.shared.lock().unwrap().loop_state = LoopState::Open;
        self.inner.events.notify(FeedbackEvent::LoopOpened);
        info!("orbit correction loop opened");
        self.release();
    }

    async fn measure_task(self) {
        let n_corr = self.inner.kinds.len();
        let n_rows = 2 * self.inner.orbit.n_bpm();
        let original = self.inner.correctors.strengths();
        let enabled = self.inner.matrix.lock().await.enabled_correctors();
        let mut columns = vec![vec![0f64; n_rows]; n_corr];
        let mut aborted = false;
        for corrector in 0..n_corr {
            if self.inner.cancel.load(Ordering::SeqCst) {
                aborted = true;
                warn!("measurement cancelled at corrector {corrector} of {n_corr}");
                break;
            }
            if !enabled[corrector] {
                continue;
            }
            let delta = self.inner.meas_deltas[corrector];
            match self.measure_column(&original, corrector, delta).await {
                Ok(column) => columns[corrector] = column,
                Err(e) => {
                    print_info(
                        format!("column {corrector} not measured"),
                        Some(&e),
                    );
                    aborted = true;
                    break;
                }
            }
            self.inner.events.notify(FeedbackEvent::MeasurementProgress {
                corrector,
                of: n_corr,
            });
        }
        if let Err(e) = self.inner.correctors.apply(&original).await {
            print_info("original kicks not restored", Some(&e));
        }
        // measured columns stay, unmeasured columns are zero
        let flat: Vec<f64> = (0..n_rows)
            .flat_map(|row| columns.iter().map(move |column| column[row]))
            .collect();
        let state = match self.inner.matrix.lock().await.set_matrix(flat) {
            Ok(()) if !aborted => MeasureState::Completed,
            Ok(()) => MeasureState::Aborted,
            Err(e) => {
                print_info("measured matrix rejected", Some(&e));
                MeasureState::Aborted
            }
        };
        self.inner.shared.lock().unwrap().measure_state = state;
        self.inner.events.notify(FeedbackEvent::MeasurementDone(state));
        info!("response matrix measurement {state:?}");
        self.release();
    }

    /// Applies the two half-step kicks to one corrector and returns the
    /// orbit response per unit kick
    async fn measure_column(
        &self,
        original: &[f64],
        corrector: usize,
        delta: f64,
    ) -> std::result::Result<Vec<f64>, RoleError> {
        let mut plus = original.to_vec();
        plus[corrector] += delta / 2f64;
        self.inner.correctors.apply(&plus).await?;
        let orbit_plus = self.inner.orbit.orbit(true).await;
        let mut minus = original.to_vec();
        minus[corrector] -= delta / 2f64;
        self.inner.correctors.apply(&minus).await?;
        let orbit_minus = self.inner.orbit.orbit(true).await;
        Ok(orbit_plus
            .iter()
            .zip(&orbit_minus)
            .map(|(plus, minus)| (plus - minus) / delta)
            .collect())
    }
}
