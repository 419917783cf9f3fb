//! Status aggregation
//!
//! Folds the per-subsystem status masks into one overall status value,
//! refreshed by the status tick.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use sofb_clients_bpm::OrbitAcquisition;
use sofb_clients_correctors::CorrectorBench;
use sofb_clients_timing::EventTiming;
use tokio::sync::watch;

/// Overall status bits, one per failing condition
pub mod bits {
    pub const BPM_DISCONNECTED: u32 = 1 << 0;
    pub const BPM_DISABLED: u32 = 1 << 1;
    pub const BPM_FAULT: u32 = 1 << 2;
    pub const CORR_DISCONNECTED: u32 = 1 << 3;
    pub const CORR_POWER: u32 = 1 << 4;
    pub const CORR_MODE: u32 = 1 << 5;
    pub const TIMING_DISCONNECTED: u32 = 1 << 6;
    pub const TIMING_UNCONFIGURED: u32 = 1 << 7;
}

/// Periodic overall status computation
pub struct StatusAggregator {
    acquisition: Arc<OrbitAcquisition>,
    correctors: Arc<CorrectorBench>,
    timing: Arc<EventTiming>,
    overall: AtomicU32,
}

impl StatusAggregator {
    pub fn new(
        acquisition: Arc<OrbitAcquisition>,
        correctors: Arc<CorrectorBench>,
        timing: Arc<EventTiming>,
    ) -> Self {
        Self {
            acquisition,
            correctors,
            timing,
            overall: AtomicU32::new(0),
        }
    }
    /// Recomputes and stores the overall status value
    pub fn refresh(&self) -> u32 {
        let mut overall = 0u32;
        let orbit = self.acquisition.status();
        if !orbit.connected.all_clear() {
            overall |= bits::BPM_DISCONNECTED;
        }
        if !orbit.enabled.all_clear() {
            overall |= bits::BPM_DISABLED;
        }
        if !orbit.ok.all_clear() {
            overall |= bits::BPM_FAULT;
        }
        let bench = self.correctors.status();
        if !bench.connected.all_clear() {
            overall |= bits::CORR_DISCONNECTED;
        }
        if !bench.power.all_clear() {
            overall |= bits::CORR_POWER;
        }
        if !bench.mode.all_clear() {
            overall |= bits::CORR_MODE;
        }
        let timing = self.timing.status();
        if timing.get(0) {
            overall |= bits::TIMING_DISCONNECTED;
        }
        if timing.get(1) {
            overall |= bits::TIMING_UNCONFIGURED;
        }
        self.overall.store(overall, Ordering::SeqCst);
        overall
    }
    /// Last refreshed overall status value
    pub fn overall(&self) -> u32 {
        self.overall.load(Ordering::SeqCst)
    }
    /// Status tick task
    pub async fn run(
        self: Arc<Self>,
        period: std::time::Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(period) => {
                    self.refresh();
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
