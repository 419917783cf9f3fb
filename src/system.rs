//! System assembly
//!
//! Builds the full correction engine from one [SofbConfig] and the device
//! handle bundle provided by the process-variable layer, then owns the
//! background task lifecycles.

use std::sync::Arc;

use interface::Handle;
use log::info;
use sofb_clients_bpm::{BpmHandles, BpmReader, OrbitAcquisition};
use sofb_clients_correctors::{Corrector, CorrectorBench, CorrectorHandles};
use sofb_clients_respmat::RespMat;
use sofb_clients_timing::EventTiming;
use tokio::sync::watch;

use crate::{FeedbackController, SofbConfig, SofbError, StatusAggregator};

/// Device handles of one accelerator section, bundled by the transport layer
///
/// BPM handles pair positionally with `SofbConfig::bpm_names`, corrector
/// handles with `[ch_names...][cv_names...][rf]`.
pub struct SofbDevices {
    pub bpms: Vec<BpmHandles>,
    pub correctors: Vec<CorrectorHandles>,
    pub timing_event: Handle,
    pub timing_trigger: Handle,
}

/// The assembled correction engine
pub struct Sofb {
    pub acquisition: Arc<OrbitAcquisition>,
    pub correctors: Arc<CorrectorBench>,
    pub timing: Arc<EventTiming>,
    pub feedback: FeedbackController<OrbitAcquisition, RespMat, CorrectorBench>,
    pub status: Arc<StatusAggregator>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    poll_period: std::time::Duration,
    status_period: std::time::Duration,
}

impl Sofb {
    /// Wires the whole engine, failing fast on any size disagreement
    /// between the configuration and the device bundle
    pub fn new(config: &SofbConfig, devices: SofbDevices) -> Result<Self, SofbError> {
        if devices.bpms.len() != config.n_bpm() {
            return Err(SofbError::Devices(format!(
                "{} BPM handle sets for {} configured monitors",
                devices.bpms.len(),
                config.n_bpm()
            )));
        }
        if devices.correctors.len() != config.n_corr() {
            return Err(SofbError::Devices(format!(
                "{} corrector handle sets for {} configured correctors",
                devices.correctors.len(),
                config.n_corr()
            )));
        }
        let timing = Arc::new(EventTiming::new(
            devices.timing_event,
            devices.timing_trigger,
        ));
        let readers: Vec<BpmReader> = config
            .bpm_names
            .iter()
            .zip(devices.bpms)
            .map(|(name, handles)| BpmReader::new(name, handles))
            .collect();
        let acquisition = Arc::new(OrbitAcquisition::new(
            readers,
            Arc::clone(&timing),
            config.acquisition.clone(),
        )?);
        let corrector_names = config
            .ch_names
            .iter()
            .chain(&config.cv_names)
            .cloned()
            .chain(config.rf.then(|| "rf-frequency".to_string()));
        let kinds = config.corrector_kinds();
        let correctors: Vec<Corrector> = corrector_names
            .zip(kinds.iter().copied())
            .zip(devices.correctors)
            .map(|((name, kind), handles)| Corrector::new(name, kind, handles))
            .collect();
        let bench = Arc::new(
            CorrectorBench::new(correctors, Arc::clone(&timing))
                .with_settle(config.settle())
                .with_limits(config.limits),
        );
        bench.set_sync(config.sync);
        let respmat = RespMat::new(
            config.n_bpm(),
            config.ch_names.len(),
            config.cv_names.len(),
            config.rf,
        )
        .with_path(config.acquisition.data_dir.join("respmat.dat"));
        let feedback = FeedbackController::new(
            Arc::clone(&acquisition),
            respmat,
            Arc::clone(&bench),
            kinds,
            config.meas_deltas(),
            config.loop_rate,
        )?;
        let status = Arc::new(StatusAggregator::new(
            Arc::clone(&acquisition),
            Arc::clone(&bench),
            Arc::clone(&timing),
        ));
        let (shutdown, _) = watch::channel(false);
        info!(
            "SOFB assembled: {} BPMs, {} correctors",
            config.n_bpm(),
            config.n_corr()
        );
        Ok(Self {
            acquisition,
            correctors: bench,
            timing,
            feedback,
            status,
            shutdown,
            tasks: Vec::new(),
            poll_period: config.poll_period(),
            status_period: config.status_period(),
        })
    }

    /// Shared handle to the response matrix
    pub fn respmat(&self) -> Arc<tokio::sync::Mutex<RespMat>> {
        self.feedback.matrix()
    }

    /// Spawns the periodic background tasks: orbit acquisition, corrector
    /// strength polling and the status tick
    pub fn start(&mut self) {
        let rx = self.shutdown.subscribe();
        self.tasks
            .push(tokio::spawn(Arc::clone(&self.acquisition).run(rx)));
        let rx = self.shutdown.subscribe();
        self.tasks.push(tokio::spawn(
            Arc::clone(&self.correctors).run(self.poll_period, rx),
        ));
        let rx = self.shutdown.subscribe();
        self.tasks.push(tokio::spawn(
            Arc::clone(&self.status).run(self.status_period, rx),
        ));
    }

    /// Stops the background tasks and waits for them to exit
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}
