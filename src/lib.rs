/*!
# SOFB

Closed-loop transverse orbit correction engine for a storage ring or
transport line.

The engine continuously estimates the beam position error relative to a
reference orbit from the beam position monitors, maps it to corrective
magnet kicks (and an RF frequency offset) through the pseudo-inverse of the
measured response matrix, and actuates the corrector power supplies under
per-group safety limits, optionally synchronized on a timing trigger.

The engine is assembled from one [SofbConfig] and the device handle bundle
of the process-variable transport layer:

```ignore
let mut sofb = Sofb::new(&config, devices)?;
sofb.start();
sofb.acquisition.set_mode(AcquisitionMode::SlowOrbit);
sofb.feedback.close_loop()?;
```

The subsystems live in their own crates:
- [`sofb_clients_bpm`]: position decoding, smoothing, orbit aggregation
- [`sofb_clients_respmat`]: response matrix and regularized pseudo-inverse
- [`sofb_clients_correctors`]: safety clipping and synchronized actuation
- [`sofb_clients_timing`]: the shared timing event client
- [`interface`]: the device-layer and role contracts
*/

mod config;
pub use config::SofbConfig;
mod feedback;
pub use feedback::{
    Correction, FeedbackController, FeedbackError, FeedbackEvent, FeedbackState, LoopState,
    MeasureState,
};
mod status;
pub use status::{bits, StatusAggregator};
mod system;
pub use system::{Sofb, SofbDevices};

pub use sofb_clients_bpm::AcquisitionMode;
pub use sofb_clients_correctors::Subset;

#[derive(Debug, thiserror::Error)]
pub enum SofbError {
    #[error("device bundle mismatch: {0}")]
    Devices(String),
    #[error(transparent)]
    Acquisition(#[from] sofb_clients_bpm::AcquisitionError),
    #[error(transparent)]
    Feedback(#[from] FeedbackError),
}

pub mod prelude {
    pub use crate::{
        AcquisitionMode, FeedbackController, FeedbackEvent, FeedbackState, LoopState,
        MeasureState, Sofb, SofbConfig, SofbDevices, SofbError, Subset,
    };
    pub use interface::{ArcMutex, DeviceHandle, Handle, Value};
    pub use sofb_clients_bpm::{
        AcqSettings, BpmCalibration, BpmHandles, BpmReader, OrbitAcquisition, SmoothMethod,
    };
    pub use sofb_clients_correctors::{
        CorrKind, Corrector, CorrectorBench, CorrectorHandles, KickLimits,
    };
    pub use sofb_clients_respmat::{MaskGroup, RespMat};
    pub use sofb_clients_timing::{EventTiming, TriggerConfig, TriggerSource};
}
