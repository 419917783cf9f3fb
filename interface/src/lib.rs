/*!
# sofb-interface

Interface definitions between the orbit feedback core and its collaborators.

Remote points (BPM electronics, corrector power supplies, the timing event
generator) are reached through the [DeviceHandle] contract, implemented by
the process-variable transport layer.

The feedback orchestrator reaches the subsystems through the typed roles
[OrbitSource], [MatrixSource] and [CorrectorSink]; each role is injected at
construction time and a size mismatch between them fails fast with
[RoleError::SizeMismatch].

State changes are published as typed events through [Notifier]; the
device-layer adapter subscribes and republishes over the network protocol.
*/

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

mod event;
pub use event::Notifier;
mod status;
pub use status::StatusBits;

#[cfg(feature = "mock")]
pub mod mock;

/// Value read from or written to a remote point
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(f64),
    Waveform(Vec<f64>),
}
impl Value {
    /// Returns the scalar value, if any
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Scalar(value) => Some(*value),
            Value::Waveform(_) => None,
        }
    }
    /// Returns the waveform samples, if any
    pub fn as_slice(&self) -> Option<&[f64]> {
        match self {
            Value::Scalar(_) => None,
            Value::Waveform(samples) => Some(samples),
        }
    }
}
impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Scalar(value)
    }
}
impl From<Vec<f64>> for Value {
    fn from(samples: Vec<f64>) -> Self {
        Value::Waveform(samples)
    }
}

/// Device-layer contract for one remote point
///
/// Reads on a disconnected point return `None`, never fail; writes are
/// fire-and-forget, completion is observed with a subsequent readback.
pub trait DeviceHandle: Send + Sync {
    /// Connectivity of the remote point
    fn connected(&self) -> bool;
    /// Latest value of the remote point, `None` when disconnected
    fn read(&self) -> Option<Value>;
    /// Writes a new value to the remote point
    fn write(&self, value: Value, wait: bool);
    /// Writes a mode/acquisition configuration field of the remote point
    fn put_config(&self, field: &str, value: Value);
}

/// Reference counted [DeviceHandle] trait object
pub type Handle = Arc<dyn DeviceHandle>;

#[derive(Debug, thiserror::Error)]
pub enum RoleError {
    #[error("expected a vector of length {expected}, found {found}")]
    SizeMismatch { expected: usize, found: usize },
    #[error("subsystem is not ready: {0}")]
    NotReady(String),
    #[error("command rejected: {0}")]
    Rejected(String),
}

/// Provider of the beam position error relative to the reference orbit
#[async_trait]
pub trait OrbitSource: Send + Sync {
    /// Number of beam position monitors
    fn n_bpm(&self) -> usize;
    /// `true` while samples come from the machine rather than from file
    fn is_live(&self) -> bool;
    /// Returns the `2 * n_bpm` orbit error vector, X plane then Y plane
    ///
    /// With `reset`, the smoothing buffers are cleared first and the call
    /// waits one smoothing window for them to refill.
    async fn orbit(&self, reset: bool) -> Vec<f64>;
}

/// Provider of the orbit-to-kick mapping
pub trait MatrixSource: Send + Sync {
    /// Number of correctors (matrix columns)
    fn n_corr(&self) -> usize;
    /// Enable state of each corrector column
    fn enabled_correctors(&self) -> Vec<bool>;
    /// Maps an orbit error to a corrective kick vector
    fn kicks(&self, orbit: &[f64]) -> Result<Vec<f64>, RoleError>;
    /// Replaces the response matrix with a row-major flattened one
    fn set_matrix(&mut self, values: Vec<f64>) -> Result<(), RoleError>;
}

/// Consumer of corrective kicks
#[async_trait]
pub trait CorrectorSink: Send + Sync {
    /// Number of correctors
    fn n_corr(&self) -> usize;
    /// `true` once every corrector is connected, powered and in the
    /// commanded operation mode
    fn ready(&self) -> bool;
    /// Current kick vector from readback
    fn strengths(&self) -> Vec<f64>;
    /// Clips a delta-kick vector against the per-group safety limits
    ///
    /// Groups whose current strength already exceeds the absolute limit are
    /// rejected wholesale, their delta zeroed.
    fn clip(&self, current: &[f64], delta: &[f64]) -> Result<Vec<f64>, RoleError>;
    /// Applies an absolute kick vector, skipping degraded correctors
    async fn apply(&self, kicks: &[f64]) -> Result<(), RoleError>;
}

/// Creates a reference counted pointer
///
/// Converts an object into an atomic reference counted pointer
/// [Arc](std::sync::Arc) with interior mutability [Mutex](tokio::sync::Mutex)
pub trait ArcMutex {
    fn into_arcx(self) -> Arc<Mutex<Self>>
    where
        Self: Sized,
    {
        Arc::new(Mutex::new(self))
    }
}
impl<T> ArcMutex for T {}

use log::{info, warn};

/// Pretty prints error message
pub fn print_info<S: Into<String>>(msg: S, e: Option<&dyn std::error::Error>) {
    if let Some(e) = e {
        let mut msg: Vec<String> = vec![msg.into()];
        msg.push(format!("{}", e));
        let mut current = e.source();
        while let Some(cause) = current {
            msg.push(format!("{}", cause));
            current = cause.source();
        }
        warn!("{}", msg.join("\n .due to: "))
    } else {
        info!("{}", msg.into())
    }
}
