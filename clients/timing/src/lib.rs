/*!
# SOFB timing event client

Client for the timing event generator shared by the orbit acquisition and
the corrector bench.

Triggered acquisition modes reprogram the event source and delay with
[EventTiming::configure]; synchronized corrector application fires a single
software event with [EventTiming::trigger] so that every staged setpoint
takes effect on the same accelerator turn.
*/

use interface::{Handle, StatusBits, Value};
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Event source feeding the acquisition trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TriggerSource {
    /// Free running clock divider
    #[default]
    Clock,
    /// Injection event
    Injection,
    /// On-demand software event
    Software,
}
impl TriggerSource {
    fn code(self) -> f64 {
        match self {
            TriggerSource::Clock => 0f64,
            TriggerSource::Injection => 1f64,
            TriggerSource::Software => 2f64,
        }
    }
}

/// One trigger programming of the event generator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub source: TriggerSource,
    /// Delay from event to sampling [us]
    pub delay: f64,
    /// Number of pulses per event
    pub n_pulses: u32,
}
impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            source: TriggerSource::default(),
            delay: 0f64,
            n_pulses: 1,
        }
    }
}

/// Timing event generator client
pub struct EventTiming {
    event: Handle,
    trigger: Handle,
    commanded: Mutex<Option<TriggerConfig>>,
}

impl EventTiming {
    /// Creates the client from the event-generator and software-trigger points
    pub fn new(event: Handle, trigger: Handle) -> Self {
        Self {
            event,
            trigger,
            commanded: Mutex::new(None),
        }
    }
    pub fn connected(&self) -> bool {
        self.event.connected() && self.trigger.connected()
    }
    /// Programs the event generator
    ///
    /// Returns `false`, leaving the last commanded configuration in place,
    /// when the event generator is disconnected.
    pub fn configure(&self, config: TriggerConfig) -> bool {
        if !self.event.connected() {
            error!("timing: event generator disconnected, trigger not configured");
            return false;
        }
        self.event.put_config("Src", config.source.code().into());
        self.event.put_config("Delay", config.delay.into());
        self.event.put_config("NrPulses", (config.n_pulses as f64).into());
        info!("timing: trigger configured {config:?}");
        self.commanded.lock().unwrap().replace(config);
        true
    }
    /// `true` once a configuration has been pushed to a connected generator
    pub fn configured(&self) -> bool {
        self.connected() && self.commanded.lock().unwrap().is_some()
    }
    /// Last commanded configuration, if any
    pub fn commanded(&self) -> Option<TriggerConfig> {
        self.commanded.lock().unwrap().clone()
    }
    /// Fires one software event
    pub fn trigger(&self) {
        if self.trigger.connected() {
            self.trigger.write(Value::Scalar(1f64), false);
        } else {
            error!("timing: trigger point disconnected, event not sent");
        }
    }
    /// Connectivity and configuration status, one bit per condition
    pub fn status(&self) -> StatusBits {
        let mut bits = StatusBits::new(2);
        bits.set(0, !self.connected());
        bits.set(1, !self.configured());
        bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use interface::mock::SoftDevice;

    fn timing() -> (EventTiming, SoftDevice, SoftDevice) {
        let event = SoftDevice::new(0f64);
        let trigger = SoftDevice::new(0f64);
        (
            EventTiming::new(event.handle(), trigger.handle()),
            event,
            trigger,
        )
    }

    #[test]
    fn configure_pushes_fields() {
        let (timing, event, _) = timing();
        assert!(timing.configure(TriggerConfig {
            source: TriggerSource::Injection,
            delay: 12.5,
            n_pulses: 3,
        }));
        assert_eq!(event.config_value("Src"), Some(Value::Scalar(1.0)));
        assert_eq!(event.config_value("Delay"), Some(Value::Scalar(12.5)));
        assert_eq!(event.config_value("NrPulses"), Some(Value::Scalar(3.0)));
        assert!(timing.configured());
    }

    #[test]
    fn disconnected_configure_is_rejected() {
        let (timing, event, _) = timing();
        event.set_connected(false);
        assert!(!timing.configure(TriggerConfig::default()));
        assert!(!timing.configured());
        assert!(!timing.status().all_clear());
    }

    #[test]
    fn software_trigger_fires() {
        let (timing, _, trigger) = timing();
        timing.trigger();
        assert_eq!(trigger.last_write(), Some(Value::Scalar(1.0)));
    }
}
