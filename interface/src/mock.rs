//! In-memory device doubles
//!
//! [SoftDevice] implements the [DeviceHandle](crate::DeviceHandle) contract
//! against process-local state, standing in for the process-variable
//! transport in tests and dry runs. Writes are readback-coupled: a written
//! value is immediately visible to [read](crate::DeviceHandle::read), the
//! way a settled power supply setpoint would be.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use crate::{DeviceHandle, Handle, Value};

#[derive(Debug, Default)]
struct Inner {
    connected: bool,
    value: Option<Value>,
    config: HashMap<String, Value>,
    writes: Vec<Value>,
}

/// Process-local device double
#[derive(Debug, Clone)]
pub struct SoftDevice {
    inner: Arc<RwLock<Inner>>,
}

impl SoftDevice {
    /// Creates a connected device holding `value`
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                connected: true,
                value: Some(value.into()),
                ..Default::default()
            })),
        }
    }
    /// Creates a disconnected device
    pub fn disconnected() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
        }
    }
    /// Shares the device as a [DeviceHandle] trait object
    pub fn handle(&self) -> Handle {
        Arc::new(self.clone())
    }
    pub fn set_connected(&self, connected: bool) {
        self.inner.write().unwrap().connected = connected;
    }
    /// Updates the device value without logging a write
    pub fn set_value(&self, value: impl Into<Value>) {
        self.inner.write().unwrap().value = Some(value.into());
    }
    /// Last written value, if any
    pub fn last_write(&self) -> Option<Value> {
        self.inner.read().unwrap().writes.last().cloned()
    }
    /// Every value written so far, oldest first
    pub fn writes(&self) -> Vec<Value> {
        self.inner.read().unwrap().writes.clone()
    }
    /// Last configured value of `field`, if any
    pub fn config_value(&self, field: &str) -> Option<Value> {
        self.inner.read().unwrap().config.get(field).cloned()
    }
}

impl DeviceHandle for SoftDevice {
    fn connected(&self) -> bool {
        self.inner.read().unwrap().connected
    }
    fn read(&self) -> Option<Value> {
        let inner = self.inner.read().unwrap();
        if inner.connected {
            inner.value.clone()
        } else {
            None
        }
    }
    fn write(&self, value: Value, _wait: bool) {
        let mut inner = self.inner.write().unwrap();
        if inner.connected {
            inner.value = Some(value.clone());
            inner.writes.push(value);
        }
    }
    fn put_config(&self, field: &str, value: Value) {
        let mut inner = self.inner.write().unwrap();
        if inner.connected {
            inner.config.insert(field.into(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnected_reads_none() {
        let device = SoftDevice::new(1f64);
        assert_eq!(device.read(), Some(Value::Scalar(1.0)));
        device.set_connected(false);
        assert!(device.read().is_none());
    }

    #[test]
    fn write_is_readback_coupled() {
        let device = SoftDevice::new(0f64);
        device.write(Value::Scalar(2.5), false);
        assert_eq!(device.read(), Some(Value::Scalar(2.5)));
        assert_eq!(device.last_write(), Some(Value::Scalar(2.5)));
    }
}
