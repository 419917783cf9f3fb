//! Orbit sample smoothing
//!
//! Every acquisition tick appends the latest decoded position into a
//! fixed-capacity queue; the orbit is read from the queue's running mean or
//! median.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SmoothMethod {
    #[default]
    Mean,
    /// Robust against single-shot spikes in triggered acquisitions
    Median,
}

/// Fixed-capacity smoothing queue
#[derive(Debug, Clone)]
pub struct SmoothBuffer {
    capacity: usize,
    method: SmoothMethod,
    data: VecDeque<f64>,
}

impl SmoothBuffer {
    pub fn new(capacity: usize, method: SmoothMethod) -> Self {
        Self {
            capacity: capacity.max(1),
            method,
            data: VecDeque::with_capacity(capacity.max(1)),
        }
    }
    pub fn capacity(&self) -> usize {
        self.capacity
    }
    pub fn len(&self) -> usize {
        self.data.len()
    }
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
    /// Appends a sample, discarding the oldest at capacity
    pub fn push(&mut self, sample: f64) {
        if self.data.len() == self.capacity {
            self.data.pop_front();
        }
        self.data.push_back(sample);
    }
    /// Smoothed value, `None` while the queue is empty
    pub fn value(&self) -> Option<f64> {
        if self.data.is_empty() {
            return None;
        }
        Some(match self.method {
            SmoothMethod::Mean => self.data.iter().sum::<f64>() / self.data.len() as f64,
            SmoothMethod::Median => {
                let mut sorted: Vec<f64> = self.data.iter().copied().collect();
                sorted.sort_by(|a, b| a.total_cmp(b));
                let mid = sorted.len() / 2;
                if sorted.len() % 2 == 1 {
                    sorted[mid]
                } else {
                    0.5 * (sorted[mid - 1] + sorted[mid])
                }
            }
        })
    }
    pub fn clear(&mut self) {
        self.data.clear();
    }
    /// Resizes the queue, discarding buffered samples
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        self.data = VecDeque::with_capacity(self.capacity);
    }
    pub fn set_method(&mut self, method: SmoothMethod) {
        self.method = method;
    }
}
