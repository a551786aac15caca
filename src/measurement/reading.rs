//! Readings and the queue decoupling acquisition from consumers.

use chrono::Utc;
use serde::Serialize;
use std::sync::Mutex;

/// One acquisition across all bound roles.
///
/// Every field is a plain `f64`; roles that are unbound or unsupported
/// carry NaN rather than being absent. Immutable once handed to the queue.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Reading {
    /// Unix timestamp in seconds.
    pub timestamp: f64,
    /// Applied source voltage.
    pub voltage: f64,
    pub v_smu: f64,
    pub i_smu: f64,
    pub i_elm: f64,
    pub i_elm2: f64,
    pub t_dmm: f64,
    pub c_lcr: f64,
    /// Derived 1/C^2, for Mott-Schottky analysis.
    pub c2_lcr: f64,
}

impl Reading {
    /// A fresh reading stamped now, all measured fields NaN.
    pub fn at_voltage(voltage: f64) -> Self {
        Self {
            timestamp: Utc::now().timestamp_millis() as f64 / 1e3,
            voltage,
            v_smu: f64::NAN,
            i_smu: f64::NAN,
            i_elm: f64::NAN,
            i_elm2: f64::NAN,
            t_dmm: f64::NAN,
            c_lcr: f64::NAN,
            c2_lcr: f64::NAN,
        }
    }

    /// Stores a capacitance and its derived inverse square.
    pub fn set_capacitance(&mut self, capacitance: f64) {
        self.c_lcr = capacitance;
        self.c2_lcr = if capacitance != 0.0 {
            1.0 / (capacitance * capacitance)
        } else {
            f64::NAN
        };
    }
}

/// Append/drain queue between the engine and its consumers.
///
/// Critical sections are limited to the append and the drain; the stored
/// sequence is never reordered.
#[derive(Debug, Default)]
pub struct ReadingQueue {
    inner: Mutex<Vec<Reading>>,
}

impl ReadingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, reading: Reading) {
        self.lock().push(reading);
    }

    /// Takes everything queued so far, in insertion order.
    pub fn drain(&self) -> Vec<Reading> {
        std::mem::take(&mut *self.lock())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Reading>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
