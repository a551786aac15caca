//! Shared measurement configuration and runtime flags.
//!
//! One [`MeasurementState`] exists per run. Configuration is immutable for
//! the run's duration; the runtime fields follow a single-writer
//! (controller) / single-reader (engine) discipline and are polled, never
//! used to interrupt a blocking call.

use crate::driver::Role;
use crate::error::{DaqError, Result};
use crate::measurement::LinearRange;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeasurementKind {
    #[default]
    Iv,
    Cv,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MeasurementConfig {
    #[serde(default)]
    pub kind: MeasurementKind,
    #[serde(default)]
    pub voltage_begin: f64,
    #[serde(default)]
    pub voltage_end: f64,
    #[serde(default)]
    pub voltage_step: f64,
    /// Settle time after each sweep step, in seconds.
    #[serde(default = "default_waiting_time")]
    pub waiting_time: f64,
    /// Tick cadence in continuous mode, in seconds.
    #[serde(default = "default_waiting_time")]
    pub waiting_time_continuous: f64,
    #[serde(default)]
    pub current_compliance: f64,
    /// Keep sampling at the final voltage after the sweep completes.
    #[serde(default)]
    pub continuous: bool,
    #[serde(default)]
    pub continue_in_compliance: bool,
    #[serde(default)]
    pub auto_reconnect: bool,
    /// Reset every instrument during configuration.
    #[serde(default)]
    pub reset: bool,
    /// Which bound role sources the sweep voltage.
    #[serde(default = "default_source")]
    pub source: Role,
}

fn default_waiting_time() -> f64 {
    1.0
}

fn default_source() -> Role {
    Role::Smu
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            kind: MeasurementKind::Iv,
            voltage_begin: 0.0,
            voltage_end: 0.0,
            voltage_step: 0.0,
            waiting_time: default_waiting_time(),
            waiting_time_continuous: default_waiting_time(),
            current_compliance: 0.0,
            continuous: false,
            continue_in_compliance: false,
            auto_reconnect: false,
            reset: false,
            source: default_source(),
        }
    }
}

impl MeasurementConfig {
    /// Start-time validation: a sweep with a zero or non-finite step never
    /// crosses its end voltage.
    pub fn validate(&self) -> Result<()> {
        let range = self.range();
        if !range.is_valid() {
            return Err(DaqError::Validation(format!(
                "voltage step {} cannot reach {} from {}",
                self.voltage_step, self.voltage_end, self.voltage_begin
            )));
        }
        if self.waiting_time < 0.0 || self.waiting_time_continuous < 0.0 {
            return Err(DaqError::Validation("negative waiting time".into()));
        }
        Ok(())
    }

    /// The sweep range with the step direction normalized to
    /// `sign(voltage_end - voltage_begin)`.
    pub fn range(&self) -> LinearRange {
        LinearRange::new(self.voltage_begin, self.voltage_end, self.voltage_step)
    }

    pub fn waiting_time(&self) -> Duration {
        Duration::from_secs_f64(self.waiting_time.max(0.0))
    }

    pub fn waiting_time_continuous(&self) -> Duration {
        Duration::from_secs_f64(self.waiting_time_continuous.max(0.0))
    }
}

/// Voltage change applied while the engine runs in continuous mode.
///
/// Queued by the controller and consumed atomically by the engine, exactly
/// once, on its slow-path tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChangeVoltageRequest {
    pub end_voltage: f64,
    pub step_voltage: f64,
    pub waiting_time: Duration,
}

#[derive(Debug)]
pub struct MeasurementState {
    config: MeasurementConfig,
    stop_requested: AtomicBool,
    compliance: Mutex<f64>,
    pending_change: Mutex<Option<ChangeVoltageRequest>>,
}

impl MeasurementState {
    pub fn new(config: MeasurementConfig) -> Self {
        let compliance = config.current_compliance;
        Self {
            config,
            stop_requested: AtomicBool::new(false),
            compliance: Mutex::new(compliance),
            pending_change: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MeasurementConfig {
        &self.config
    }

    /// Asks the engine to stop; observed within one tick.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Rearms the stop flag; the engine calls this when a run starts.
    pub fn clear_stop(&self) {
        self.stop_requested.store(false, Ordering::Release);
    }

    /// Live compliance level; the engine re-applies it when it changes.
    pub fn set_current_compliance(&self, level: f64) {
        *self.lock_compliance() = level;
    }

    pub fn current_compliance(&self) -> f64 {
        *self.lock_compliance()
    }

    /// Queues a continuous-mode voltage change, replacing any pending one.
    pub fn request_change_voltage(&self, request: ChangeVoltageRequest) {
        *self.lock_pending() = Some(request);
    }

    /// Consumes the pending voltage change, if any.
    pub fn take_change_voltage(&self) -> Option<ChangeVoltageRequest> {
        self.lock_pending().take()
    }

    fn lock_compliance(&self) -> std::sync::MutexGuard<'_, f64> {
        self.compliance
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Option<ChangeVoltageRequest>> {
        self.pending_change
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
