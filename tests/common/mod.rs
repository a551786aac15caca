//! Simulated instruments for engine-level tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use sweep_daq::driver::{ErrorRecord, Instrument, Options, SourceMeter};
use sweep_daq::error::{DaqError, Result};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A source meter that answers from in-memory state and records every
/// level it is told to apply.
#[derive(Default)]
pub struct FakeSourceMeter {
    level: Mutex<f64>,
    levels: Mutex<Vec<f64>>,
    output: AtomicBool,
    compliance: Mutex<f64>,
    measurements: AtomicUsize,
    /// Report a tripped compliance once this many measurements happened.
    trip_after: Mutex<Option<usize>>,
    /// Fail this many upcoming measurements with a transport fault.
    fail_measurements: AtomicUsize,
    reconnects: AtomicUsize,
    resets: AtomicUsize,
}

impl FakeSourceMeter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn trip_after(&self, measurements: usize) {
        *lock(&self.trip_after) = Some(measurements);
    }

    pub fn fail_next_measurements(&self, count: usize) {
        self.fail_measurements.store(count, Ordering::SeqCst);
    }

    pub fn level(&self) -> f64 {
        *lock(&self.level)
    }

    pub fn applied_levels(&self) -> Vec<f64> {
        lock(&self.levels).clone()
    }

    pub fn output(&self) -> bool {
        self.output.load(Ordering::SeqCst)
    }

    pub fn compliance(&self) -> f64 {
        *lock(&self.compliance)
    }

    pub fn measurements(&self) -> usize {
        self.measurements.load(Ordering::SeqCst)
    }

    pub fn reconnects(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Instrument for FakeSourceMeter {
    fn model(&self) -> &'static str {
        "FAKE"
    }

    async fn identity(&self) -> Result<String> {
        Ok("Fake Instruments Inc.,Model FAKE,0,1.0".to_string())
    }

    async fn reset(&self) -> Result<()> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        Ok(())
    }

    async fn next_error(&self) -> Result<ErrorRecord> {
        Ok(ErrorRecord {
            code: 0,
            message: "No error".to_string(),
        })
    }

    async fn configure(&self, _options: &Options) -> Result<()> {
        Ok(())
    }

    async fn reconnect(&self) -> Result<()> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl SourceMeter for FakeSourceMeter {
    async fn output_enabled(&self) -> Result<bool> {
        Ok(self.output())
    }

    async fn set_output_enabled(&self, enabled: bool) -> Result<()> {
        self.output.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    async fn voltage_level(&self) -> Result<f64> {
        Ok(self.level())
    }

    async fn set_voltage_level(&self, level: f64) -> Result<()> {
        *lock(&self.level) = level;
        lock(&self.levels).push(level);
        Ok(())
    }

    async fn set_voltage_range(&self, _level: f64) -> Result<()> {
        Ok(())
    }

    async fn set_current_compliance(&self, level: f64) -> Result<()> {
        *lock(&self.compliance) = level;
        Ok(())
    }

    async fn compliance_tripped(&self) -> Result<bool> {
        let seen = self.measurements();
        Ok(lock(&self.trip_after).is_some_and(|limit| seen >= limit))
    }

    async fn measure_i(&self) -> Result<f64> {
        self.measure_iv().await.map(|(i, _)| i)
    }

    async fn measure_iv(&self) -> Result<(f64, f64)> {
        let pending = self.fail_measurements.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_measurements.store(pending - 1, Ordering::SeqCst);
            return Err(DaqError::Transport("simulated link loss".to_string()));
        }
        self.measurements.fetch_add(1, Ordering::SeqCst);
        let level = self.level();
        Ok((level * 1e-9, level))
    }
}
