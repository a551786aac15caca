//! The sweep/continuous measurement engine.
//!
//! One engine drives one run: it configures every bound role, walks the
//! voltage range tick by tick, then optionally keeps sampling in continuous
//! mode until stopped. Readings go to the [`ReadingQueue`] and onto a
//! broadcast stream; consumers that fall behind lose events, never queued
//! readings.
//!
//! The tick loop is meant to run on its own task (`tokio::spawn`) and never
//! concurrently with itself. Cancellation is cooperative: the stop flag is
//! polled at the top of every tick and long waits are sliced so the
//! reaction latency stays within one tick.

use crate::driver::{Role, RoleBindings, SourceMeter};
use crate::error::{DaqError, Result};
use crate::measurement::{
    Estimate, LinearRange, MeasurementKind, MeasurementState, Reading, ReadingQueue,
};
use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Configuring,
    Sweeping,
    Continuous,
    Stopping,
    Stopped,
    Error,
}

impl EngineState {
    /// Whether `next` is a regular transition from this state. `Error` is
    /// reachable from anywhere.
    pub fn can_enter(self, next: EngineState) -> bool {
        use EngineState::*;
        matches!(
            (self, next),
            (Idle, Configuring)
                | (Configuring, Sweeping)
                | (Configuring, Stopping)
                | (Sweeping, Continuous)
                | (Sweeping, Stopping)
                | (Continuous, Stopping)
                | (Stopping, Stopped)
                | (Stopped, Idle)
                | (Error, Idle)
                | (_, Error)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, EngineState::Stopped | EngineState::Error)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Idle => "idle",
            EngineState::Configuring => "configuring",
            EngineState::Sweeping => "sweeping",
            EngineState::Continuous => "continuous",
            EngineState::Stopping => "stopping",
            EngineState::Stopped => "stopped",
            EngineState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Why a run left its measuring state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The sweep reached its end voltage (and continuous mode, if any,
    /// was not requested to stop).
    Completed,
    Requested,
    ComplianceTripped,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StopReason::Completed => "completed",
            StopReason::Requested => "stop requested",
            StopReason::ComplianceTripped => "compliance tripped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub enum MeasurementEvent {
    State(EngineState),
    Reading(Reading),
    Message(String),
    Finished(StopReason),
    Failed(String),
}

enum TickOutcome {
    Continue,
    ComplianceTripped,
}

pub struct SweepEngine {
    state: Arc<MeasurementState>,
    bindings: RoleBindings,
    queue: Arc<ReadingQueue>,
    events: broadcast::Sender<MeasurementEvent>,
    engine_state: EngineState,
    ramp_step: f64,
    ramp_delay: Duration,
    settle_time: Duration,
    slow_tick: Duration,
}

impl SweepEngine {
    pub fn new(
        state: Arc<MeasurementState>,
        bindings: RoleBindings,
        queue: Arc<ReadingQueue>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state,
            bindings,
            queue,
            events,
            engine_state: EngineState::Idle,
            ramp_step: 5.0,
            ramp_delay: Duration::from_millis(250),
            settle_time: Duration::from_secs(1),
            slow_tick: Duration::from_secs(1),
        }
    }

    /// Overrides the ramp and throttle pacing. Mainly for tests; the
    /// defaults match what the instruments tolerate.
    pub fn with_pacing(
        mut self,
        ramp_step: f64,
        ramp_delay: Duration,
        settle_time: Duration,
        slow_tick: Duration,
    ) -> Self {
        self.ramp_step = ramp_step;
        self.ramp_delay = ramp_delay;
        self.settle_time = settle_time;
        self.slow_tick = slow_tick;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeasurementEvent> {
        self.events.subscribe()
    }

    pub fn engine_state(&self) -> EngineState {
        self.engine_state
    }

    /// Readies a finished engine for another run. Outside terminal states
    /// this does nothing.
    pub fn reset_to_idle(&mut self) {
        if self.engine_state.is_terminal() {
            self.set_state(EngineState::Idle);
        }
    }

    /// Runs the whole lifecycle to completion. The source output is ramped
    /// down and disabled on every exit path, fault included.
    pub async fn run(&mut self) -> Result<StopReason> {
        let outcome = self.run_inner().await;
        if let Err(err) = self.finalize().await {
            warn!("finalize failed: {}", err);
        }
        match outcome {
            Ok(reason) => {
                info!("measurement finished: {}", reason);
                self.set_state(EngineState::Stopped);
                self.emit(MeasurementEvent::Finished(reason));
                Ok(reason)
            }
            Err(err) => {
                warn!("measurement failed: {}", err);
                self.set_state(EngineState::Error);
                self.emit(MeasurementEvent::Failed(err.to_string()));
                Err(err)
            }
        }
    }

    async fn run_inner(&mut self) -> Result<StopReason> {
        // A stop left over from a previous run must not end this one.
        self.state.clear_stop();
        self.set_state(EngineState::Configuring);
        self.state.config().validate()?;
        let source_role = self.state.config().source;
        let source = self
            .bindings
            .source_for(source_role)
            .ok_or_else(|| DaqError::NoSourceInstrument(source_role.to_string()))?;

        self.configure(&source).await?;

        if self.state.stop_requested() {
            self.set_state(EngineState::Stopping);
            return Ok(StopReason::Requested);
        }

        let mut reason = self.sweep(&source).await?;
        if reason == StopReason::Completed
            && self.state.config().continuous
            && self.state.config().kind == MeasurementKind::Iv
        {
            reason = self.continuous(&source).await?;
        }
        self.set_state(EngineState::Stopping);
        Ok(reason)
    }

    async fn configure(&self, source: &Arc<dyn SourceMeter>) -> Result<()> {
        for bound in self.bindings.iter() {
            let identity = bound.instrument.identity().await?;
            info!("{}: {}", bound.role, identity);
        }

        // An output left enabled by a previous run is ramped down before
        // anything else touches the instrument.
        if source.output_enabled().await? {
            self.ramp_to(source, 0.0, self.ramp_step, self.ramp_delay)
                .await?;
        }

        if self.state.config().reset {
            for bound in self.bindings.iter() {
                bound.instrument.reset().await?;
            }
        }
        for bound in self.bindings.iter() {
            bound.instrument.clear().await?;
        }
        for bound in self.bindings.iter() {
            bound.instrument.configure(&bound.options).await?;
        }

        source
            .set_current_compliance(self.state.current_compliance())
            .await?;
        self.check_error_states().await?;

        source.set_output_enabled(true).await?;
        // Range covers the far end of the sweep before any level reaches it.
        source
            .set_voltage_range(self.state.config().voltage_end)
            .await?;
        self.ramp_to(
            source,
            self.state.config().voltage_begin,
            self.ramp_step,
            self.ramp_delay,
        )
        .await?;
        tokio::time::sleep(self.settle_time).await;
        Ok(())
    }

    async fn sweep(&mut self, source: &Arc<dyn SourceMeter>) -> Result<StopReason> {
        self.set_state(EngineState::Sweeping);
        let range = self.state.config().range();
        let mut estimate = Estimate::new(range.points());
        let mut applied_compliance = self.state.current_compliance();
        let mut last_status: Option<Instant> = None;
        let mut reconnected = false;

        for target in range {
            if self.state.stop_requested() {
                return Ok(StopReason::Requested);
            }

            let outcome = match self.sweep_tick(source, target, &mut applied_compliance).await {
                Ok(outcome) => outcome,
                Err(err)
                    if err.is_connection_fault()
                        && self.state.config().auto_reconnect
                        && !reconnected =>
                {
                    reconnected = true;
                    warn!("connection fault, reconnecting all roles: {}", err);
                    self.reconnect_all().await?;
                    self.sweep_tick(source, target, &mut applied_compliance)
                        .await?
                }
                Err(err) => return Err(err),
            };
            if let TickOutcome::ComplianceTripped = outcome {
                return Ok(StopReason::ComplianceTripped);
            }

            estimate.advance();
            if last_status.is_none_or(|at| at.elapsed() >= self.slow_tick) {
                let (passed, total) = estimate.progress();
                self.emit(MeasurementEvent::Message(format!(
                    "Sweep at {:.3} V ({} of {}) | Elapsed {:.0?} | Remaining {:.0?} | Average {:.2?}",
                    target,
                    passed,
                    total,
                    estimate.elapsed(),
                    estimate.remaining(),
                    estimate.average()
                )));
                last_status = Some(Instant::now());
            }
        }
        Ok(StopReason::Completed)
    }

    async fn sweep_tick(
        &self,
        source: &Arc<dyn SourceMeter>,
        target: f64,
        applied_compliance: &mut f64,
    ) -> Result<TickOutcome> {
        source.set_voltage_level(target).await?;
        tokio::time::sleep(self.state.config().waiting_time()).await;

        let reading = self.acquire(target).await?;
        self.queue.append(reading);
        self.emit(MeasurementEvent::Reading(reading));

        if source.compliance_tripped().await? {
            if !self.state.config().continue_in_compliance {
                warn!("compliance tripped at {} V", target);
                return Ok(TickOutcome::ComplianceTripped);
            }
            debug!("compliance tripped at {} V, continuing", target);
        }

        // The controller may have changed the compliance level mid-run.
        let desired = self.state.current_compliance();
        if desired != *applied_compliance {
            source.set_current_compliance(desired).await?;
            *applied_compliance = desired;
            self.check_error_states().await?;
        }

        Ok(TickOutcome::Continue)
    }

    async fn continuous(&mut self, source: &Arc<dyn SourceMeter>) -> Result<StopReason> {
        self.set_state(EngineState::Continuous);
        let mut level = self.state.config().voltage_end;
        let mut applied_compliance = self.state.current_compliance();
        let mut last_slow = Instant::now();
        let mut reconnected = false;

        loop {
            if self.state.stop_requested() {
                return Ok(StopReason::Requested);
            }

            let reading = match self.acquire(level).await {
                Ok(reading) => reading,
                Err(err)
                    if err.is_connection_fault()
                        && self.state.config().auto_reconnect
                        && !reconnected =>
                {
                    reconnected = true;
                    warn!("connection fault, reconnecting all roles: {}", err);
                    self.reconnect_all().await?;
                    self.acquire(level).await?
                }
                Err(err) => return Err(err),
            };
            self.queue.append(reading);
            self.emit(MeasurementEvent::Reading(reading));

            // Slow path at most once per second, so the housekeeping
            // queries cannot saturate slow instruments.
            if last_slow.elapsed() >= self.slow_tick {
                last_slow = Instant::now();

                if source.compliance_tripped().await?
                    && !self.state.config().continue_in_compliance
                {
                    warn!("compliance tripped at {} V", level);
                    return Ok(StopReason::ComplianceTripped);
                }

                if let Some(change) = self.state.take_change_voltage() {
                    level = self.apply_change_voltage(source, level, change).await?;
                }

                let desired = self.state.current_compliance();
                if desired != applied_compliance {
                    source.set_current_compliance(desired).await?;
                    applied_compliance = desired;
                    self.check_error_states().await?;
                }

                self.emit(MeasurementEvent::Message(format!(
                    "Continuous at {:.3} V",
                    level
                )));
            }

            self.wait_observing_stop(self.state.config().waiting_time_continuous())
                .await;
        }
    }

    async fn apply_change_voltage(
        &self,
        source: &Arc<dyn SourceMeter>,
        level: f64,
        change: crate::measurement::ChangeVoltageRequest,
    ) -> Result<f64> {
        info!(
            "changing continuous voltage from {} V to {} V",
            level, change.end_voltage
        );
        // Ramping up needs the wider range in place first; ramping down
        // narrows it only after the levels are safe.
        let widening = change.end_voltage.abs() > level.abs();
        if widening {
            source.set_voltage_range(change.end_voltage).await?;
        }
        self.ramp_to(source, change.end_voltage, change.step_voltage, change.waiting_time)
            .await?;
        if !widening {
            source.set_voltage_range(change.end_voltage).await?;
        }
        Ok(change.end_voltage)
    }

    async fn acquire(&self, voltage: f64) -> Result<Reading> {
        let mut reading = Reading::at_voltage(voltage);
        if let Some(smu) = self.bindings.smu() {
            let (i, v) = smu.measure_iv().await?;
            reading.i_smu = i;
            reading.v_smu = v;
        }
        if let Some(elm) = self.bindings.elm() {
            reading.i_elm = elm.measure_i().await?;
        }
        if let Some(elm2) = self.bindings.elm2() {
            reading.i_elm2 = elm2.measure_i().await?;
        }
        if let Some(lcr) = self.bindings.lcr() {
            let (primary, _secondary) = lcr.measure_impedance().await?;
            reading.set_capacitance(primary);
        }
        if let Some(dmm) = self.bindings.dmm() {
            reading.t_dmm = dmm.read_temperature().await?;
        }
        Ok(reading)
    }

    async fn check_error_states(&self) -> Result<()> {
        for bound in self.bindings.iter() {
            let record = bound.instrument.next_error().await?;
            if record.is_error() {
                return Err(DaqError::Instrument {
                    code: record.code,
                    message: format!("{}: {}", bound.role, record.message),
                });
            }
        }
        Ok(())
    }

    async fn reconnect_all(&self) -> Result<()> {
        for bound in self.bindings.iter() {
            bound.instrument.reconnect().await?;
        }
        Ok(())
    }

    async fn ramp_to(
        &self,
        source: &Arc<dyn SourceMeter>,
        end: f64,
        step: f64,
        delay: Duration,
    ) -> Result<()> {
        let begin = source.voltage_level().await?;
        if begin == end {
            return Ok(());
        }
        self.emit(MeasurementEvent::Message(format!("Ramp to {} V", end)));
        for target in LinearRange::new(begin, end, step) {
            source.set_voltage_level(target).await?;
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn finalize(&self) -> Result<()> {
        let Some(source) = self.bindings.source_for(self.state.config().source) else {
            return Ok(());
        };
        self.ramp_to(&source, 0.0, self.ramp_step, self.ramp_delay)
            .await?;
        source.set_output_enabled(false).await?;
        self.emit(MeasurementEvent::Message("Output disabled".into()));
        Ok(())
    }

    /// Waits up to `total`, returning early once a stop is requested.
    /// Long waits are sliced so the latency bound holds.
    async fn wait_observing_stop(&self, total: Duration) {
        let slice = self.slow_tick.min(Duration::from_secs(1));
        let deadline = Instant::now() + total;
        loop {
            if self.state.stop_requested() {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            tokio::time::sleep((deadline - now).min(slice)).await;
        }
    }

    fn set_state(&mut self, next: EngineState) {
        if self.engine_state == next {
            return;
        }
        if !self.engine_state.can_enter(next) {
            debug!("irregular transition {} -> {}", self.engine_state, next);
        }
        info!("engine state: {} -> {}", self.engine_state, next);
        self.engine_state = next;
        self.emit(MeasurementEvent::State(next));
    }

    fn emit(&self, event: MeasurementEvent) {
        // Nobody listening is fine; the queue holds the data of record.
        let _ = self.events.send(event);
    }

    /// The role currently acting as voltage source, for display purposes.
    pub fn source_role(&self) -> Role {
        self.state.config().source
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_transitions() {
        use EngineState::*;
        assert!(Idle.can_enter(Configuring));
        assert!(Configuring.can_enter(Sweeping));
        assert!(Sweeping.can_enter(Continuous));
        assert!(Sweeping.can_enter(Stopping));
        assert!(Continuous.can_enter(Stopping));
        assert!(Stopping.can_enter(Stopped));
        assert!(Stopped.can_enter(Idle));
        assert!(Error.can_enter(Idle));
        assert!(Continuous.can_enter(Error));
        assert!(Idle.can_enter(Error));

        assert!(!Idle.can_enter(Sweeping));
        assert!(!Stopped.can_enter(Sweeping));
        assert!(!Continuous.can_enter(Sweeping));

        assert!(Stopped.is_terminal());
        assert!(Error.is_terminal());
        assert!(!Stopping.is_terminal());
    }

    #[test]
    fn state_and_reason_display() {
        assert_eq!(EngineState::Sweeping.to_string(), "sweeping");
        assert_eq!(StopReason::ComplianceTripped.to_string(), "compliance tripped");
    }
}
