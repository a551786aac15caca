//! Engine lifecycle tests over simulated hardware.

mod common;

use common::FakeSourceMeter;
use std::sync::Arc;
use std::time::Duration;
use sweep_daq::driver::{Options, Role, RoleBindings};
use sweep_daq::error::DaqError;
use sweep_daq::measurement::{
    ChangeVoltageRequest, EngineState, MeasurementConfig, MeasurementEvent, MeasurementState,
    ReadingQueue, StopReason, SweepEngine,
};

fn sweep_config(end: f64, step: f64) -> MeasurementConfig {
    MeasurementConfig {
        voltage_begin: 0.0,
        voltage_end: end,
        voltage_step: step,
        waiting_time: 0.0,
        waiting_time_continuous: 0.05,
        current_compliance: 1e-6,
        ..MeasurementConfig::default()
    }
}

/// Engine over a single fake SMU, paced for tests: no ramp staging, no
/// settle wait, 5 ms slow tick.
fn engine_for(
    config: MeasurementConfig,
    fake: Arc<FakeSourceMeter>,
) -> (SweepEngine, Arc<MeasurementState>, Arc<ReadingQueue>) {
    common::init_logging();
    let mut bindings = RoleBindings::new();
    bindings
        .bind_source_meter(Role::Smu, fake, Options::new())
        .unwrap();
    let state = Arc::new(MeasurementState::new(config));
    let queue = Arc::new(ReadingQueue::new());
    let engine = SweepEngine::new(state.clone(), bindings, queue.clone()).with_pacing(
        1000.0,
        Duration::ZERO,
        Duration::ZERO,
        Duration::from_millis(5),
    );
    (engine, state, queue)
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..2000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn sweep_covers_the_full_range() {
    let fake = FakeSourceMeter::new();
    let (mut engine, _state, queue) = engine_for(sweep_config(-300.0, 5.0), fake.clone());

    let reason = engine.run().await.unwrap();
    assert_eq!(reason, StopReason::Completed);

    let readings = queue.drain();
    assert_eq!(readings.len(), 61);
    assert_eq!(readings[0].voltage, 0.0);
    assert_eq!(readings[1].voltage, -5.0);
    assert_eq!(readings[60].voltage, -300.0);
    for pair in readings.windows(2) {
        assert!(pair[1].voltage < pair[0].voltage);
    }

    // The configured compliance reaches the instrument before the sweep.
    assert_eq!(fake.compliance(), 1e-6);

    // Output is ramped down and disabled on the way out.
    assert_eq!(fake.level(), 0.0);
    assert_eq!(fake.applied_levels().last(), Some(&0.0));
    assert!(!fake.output());
}

#[tokio::test]
async fn compliance_trip_halts_after_the_offending_reading() {
    let fake = FakeSourceMeter::new();
    fake.trip_after(3);
    let (mut engine, _state, queue) = engine_for(sweep_config(-50.0, 5.0), fake.clone());

    let reason = engine.run().await.unwrap();
    assert_eq!(reason, StopReason::ComplianceTripped);
    // The reading that tripped is the last one recorded.
    assert_eq!(queue.len(), 3);
    assert!(!fake.output());
}

#[tokio::test]
async fn compliance_trip_is_ignored_when_configured() {
    let fake = FakeSourceMeter::new();
    fake.trip_after(3);
    let mut config = sweep_config(-50.0, 5.0);
    config.continue_in_compliance = true;
    let (mut engine, _state, queue) = engine_for(config, fake.clone());

    let reason = engine.run().await.unwrap();
    assert_eq!(reason, StopReason::Completed);
    assert_eq!(queue.len(), 11);
}

#[tokio::test]
async fn continuous_mode_stops_within_one_tick() {
    let fake = FakeSourceMeter::new();
    let mut config = sweep_config(-10.0, 5.0);
    config.continuous = true;
    let (mut engine, state, queue) = engine_for(config, fake.clone());
    let handle = tokio::spawn(async move { engine.run().await });

    // Three readings come from the sweep; anything past that is continuous.
    wait_until("continuous sampling", || queue.len() > 3).await;

    let requested = std::time::Instant::now();
    state.request_stop();
    let reason = handle.await.unwrap().unwrap();
    assert_eq!(reason, StopReason::Requested);
    assert!(requested.elapsed() < Duration::from_millis(500));
    assert!(!fake.output());
}

#[tokio::test]
async fn change_voltage_request_is_consumed_once() {
    let fake = FakeSourceMeter::new();
    let mut config = sweep_config(-10.0, 5.0);
    config.continuous = true;
    let (mut engine, state, queue) = engine_for(config, fake.clone());
    let handle = tokio::spawn(async move { engine.run().await });

    wait_until("continuous sampling", || queue.len() > 3).await;
    state.request_change_voltage(ChangeVoltageRequest {
        end_voltage: -20.0,
        step_voltage: 10.0,
        waiting_time: Duration::ZERO,
    });
    let target = fake.clone();
    wait_until("the new level", move || target.level() == -20.0).await;
    assert!(state.take_change_voltage().is_none());

    state.request_stop();
    let reason = handle.await.unwrap().unwrap();
    assert_eq!(reason, StopReason::Requested);
    assert_eq!(fake.level(), 0.0);
}

#[tokio::test]
async fn connection_fault_triggers_one_reconnect_cycle() {
    let fake = FakeSourceMeter::new();
    fake.fail_next_measurements(1);
    let mut config = sweep_config(-50.0, 5.0);
    config.auto_reconnect = true;
    let (mut engine, _state, queue) = engine_for(config, fake.clone());

    let reason = engine.run().await.unwrap();
    assert_eq!(reason, StopReason::Completed);
    assert_eq!(fake.reconnects(), 1);
    // No tick is lost to the reconnection.
    assert_eq!(queue.len(), 11);
}

#[tokio::test]
async fn connection_fault_without_auto_reconnect_fails_the_run() {
    let fake = FakeSourceMeter::new();
    fake.fail_next_measurements(1);
    let (mut engine, _state, _queue) = engine_for(sweep_config(-50.0, 5.0), fake.clone());

    let err = engine.run().await.unwrap_err();
    assert!(err.is_connection_fault());
    assert_eq!(fake.reconnects(), 0);
    // The output still comes down after a fault.
    assert!(!fake.output());
}

#[tokio::test]
async fn missing_source_role_is_rejected() {
    let state = Arc::new(MeasurementState::new(sweep_config(-10.0, 5.0)));
    let queue = Arc::new(ReadingQueue::new());
    let mut engine = SweepEngine::new(state, RoleBindings::new(), queue);

    let err = engine.run().await.unwrap_err();
    assert!(matches!(err, DaqError::NoSourceInstrument(_)));
}

#[tokio::test]
async fn invalid_range_is_rejected_before_touching_hardware() {
    let fake = FakeSourceMeter::new();
    let (mut engine, _state, _queue) = engine_for(sweep_config(-10.0, 0.0), fake.clone());

    let err = engine.run().await.unwrap_err();
    assert!(matches!(err, DaqError::Validation(_)));
    assert_eq!(fake.measurements(), 0);
}

#[tokio::test]
async fn events_follow_the_lifecycle() {
    let fake = FakeSourceMeter::new();
    let (mut engine, _state, _queue) = engine_for(sweep_config(-10.0, 5.0), fake);
    let mut events = engine.subscribe();
    let handle = tokio::spawn(async move { engine.run().await });

    let mut states = Vec::new();
    let mut readings = 0;
    let finished = loop {
        match events.recv().await.unwrap() {
            MeasurementEvent::State(state) => states.push(state),
            MeasurementEvent::Reading(_) => readings += 1,
            MeasurementEvent::Finished(reason) => break reason,
            MeasurementEvent::Message(_) => {}
            MeasurementEvent::Failed(message) => panic!("unexpected failure: {}", message),
        }
    };
    handle.await.unwrap().unwrap();

    assert_eq!(finished, StopReason::Completed);
    assert_eq!(readings, 3);
    assert_eq!(
        states,
        vec![
            EngineState::Configuring,
            EngineState::Sweeping,
            EngineState::Stopping,
            EngineState::Stopped,
        ]
    );
}

#[tokio::test]
async fn finished_engine_can_be_reset_and_rerun() {
    let fake = FakeSourceMeter::new();
    let (mut engine, state, queue) = engine_for(sweep_config(-10.0, 5.0), fake.clone());

    engine.run().await.unwrap();
    assert!(engine.engine_state().is_terminal());
    assert_eq!(queue.drain().len(), 3);

    // A stop requested between runs must not end the next one.
    state.request_stop();
    engine.reset_to_idle();
    assert_eq!(engine.engine_state(), EngineState::Idle);

    let reason = engine.run().await.unwrap();
    assert_eq!(reason, StopReason::Completed);
    assert_eq!(queue.drain().len(), 3);
}

#[tokio::test]
async fn reset_is_forwarded_when_requested() {
    let fake = FakeSourceMeter::new();
    let mut config = sweep_config(-10.0, 5.0);
    config.reset = true;
    let (mut engine, _state, _queue) = engine_for(config, fake.clone());

    engine.run().await.unwrap();
    assert_eq!(fake.resets(), 1);
}
