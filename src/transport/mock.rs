//! Scripted channel for testing drivers without hardware.
//!
//! Responses are queued ahead of time; every outbound command is recorded
//! so tests can assert the exact wire sequence a driver produced.

use crate::error::{DaqError, Result};
use crate::transport::CommandChannel;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct MockInner {
    responses: Mutex<VecDeque<String>>,
    writes: Mutex<Vec<String>>,
    fail_remaining: AtomicUsize,
    failures_seen: AtomicUsize,
    reconnects: AtomicUsize,
}

/// Scripted mock channel. Clones share the same script and write log, so a
/// test can keep a handle while the driver owns another.
#[derive(Clone, Default)]
pub struct MockChannel {
    inner: Arc<MockInner>,
}

impl MockChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for the next query.
    pub fn push_response(&self, response: &str) {
        self.inner
            .responses
            .lock()
            .unwrap()
            .push_back(response.to_string());
    }

    /// Queue several responses at once.
    pub fn push_responses(&self, responses: &[&str]) {
        for response in responses {
            self.push_response(response);
        }
    }

    /// Fail the next `count` operations with a transport fault.
    pub fn fail_times(&self, count: usize) {
        self.inner.fail_remaining.store(count, Ordering::SeqCst);
    }

    /// Number of injected failures that were actually hit.
    pub fn failures_seen(&self) -> usize {
        self.inner.failures_seen.load(Ordering::SeqCst)
    }

    /// Number of reconnect calls observed.
    pub fn reconnects(&self) -> usize {
        self.inner.reconnects.load(Ordering::SeqCst)
    }

    /// Drain and return the recorded outbound commands.
    pub fn take_writes(&self) -> Vec<String> {
        std::mem::take(&mut *self.inner.writes.lock().unwrap())
    }

    fn check_failure(&self) -> Result<()> {
        let remaining = self.inner.fail_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.inner.fail_remaining.store(remaining - 1, Ordering::SeqCst);
            self.inner.failures_seen.fetch_add(1, Ordering::SeqCst);
            return Err(DaqError::Transport("injected fault".into()));
        }
        Ok(())
    }

    fn record(&self, command: &str) {
        self.inner.writes.lock().unwrap().push(command.to_string());
    }
}

#[async_trait]
impl CommandChannel for MockChannel {
    async fn write(&self, command: &str) -> Result<()> {
        self.check_failure()?;
        self.record(command);
        Ok(())
    }

    async fn query(&self, command: &str) -> Result<String> {
        self.check_failure()?;
        self.record(command);
        match self.inner.responses.lock().unwrap().pop_front() {
            Some(response) => Ok(response.trim().to_string()),
            None => Err(DaqError::Timeout {
                elapsed: std::time::Duration::ZERO,
            }),
        }
    }

    async fn reconnect(&self) -> Result<()> {
        self.inner.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_writes_and_pops_responses() {
        let channel = MockChannel::new();
        channel.push_response("Keithley Model 2400");

        channel.write(":SOUR:VOLT:LEV 0.000E+00").await.unwrap();
        let idn = channel.query("*IDN?").await.unwrap();

        assert_eq!(idn, "Keithley Model 2400");
        assert_eq!(
            channel.take_writes(),
            vec![":SOUR:VOLT:LEV 0.000E+00", "*IDN?"]
        );
    }

    #[tokio::test]
    async fn exhausted_responses_time_out() {
        let channel = MockChannel::new();
        assert!(matches!(
            channel.query("*IDN?").await,
            Err(DaqError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn injected_failures_are_counted() {
        let channel = MockChannel::new();
        channel.fail_times(2);
        assert!(channel.write("*RST").await.is_err());
        assert!(channel.write("*RST").await.is_err());
        assert!(channel.write("*RST").await.is_ok());
        assert_eq!(channel.failures_seen(), 2);
    }
}
