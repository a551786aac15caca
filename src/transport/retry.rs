//! Bounded-retry decoration for command channels.

use crate::error::{DaqError, Result};
use crate::transport::CommandChannel;
use async_trait::async_trait;
use log::warn;
use std::time::Duration;

/// Delay between retry attempts, to let a flaky link settle.
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Wraps a channel with a bounded retry budget.
///
/// Transport faults are absorbed and the command resent unchanged, up to
/// `attempts` tries in total; each failed attempt is logged. Once the budget
/// is exhausted the last fault is escalated as-is. Faults raised above the
/// channel (protocol, validation, timeout) are never retried.
pub struct RetryChannel {
    inner: Box<dyn CommandChannel>,
    attempts: u32,
}

impl RetryChannel {
    pub fn new(inner: Box<dyn CommandChannel>, attempts: u32) -> Self {
        Self {
            inner,
            attempts: attempts.max(1),
        }
    }

    /// Convenience constructor with the default budget of 3 attempts.
    pub fn with_default_budget(inner: Box<dyn CommandChannel>) -> Self {
        Self::new(inner, 3)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    async fn run<'a, F, Fut, T>(&'a self, command: &'a str, op: F) -> Result<T>
    where
        F: Fn(&'a dyn CommandChannel, &'a str) -> Fut,
        Fut: std::future::Future<Output = Result<T>> + 'a,
    {
        let mut last_err = None;
        for attempt in 1..=self.attempts {
            match op(self.inner.as_ref(), command).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() => {
                    warn!(
                        "attempt {}/{} failed for `{}`: {}",
                        attempt, self.attempts, command, err
                    );
                    last_err = Some(err);
                    if attempt < self.attempts {
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| DaqError::Transport("retry budget exhausted".into())))
    }
}

#[async_trait]
impl CommandChannel for RetryChannel {
    async fn write(&self, command: &str) -> Result<()> {
        self.run(command, |ch, cmd| ch.write(cmd)).await
    }

    async fn query(&self, command: &str) -> Result<String> {
        self.run(command, |ch, cmd| ch.query(cmd)).await
    }

    async fn clear(&self) -> Result<()> {
        self.inner.clear().await
    }

    async fn reconnect(&self) -> Result<()> {
        self.inner.reconnect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockChannel;

    #[tokio::test]
    async fn two_failures_then_success_within_budget() {
        let mock = MockChannel::new();
        mock.fail_times(2);
        mock.push_response("42");

        let channel = RetryChannel::new(Box::new(mock.clone()), 3);
        let response = channel.query(":READ?").await.unwrap();

        assert_eq!(response, "42");
        assert_eq!(mock.failures_seen(), 2);
        assert_eq!(mock.take_writes(), vec![":READ?"]);
    }

    #[tokio::test]
    async fn exhausted_budget_escalates_last_fault() {
        let mock = MockChannel::new();
        mock.fail_times(3);

        let channel = RetryChannel::new(Box::new(mock.clone()), 3);
        let result = channel.write("*RST").await;

        assert!(matches!(result, Err(DaqError::Transport(_))));
        assert_eq!(mock.failures_seen(), 3);
    }

    #[tokio::test]
    async fn timeouts_are_not_retried() {
        // Empty response queue makes the mock fail with a timeout, which
        // must propagate on the first attempt.
        let mock = MockChannel::new();
        let channel = RetryChannel::new(Box::new(mock.clone()), 3);

        let result = channel.query("*IDN?").await;
        assert!(matches!(result, Err(DaqError::Timeout { .. })));
        assert_eq!(mock.take_writes(), vec!["*IDN?"]);
    }
}
