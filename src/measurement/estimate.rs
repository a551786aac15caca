//! Remaining-time model for running measurements.

use std::time::Duration;
use tokio::time::Instant;

/// Rolling per-step average over a known step count.
///
/// `remaining` never increases between two `advance` calls on an unchanged
/// step count; resetting the count (a resumed sweep) restarts the model.
#[derive(Debug, Clone)]
pub struct Estimate {
    count: usize,
    passed: usize,
    started: Instant,
}

impl Estimate {
    pub fn new(count: usize) -> Self {
        Self {
            count,
            passed: 0,
            started: Instant::now(),
        }
    }

    /// Marks one step as done.
    pub fn advance(&mut self) {
        self.passed = (self.passed + 1).min(self.count);
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Average duration of the steps passed so far, zero before the first.
    pub fn average(&self) -> Duration {
        if self.passed == 0 {
            return Duration::ZERO;
        }
        self.elapsed() / self.passed as u32
    }

    pub fn remaining(&self) -> Duration {
        self.average() * (self.count - self.passed) as u32
    }

    /// (passed, total) step counts.
    pub fn progress(&self) -> (usize, usize) {
        (self.passed, self.count)
    }

    pub fn is_done(&self) -> bool {
        self.passed >= self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn averages_over_passed_steps() {
        let mut estimate = Estimate::new(4);
        assert_eq!(estimate.average(), Duration::ZERO);
        assert_eq!(estimate.remaining(), Duration::ZERO);

        tokio::time::sleep(Duration::from_millis(20)).await;
        estimate.advance();
        estimate.advance();

        let average = estimate.average();
        assert!(average >= Duration::from_millis(10));
        assert!(estimate.remaining() >= average);
        assert_eq!(estimate.progress(), (2, 4));
        assert!(!estimate.is_done());
    }

    #[tokio::test]
    async fn completes_after_all_steps() {
        let mut estimate = Estimate::new(2);
        estimate.advance();
        estimate.advance();
        estimate.advance(); // extra advances saturate
        assert!(estimate.is_done());
        assert_eq!(estimate.remaining(), Duration::ZERO);
        assert_eq!(estimate.progress(), (2, 2));
    }
}
