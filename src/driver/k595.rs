//! Keithley 595 quasistatic CV meter.
//!
//! Pre-SCPI command-word dialect: single-letter commands terminated by `X`,
//! status words `U0X`/`U1X`, readings triggered with a bare `X`. The
//! instrument drops commands arriving faster than it can digest, so writes
//! are paced to a minimum interval. Output switching, voltage ranging and
//! current compliance do not exist on this model and return neutral values.

use crate::driver::scpi;
use crate::driver::{ErrorRecord, Instrument, LcrMeter, Options, SourceMeter};
use crate::error::Result;
use crate::transport::CommandChannel;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

const ERROR_MESSAGES: [&str; 7] = [
    "IDDC",
    "IDDCO",
    "No Remote",
    "Conflict",
    "Trigger Overrun",
    "Number",
    "Self Test",
];

pub struct K595 {
    channel: Box<dyn CommandChannel>,
    write_delay: Duration,
    last_write: Mutex<Option<Instant>>,
}

impl K595 {
    pub const MODEL: &'static str = "K595";

    pub fn new(channel: Box<dyn CommandChannel>) -> Self {
        Self::with_write_delay(channel, Duration::from_millis(250))
    }

    pub fn with_write_delay(channel: Box<dyn CommandChannel>, write_delay: Duration) -> Self {
        Self {
            channel,
            write_delay,
            last_write: Mutex::new(None),
        }
    }

    async fn write(&self, command: &str) -> Result<()> {
        let mut last = self.last_write.lock().await;
        if let Some(stamp) = *last {
            let elapsed = stamp.elapsed();
            if elapsed < self.write_delay {
                tokio::time::sleep(self.write_delay - elapsed).await;
            }
        }
        let result = self
            .channel
            .write(command)
            .await
            .map_err(|e| e.for_model(Self::MODEL));
        *last = Some(Instant::now());
        result
    }

    async fn query(&self, command: &str) -> Result<String> {
        self.channel
            .query(command)
            .await
            .map_err(|e| e.for_model(Self::MODEL))
    }

    /// Selects function and readout format, then triggers one reading.
    async fn trigger_reading(&self, function: &str) -> Result<String> {
        self.write(function).await?;
        self.write("G1X").await?;
        self.query("X").await
    }
}

#[async_trait]
impl Instrument for K595 {
    fn model(&self) -> &'static str {
        Self::MODEL
    }

    async fn identity(&self) -> Result<String> {
        let status = self.query("U0X").await?;
        Ok(status.chars().take(3).collect())
    }

    async fn reset(&self) -> Result<()> {
        self.channel.clear().await
    }

    async fn clear(&self) -> Result<()> {
        self.channel.clear().await
    }

    async fn next_error(&self) -> Result<ErrorRecord> {
        // U1X returns a fixed-position bitmask after a 3-char prefix.
        let status = self.query("U1X").await?;
        for (index, flag) in status.chars().skip(3).enumerate() {
            if flag == '1' {
                return Ok(ErrorRecord {
                    code: index as i32 + 100,
                    message: ERROR_MESSAGES
                        .get(index)
                        .copied()
                        .unwrap_or("Unknown Error")
                        .to_string(),
                });
            }
        }
        Ok(ErrorRecord {
            code: 0,
            message: "No Error".to_string(),
        })
    }

    async fn configure(&self, _options: &Options) -> Result<()> {
        self.write("T0X").await?;
        self.write("V0X").await
    }

    async fn reconnect(&self) -> Result<()> {
        self.channel.reconnect().await
    }
}

#[async_trait]
impl SourceMeter for K595 {
    async fn output_enabled(&self) -> Result<bool> {
        Ok(self.voltage_level().await? != 0.0)
    }

    async fn set_output_enabled(&self, _enabled: bool) -> Result<()> {
        Ok(()) // not available on this model
    }

    async fn voltage_level(&self) -> Result<f64> {
        let reading = self.trigger_reading("F1X").await?;
        let field = reading.split(',').nth(1).unwrap_or_default();
        field
            .trim()
            .parse()
            .map_err(|_| crate::error::DaqError::Protocol(format!("bad K595 reading: {:?}", reading)))
    }

    async fn set_voltage_level(&self, level: f64) -> Result<()> {
        self.write(&format!("V{:.2}X", level)).await
    }

    async fn set_voltage_range(&self, _level: f64) -> Result<()> {
        Ok(()) // fixed range
    }

    async fn set_current_compliance(&self, _level: f64) -> Result<()> {
        Ok(()) // not available on this model
    }

    async fn compliance_tripped(&self) -> Result<bool> {
        let reading = self.trigger_reading("F1X").await?;
        Ok(reading.starts_with('O'))
    }

    async fn measure_i(&self) -> Result<f64> {
        let reading = self.trigger_reading("F1X").await?;
        scpi::parse_scalar(&reading)
    }
}

#[async_trait]
impl LcrMeter for K595 {
    async fn measure_impedance(&self) -> Result<(f64, f64)> {
        let reading = self.trigger_reading("F0X").await?;
        Ok((scpi::parse_scalar(&reading)?, f64::NAN))
    }
}
