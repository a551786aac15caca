//! Keithley 6514 electrometer.
//!
//! Pure measuring instrument in this setup: it sources nothing, so the
//! source-meter operations return neutral values. Current readings are
//! armed with `:INIT` and collected through the event-status poll loop.

use crate::driver::scpi::{self, format_exponent, on_off};
use crate::driver::{Electrometer, ErrorRecord, Instrument, Options, OptionsExt, SourceMeter};
use crate::error::Result;
use crate::transport::CommandChannel;
use async_trait::async_trait;
use std::time::Duration;

pub struct K6514 {
    channel: Box<dyn CommandChannel>,
    fetch_timeout: Duration,
    fetch_interval: Duration,
}

impl K6514 {
    pub const MODEL: &'static str = "K6514";

    pub fn new(channel: Box<dyn CommandChannel>) -> Self {
        Self::with_fetch_timing(channel, Duration::from_secs(10), Duration::from_millis(250))
    }

    pub fn with_fetch_timing(
        channel: Box<dyn CommandChannel>,
        fetch_timeout: Duration,
        fetch_interval: Duration,
    ) -> Self {
        Self {
            channel,
            fetch_timeout,
            fetch_interval,
        }
    }

    async fn write(&self, command: &str) -> Result<()> {
        scpi::write_opc(self.channel.as_ref(), command)
            .await
            .map_err(|e| e.for_model(Self::MODEL))
    }

    async fn query(&self, command: &str) -> Result<String> {
        self.channel
            .query(command)
            .await
            .map_err(|e| e.for_model(Self::MODEL))
    }
}

#[async_trait]
impl Instrument for K6514 {
    fn model(&self) -> &'static str {
        Self::MODEL
    }

    async fn identity(&self) -> Result<String> {
        self.query("*IDN?").await
    }

    async fn reset(&self) -> Result<()> {
        self.write("*RST").await
    }

    async fn clear(&self) -> Result<()> {
        self.write("*CLS").await
    }

    async fn next_error(&self) -> Result<ErrorRecord> {
        let response = self.query(":SYST:ERR?").await?;
        Ok(scpi::match_scpi_error(&response).unwrap_or_else(|| scpi::fallback_error(&response)))
    }

    async fn configure(&self, options: &Options) -> Result<()> {
        self.write(":FORM:ELEM READ").await?;
        self.write(":SENS:FUNC 'CURR'").await?;
        self.write(&format!(
            ":SENS:CURR:RANG {}",
            format_exponent(options.number("sense.range", 200e-6), 6)
        ))
        .await?;
        self.write(&format!(
            ":SENS:CURR:RANG:AUTO {}",
            on_off(options.flag("sense.auto_range", true))
        ))
        .await?;
        self.write(&format!(
            ":SENS:AVER:TCON {}",
            options.text("filter.mode", "MOV")
        ))
        .await?;
        self.write(&format!(
            ":SENS:AVER:COUN {}",
            options.integer("filter.count", 1)
        ))
        .await?;
        self.write(&format!(
            ":SENS:AVER:STAT {}",
            on_off(options.flag("filter.enable", false))
        ))
        .await?;
        self.write(&format!(
            ":SENS:CURR:NPLC {}",
            format_exponent(options.number("nplc", 5.0), 6)
        ))
        .await
    }

    async fn reconnect(&self) -> Result<()> {
        self.channel.reconnect().await
    }
}

#[async_trait]
impl SourceMeter for K6514 {
    async fn output_enabled(&self) -> Result<bool> {
        Ok(false) // no source stage
    }

    async fn set_output_enabled(&self, _enabled: bool) -> Result<()> {
        Ok(())
    }

    async fn voltage_level(&self) -> Result<f64> {
        Ok(0.0)
    }

    async fn set_voltage_level(&self, _level: f64) -> Result<()> {
        Ok(())
    }

    async fn set_voltage_range(&self, _level: f64) -> Result<()> {
        Ok(())
    }

    async fn set_current_compliance(&self, _level: f64) -> Result<()> {
        Ok(())
    }

    async fn compliance_tripped(&self) -> Result<bool> {
        Ok(false)
    }

    async fn measure_i(&self) -> Result<f64> {
        let response = scpi::poll_fetch(
            self.channel.as_ref(),
            &["*CLS", "*OPC", ":INIT"],
            ":FETC?",
            self.fetch_timeout,
            self.fetch_interval,
        )
        .await
        .map_err(|e| e.for_model(Self::MODEL))?;
        scpi::parse_scalar(&response)
    }
}

impl Electrometer for K6514 {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_support::wire_writes;
    use crate::transport::MockChannel;

    #[tokio::test]
    async fn configure_emits_documented_sequence() {
        let mock = MockChannel::new();
        for _ in 0..8 {
            mock.push_response("1");
        }

        let driver = K6514::new(Box::new(mock.clone()));
        driver.configure(&Options::new()).await.unwrap();

        assert_eq!(
            wire_writes(&mock),
            vec![
                ":FORM:ELEM READ",
                ":SENS:FUNC 'CURR'",
                ":SENS:CURR:RANG 2.000000E-04",
                ":SENS:CURR:RANG:AUTO 1",
                ":SENS:AVER:TCON MOV",
                ":SENS:AVER:COUN 1",
                ":SENS:AVER:STAT 0",
                ":SENS:CURR:NPLC 5.000000E+00",
            ]
        );
    }

    #[tokio::test]
    async fn current_reading_polls_event_status() {
        let mock = MockChannel::new();
        mock.push_responses(&["0", "1", "-1.500000E-11,+0.000000E+00"]);

        let driver = K6514::with_fetch_timing(
            Box::new(mock.clone()),
            Duration::from_secs(1),
            Duration::from_millis(1),
        );
        assert_eq!(driver.measure_i().await.unwrap(), -1.5e-11);

        assert_eq!(
            mock.take_writes(),
            vec!["*CLS", "*OPC", ":INIT", "*ESR?", "*ESR?", ":FETC?"]
        );
    }

    #[tokio::test]
    async fn source_operations_are_neutral() {
        let mock = MockChannel::new();
        let driver = K6514::new(Box::new(mock.clone()));

        assert!(!driver.output_enabled().await.unwrap());
        assert_eq!(driver.voltage_level().await.unwrap(), 0.0);
        assert!(!driver.compliance_tripped().await.unwrap());
        driver.set_voltage_level(5.0).await.unwrap();
        driver.set_current_compliance(1e-6).await.unwrap();
        assert!(mock.take_writes().is_empty());
    }
}
