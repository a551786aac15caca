//! Keithley 6517B electrometer with built-in voltage source.
//!
//! Same fetch-loop acquisition as the 6514, plus a usable source stage.
//! The current limit is fixed at 1 mA in hardware, so setting a compliance
//! level is a documented no-op while the trip indicator is real.

use crate::driver::scpi::{self, format_exponent, on_off, parse_flag};
use crate::driver::{Electrometer, ErrorRecord, Instrument, Options, OptionsExt, SourceMeter};
use crate::error::Result;
use crate::transport::CommandChannel;
use async_trait::async_trait;
use std::time::Duration;

pub struct K6517B {
    channel: Box<dyn CommandChannel>,
    fetch_timeout: Duration,
    fetch_interval: Duration,
}

impl K6517B {
    pub const MODEL: &'static str = "K6517B";

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
impl Instrument for K6517B {
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
            format_exponent(options.number("sense.range", 20e-3), 6)
        ))
        .await?;
        self.write(&format!(
            ":SENS:CURR:RANG:AUTO:LLIM {}",
            format_exponent(options.number("sense.auto_range.lower_limit", 2e-12), 6)
        ))
        .await?;
        self.write(&format!(
            ":SENS:CURR:RANG:AUTO:ULIM {}",
            format_exponent(options.number("sense.auto_range.upper_limit", 20e-3), 6)
        ))
        .await?;
        self.write(&format!(
            ":SENS:CURR:RANG:AUTO {}",
            on_off(options.flag("sense.auto_range", true))
        ))
        .await?;
        self.write(&format!(
            ":SOUR:VOLT:MCON {}",
            on_off(options.flag("source.meter_connect", false))
        ))
        .await?;
        self.write(&format!(
            ":SENS:CURR:AVER:TCON {}",
            options.text("filter.mode", "MOV")
        ))
        .await?;
        self.write(&format!(
            ":SENS:CURR:AVER:COUN {}",
            options.integer("filter.count", 10)
        ))
        .await?;
        self.write(&format!(
            ":SENS:CURR:AVER:STAT {}",
            on_off(options.flag("filter.enable", false))
        ))
        .await?;
        self.write(&format!(
            ":SENS:CURR:NPLC {}",
            format_exponent(options.number("nplc", 1.0), 6)
        ))
        .await
    }

    async fn reconnect(&self) -> Result<()> {
        self.channel.reconnect().await
    }
}

#[async_trait]
impl SourceMeter for K6517B {
    async fn output_enabled(&self) -> Result<bool> {
        Ok(parse_flag(&self.query(":OUTP:STAT?").await?))
    }

    async fn set_output_enabled(&self, enabled: bool) -> Result<()> {
        self.write(&format!(":OUTP:STAT {}", on_off(enabled))).await
    }

    async fn voltage_level(&self) -> Result<f64> {
        scpi::parse_scalar(&self.query(":SOUR:VOLT:LEV?").await?)
    }

    async fn set_voltage_level(&self, level: f64) -> Result<()> {
        self.write(&format!(":SOUR:VOLT:LEV {}", format_exponent(level, 6)))
            .await
    }

    async fn set_voltage_range(&self, level: f64) -> Result<()> {
        self.write(&format!(":SOUR:VOLT:RANG {}", format_exponent(level, 6)))
            .await
    }

    async fn set_current_compliance(&self, _level: f64) -> Result<()> {
        Ok(()) // fixed to 1 mA in hardware
    }

    async fn compliance_tripped(&self) -> Result<bool> {
        Ok(parse_flag(&self.query(":SOUR:CURR:LIM?").await?))
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

impl Electrometer for K6517B {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_support::wire_writes;
    use crate::transport::MockChannel;

    #[tokio::test]
    async fn configure_emits_documented_sequence() {
        let mock = MockChannel::new();
        for _ in 0..11 {
            mock.push_response("1");
        }

        let driver = K6517B::new(Box::new(mock.clone()));
        driver.configure(&Options::new()).await.unwrap();

        assert_eq!(
            wire_writes(&mock),
            vec![
                ":FORM:ELEM READ",
                ":SENS:FUNC 'CURR'",
                ":SENS:CURR:RANG 2.000000E-02",
                ":SENS:CURR:RANG:AUTO:LLIM 2.000000E-12",
                ":SENS:CURR:RANG:AUTO:ULIM 2.000000E-02",
                ":SENS:CURR:RANG:AUTO 1",
                ":SOUR:VOLT:MCON 0",
                ":SENS:CURR:AVER:TCON MOV",
                ":SENS:CURR:AVER:COUN 10",
                ":SENS:CURR:AVER:STAT 0",
                ":SENS:CURR:NPLC 1.000000E+00",
            ]
        );
    }

    #[tokio::test]
    async fn source_levels_use_six_digit_exponent_form() {
        let mock = MockChannel::new();
        mock.push_responses(&["1", "1", "0"]);

        let driver = K6517B::new(Box::new(mock.clone()));
        driver.set_voltage_level(-300.0).await.unwrap();
        driver.set_voltage_range(300.0).await.unwrap();
        assert!(!driver.compliance_tripped().await.unwrap());

        assert_eq!(
            wire_writes(&mock),
            vec![
                ":SOUR:VOLT:LEV -3.000000E+02",
                ":SOUR:VOLT:RANG 3.000000E+02",
                ":SOUR:CURR:LIM?",
            ]
        );
    }
}
