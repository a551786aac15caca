//! Keithley 2470 source-measure unit.
//!
//! Newer SCPI generation of the 2400 family. Compliance lives under the
//! source subsystem (`:SOUR:VOLT:ILIM`) and current is read with a direct
//! `:MEAS:CURR?` query.

use crate::driver::scpi::{self, format_exponent, on_off, parse_flag};
use crate::driver::{ErrorRecord, Instrument, Options, OptionsExt, SourceMeter};
use crate::error::Result;
use crate::transport::CommandChannel;
use async_trait::async_trait;

pub struct K2470 {
    channel: Box<dyn CommandChannel>,
}

impl K2470 {
    pub const MODEL: &'static str = "K2470";

    pub fn new(channel: Box<dyn CommandChannel>) -> Self {
        Self { channel }
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
impl Instrument for K2470 {
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
        self.write(&format!(
            ":ROUT:TERM {}",
            options.text("route.terminals", "FRON")
        ))
        .await?;
        self.write(":SOUR:FUNC VOLT").await?;
        self.write(&format!(
            ":SENS:CURR:AVER:TCON {}",
            options.text("filter.mode", "MOV")
        ))
        .await?;
        self.write(&format!(
            ":SENS:CURR:AVER:COUN {}",
            options.integer("filter.count", 1)
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
impl SourceMeter for K2470 {
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
        self.write(&format!(":SOUR:VOLT:LEV {}", format_exponent(level, 3)))
            .await
    }

    async fn set_voltage_range(&self, level: f64) -> Result<()> {
        self.write(&format!(":SOUR:VOLT:RANG {}", format_exponent(level, 3)))
            .await
    }

    async fn set_current_compliance(&self, level: f64) -> Result<()> {
        self.write(&format!(
            ":SOUR:VOLT:ILIM:LEV {}",
            format_exponent(level, 3)
        ))
        .await
    }

    async fn compliance_tripped(&self) -> Result<bool> {
        Ok(parse_flag(&self.query(":SOUR:VOLT:ILIM:LEV:TRIP?").await?))
    }

    async fn measure_i(&self) -> Result<f64> {
        scpi::parse_scalar(&self.query(":MEAS:CURR?").await?)
    }
}
