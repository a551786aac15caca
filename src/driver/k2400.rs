//! Keithley 2400 source-measure unit.
//!
//! Classic SCPI dialect with a write-then-`*OPC?` handshake on every
//! side-effecting command. Voltage and current are sensed concurrently; the
//! data format element selection is cached so repeated acquisitions skip the
//! redundant `:FORM:ELEM` write.

use crate::driver::scpi::{self, format_exponent, on_off, parse_flag, parse_pair};
use crate::driver::{ErrorRecord, Instrument, Options, OptionsExt, SourceMeter};
use crate::error::Result;
use crate::transport::CommandChannel;
use async_trait::async_trait;
use tokio::sync::Mutex;

pub struct K2400 {
    channel: Box<dyn CommandChannel>,
    format_element: Mutex<Option<String>>,
}

impl K2400 {
    pub const MODEL: &'static str = "K2400";

    pub fn new(channel: Box<dyn CommandChannel>) -> Self {
        Self {
            channel,
            format_element: Mutex::new(None),
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

    async fn select_format_elements(&self, elements: &str) -> Result<()> {
        let mut cached = self.format_element.lock().await;
        if cached.as_deref() != Some(elements) {
            self.write(&format!(":FORM:ELEM {}", elements)).await?;
            *cached = Some(elements.to_string());
        }
        Ok(())
    }
}

#[async_trait]
impl Instrument for K2400 {
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
            ":SYST:BEEP:STAT {}",
            on_off(options.flag("beeper.state", false))
        ))
        .await?;
        self.write(&format!(
            ":ROUT:TERM {}",
            options.text("route.terminals", "FRON")
        ))
        .await?;
        self.write(":SOUR:FUNC VOLT").await?;

        // Concurrent voltage/current sensing, readings as VOLT,CURR pairs.
        self.write(":SENS:FUNC:CONC ON").await?;
        self.write(":SENS:FUNC:ON 'VOLT','CURR'").await?;
        self.select_format_elements("VOLT,CURR").await?;

        self.write(&format!(
            ":SENS:AVER:TCON {}",
            options.text("filter.mode", "MOV")
        ))
        .await?;
        self.write(&format!(
            ":SENS:AVER:COUN {}",
            options.integer("filter.count", 10)
        ))
        .await?;
        self.write(&format!(
            ":SENS:AVER:STAT {}",
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
impl SourceMeter for K2400 {
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
            ":SENS:CURR:PROT:LEV {}",
            format_exponent(level, 3)
        ))
        .await
    }

    async fn compliance_tripped(&self) -> Result<bool> {
        Ok(parse_flag(&self.query(":SENS:CURR:PROT:TRIP?").await?))
    }

    async fn measure_i(&self) -> Result<f64> {
        Ok(self.measure_iv().await?.0)
    }

    async fn measure_iv(&self) -> Result<(f64, f64)> {
        self.select_format_elements("VOLT,CURR").await?;
        let (voltage, current) = parse_pair(&self.query(":READ?").await?)?;
        Ok((current, voltage))
    }
}
