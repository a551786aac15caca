//! Keithley 2657A source-measure unit (TSP dialect).
//!
//! No SCPI tree here: commands are Lua statements against the `smua` node,
//! and every readback goes through `print(...)`. The error queue yields
//! tab-separated records with a float code.

use crate::driver::scpi::{self, format_exponent};
use crate::driver::{ErrorRecord, Instrument, Options, OptionsExt, SourceMeter};
use crate::error::Result;
use crate::transport::CommandChannel;
use async_trait::async_trait;

pub struct K2657A {
    channel: Box<dyn CommandChannel>,
}

impl K2657A {
    pub const MODEL: &'static str = "K2657A";

    pub fn new(channel: Box<dyn CommandChannel>) -> Self {
        Self { channel }
    }

    async fn write(&self, command: &str) -> Result<()> {
        scpi::write_opc(self.channel.as_ref(), command)
            .await
            .map_err(|e| e.for_model(Self::MODEL))
    }

    async fn print(&self, expression: &str) -> Result<String> {
        self.channel
            .query(&format!("print({})", expression))
            .await
            .map_err(|e| e.for_model(Self::MODEL))
    }
}

#[async_trait]
impl Instrument for K2657A {
    fn model(&self) -> &'static str {
        Self::MODEL
    }

    async fn identity(&self) -> Result<String> {
        self.channel
            .query("*IDN?")
            .await
            .map_err(|e| e.for_model(Self::MODEL))
    }

    async fn reset(&self) -> Result<()> {
        self.write("reset()").await
    }

    async fn clear(&self) -> Result<()> {
        self.write("status.reset()").await
    }

    async fn next_error(&self) -> Result<ErrorRecord> {
        let response = self.print("errorqueue.next()").await?;
        Ok(scpi::match_tsp_error(&response).unwrap_or_else(|| scpi::fallback_error(&response)))
    }

    async fn configure(&self, options: &Options) -> Result<()> {
        self.write("beeper.enable = 0").await?;
        self.write("smua.source.func = smua.OUTPUT_DCVOLTS").await?;
        self.write(&format!(
            "smua.measure.filter.type = smua.FILTER_{}",
            options.text("filter.mode", "REPEAT_AVG")
        ))
        .await?;
        self.write(&format!(
            "smua.measure.filter.count = {}",
            options.integer("filter.count", 1)
        ))
        .await?;
        self.write(&format!(
            "smua.measure.filter.enable = {}",
            i64::from(options.flag("filter.enable", false))
        ))
        .await?;
        self.write(&format!(
            "smua.measure.nplc = {}",
            format_exponent(options.number("nplc", 1.0), 6)
        ))
        .await
    }

    async fn reconnect(&self) -> Result<()> {
        self.channel.reconnect().await
    }
}

#[async_trait]
impl SourceMeter for K2657A {
    async fn output_enabled(&self) -> Result<bool> {
        Ok(self.print("smua.source.output").await?.trim() == "1")
    }

    async fn set_output_enabled(&self, enabled: bool) -> Result<()> {
        let value = if enabled { "ON" } else { "OFF" };
        self.write(&format!("smua.source.output = smua.OUTPUT_{}", value))
            .await
    }

    async fn voltage_level(&self) -> Result<f64> {
        scpi::parse_scalar(&self.print("smua.source.levelv").await?)
    }

    async fn set_voltage_level(&self, level: f64) -> Result<()> {
        self.write(&format!(
            "smua.source.levelv = {}",
            format_exponent(level, 3)
        ))
        .await
    }

    async fn set_voltage_range(&self, level: f64) -> Result<()> {
        self.write(&format!(
            "smua.source.rangev = {}",
            format_exponent(level, 3)
        ))
        .await
    }

    async fn set_current_compliance(&self, level: f64) -> Result<()> {
        self.write(&format!(
            "smua.source.limiti = {}",
            format_exponent(level, 3)
        ))
        .await
    }

    async fn compliance_tripped(&self) -> Result<bool> {
        Ok(self
            .print("smua.source.compliance")
            .await?
            .trim()
            .eq_ignore_ascii_case("true"))
    }

    async fn measure_i(&self) -> Result<f64> {
        scpi::parse_scalar(&self.print("smua.measure.i()").await?)
    }
}
