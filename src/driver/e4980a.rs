//! Keysight E4980A precision LCR meter.
//!
//! Impedance acquisitions are armed with `:INIT` and collected through the
//! event-status poll loop. Configure validates against the documented
//! physical ranges and rejects out-of-range values instead of clamping.

use crate::driver::scpi::{self, format_exponent, on_off, parse_flag, parse_pair};
use crate::driver::{ErrorRecord, Instrument, LcrMeter, Options, OptionsExt, SourceMeter};
use crate::error::{DaqError, Result};
use crate::transport::CommandChannel;
use async_trait::async_trait;
use std::time::Duration;

pub struct E4980A {
    channel: Box<dyn CommandChannel>,
    fetch_timeout: Duration,
    fetch_interval: Duration,
}

impl E4980A {
    pub const MODEL: &'static str = "E4980A";

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

    /// AC test signal amplitude, documented range 10 mV to 1 V inclusive.
    pub async fn set_amplitude_voltage(&self, voltage: f64) -> Result<()> {
        if !(0.01..=1.0).contains(&voltage) {
            return Err(DaqError::Validation(format!(
                "amplitude voltage {} V out of range 0.01..=1.0 V",
                voltage
            )));
        }
        self.write(&format!(":VOLT {}", format_exponent(voltage, 6)))
            .await
    }

    /// AC test signal frequency, documented range 20 Hz to 2 MHz inclusive.
    pub async fn set_amplitude_frequency(&self, frequency: f64) -> Result<()> {
        if !(20.0..=2e6).contains(&frequency) {
            return Err(DaqError::Validation(format!(
                "frequency {} Hz out of range 20..=2e6 Hz",
                frequency
            )));
        }
        self.write(&format!(":FREQ {}", format_exponent(frequency, 6)))
            .await
    }
}

#[async_trait]
impl Instrument for E4980A {
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
        self.write(":SYST:BEEP:STAT 0").await?;
        self.write(":BIAS:RANG:AUTO 1").await?;

        // Function type before the amplitude/bias parameters that depend
        // on it.
        self.write(&format!(
            ":FUNC:IMP:TYPE {}",
            options.text("function.type", "CPRP")
        ))
        .await?;

        let integration_time = options.text("aperture.integration_time", "MED");
        if !["SHOR", "MED", "LONG"].contains(&integration_time.as_str()) {
            return Err(DaqError::Validation(format!(
                "integration time {:?} not one of SHOR, MED, LONG",
                integration_time
            )));
        }
        let averaging_rate = options.integer("aperture.averaging_rate", 1);
        if !(1..=128).contains(&averaging_rate) {
            return Err(DaqError::Validation(format!(
                "averaging rate {} out of range 1..=128",
                averaging_rate
            )));
        }
        self.write(&format!(":APER {},{}", integration_time, averaging_rate))
            .await?;

        let correction_length = options.integer("correction.length", 0);
        if ![0, 1, 2].contains(&correction_length) {
            return Err(DaqError::Validation(format!(
                "cable length {} m not one of 0, 1, 2",
                correction_length
            )));
        }
        self.write(&format!(":CORR:LENG {}", correction_length))
            .await?;
        self.write(&format!(
            ":CORR:OPEN:STAT {}",
            on_off(options.flag("correction.open.enabled", false))
        ))
        .await?;
        self.write(&format!(
            ":CORR:SHOR:STAT {}",
            on_off(options.flag("correction.short.enabled", false))
        ))
        .await?;

        self.set_amplitude_voltage(options.number("voltage", 1.0))
            .await?;
        self.set_amplitude_frequency(options.number("frequency", 1000.0))
            .await
    }

    async fn reconnect(&self) -> Result<()> {
        self.channel.reconnect().await
    }
}

#[async_trait]
impl SourceMeter for E4980A {
    async fn output_enabled(&self) -> Result<bool> {
        Ok(parse_flag(&self.query(":BIAS:STAT?").await?))
    }

    async fn set_output_enabled(&self, enabled: bool) -> Result<()> {
        self.write(&format!(":BIAS:STAT {}", on_off(enabled))).await
    }

    async fn voltage_level(&self) -> Result<f64> {
        scpi::parse_scalar(&self.query(":BIAS:VOLT:LEV?").await?)
    }

    async fn set_voltage_level(&self, level: f64) -> Result<()> {
        self.write(&format!(":BIAS:VOLT:LEV {}", format_exponent(level, 3)))
            .await
    }

    async fn set_voltage_range(&self, _level: f64) -> Result<()> {
        Ok(()) // bias range is on auto
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
        Ok(0.0) // no current readout on this meter
    }
}

#[async_trait]
impl LcrMeter for E4980A {
    async fn measure_impedance(&self) -> Result<(f64, f64)> {
        let response = scpi::poll_fetch(
            self.channel.as_ref(),
            &["*CLS", "*OPC", ":INIT"],
            ":FETC?",
            self.fetch_timeout,
            self.fetch_interval,
        )
        .await
        .map_err(|e| e.for_model(Self::MODEL))?;
        parse_pair(&response)
    }
}
