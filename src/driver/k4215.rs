//! Keithley 4215 CVU card behind a KXCI controller.
//!
//! KXCI speaks a `:CVU:` command tree with a few departures from plain
//! SCPI: device clear is the bare `BC` word, and the error queue answers
//! `:ERROR:LAST:GET` in one of two textual forms. Error decoding runs an
//! ordered matcher chain and falls back to `(-1, raw)` after clearing the
//! queue.
//!
//! With the external P3 bias tee enabled the card's own DC output is pinned
//! to -10 V; bias-voltage writes are rejected in that state.

use crate::driver::scpi::{self, format_exponent, on_off, parse_flag, parse_pair};
use crate::driver::{ErrorRecord, Instrument, LcrMeter, Options, OptionsExt, SourceMeter};
use crate::error::{DaqError, Result};
use crate::transport::CommandChannel;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub struct K4215 {
    channel: Box<dyn CommandChannel>,
    external_bias_tee: AtomicBool,
    fetch_timeout: Duration,
    fetch_interval: Duration,
}

impl K4215 {
    pub const MODEL: &'static str = "K4215";

    pub fn new(channel: Box<dyn CommandChannel>) -> Self {
        Self::with_fetch_timing(channel, Duration::from_secs(15), Duration::from_millis(250))
    }

    pub fn with_fetch_timing(
        channel: Box<dyn CommandChannel>,
        fetch_timeout: Duration,
        fetch_interval: Duration,
    ) -> Self {
        Self {
            channel,
            external_bias_tee: AtomicBool::new(false),
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

    /// Maps a symbolic equivalent-circuit name onto the CVU model number.
    /// Unknown names select Cp/Gp.
    fn impedance_model(name: &str) -> i32 {
        match name.to_ascii_uppercase().as_str() {
            "ZTHETA" => 0,
            "RPLUSJX" => 1,
            "CPRP" | "CPGP" => 2,
            "CSRS" => 3,
            "CPD" => 4,
            "CSD" => 5,
            "YTHETA" => 7,
            _ => 2,
        }
    }

    pub async fn set_function_impedance_type(&self, name: &str) -> Result<()> {
        self.write(&format!(":CVU:MODEL {}", Self::impedance_model(name)))
            .await
    }

    /// Measurement speed: aperture in power-line cycles plus filter and
    /// delay factors, documented aperture range 0.006 to 10.002 PLC.
    pub async fn set_aperture(
        &self,
        aperture: f64,
        filter_factor: f64,
        delay_factor: f64,
    ) -> Result<()> {
        if !(0.006..=10.002).contains(&aperture) {
            return Err(DaqError::Validation(format!(
                "aperture {} PLC out of range 0.006..=10.002",
                aperture
            )));
        }
        self.write(&format!(
            ":CVU:SPEED 3,{},{},{}",
            format_exponent(delay_factor, 3),
            format_exponent(filter_factor, 3),
            format_exponent(aperture, 3)
        ))
        .await
    }

    /// AC test signal amplitude, documented range 10 mV to 1 V inclusive.
    pub async fn set_amplitude_voltage(&self, voltage: f64) -> Result<()> {
        if !(0.01..=1.0).contains(&voltage) {
            return Err(DaqError::Validation(format!(
                "amplitude voltage {} V out of range 0.01..=1.0 V",
                voltage
            )));
        }
        self.write(&format!(":CVU:ACV {}", format_exponent(voltage, 6)))
            .await
    }

    /// AC test signal frequency, documented range 1 kHz to 10 MHz inclusive.
    pub async fn set_amplitude_frequency(&self, frequency: f64) -> Result<()> {
        if !(1e3..=1e7).contains(&frequency) {
            return Err(DaqError::Validation(format!(
                "frequency {} Hz out of range 1e3..=1e7 Hz",
                frequency
            )));
        }
        self.write(&format!(":CVU:FREQ {}", frequency as i64)).await
    }

    /// Cable length correction, 0, 1.5 or 3.0 meters.
    pub async fn set_correction_length(&self, length: f64) -> Result<()> {
        if ![0.0, 1.5, 3.0].contains(&length) {
            return Err(DaqError::Validation(format!(
                "cable length {} m not one of 0, 1.5, 3.0",
                length
            )));
        }
        self.write(&format!(":CVU:LENGTH {:.1}", length)).await
    }

    /// AC impedance range in amperes, 0 selects auto range.
    pub async fn set_aci_range(&self, level: f64) -> Result<()> {
        self.write(&format!(":CVU:ACZ:RANGE {}", format_exponent(level, 6)))
            .await
    }

    async fn enable_bias_tee_dc_voltage(&self) -> Result<()> {
        self.write(":CVU:CONFIG:ACVHI 1").await?;
        self.write(":CVU:CONFIG:DCVHI 1").await?;
        self.write(":CVU:DCV:OFFSET -10").await?;
        self.write(":CVU:DCV -10").await
    }
}

#[async_trait]
impl Instrument for K4215 {
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
        self.write("BC").await
    }

    async fn next_error(&self) -> Result<ErrorRecord> {
        let response = self.query(":ERROR:LAST:GET").await?;
        if let Some(record) = scpi::match_scpi_error(&response) {
            return Ok(record);
        }
        if let Some(record) = scpi::match_trailing_code(&response) {
            return Ok(record);
        }
        // Unparsable entry: drop it from the queue, then report it raw.
        self.write(":ERROR:LAST:CLEAR").await?;
        Ok(scpi::fallback_error(&response))
    }

    async fn configure(&self, options: &Options) -> Result<()> {
        // User mode before everything else.
        self.write(":CVU:MODE 0").await?;

        let bias_tee = options.flag("external_bias_tee.enabled", false);
        self.external_bias_tee.store(bias_tee, Ordering::Release);
        if bias_tee {
            self.enable_bias_tee_dc_voltage().await?;
        }

        self.set_function_impedance_type(&options.text("function.type", "CPRP"))
            .await?;
        self.set_aperture(
            options.number("aperture.aperture", 1.0),
            options.number("aperture.filter_factor", 5.0),
            options.number("aperture.delay_factor", 10.0),
        )
        .await?;
        self.set_correction_length(options.number("correction.length", 0.0))
            .await?;

        let open = options.flag("correction.open.enabled", false);
        let short = options.flag("correction.short.enabled", false);
        let load = options.flag("correction.load.enabled", false);
        self.write(&format!(
            ":CVU:CORRECT {},{},{}",
            on_off(open),
            on_off(short),
            on_off(load)
        ))
        .await?;

        self.set_amplitude_voltage(options.number("voltage", 0.2))
            .await?;
        self.set_amplitude_frequency(options.number("frequency", 100_000.0))
            .await?;

        if !bias_tee {
            if let Some(bias_voltage) = options.maybe_number("bias_voltage") {
                self.set_voltage_level(bias_voltage).await?;
            }
        }

        self.set_aci_range(options.number("ac_range", 0.0)).await
    }

    async fn reconnect(&self) -> Result<()> {
        self.channel.reconnect().await
    }
}

#[async_trait]
impl SourceMeter for K4215 {
    async fn output_enabled(&self) -> Result<bool> {
        Ok(parse_flag(&self.query(":CVU:OUTPUT?").await?))
    }

    async fn set_output_enabled(&self, enabled: bool) -> Result<()> {
        self.write(&format!(":CVU:OUTPUT {}", on_off(enabled))).await
    }

    async fn voltage_level(&self) -> Result<f64> {
        scpi::parse_scalar(&self.query(":CVU:DCV?").await?)
    }

    async fn set_voltage_level(&self, level: f64) -> Result<()> {
        if self.external_bias_tee.load(Ordering::Acquire) {
            return Err(DaqError::Validation(
                "bias voltage is fixed while the external bias tee is enabled".into(),
            ));
        }
        if !(-30.0..=30.0).contains(&level) {
            return Err(DaqError::Validation(format!(
                "bias voltage {} V out of range -30..=30 V",
                level
            )));
        }
        self.write(&format!(":CVU:DCV {}", format_exponent(level, 3)))
            .await
    }

    async fn set_voltage_range(&self, level: f64) -> Result<()> {
        self.write(&format!(":CVU:DCV:RANGE {}", format_exponent(level, 3)))
            .await
    }

    async fn set_current_compliance(&self, _level: f64) -> Result<()> {
        Ok(()) // no current compliance on the CVU
    }

    async fn compliance_tripped(&self) -> Result<bool> {
        Ok(false)
    }

    async fn measure_i(&self) -> Result<f64> {
        Ok(0.0) // no current readout on the CVU
    }
}

#[async_trait]
impl LcrMeter for K4215 {
    async fn measure_impedance(&self) -> Result<(f64, f64)> {
        let response = scpi::poll_fetch(
            self.channel.as_ref(),
            &["*CLS", "*OPC", ":CVU:TRIG"],
            ":CVU:MEASZ?",
            self.fetch_timeout,
            self.fetch_interval,
        )
        .await
        .map_err(|e| e.for_model(Self::MODEL))?;
        parse_pair(&response)
    }
}

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

        let driver = K4215::new(Box::new(mock.clone()));
        driver.configure(&Options::new()).await.unwrap();

        assert_eq!(
            wire_writes(&mock),
            vec![
                ":CVU:MODE 0",
                ":CVU:MODEL 2",
                ":CVU:SPEED 3,1.000E+01,5.000E+00,1.000E+00",
                ":CVU:LENGTH 0.0",
                ":CVU:CORRECT 0,0,0",
                ":CVU:ACV 2.000000E-01",
                ":CVU:FREQ 100000",
                ":CVU:ACZ:RANGE 0.000000E+00",
            ]
        );
    }

    #[tokio::test]
    async fn bias_tee_sequence_precedes_other_settings() {
        let mock = MockChannel::new();
        for _ in 0..12 {
            mock.push_response("1");
        }

        let driver = K4215::new(Box::new(mock.clone()));
        let mut options = Options::new();
        options.insert(
            "external_bias_tee.enabled".into(),
            toml::Value::Boolean(true),
        );
        options.insert("bias_voltage".into(), toml::Value::Float(5.0));
        driver.configure(&options).await.unwrap();

        let writes = wire_writes(&mock);
        assert_eq!(
            &writes[..5],
            &[
                ":CVU:MODE 0",
                ":CVU:CONFIG:ACVHI 1",
                ":CVU:CONFIG:DCVHI 1",
                ":CVU:DCV:OFFSET -10",
                ":CVU:DCV -10",
            ]
        );
        // The configured bias voltage is skipped while the tee is active.
        assert!(!writes.iter().any(|w| w == ":CVU:DCV 5.000E+00"));

        let result = driver.set_voltage_level(1.0).await;
        assert!(matches!(result, Err(DaqError::Validation(_))));
    }

    #[tokio::test]
    async fn validation_ranges_are_boundary_inclusive() {
        let mock = MockChannel::new();
        for _ in 0..8 {
            mock.push_response("1");
        }

        let driver = K4215::new(Box::new(mock.clone()));
        driver.set_amplitude_voltage(0.01).await.unwrap();
        driver.set_amplitude_voltage(1.0).await.unwrap();
        assert!(driver.set_amplitude_voltage(0.0099).await.is_err());
        assert!(driver.set_amplitude_voltage(1.0001).await.is_err());

        driver.set_amplitude_frequency(1e3).await.unwrap();
        driver.set_amplitude_frequency(1e7).await.unwrap();
        assert!(driver.set_amplitude_frequency(999.0).await.is_err());

        driver.set_aperture(0.006, 1.0, 1.0).await.unwrap();
        driver.set_aperture(10.002, 1.0, 1.0).await.unwrap();
        assert!(driver.set_aperture(10.003, 1.0, 1.0).await.is_err());

        assert!(driver.set_correction_length(2.0).await.is_err());
        driver.set_correction_length(1.5).await.unwrap();
        driver.set_voltage_level(-30.0).await.unwrap();
        assert!(driver.set_voltage_level(-30.5).await.is_err());
    }

    #[tokio::test]
    async fn error_chain_handles_both_forms_and_garbled_input() {
        let mock = MockChannel::new();
        mock.push_responses(&[
            r#"0,"No error""#,
            "Command not recognized. (17)",
            "complete garbage",
            "1", // *OPC? for :ERROR:LAST:CLEAR
        ]);

        let driver = K4215::new(Box::new(mock.clone()));
        assert_eq!(driver.next_error().await.unwrap().code, 0);

        let record = driver.next_error().await.unwrap();
        assert_eq!(record.code, 17);
        assert_eq!(record.message, "Command not recognized");

        let record = driver.next_error().await.unwrap();
        assert_eq!(record.code, -1);
        assert_eq!(record.message, "complete garbage");
        assert!(wire_writes(&mock).contains(&":ERROR:LAST:CLEAR".to_string()));
    }

    #[tokio::test]
    async fn impedance_fetch_uses_cvu_trigger() {
        let mock = MockChannel::new();
        mock.push_responses(&["1", "+4.700000E-10,+2.100000E-08"]);

        let driver = K4215::with_fetch_timing(
            Box::new(mock.clone()),
            Duration::from_secs(1),
            Duration::from_millis(1),
        );
        let (primary, secondary) = driver.measure_impedance().await.unwrap();

        assert_eq!((primary, secondary), (4.7e-10, 2.1e-8));
        assert_eq!(
            mock.take_writes(),
            vec!["*CLS", "*OPC", ":CVU:TRIG", "*ESR?", ":CVU:MEASZ?"]
        );
    }
}
