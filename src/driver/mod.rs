//! Instrument drivers behind capability traits.
//!
//! Each supported model gets one driver translating the uniform capability
//! operations into its own command grammar. Drivers own a boxed
//! [`CommandChannel`](crate::transport::CommandChannel) (usually wrapped in a
//! [`RetryChannel`](crate::transport::RetryChannel) by the registry) and
//! serialize their exchanges through it.
//!
//! Capability hierarchy mirrors the instrument classes: every driver is an
//! [`Instrument`]; source-measure units add [`SourceMeter`]; electrometers
//! are source meters with a fetch-loop current reading ([`Electrometer`]);
//! LCR meters add impedance ([`LcrMeter`]); multimeters add temperature
//! ([`Dmm`]).

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;

pub mod e4980a;
pub mod k2400;
pub mod k2470;
pub mod k2657a;
pub mod k2700;
pub mod k4215;
pub mod k595;
pub mod k6514;
pub mod k6517b;
pub mod registry;
pub mod scpi;

pub use e4980a::E4980A;
pub use k2400::K2400;
pub use k2470::K2470;
pub use k2657a::K2657A;
pub use k2700::K2700;
pub use k4215::K4215;
pub use k595::K595;
pub use k6514::K6514;
pub use k6517b::K6517B;
pub use registry::{BoundRole, Role, RoleBindings};

/// One entry from an instrument's error queue.
///
/// Always well formed: code 0 means no error, code -1 carries an unparsable
/// raw response in the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    pub code: i32,
    pub message: String,
}

impl ErrorRecord {
    pub fn is_error(&self) -> bool {
        self.code != 0
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

/// Driver configuration options, dotted keys to TOML values.
pub type Options = HashMap<String, toml::Value>;

/// Typed accessors with per-model defaults over [`Options`].
pub trait OptionsExt {
    fn flag(&self, key: &str, default: bool) -> bool;
    fn number(&self, key: &str, default: f64) -> f64;
    fn integer(&self, key: &str, default: i64) -> i64;
    fn text(&self, key: &str, default: &str) -> String;
    fn maybe_number(&self, key: &str) -> Option<f64>;
}

impl OptionsExt for Options {
    fn flag(&self, key: &str, default: bool) -> bool {
        self.get(key).and_then(toml::Value::as_bool).unwrap_or(default)
    }

    fn number(&self, key: &str, default: f64) -> f64 {
        self.maybe_number(key).unwrap_or(default)
    }

    fn integer(&self, key: &str, default: i64) -> i64 {
        self.get(key)
            .and_then(toml::Value::as_integer)
            .unwrap_or(default)
    }

    fn text(&self, key: &str, default: &str) -> String {
        self.get(key)
            .and_then(toml::Value::as_str)
            .unwrap_or(default)
            .to_string()
    }

    fn maybe_number(&self, key: &str) -> Option<f64> {
        let value = self.get(key)?;
        value
            .as_float()
            .or_else(|| value.as_integer().map(|i| i as f64))
    }
}

/// Operations common to every instrument model.
#[async_trait]
pub trait Instrument: Send + Sync {
    /// Model name as configured, e.g. "K2400".
    fn model(&self) -> &'static str;

    async fn identity(&self) -> Result<String>;

    /// Some models no-op reset/clear to avoid disturbing shared-bus state.
    async fn reset(&self) -> Result<()>;
    async fn clear(&self) -> Result<()>;

    /// Next entry from the error queue.
    ///
    /// Decoding never fails: an unparsable response comes back as
    /// `(-1, raw)`. Only transport faults propagate.
    async fn next_error(&self) -> Result<ErrorRecord>;

    /// Applies options with defaults, in the model's documented dependency
    /// order. Out-of-range values fail with a validation error before any
    /// command is sent for them.
    async fn configure(&self, options: &Options) -> Result<()>;

    /// Re-establishes the underlying transport link.
    async fn reconnect(&self) -> Result<()>;
}

/// Voltage-sourcing instruments with compliance monitoring.
///
/// Operations a model does not support return neutral values (false/0.0)
/// rather than failing; the per-driver docs call these out.
#[async_trait]
pub trait SourceMeter: Instrument {
    async fn output_enabled(&self) -> Result<bool>;
    async fn set_output_enabled(&self, enabled: bool) -> Result<()>;
    async fn voltage_level(&self) -> Result<f64>;
    async fn set_voltage_level(&self, level: f64) -> Result<()>;
    async fn set_voltage_range(&self, level: f64) -> Result<()>;
    async fn set_current_compliance(&self, level: f64) -> Result<()>;
    async fn compliance_tripped(&self) -> Result<bool>;

    async fn measure_i(&self) -> Result<f64>;

    /// Sensed voltage, NaN on models without voltage readback.
    async fn measure_v(&self) -> Result<f64> {
        Ok(self.measure_iv().await?.1)
    }

    /// Current and voltage from one acquisition where the model supports
    /// concurrent sensing; otherwise voltage is NaN.
    async fn measure_iv(&self) -> Result<(f64, f64)> {
        Ok((self.measure_i().await?, f64::NAN))
    }
}

/// Marker for electrometer-class instruments (fetch-loop current readings).
pub trait Electrometer: SourceMeter {}

/// Impedance-capable meters.
#[async_trait]
pub trait LcrMeter: SourceMeter {
    /// One impedance acquisition. The physical meaning of the two
    /// components (Cp/Gp, Cs/Rs, Z/theta, ...) follows the configured
    /// function-impedance type.
    async fn measure_impedance(&self) -> Result<(f64, f64)>;
}

/// Digital multimeters used for temperature monitoring.
#[async_trait]
pub trait Dmm: Instrument {
    async fn read_temperature(&self) -> Result<f64>;
}
