//! Run configuration loaded from TOML.
//!
//! One `[roles.<name>]` table per instrument slot plus a `[sweep]` table
//! for the measurement itself. Driver options live under
//! `[roles.<name>.options]` with their documented dotted keys quoted, e.g.
//! `"filter.mode" = "MOV"`.

use crate::driver::Options;
use crate::error::Result;
use crate::measurement::MeasurementConfig;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub roles: BTreeMap<String, RoleSettings>,
    #[serde(default)]
    pub sweep: MeasurementConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoleSettings {
    /// VISA-style resource name or a short descriptor (`"16"`,
    /// `"host:5025"`).
    pub resource_name: String,
    /// Driver model, e.g. `"K2400"`.
    pub model: String,
    #[serde(default = "default_termination")]
    pub termination: String,
    /// Query timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: f64,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub options: Options,
}

fn default_termination() -> String {
    "\r\n".into()
}

fn default_timeout() -> f64 {
    8.0
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_enabled() -> bool {
    true
}

impl Settings {
    /// Loads settings from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Parses settings from an in-memory TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{OptionsExt, Role};

    const SAMPLE: &str = r#"
        [roles.smu]
        resource_name = "10.0.0.5:5025"
        model = "K2400"

        [roles.smu.options]
        "filter.enable" = true
        "filter.count" = 10
        nplc = 1.0

        [roles.lcr]
        resource_name = "lcr-bench:5025"
        model = "E4980A"
        termination = "\n"
        timeout = 4.0
        enabled = false

        [sweep]
        kind = "iv"
        voltage_begin = 0.0
        voltage_end = -300.0
        voltage_step = 5.0
        waiting_time = 1.0
        current_compliance = 1e-6
        continuous = true
    "#;

    #[test]
    fn parses_roles_and_sweep() {
        let settings = Settings::from_toml_str(SAMPLE).unwrap();

        let smu = &settings.roles["smu"];
        assert_eq!(smu.model, "K2400");
        assert_eq!(smu.termination, "\r\n");
        assert_eq!(smu.timeout, 8.0);
        assert!(smu.enabled);
        assert!(smu.options.flag("filter.enable", false));
        assert_eq!(smu.options.integer("filter.count", 1), 10);

        let lcr = &settings.roles["lcr"];
        assert!(!lcr.enabled);
        assert_eq!(lcr.termination, "\n");
        assert_eq!(lcr.timeout, 4.0);

        let sweep = &settings.sweep;
        assert_eq!(sweep.voltage_end, -300.0);
        assert_eq!(sweep.current_compliance, 1e-6);
        assert!(sweep.continuous);
        assert_eq!(sweep.source, Role::Smu);
    }

    #[test]
    fn empty_document_yields_defaults() {
        let settings = Settings::from_toml_str("").unwrap();
        assert!(settings.roles.is_empty());
        assert_eq!(settings.sweep.voltage_step, 0.0);
    }
}
