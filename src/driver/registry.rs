//! Role to driver binding, resolved at configuration time.
//!
//! A [`Role`] is a logical instrument slot. The registry maps each enabled
//! role from the settings onto a concrete driver over a retry-wrapped
//! channel and records the binding order, which is also the order
//! `configure` runs in.

use crate::config::{RoleSettings, Settings};
use crate::driver::{
    Dmm, Instrument, LcrMeter, Options, SourceMeter, E4980A, K2400, K2470, K2657A, K2700, K4215,
    K595, K6514, K6517B,
};
use crate::error::{DaqError, Result};
use crate::transport::{self, ChannelOptions, CommandChannel, RetryChannel, TcpChannel};
use log::info;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Logical instrument slots, in canonical binding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Smu,
    Elm,
    Elm2,
    Lcr,
    Dmm,
}

impl Role {
    pub const ALL: [Role; 5] = [Role::Smu, Role::Elm, Role::Elm2, Role::Lcr, Role::Dmm];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Smu => "smu",
            Role::Elm => "elm",
            Role::Elm2 => "elm2",
            Role::Lcr => "lcr",
            Role::Dmm => "dmm",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "smu" => Ok(Role::Smu),
            "elm" => Ok(Role::Elm),
            "elm2" => Ok(Role::Elm2),
            "lcr" => Ok(Role::Lcr),
            "dmm" => Ok(Role::Dmm),
            other => Err(DaqError::Validation(format!("unknown role {:?}", other))),
        }
    }
}

/// One bound role: the driver behind its uniform face plus the options the
/// engine applies during configuration.
pub struct BoundRole {
    pub role: Role,
    pub instrument: Arc<dyn Instrument>,
    pub options: Options,
}

/// The resolved binding table for one run.
///
/// Unbound roles are not errors; readings simply carry NaN for them.
#[derive(Default)]
pub struct RoleBindings {
    ordered: Vec<BoundRole>,
    smu: Option<Arc<dyn SourceMeter>>,
    elm: Option<Arc<dyn SourceMeter>>,
    elm2: Option<Arc<dyn SourceMeter>>,
    lcr: Option<Arc<dyn LcrMeter>>,
    dmm: Option<Arc<dyn Dmm>>,
}

impl RoleBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects every enabled role from the settings. Channels are wrapped
    /// in a [`RetryChannel`] with the default budget.
    pub async fn connect(settings: &Settings) -> Result<Self> {
        let mut bindings = Self::new();
        for role in Role::ALL {
            let Some(role_settings) = settings.roles.get(role.as_str()) else {
                continue;
            };
            if !role_settings.enabled {
                continue;
            }
            let channel = open_channel(role_settings).await?;
            let channel = Box::new(RetryChannel::with_default_budget(channel));
            bindings.bind(role, &role_settings.model, channel, role_settings.options.clone())?;
            info!("bound role {} to {}", role, role_settings.model);
        }
        Ok(bindings)
    }

    /// Binds one role to a driver built over the given channel.
    pub fn bind(
        &mut self,
        role: Role,
        model: &str,
        channel: Box<dyn CommandChannel>,
        options: Options,
    ) -> Result<()> {
        let instrument: Arc<dyn Instrument> = match role {
            Role::Smu => {
                let driver = build_source_meter(model, channel)?;
                self.smu = Some(driver.clone());
                driver
            }
            Role::Elm | Role::Elm2 => {
                let driver = build_electrometer(model, channel)?;
                if role == Role::Elm {
                    self.elm = Some(driver.clone());
                } else {
                    self.elm2 = Some(driver.clone());
                }
                driver
            }
            Role::Lcr => {
                let driver = build_lcr_meter(model, channel)?;
                self.lcr = Some(driver.clone());
                driver
            }
            Role::Dmm => {
                let driver = build_dmm(model, channel)?;
                self.dmm = Some(driver.clone());
                driver
            }
        };
        self.ordered.push(BoundRole {
            role,
            instrument,
            options,
        });
        Ok(())
    }

    /// Binds a sourcing role to an instrument the caller has already
    /// constructed, for custom transports or simulated hardware.
    pub fn bind_source_meter(
        &mut self,
        role: Role,
        instrument: Arc<dyn SourceMeter>,
        options: Options,
    ) -> Result<()> {
        match role {
            Role::Smu => self.smu = Some(instrument.clone()),
            Role::Elm => self.elm = Some(instrument.clone()),
            Role::Elm2 => self.elm2 = Some(instrument.clone()),
            other => {
                return Err(DaqError::Validation(format!(
                    "role {} does not take a source meter",
                    other
                )))
            }
        }
        self.ordered.push(BoundRole {
            role,
            instrument: instrument as Arc<dyn Instrument>,
            options,
        });
        Ok(())
    }

    /// Bound roles in binding order.
    pub fn iter(&self) -> impl Iterator<Item = &BoundRole> {
        self.ordered.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn smu(&self) -> Option<Arc<dyn SourceMeter>> {
        self.smu.clone()
    }

    pub fn elm(&self) -> Option<Arc<dyn SourceMeter>> {
        self.elm.clone()
    }

    pub fn elm2(&self) -> Option<Arc<dyn SourceMeter>> {
        self.elm2.clone()
    }

    pub fn lcr(&self) -> Option<Arc<dyn LcrMeter>> {
        self.lcr.clone()
    }

    pub fn dmm(&self) -> Option<Arc<dyn Dmm>> {
        self.dmm.clone()
    }

    /// The voltage source for the given role, if that role is bound and
    /// can source.
    pub fn source_for(&self, role: Role) -> Option<Arc<dyn SourceMeter>> {
        match role {
            Role::Smu => self.smu.clone(),
            Role::Elm => self.elm.clone(),
            Role::Elm2 => self.elm2.clone(),
            Role::Lcr => self.lcr.clone().map(|d| d as Arc<dyn SourceMeter>),
            Role::Dmm => None,
        }
    }
}

async fn open_channel(settings: &RoleSettings) -> Result<Box<dyn CommandChannel>> {
    let resource = transport::resolve_resource(&settings.resource_name);
    let options = ChannelOptions::default()
        .with_termination(&settings.termination)
        .with_timeout(Duration::from_secs_f64(settings.timeout));

    if let Some((host, port)) = transport::tcp_endpoint(&resource) {
        let channel = TcpChannel::connect(&host, port, options).await?;
        return Ok(Box::new(channel));
    }

    #[cfg(feature = "instrument_serial")]
    if let Some(path) = transport::serial_port_path(&resource) {
        let channel =
            transport::serial::SerialChannel::connect(path, settings.baud_rate, options).await?;
        return Ok(Box::new(channel));
    }

    Err(DaqError::UnsupportedResource(resource))
}

fn build_source_meter(
    model: &str,
    channel: Box<dyn CommandChannel>,
) -> Result<Arc<dyn SourceMeter>> {
    Ok(match model {
        "K2400" => Arc::new(K2400::new(channel)),
        "K2470" => Arc::new(K2470::new(channel)),
        "K2657A" => Arc::new(K2657A::new(channel)),
        other => return Err(DaqError::UnknownModel(other.to_string())),
    })
}

fn build_electrometer(
    model: &str,
    channel: Box<dyn CommandChannel>,
) -> Result<Arc<dyn SourceMeter>> {
    Ok(match model {
        "K6514" => Arc::new(K6514::new(channel)),
        "K6517B" => Arc::new(K6517B::new(channel)),
        other => return Err(DaqError::UnknownModel(other.to_string())),
    })
}

fn build_lcr_meter(model: &str, channel: Box<dyn CommandChannel>) -> Result<Arc<dyn LcrMeter>> {
    Ok(match model {
        "K595" => Arc::new(K595::new(channel)),
        "E4980A" => Arc::new(E4980A::new(channel)),
        "K4215" => Arc::new(K4215::new(channel)),
        other => return Err(DaqError::UnknownModel(other.to_string())),
    })
}

fn build_dmm(model: &str, channel: Box<dyn CommandChannel>) -> Result<Arc<dyn Dmm>> {
    Ok(match model {
        "K2700" => Arc::new(K2700::new(channel)),
        other => return Err(DaqError::UnknownModel(other.to_string())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockChannel;

    #[test]
    fn role_parsing_round_trips() {
        for role in Role::ALL {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("gpib".parse::<Role>().is_err());
    }

    #[test]
    fn binding_preserves_order_and_capabilities() {
        let mut bindings = RoleBindings::new();
        bindings
            .bind(
                Role::Smu,
                "K2400",
                Box::new(MockChannel::new()),
                Options::new(),
            )
            .unwrap();
        bindings
            .bind(
                Role::Lcr,
                "E4980A",
                Box::new(MockChannel::new()),
                Options::new(),
            )
            .unwrap();

        let roles: Vec<Role> = bindings.iter().map(|b| b.role).collect();
        assert_eq!(roles, vec![Role::Smu, Role::Lcr]);

        assert!(bindings.smu().is_some());
        assert!(bindings.lcr().is_some());
        assert!(bindings.dmm().is_none());
        assert!(bindings.source_for(Role::Smu).is_some());
        assert!(bindings.source_for(Role::Lcr).is_some());
        assert!(bindings.source_for(Role::Dmm).is_none());
    }

    #[test]
    fn unknown_model_is_rejected() {
        let mut bindings = RoleBindings::new();
        let result = bindings.bind(
            Role::Smu,
            "K9999",
            Box::new(MockChannel::new()),
            Options::new(),
        );
        assert!(matches!(result, Err(DaqError::UnknownModel(_))));
    }
}
