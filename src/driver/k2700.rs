//! Keithley 2700 multimeter, used as temperature monitor.
//!
//! Reset and clear are deliberate no-ops: the 2700 typically shares a bus
//! with other instruments and a `*RST` would disturb its scan configuration.

use crate::driver::scpi;
use crate::driver::{Dmm, ErrorRecord, Instrument, Options};
use crate::error::Result;
use crate::transport::CommandChannel;
use async_trait::async_trait;

pub struct K2700 {
    channel: Box<dyn CommandChannel>,
}

impl K2700 {
    pub const MODEL: &'static str = "K2700";

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
impl Instrument for K2700 {
    fn model(&self) -> &'static str {
        Self::MODEL
    }

    async fn identity(&self) -> Result<String> {
        self.query("*IDN?").await
    }

    async fn reset(&self) -> Result<()> {
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        Ok(())
    }

    async fn next_error(&self) -> Result<ErrorRecord> {
        let response = self.query(":SYST:ERR?").await?;
        Ok(scpi::match_scpi_error(&response).unwrap_or_else(|| scpi::fallback_error(&response)))
    }

    async fn configure(&self, _options: &Options) -> Result<()> {
        Ok(())
    }

    async fn reconnect(&self) -> Result<()> {
        self.channel.reconnect().await
    }
}

#[async_trait]
impl Dmm for K2700 {
    async fn read_temperature(&self) -> Result<f64> {
        // Select the bare reading as the returned element.
        self.write(":FORM:ELEM READ").await?;
        scpi::parse_scalar(&self.query(":FETC?").await?)
    }
}
