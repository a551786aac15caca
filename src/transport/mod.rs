//! Instrument transport layer.
//!
//! A [`CommandChannel`] carries textual command/response exchanges with a
//! single physical instrument. The channel appends the configured line
//! termination on write, strips surrounding whitespace on read, and performs
//! no interpretation of content; all protocol knowledge lives in the driver
//! layer.
//!
//! Implementations:
//! - [`tcp::TcpChannel`] for `TCPIP0::host::port::SOCKET` resources
//! - [`serial::SerialChannel`] for RS-232 resources (feature `instrument_serial`)
//! - [`mock::MockChannel`] scripted channel for tests and dry runs
//!
//! [`retry::RetryChannel`] decorates any channel with a bounded retry budget
//! for transport faults.

use crate::error::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;

pub mod mock;
pub mod retry;
#[cfg(feature = "instrument_serial")]
pub mod serial;
pub mod tcp;

pub use mock::MockChannel;
pub use retry::RetryChannel;
pub use tcp::TcpChannel;

/// Line termination and timeout applied to every exchange on a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelOptions {
    /// Appended to outbound commands and expected at the end of responses.
    pub termination: String,
    /// Budget for a single query round trip.
    pub timeout: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            termination: "\r\n".into(),
            timeout: Duration::from_secs(8),
        }
    }
}

impl ChannelOptions {
    pub fn with_termination(mut self, termination: &str) -> Self {
        self.termination = termination.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Transport abstraction for a single instrument session.
///
/// A physical command/response session is not reentrant: implementations
/// serialize exchanges behind an internal lock so that a `query` is one
/// atomic write-then-read. Every blocking call carries the configured
/// timeout so callers can never hang indefinitely.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Send a command without expecting a response.
    async fn write(&self, command: &str) -> Result<()>;

    /// Send a command and return the whitespace-trimmed response.
    async fn query(&self, command: &str) -> Result<String>;

    /// Issue a device clear, where the transport supports one.
    async fn clear(&self) -> Result<()> {
        Ok(())
    }

    /// Tear down and re-establish the link. Used by the engine's
    /// auto-reconnect cycle after a connection fault.
    async fn reconnect(&self) -> Result<()>;
}

static GPIB_SHORT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)$").unwrap());
static IP_PORT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+\.\d+\.\d+\.\d+):(\d+)$").unwrap());
static HOST_PORT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([\w.-]+):(\d+)$").unwrap());

/// Expand short resource descriptors into canonical VISA-style names.
///
/// - `"16"` becomes `GPIB0::16::INSTR`
/// - `"192.168.0.2:5025"` becomes `TCPIP0::192.168.0.2::5025::SOCKET`
/// - `"lcr-bench:5025"` becomes `TCPIP0::lcr-bench::5025::SOCKET`
///
/// Already-canonical names pass through unchanged.
pub fn resolve_resource(resource_name: &str) -> String {
    let resource_name = resource_name.trim();

    if let Some(caps) = GPIB_SHORT.captures(resource_name) {
        return format!("GPIB0::{}::INSTR", &caps[1]);
    }
    if let Some(caps) = IP_PORT.captures(resource_name) {
        return format!("TCPIP0::{}::{}::SOCKET", &caps[1], &caps[2]);
    }
    if let Some(caps) = HOST_PORT.captures(resource_name) {
        return format!("TCPIP0::{}::{}::SOCKET", &caps[1], &caps[2]);
    }
    resource_name.to_string()
}

static TCP_SOCKET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^TCPIP\d*::([^:]+)::(\d+)::SOCKET$").unwrap());
static SERIAL_RESOURCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^ASRL(.+)::INSTR$").unwrap());

/// Host and port of a canonical `TCPIP::SOCKET` resource, if it is one.
pub fn tcp_endpoint(resource_name: &str) -> Option<(String, u16)> {
    TCP_SOCKET.captures(resource_name).and_then(|caps| {
        let port = caps[2].parse().ok()?;
        Some((caps[1].to_string(), port))
    })
}

/// Serial port path of a canonical `ASRL::INSTR` resource, if it is one.
pub fn serial_port_path(resource_name: &str) -> Option<String> {
    SERIAL_RESOURCE
        .captures(resource_name)
        .map(|caps| caps[1].to_string())
}
