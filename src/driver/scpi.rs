//! Shared protocol plumbing for SCPI-style instruments.
//!
//! The textual forms produced here are part of the wire contract. The
//! instruments' own parsers expect sign-and-two-digit exponents
//! (`4.200E+01`), which Rust's `{:E}` does not emit, so outbound numerics
//! go through [`format_exponent`].

use crate::driver::ErrorRecord;
use crate::error::{DaqError, Result};
use crate::transport::CommandChannel;
use std::time::Duration;
use tokio::time::Instant;

/// Renders `value` like C's `%.*E`: fixed decimals, `E`, explicit sign,
/// at least two exponent digits.
pub fn format_exponent(value: f64, precision: usize) -> String {
    let rendered = format!("{:.*e}", precision, value);
    match rendered.split_once('e') {
        Some((mantissa, exponent)) => {
            let exponent: i32 = exponent.parse().unwrap_or(0);
            let sign = if exponent < 0 { '-' } else { '+' };
            format!("{}E{}{:02}", mantissa, sign, exponent.abs())
        }
        None => rendered,
    }
}

/// `0`/`1` flag rendering shared by the SCPI dialects.
pub fn on_off(state: bool) -> &'static str {
    if state {
        "1"
    } else {
        "0"
    }
}

/// Parses the first comma-separated field of a response as a float.
pub fn parse_scalar(response: &str) -> Result<f64> {
    let field = response.split(',').next().unwrap_or(response).trim();
    field
        .parse()
        .map_err(|_| DaqError::Protocol(format!("not a numeric reading: {:?}", response)))
}

/// Parses the first two comma-separated fields of a response.
pub fn parse_pair(response: &str) -> Result<(f64, f64)> {
    let mut fields = response.split(',');
    let first = fields
        .next()
        .map(str::trim)
        .and_then(|f| f.parse().ok());
    let second = fields
        .next()
        .map(str::trim)
        .and_then(|f| f.parse().ok());
    match (first, second) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(DaqError::Protocol(format!(
            "not a numeric pair: {:?}",
            response
        ))),
    }
}

pub fn parse_flag(response: &str) -> bool {
    response.trim() == "1"
}

/// Matches the standard SCPI error form `code,"message"`.
pub fn match_scpi_error(response: &str) -> Option<ErrorRecord> {
    let (code, message) = response.split_once(',')?;
    let code: i32 = code.trim().parse().ok()?;
    Some(ErrorRecord {
        code,
        message: message.trim().trim_matches('"').to_string(),
    })
}

/// Matches the TSP error-queue form, tab-separated with a float code.
pub fn match_tsp_error(response: &str) -> Option<ErrorRecord> {
    let mut fields = response.split('\t');
    let code: f64 = fields.next()?.trim().parse().ok()?;
    let message = fields.next()?.trim().trim_matches('"').to_string();
    Some(ErrorRecord {
        code: code as i32,
        message,
    })
}

/// Matches the KXCI free-text form `message. (code)`.
pub fn match_trailing_code(response: &str) -> Option<ErrorRecord> {
    let open = response.rfind('(')?;
    let close = response[open..].find(')')? + open;
    let code: i32 = response[open + 1..close].trim().parse().ok()?;
    let message = response[..open].trim().trim_end_matches('.').to_string();
    Some(ErrorRecord { code, message })
}

/// Unparsable responses are retained verbatim under code -1.
pub fn fallback_error(response: &str) -> ErrorRecord {
    ErrorRecord {
        code: -1,
        message: response.trim().to_string(),
    }
}

/// Write followed by an `*OPC?` completion handshake.
pub async fn write_opc(channel: &dyn CommandChannel, command: &str) -> Result<()> {
    channel.write(command).await?;
    channel.query("*OPC?").await?;
    Ok(())
}

/// Arm-and-poll fetch loop for buffered measurements.
///
/// Issues the arm commands without handshaking, then polls the event status
/// register until the operation-complete bit rises, at which point the fetch
/// query is run. The poll interval never exceeds the remaining budget; on
/// expiry a timeout carrying the elapsed budget is returned.
pub async fn poll_fetch(
    channel: &dyn CommandChannel,
    arm: &[&str],
    fetch: &str,
    budget: Duration,
    interval: Duration,
) -> Result<String> {
    for command in arm {
        channel.write(command).await?;
    }
    let started = Instant::now();
    loop {
        let esr: i32 = channel.query("*ESR?").await?.trim().parse().unwrap_or(0);
        if esr & 0x1 != 0 {
            return channel.query(fetch).await;
        }
        let elapsed = started.elapsed();
        let remaining = match budget.checked_sub(elapsed) {
            Some(r) if !r.is_zero() => r,
            _ => return Err(DaqError::Timeout { elapsed }),
        };
        tokio::time::sleep(interval.min(remaining)).await;
    }
}
