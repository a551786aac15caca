//! Raw-socket channel for `TCPIP::SOCKET` instrument resources.

use crate::error::{DaqError, Result};
use crate::transport::{ChannelOptions, CommandChannel};
use async_trait::async_trait;
use log::trace;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// SCPI-over-socket channel.
///
/// The stream is held behind a mutex so a query is one atomic
/// write-then-read exchange; commands from concurrent callers can never
/// interleave inside a single round trip.
pub struct TcpChannel {
    host: String,
    port: u16,
    options: ChannelOptions,
    stream: Mutex<Option<BufReader<TcpStream>>>,
}

impl TcpChannel {
    /// Open a connection to `host:port`. The connect attempt itself is
    /// bounded by the channel timeout.
    pub async fn connect(host: &str, port: u16, options: ChannelOptions) -> Result<Self> {
        let channel = Self {
            host: host.to_string(),
            port,
            options,
            stream: Mutex::new(None),
        };
        channel.reconnect().await?;
        Ok(channel)
    }

    async fn dial(&self) -> Result<BufReader<TcpStream>> {
        let addr = format!("{}:{}", self.host, self.port);
        let stream = tokio::time::timeout(self.options.timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| DaqError::Timeout {
                elapsed: self.options.timeout,
            })?
            .map_err(|err| DaqError::Transport(format!("{addr}: {err}")))?;
        stream
            .set_nodelay(true)
            .map_err(|err| DaqError::Transport(format!("{addr}: {err}")))?;
        Ok(BufReader::new(stream))
    }

    /// Last byte of the termination sequence, used as read delimiter.
    fn delimiter(&self) -> u8 {
        self.options.termination.as_bytes().last().copied().unwrap_or(b'\n')
    }

    async fn send(&self, stream: &mut BufReader<TcpStream>, command: &str) -> Result<()> {
        trace!("tcp.write: `{}`", command);
        let payload = format!("{}{}", command, self.options.termination);
        stream
            .get_mut()
            .write_all(payload.as_bytes())
            .await
            .map_err(|err| DaqError::Transport(format!("{}:{}: {err}", self.host, self.port)))
    }

    async fn receive(&self, stream: &mut BufReader<TcpStream>) -> Result<String> {
        let delimiter = self.delimiter();
        let deadline = tokio::time::Instant::now() + self.options.timeout;
        let mut response = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .unwrap_or(Duration::ZERO);
            if remaining.is_zero() {
                return Err(DaqError::Timeout {
                    elapsed: self.options.timeout,
                });
            }
            let n = tokio::time::timeout(remaining, stream.read(&mut byte))
                .await
                .map_err(|_| DaqError::Timeout {
                    elapsed: self.options.timeout,
                })?
                .map_err(|err| {
                    DaqError::Transport(format!("{}:{}: {err}", self.host, self.port))
                })?;
            if n == 0 {
                return Err(DaqError::Transport(format!(
                    "{}:{}: connection closed",
                    self.host, self.port
                )));
            }
            if byte[0] == delimiter {
                break;
            }
            response.push(byte[0]);
        }
        let response = String::from_utf8_lossy(&response).trim().to_string();
        trace!("tcp.read: `{}`", response);
        Ok(response)
    }
}

#[async_trait]
impl CommandChannel for TcpChannel {
    async fn write(&self, command: &str) -> Result<()> {
        let mut guard = self.stream.lock().await;
        let stream = guard
            .as_mut()
            .ok_or_else(|| DaqError::Transport("not connected".into()))?;
        let result = self.send(stream, command).await;
        if result.is_err() {
            *guard = None;
        }
        result
    }

    async fn query(&self, command: &str) -> Result<String> {
        let mut guard = self.stream.lock().await;
        let stream = guard
            .as_mut()
            .ok_or_else(|| DaqError::Transport("not connected".into()))?;
        let result = async {
            self.send(stream, command).await?;
            self.receive(stream).await
        }
        .await;
        // A timed-out exchange also poisons the stream: the reply may still
        // arrive later and must never be handed to the next query.
        if matches!(
            result,
            Err(DaqError::Transport(_) | DaqError::Timeout { .. })
        ) {
            *guard = None;
        }
        result
    }

    async fn reconnect(&self) -> Result<()> {
        let stream = self.dial().await?;
        *self.stream.lock().await = Some(stream);
        Ok(())
    }
}
