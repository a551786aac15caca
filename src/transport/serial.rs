//! Serial-port command channel (feature `instrument_serial`).
//!
//! Blocking serialport I/O is pushed onto the blocking pool so the async
//! runtime never stalls on a slow instrument.

use crate::error::{DaqError, Result};
use crate::transport::{ChannelOptions, CommandChannel};
use async_trait::async_trait;
use log::trace;
use serialport::SerialPort;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Instant;

pub struct SerialChannel {
    path: String,
    baud_rate: u32,
    options: ChannelOptions,
    port: Arc<Mutex<Option<Box<dyn SerialPort>>>>,
}

impl SerialChannel {
    pub fn new(path: impl Into<String>, baud_rate: u32, options: ChannelOptions) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            options,
            port: Arc::new(Mutex::new(None)),
        }
    }

    /// Opens the port and returns a ready channel.
    pub async fn connect(
        path: impl Into<String>,
        baud_rate: u32,
        options: ChannelOptions,
    ) -> Result<Self> {
        let channel = Self::new(path, baud_rate, options);
        channel.reconnect().await?;
        Ok(channel)
    }

    fn open_port(&self) -> Result<Box<dyn SerialPort>> {
        serialport::new(&self.path, self.baud_rate)
            .timeout(self.options.timeout)
            .open()
            .map_err(|e| DaqError::Transport(format!("open {}: {}", self.path, e)))
    }

    async fn send(&self, command: &str) -> Result<()> {
        let port = Arc::clone(&self.port);
        let payload = format!("{}{}", command, self.options.termination);
        trace!("serial send: {:?}", payload);
        tokio::task::spawn_blocking(move || {
            let mut guard = port.lock().map_err(|_| poisoned())?;
            let handle = guard
                .as_mut()
                .ok_or_else(|| DaqError::Transport("serial port not open".into()))?;
            if let Err(e) = handle.write_all(payload.as_bytes()) {
                *guard = None;
                return Err(DaqError::Transport(format!("serial write: {}", e)));
            }
            Ok(())
        })
        .await
        .map_err(|e| DaqError::Transport(format!("serial task: {}", e)))?
    }

    /// One write-then-read round trip under a single port lock, so a
    /// concurrent caller can never interleave between question and answer.
    async fn exchange(&self, command: &str) -> Result<String> {
        let port = Arc::clone(&self.port);
        let payload = format!("{}{}", command, self.options.termination);
        let termination = self.options.termination.clone();
        let timeout = self.options.timeout;
        trace!("serial send: {:?}", payload);
        tokio::task::spawn_blocking(move || {
            let mut guard = port.lock().map_err(|_| poisoned())?;
            let handle = guard
                .as_mut()
                .ok_or_else(|| DaqError::Transport("serial port not open".into()))?;
            if let Err(e) = handle.write_all(payload.as_bytes()) {
                *guard = None;
                return Err(DaqError::Transport(format!("serial write: {}", e)));
            }
            let delimiter = termination.as_bytes().last().copied().unwrap_or(b'\n');
            let started = Instant::now();
            let mut buffer = Vec::new();
            let mut byte = [0u8; 1];
            loop {
                match handle.read(&mut byte) {
                    Ok(1) if byte[0] == delimiter => break,
                    Ok(1) => buffer.push(byte[0]),
                    Ok(_) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                        return Err(DaqError::Timeout {
                            elapsed: started.elapsed(),
                        });
                    }
                    Err(e) => {
                        *guard = None;
                        return Err(DaqError::Transport(format!("serial read: {}", e)));
                    }
                }
                if started.elapsed() > timeout {
                    return Err(DaqError::Timeout {
                        elapsed: started.elapsed(),
                    });
                }
            }
            let text = String::from_utf8_lossy(&buffer);
            Ok(text.trim_end_matches(['\r', '\n']).to_string())
        })
        .await
        .map_err(|e| DaqError::Transport(format!("serial task: {}", e)))?
    }
}

fn poisoned() -> DaqError {
    DaqError::Transport("serial port lock poisoned".into())
}

#[async_trait]
impl CommandChannel for SerialChannel {
    async fn write(&self, command: &str) -> Result<()> {
        self.send(command).await
    }

    async fn query(&self, command: &str) -> Result<String> {
        let response = self.exchange(command).await?;
        trace!("serial recv: {:?}", response);
        Ok(response)
    }

    async fn clear(&self) -> Result<()> {
        let port = Arc::clone(&self.port);
        tokio::task::spawn_blocking(move || {
            let mut guard = port.lock().map_err(|_| poisoned())?;
            if let Some(handle) = guard.as_mut() {
                handle
                    .clear(serialport::ClearBuffer::All)
                    .map_err(|e| DaqError::Transport(format!("serial clear: {}", e)))?;
            }
            Ok(())
        })
        .await
        .map_err(|e| DaqError::Transport(format!("serial task: {}", e)))?
    }

    async fn reconnect(&self) -> Result<()> {
        let fresh = self.open_port()?;
        let mut guard = self.port.lock().map_err(|_| poisoned())?;
        *guard = Some(fresh);
        Ok(())
    }
}
