//! Serial port transport implementation

use super::{TransportError, TransportPort, WriteStatus, LINE_TERMINATOR};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// Default baud rate. USB CDC devices ignore it, UART bridges do not.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

const READ_BUFFER_SIZE: usize = 1024;

/// Serial link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Port path (e.g. /dev/ttyACM0). `None` selects the platform default.
    pub port: Option<String>,
    /// Baud rate
    pub baud_rate: u32,
}

impl LinkConfig {
    /// Create a configuration for an explicit port
    pub fn new(port: Option<String>) -> Self {
        Self {
            port,
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }

    /// Set baud rate
    #[must_use]
    pub fn baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Resolve the port path, falling back to the platform default
    pub fn resolve_port(&self) -> Result<String, TransportError> {
        if let Some(port) = &self.port {
            return Ok(port.clone());
        }
        default_port()
            .map(str::to_string)
            .ok_or(TransportError::NoDefaultPort)
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self::new(None)
    }
}

fn default_port() -> Option<&'static str> {
    if cfg!(target_os = "linux") {
        Some("/dev/ttyACM0")
    } else if cfg!(target_os = "macos") {
        Some("/dev/cu.usbmodem14201")
    } else {
        None
    }
}

/// Serial port transport.
///
/// The stream is split so the background reader and the protocol driver each
/// lock only their own half.
pub struct SerialLink {
    path: String,
    baud_rate: u32,
    reader: Mutex<Option<ReadHalf<SerialStream>>>,
    writer: Mutex<Option<WriteHalf<SerialStream>>>,
}

impl SerialLink {
    /// Open the serial port described by `config`
    pub fn open(config: &LinkConfig) -> Result<Self, TransportError> {
        let path = config.resolve_port()?;

        #[allow(unused_mut)]
        let mut stream = tokio_serial::new(&path, config.baud_rate)
            .open_native_async()
            .map_err(|e| map_open_error(&path, &e))?;

        #[cfg(unix)]
        stream
            .set_exclusive(true)
            .map_err(|e| map_open_error(&path, &e))?;

        let (reader, writer) = tokio::io::split(stream);
        tracing::info!("Opened serial port {} @ {} baud", path, config.baud_rate);

        Ok(Self {
            path,
            baud_rate: config.baud_rate,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
        })
    }
}

fn map_open_error(path: &str, e: &tokio_serial::Error) -> TransportError {
    match e.kind() {
        serialport::ErrorKind::NoDevice => TransportError::PortNotFound(path.to_string()),
        serialport::ErrorKind::Io(io_kind) => match io_kind {
            std::io::ErrorKind::NotFound => TransportError::PortNotFound(path.to_string()),
            std::io::ErrorKind::PermissionDenied => {
                TransportError::PermissionDenied(path.to_string())
            }
            _ => TransportError::ConnectionFailed(e.to_string()),
        },
        _ => TransportError::ConnectionFailed(e.to_string()),
    }
}

/// A zero-byte read into a non-empty buffer is end of stream
fn chunk_from_read(mut buffer: Vec<u8>, n: usize) -> Result<Bytes, TransportError> {
    if n == 0 {
        return Err(TransportError::Disconnected);
    }
    buffer.truncate(n);
    Ok(Bytes::from(buffer))
}

#[async_trait]
impl TransportPort for SerialLink {
    async fn write_line(&self, line: &str, timeout: Duration) -> Result<WriteStatus, TransportError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::NotConnected)?;

        let payload = line.as_bytes();
        let write = async {
            let mut written = 0;
            while written < payload.len() {
                let n = writer.write(&payload[written..]).await?;
                if n == 0 {
                    return Err(TransportError::ShortWrite {
                        written,
                        expected: payload.len(),
                    });
                }
                written += n;
            }
            writer.write_all(LINE_TERMINATOR).await?;
            writer.flush().await?;
            Ok(())
        };

        match tokio::time::timeout(timeout, write).await {
            Ok(Ok(())) => Ok(WriteStatus::Written),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(WriteStatus::TimedOut),
        }
    }

    async fn read_chunk(&self, timeout: Duration) -> Result<Bytes, TransportError> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(TransportError::NotConnected)?;

        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        match tokio::time::timeout(timeout, reader.read(&mut buffer)).await {
            Ok(Ok(n)) => chunk_from_read(buffer, n),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => Ok(Bytes::new()),
            Ok(Err(e)) => Err(TransportError::IoError(e)),
            // No data available yet
            Err(_) => Ok(Bytes::new()),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        let reader = self.reader.lock().await.take();
        let writer = self.writer.lock().await.take();
        if reader.is_some() || writer.is_some() {
            tracing::info!("Closed serial port {}", self.path);
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("{} @ {} baud", self.path, self.baud_rate)
    }
}

/// List available serial ports
pub fn list_ports() -> Result<Vec<serialport::SerialPortInfo>, TransportError> {
    serialport::available_ports().map_err(|e| TransportError::IoError(e.into()))
}
