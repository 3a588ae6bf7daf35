//! Transport layer for the device link
//!
//! The harness only needs four things from a link: open it, write a line with a
//! timeout, read whatever bytes are available with a timeout, and close it.
//! [`SerialLink`] is the real implementation; the in-memory
//! [`SimulatedDevice`](crate::core::simulator::SimulatedDevice) implements the
//! same trait for tests.

mod serial;

pub use serial::{list_ports, LinkConfig, SerialLink, DEFAULT_BAUD_RATE};

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;

/// Line terminator appended by [`TransportPort::write_line`]
pub const LINE_TERMINATOR: &[u8] = b"\n";

/// Transport error types
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Port not found
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// No port given and the platform has no default
    #[error("No serial port specified and no default is known for this platform")]
    NoDefaultPort,

    /// Fewer bytes were accepted than requested
    #[error("Short write {written} of {expected}")]
    ShortWrite {
        /// Bytes accepted by the link
        written: usize,
        /// Bytes requested
        expected: usize,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Not connected
    #[error("Not connected")]
    NotConnected,

    /// Device went away (end of stream)
    #[error("Device disconnected")]
    Disconnected,
}

/// Result of a timed write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// The whole line, terminator included, was written
    Written,
    /// The write did not finish before the timeout
    TimedOut,
}

impl WriteStatus {
    /// Check whether the write completed
    pub fn is_written(self) -> bool {
        matches!(self, Self::Written)
    }
}

/// Link abstraction consumed by the line reader and the upload protocol.
///
/// Implementations must allow `read_chunk` and `write_line` to run
/// concurrently: the background reader polls continuously while the driver
/// writes commands.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransportPort: Send + Sync {
    /// Write `line` followed by [`LINE_TERMINATOR`].
    ///
    /// A timeout is reported as [`WriteStatus::TimedOut`]; a short write is an
    /// error.
    async fn write_line(&self, line: &str, timeout: Duration) -> Result<WriteStatus, TransportError>;

    /// Read whatever is available within `timeout` (possibly nothing)
    async fn read_chunk(&self, timeout: Duration) -> Result<Bytes, TransportError>;

    /// Release the link
    async fn close(&self) -> Result<(), TransportError>;

    /// Human readable description of the link
    fn describe(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_write_message() {
        let err = TransportError::ShortWrite { written: 3, expected: 8 };
        assert_eq!(err.to_string(), "Short write 3 of 8");
    }

    #[test]
    fn test_write_status() {
        assert!(WriteStatus::Written.is_written());
        assert!(!WriteStatus::TimedOut.is_written());
    }
}
