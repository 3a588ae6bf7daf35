//! Background line reader
//!
//! Polls the transport with a short timeout, assembles newline-terminated
//! lines and pushes them into the [`ResponseDispatcher`].

use super::dispatcher::ResponseDispatcher;
use super::transport::TransportPort;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default transport poll interval
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Splits a byte stream into lines with `\n` / `\r` terminators removed
#[derive(Debug, Default)]
pub struct LineAssembler {
    buffer: Vec<u8>,
}

impl LineAssembler {
    /// Create an empty assembler
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning every line completed by them
    pub fn feed(&mut self, data: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in data {
            if byte == b'\n' {
                let mut end = self.buffer.len();
                while end > 0 && matches!(self.buffer[end - 1], b'\r' | b'\n') {
                    end -= 1;
                }
                lines.push(String::from_utf8_lossy(&self.buffer[..end]).into_owned());
                self.buffer.clear();
            } else {
                self.buffer.push(byte);
            }
        }
        lines
    }

    /// Bytes of the current incomplete line
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Handle to the background reader task
pub struct LineChannel {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl LineChannel {
    /// Start reading from `port` into `dispatcher`
    pub fn spawn(
        port: Arc<dyn TransportPort>,
        dispatcher: Arc<ResponseDispatcher>,
        poll_interval: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(read_loop(port, dispatcher, poll_interval, cancel.clone()));
        Self { cancel, task }
    }

    /// Check whether the reader task has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the reader to stop and wait until it has exited
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::error!("Line reader task failed: {}", e);
        }
    }
}

async fn read_loop(
    port: Arc<dyn TransportPort>,
    dispatcher: Arc<ResponseDispatcher>,
    poll_interval: Duration,
    cancel: CancellationToken,
) {
    let mut assembler = LineAssembler::new();

    loop {
        let chunk = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            chunk = port.read_chunk(poll_interval) => chunk,
        };

        match chunk {
            // Transports that return early without data must not starve the runtime
            Ok(bytes) if bytes.is_empty() => tokio::task::yield_now().await,
            Ok(bytes) => {
                for line in assembler.feed(&bytes) {
                    tracing::debug!("<<< {}", line);
                    dispatcher.push(line);
                }
            }
            Err(e) => {
                tracing::error!("Serial read failed, line reader exiting: {}", e);
                break;
            }
        }
    }

    if assembler.pending() > 0 {
        tracing::trace!("Discarding {} bytes of partial line", assembler.pending());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::{MockTransportPort, TransportError};
    use bytes::Bytes;

    #[test]
    fn test_crlf_and_split_lines() {
        let mut assembler = LineAssembler::new();
        assert!(assembler.feed(b"!OK TE").is_empty());
        assert_eq!(assembler.feed(b"ST 48\r\n!DATA_ACK 4\n"), vec!["!OK TEST 48", "!DATA_ACK 4"]);
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn test_empty_and_partial_lines() {
        let mut assembler = LineAssembler::new();
        assert_eq!(assembler.feed(b"\r\n\npartial"), vec!["", ""]);
        assert_eq!(assembler.pending(), 7);
    }

    #[tokio::test]
    async fn test_lines_reach_dispatcher() {
        let mut port = MockTransportPort::new();
        let mut sent = false;
        port.expect_read_chunk().returning(move |_| {
            if sent {
                Ok(Bytes::new())
            } else {
                sent = true;
                Ok(Bytes::from_static(b"noise\r\n!OK TEST 32\r\n"))
            }
        });

        let dispatcher = Arc::new(ResponseDispatcher::new());
        let channel = LineChannel::spawn(Arc::new(port), dispatcher.clone(), Duration::from_millis(5));

        let result = dispatcher
            .wait_match(&[r"!OK TEST (\d+)"], Some(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(result, Some(vec!["!OK TEST 32".to_string(), "32".to_string()]));

        channel.stop().await;
    }

    #[tokio::test]
    async fn test_disconnect_ends_task() {
        let mut port = MockTransportPort::new();
        port.expect_read_chunk()
            .returning(|_| Err(TransportError::Disconnected));

        let dispatcher = Arc::new(ResponseDispatcher::new());
        let channel = LineChannel::spawn(Arc::new(port), dispatcher, Duration::from_millis(5));
        tokio::time::timeout(Duration::from_secs(1), async {
            while !channel.is_finished() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        channel.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_does_not_break_pending_wait() {
        let mut port = MockTransportPort::new();
        port.expect_read_chunk().returning(|_| Ok(Bytes::new()));

        let dispatcher = Arc::new(ResponseDispatcher::new());
        let channel = LineChannel::spawn(Arc::new(port), dispatcher.clone(), Duration::from_millis(100));

        let waiter = {
            let d = dispatcher.clone();
            tokio::spawn(async move { d.wait_match(&["never"], Some(Duration::from_millis(500))).await })
        };
        channel.stop().await;

        assert_eq!(waiter.await.unwrap().unwrap(), None);
    }
}
