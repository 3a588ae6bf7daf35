//! Simulated device
//!
//! An in-memory [`TransportPort`] that speaks the device side of the test-mode
//! protocol. Behavior knobs let tests script refusals, bad acknowledgements and
//! aborted transfers without hardware.

use super::transport::{TransportError, TransportPort, WriteStatus};
use super::upload::DataKind;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Produces the inference result line for a completed upload
pub type InferenceFn = Arc<dyn Fn(DataKind, &[u8]) -> Option<String> + Send + Sync>;

/// Scriptable device behavior
#[derive(Clone)]
pub struct DeviceBehavior {
    /// Chunk size announced in `!OK TEST`
    pub decode_length: usize,
    /// Answer `!TEST` with `!FAIL TEST`
    pub refuse_test: bool,
    /// Acknowledge every chunk with this count instead of the decoded size
    pub ack_override: Option<usize>,
    /// Abort the transfer when this chunk (1-based) arrives
    pub fail_data_after_chunks: Option<usize>,
    /// Answer the last chunk with `!FAIL DATA`
    pub fail_final: bool,
    /// Never answer anything
    pub silent: bool,
    /// Result line printed after each accepted upload
    pub inference: InferenceFn,
}

impl Default for DeviceBehavior {
    fn default() -> Self {
        Self {
            decode_length: 48,
            refuse_test: false,
            ack_override: None,
            fail_data_after_chunks: None,
            fail_final: false,
            silent: false,
            inference: Arc::new(|_, _| None),
        }
    }
}

impl DeviceBehavior {
    /// Set the result line producer
    #[must_use]
    pub fn with_inference<F>(mut self, f: F) -> Self
    where
        F: Fn(DataKind, &[u8]) -> Option<String> + Send + Sync + 'static,
    {
        self.inference = Arc::new(f);
        self
    }
}

impl fmt::Debug for DeviceBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBehavior")
            .field("decode_length", &self.decode_length)
            .field("refuse_test", &self.refuse_test)
            .field("ack_override", &self.ack_override)
            .field("fail_data_after_chunks", &self.fail_data_after_chunks)
            .field("fail_final", &self.fail_final)
            .field("silent", &self.silent)
            .finish_non_exhaustive()
    }
}

/// One upload as seen by the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedUpload {
    /// Declared data kind
    pub kind: DataKind,
    /// Declared length
    pub declared_len: usize,
    /// Decoded bytes received so far
    pub data: Vec<u8>,
    /// Decoded size of each chunk
    pub chunk_sizes: Vec<usize>,
    /// Transfer reached `!OK DATA`
    pub completed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Idle,
    Armed,
    Receiving,
}

struct DeviceState {
    mode: Mode,
    uploads: Vec<RecordedUpload>,
    received: Vec<String>,
    closed: bool,
}

/// In-memory device implementing [`TransportPort`]
pub struct SimulatedDevice {
    behavior: DeviceBehavior,
    state: Mutex<DeviceState>,
    tx: mpsc::UnboundedSender<Bytes>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

impl SimulatedDevice {
    /// Create a device with the given behavior
    pub fn new(behavior: DeviceBehavior) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            behavior,
            state: Mutex::new(DeviceState {
                mode: Mode::Idle,
                uploads: Vec::new(),
                received: Vec::new(),
                closed: false,
            }),
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Print an unsolicited line, as device firmware logging would
    pub fn emit(&self, line: &str) {
        let _ = self.tx.send(Bytes::from(format!("{line}\r\n")));
    }

    /// Uploads seen so far
    pub fn uploads(&self) -> Vec<RecordedUpload> {
        self.state.lock().uploads.clone()
    }

    /// Every line written to the device, in order
    pub fn received_lines(&self) -> Vec<String> {
        self.state.lock().received.clone()
    }

    /// Check whether the link was closed
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn handle_line(&self, line: &str) {
        let mut state = self.state.lock();
        state.received.push(line.to_string());
        if self.behavior.silent {
            return;
        }

        if line == "!TEST" {
            if self.behavior.refuse_test {
                self.emit("!FAIL TEST");
            } else {
                state.mode = Mode::Armed;
                self.emit(&format!("!OK TEST {}", self.behavior.decode_length));
            }
            return;
        }

        if let Some(rest) = line.strip_prefix("!DATA ") {
            if state.mode == Mode::Idle {
                self.emit(&format!("!FAIL {}", &line[1..]));
                return;
            }
            let mut parts = rest.split_whitespace();
            let header = parts
                .next()
                .and_then(|k| k.parse::<DataKind>().ok())
                .zip(parts.next().and_then(|n| n.parse::<usize>().ok()));
            let Some((kind, declared_len)) = header else {
                self.emit(&format!("!FAIL {}", &line[1..]));
                return;
            };
            state.mode = Mode::Receiving;
            state.uploads.push(RecordedUpload {
                kind,
                declared_len,
                data: Vec::new(),
                chunk_sizes: Vec::new(),
                completed: false,
            });
            if declared_len == 0 {
                self.finish_upload(&mut state);
            }
            return;
        }

        if state.mode != Mode::Receiving {
            tracing::debug!("Simulated device ignoring <{}>", line);
            return;
        }

        let Some(upload) = state.uploads.last_mut() else {
            return;
        };
        let fail = format!("!FAIL DATA {} {}", upload.kind, upload.declared_len);
        let Ok(chunk) = STANDARD.decode(line) else {
            self.emit(&fail);
            state.mode = Mode::Armed;
            return;
        };

        upload.chunk_sizes.push(chunk.len());
        if self.behavior.fail_data_after_chunks == Some(upload.chunk_sizes.len()) {
            self.emit(&fail);
            state.mode = Mode::Armed;
            return;
        }
        upload.data.extend_from_slice(&chunk);
        self.emit(&format!(
            "!DATA_ACK {}",
            self.behavior.ack_override.unwrap_or(chunk.len())
        ));

        if upload.data.len() >= upload.declared_len {
            self.finish_upload(&mut state);
        }
    }

    fn finish_upload(&self, state: &mut DeviceState) {
        state.mode = Mode::Armed;
        let Some(upload) = state.uploads.last_mut() else {
            return;
        };
        if self.behavior.fail_final {
            self.emit(&format!("!FAIL DATA {} {}", upload.kind, upload.declared_len));
            return;
        }
        upload.completed = true;
        self.emit(&format!("!OK DATA {} {}", upload.kind, upload.declared_len));
        if let Some(result) = (self.behavior.inference)(upload.kind, &upload.data) {
            self.emit(&result);
        }
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new(DeviceBehavior::default())
    }
}

#[async_trait]
impl TransportPort for SimulatedDevice {
    async fn write_line(&self, line: &str, _timeout: Duration) -> Result<WriteStatus, TransportError> {
        if self.is_closed() {
            return Err(TransportError::NotConnected);
        }
        self.handle_line(line.trim_end());
        Ok(WriteStatus::Written)
    }

    async fn read_chunk(&self, timeout: Duration) -> Result<Bytes, TransportError> {
        if self.is_closed() {
            return Err(TransportError::NotConnected);
        }
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(bytes)) => Ok(bytes),
            Ok(None) | Err(_) => Ok(Bytes::new()),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.state.lock().closed = true;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("simulated device (chunk {})", self.behavior.decode_length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(device: &SimulatedDevice) -> String {
        let mut out = String::new();
        loop {
            let chunk = device.read_chunk(Duration::from_millis(1)).await.unwrap();
            if chunk.is_empty() {
                return out;
            }
            out.push_str(&String::from_utf8_lossy(&chunk));
        }
    }

    #[tokio::test]
    async fn test_arm_and_upload() {
        let device = SimulatedDevice::new(
            DeviceBehavior {
                decode_length: 4,
                ..DeviceBehavior::default()
            }
            .with_inference(|_, data| Some(format!("sum {}", data.iter().map(|&b| u32::from(b)).sum::<u32>()))),
        );
        let timeout = Duration::from_secs(1);

        device.write_line("!TEST", timeout).await.unwrap();
        device.write_line("!DATA raw-int8 6", timeout).await.unwrap();
        device.write_line(&STANDARD.encode([1, 2, 3, 4]), timeout).await.unwrap();
        device.write_line(&STANDARD.encode([5, 6]), timeout).await.unwrap();

        assert_eq!(
            drain(&device).await,
            "!OK TEST 4\r\n!DATA_ACK 4\r\n!DATA_ACK 2\r\n!OK DATA raw-int8 6\r\nsum 21\r\n"
        );
        let uploads = device.uploads();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].chunk_sizes, vec![4, 2]);
        assert!(uploads[0].completed);
    }

    #[tokio::test]
    async fn test_refusal_and_abort() {
        let refusing = SimulatedDevice::new(DeviceBehavior {
            refuse_test: true,
            ..DeviceBehavior::default()
        });
        refusing.write_line("!TEST", Duration::ZERO).await.unwrap();
        assert_eq!(drain(&refusing).await, "!FAIL TEST\r\n");

        let aborting = SimulatedDevice::new(DeviceBehavior {
            fail_data_after_chunks: Some(1),
            ..DeviceBehavior::default()
        });
        aborting.write_line("!TEST", Duration::ZERO).await.unwrap();
        aborting.write_line("!DATA image-grayscale 3", Duration::ZERO).await.unwrap();
        aborting.write_line(&STANDARD.encode([0, 0, 0]), Duration::ZERO).await.unwrap();
        assert_eq!(
            drain(&aborting).await,
            "!OK TEST 48\r\n!FAIL DATA image-grayscale 3\r\n"
        );
    }

    #[tokio::test]
    async fn test_closed_device() {
        let device = SimulatedDevice::default();
        device.close().await.unwrap();
        assert!(matches!(
            device.write_line("!TEST", Duration::ZERO).await,
            Err(TransportError::NotConnected)
        ));
        assert_eq!(device.received_lines().len(), 0);
    }
}
