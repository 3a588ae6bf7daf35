//! Test-mode upload protocol
//!
//! Line oriented command/acknowledge conversation with the device:
//!
//! ```text
//! >>> !TEST                        <<< !OK TEST <n> | !FAIL TEST
//! >>> !DATA <kind> <len>
//! >>> <base64 of at most n bytes>  <<< !DATA_ACK <count> | !FAIL DATA <kind> <len>
//! ...
//!                                  <<< !OK DATA <kind> <len> | !FAIL DATA <kind> <len>
//! ```
//!
//! Only one conversation is in flight at a time; every step blocks until the
//! device answers or the step's timeout expires.

use super::dispatcher::ResponseDispatcher;
use super::transport::{TransportError, TransportPort};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Kind of test data uploaded to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataKind {
    /// 8-bit grayscale image, 96x96 or 160x120
    #[serde(rename = "image-grayscale")]
    Image,
    /// 16 kHz mono signed 16-bit PCM
    #[serde(rename = "audio-pcm-16khz-mono-s16")]
    Audio,
    /// Raw int8 tensor data
    #[serde(rename = "raw-int8")]
    RawInt8,
    /// Raw float32 tensor data
    #[serde(rename = "raw-float")]
    RawFloat,
}

impl DataKind {
    /// Token used on the wire and in test plans
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image-grayscale",
            Self::Audio => "audio-pcm-16khz-mono-s16",
            Self::RawInt8 => "raw-int8",
            Self::RawFloat => "raw-float",
        }
    }

    /// All kinds
    pub fn all() -> &'static [DataKind] {
        &[Self::Image, Self::Audio, Self::RawInt8, Self::RawFloat]
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown data type <{s}>"))
    }
}

/// Timeouts for each protocol step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolTimeouts {
    /// Any command or chunk write
    #[serde(with = "millis")]
    pub write: Duration,
    /// Reply to `!TEST`
    #[serde(with = "millis")]
    pub arm: Duration,
    /// Per-chunk acknowledgement
    #[serde(with = "millis")]
    pub chunk_ack: Duration,
    /// Final `!DATA` reply after the last chunk
    #[serde(with = "millis")]
    pub data_final: Duration,
    /// Inference result line
    #[serde(with = "millis")]
    pub inference_result: Duration,
}

impl Default for ProtocolTimeouts {
    fn default() -> Self {
        Self {
            write: Duration::from_secs(1),
            arm: Duration::from_secs(5),
            chunk_ack: Duration::from_secs(1),
            data_final: Duration::from_secs(1),
            inference_result: Duration::from_secs(3),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Protocol step, used in error reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// `!TEST` command
    TestCommand,
    /// `!DATA` header
    DataCommand,
    /// Base64 chunk
    DataChunk,
    /// Per-chunk acknowledgement
    DataAck,
    /// Final `!DATA` reply
    DataReply,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TestCommand => write!(f, "TEST command"),
            Self::DataCommand => write!(f, "DATA command"),
            Self::DataChunk => write!(f, "data transfer"),
            Self::DataAck => write!(f, "DATA ack"),
            Self::DataReply => write!(f, "DATA command reply"),
        }
    }
}

/// Fatal protocol errors. Any of these desynchronizes the session.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Write or reply timeout
    #[error("Timeout during {stage} ({direction})")]
    Timeout {
        /// Step that timed out
        stage: Stage,
        /// "write" or "reply"
        direction: &'static str,
    },

    /// Device refused to enter test mode
    #[error("Unable to place device into test mode")]
    TestModeRefused,

    /// Reply did not have the expected shape
    #[error("Unexpected {stage} reply: {reply}")]
    UnexpectedReply {
        /// Step being answered
        stage: Stage,
        /// Offending reply
        reply: String,
    },

    /// Acknowledged byte count differs from the chunk size
    #[error("DATA ack line length {acked} != {expected}")]
    AckMismatch {
        /// Count reported by the device
        acked: usize,
        /// Raw bytes in the chunk
        expected: usize,
    },

    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Internal pattern failed to compile
    #[error("Invalid response pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Outcome of a completed DATA conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Device accepted the data and ran inference
    Completed,
    /// Device reported `!FAIL DATA`
    Aborted,
}

/// Size of each raw chunk when `len` bytes are split by `decode_length`
pub fn chunk_lengths(len: usize, decode_length: usize) -> impl Iterator<Item = usize> {
    let step = decode_length.max(1);
    (0..len).step_by(step).map(move |offset| (len - offset).min(step))
}

/// Protocol driver bound to one transport and dispatcher
pub struct UploadProtocol<'a> {
    port: &'a dyn TransportPort,
    dispatcher: &'a ResponseDispatcher,
    timeouts: ProtocolTimeouts,
}

impl<'a> UploadProtocol<'a> {
    /// Create a driver
    pub fn new(
        port: &'a dyn TransportPort,
        dispatcher: &'a ResponseDispatcher,
        timeouts: ProtocolTimeouts,
    ) -> Self {
        Self {
            port,
            dispatcher,
            timeouts,
        }
    }

    /// Timeouts in effect
    pub fn timeouts(&self) -> &ProtocolTimeouts {
        &self.timeouts
    }

    async fn send_line(&self, line: &str, stage: Stage) -> Result<(), ProtocolError> {
        let status = self.port.write_line(line, self.timeouts.write).await?;
        if !status.is_written() {
            return Err(ProtocolError::Timeout {
                stage,
                direction: "write",
            });
        }
        if stage == Stage::DataChunk {
            tracing::trace!(">>> {}", line);
        } else {
            tracing::debug!(">>> {}", line);
        }
        Ok(())
    }

    async fn expect(
        &self,
        patterns: &[&str],
        timeout: Duration,
        stage: Stage,
    ) -> Result<Vec<String>, ProtocolError> {
        self.dispatcher
            .wait_match(patterns, Some(timeout))
            .await?
            .ok_or(ProtocolError::Timeout {
                stage,
                direction: "reply",
            })
    }

    /// Put the device into test mode, returning the negotiated chunk size
    pub async fn arm(&self) -> Result<usize, ProtocolError> {
        const FAIL: &str = "!FAIL TEST";

        self.send_line("!TEST", Stage::TestCommand).await?;
        let groups = self
            .expect(&[r"!OK TEST (\d+)", FAIL], self.timeouts.arm, Stage::TestCommand)
            .await?;

        match groups.as_slice() {
            [line] if line == FAIL => Err(ProtocolError::TestModeRefused),
            [line, length] => match length.parse::<usize>() {
                Ok(n) if n > 0 => {
                    tracing::debug!("Device armed, chunk decode length {}", n);
                    Ok(n)
                }
                _ => Err(ProtocolError::UnexpectedReply {
                    stage: Stage::TestCommand,
                    reply: line.clone(),
                }),
            },
            _ => Err(ProtocolError::UnexpectedReply {
                stage: Stage::TestCommand,
                reply: groups.first().cloned().unwrap_or_default(),
            }),
        }
    }

    /// Upload `data` in chunks of at most `decode_length` raw bytes
    pub async fn send_data(
        &self,
        kind: DataKind,
        data: &[u8],
        decode_length: usize,
    ) -> Result<TransferOutcome, ProtocolError> {
        let command = format!("DATA {kind} {}", data.len());
        let fail = regex::escape(&format!("!FAIL {command}"));
        let success = regex::escape(&format!("!OK {command}"));

        self.send_line(&format!("!{command}"), Stage::DataCommand)
            .await?;

        let mut offset = 0;
        for len in chunk_lengths(data.len(), decode_length) {
            let chunk = &data[offset..offset + len];
            offset += len;
            self.send_line(&STANDARD.encode(chunk), Stage::DataChunk)
                .await?;

            let groups = self
                .expect(
                    &[fail.as_str(), r"!DATA_ACK (\d+)"],
                    self.timeouts.chunk_ack,
                    Stage::DataAck,
                )
                .await?;

            let [_, count] = groups.as_slice() else {
                tracing::warn!("Device aborted transfer: {}", groups[0]);
                return Ok(TransferOutcome::Aborted);
            };
            let acked = count
                .parse::<usize>()
                .map_err(|_| ProtocolError::UnexpectedReply {
                    stage: Stage::DataAck,
                    reply: groups[0].clone(),
                })?;
            if acked != chunk.len() {
                return Err(ProtocolError::AckMismatch {
                    acked,
                    expected: chunk.len(),
                });
            }
        }

        let groups = self
            .expect(
                &[success.as_str(), fail.as_str()],
                self.timeouts.data_final,
                Stage::DataReply,
            )
            .await?;
        if groups[0].starts_with("!OK") {
            Ok(TransferOutcome::Completed)
        } else {
            tracing::warn!("Device rejected data: {}", groups[0]);
            Ok(TransferOutcome::Aborted)
        }
    }
}
