//! Harness settings
//!
//! Optional TOML file tuning the link and protocol timing:
//!
//! ```toml
//! transfer_failure = "abort"
//!
//! [link]
//! baud_rate = 115200
//! poll_interval_ms = 100
//!
//! [timeouts]
//! arm = 5000
//! inference_result = 3000
//! ```

use crate::core::line_channel::DEFAULT_POLL_INTERVAL;
use crate::core::sequencer::TransferFailurePolicy;
use crate::core::transport::DEFAULT_BAUD_RATE;
use crate::core::upload::ProtocolTimeouts;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Settings errors
#[derive(Error, Debug)]
pub enum SettingsError {
    /// File could not be read
    #[error("Unable to read settings <{path}> ({source})")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// TOML syntax or schema error
    #[error("Bad settings file <{path}> ({source})")]
    Parse {
        /// File path
        path: PathBuf,
        /// Underlying error
        source: toml::de::Error,
    },
}

/// Link settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSettings {
    /// Baud rate
    pub baud_rate: u32,
    /// Background reader poll interval in milliseconds
    pub poll_interval_ms: u64,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            poll_interval_ms: u64::try_from(DEFAULT_POLL_INTERVAL.as_millis()).unwrap_or(100),
        }
    }
}

impl LinkSettings {
    /// Poll interval as a duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// All harness settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessSettings {
    /// Serial link
    pub link: LinkSettings,
    /// Protocol step timeouts
    pub timeouts: ProtocolTimeouts,
    /// What an aborted DATA transfer does to the run
    pub transfer_failure: TransferFailurePolicy,
}

impl HarnessSettings {
    /// Load settings from `path`, or from the user config directory when
    /// `path` is `None`. Missing default settings yield the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        match path {
            Some(path) => Self::load_file(path),
            None => match super::settings_path() {
                Some(path) if path.exists() => Self::load_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    fn load_file(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = toml::from_str(&content).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}
