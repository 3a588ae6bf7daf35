//! # Serialtest Core Library
//!
//! Host-side driver for the serial test mode of embedded inference examples:
//! - Background line reader feeding a pattern-matching response dispatcher
//! - Chunked base64 upload protocol with per-chunk acknowledgement
//! - Test plans with per-case regex and pass/fail expressions
//! - Simulated device for running without hardware
//!
//! ## Example
//!
//! ```rust,no_run
//! use serialtest_core::{
//!     FilePayloadResolver, HarnessSettings, LineChannel, LinkConfig, ResponseDispatcher,
//!     SerialLink, TestPlan, TestSequencer, TransportPort,
//! };
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = HarnessSettings::default();
//!     let plan = TestPlan::load(Path::new("serial_test_config.json"))?;
//!
//!     let port: Arc<dyn TransportPort> = Arc::new(SerialLink::open(&LinkConfig::default())?);
//!     let dispatcher = Arc::new(ResponseDispatcher::new());
//!     let reader = LineChannel::spawn(port.clone(), dispatcher.clone(), settings.link.poll_interval());
//!
//!     let mut sequencer = TestSequencer::new(
//!         port.clone(),
//!         dispatcher,
//!         Arc::new(FilePayloadResolver::new()),
//!         settings,
//!     );
//!     let outcome = sequencer.run(&plan).await;
//!
//!     reader.stop().await;
//!     port.close().await?;
//!     println!("Test end: {}", sequencer.results());
//!     outcome?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;

// Re-exports for convenience
pub use crate::cli::{CliResult, ExitCodes};
pub use crate::config::{HarnessSettings, TestCase, TestPlan};
pub use crate::core::dispatcher::{MatchResult, PatternSet, ResponseDispatcher};
pub use crate::core::expr::{Bindings, Expression};
pub use crate::core::line_channel::LineChannel;
pub use crate::core::payload::{FilePayloadResolver, PayloadResolver};
pub use crate::core::sequencer::{
    HarnessError, RunSummary, TestResults, TestSequencer, TransferFailurePolicy,
};
pub use crate::core::simulator::{DeviceBehavior, SimulatedDevice};
pub use crate::core::transport::{LinkConfig, SerialLink, TransportError, TransportPort};
pub use crate::core::upload::{DataKind, ProtocolTimeouts, UploadProtocol};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
