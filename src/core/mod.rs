//! Core module containing the harness functionality
//!
//! This module provides:
//! - Transport layer for the serial link
//! - Line reader and response dispatcher
//! - Test-mode upload protocol
//! - Pass/fail expressions
//! - Payload preparation
//! - Test sequencing
//! - Simulated device

pub mod dispatcher;
pub mod expr;
pub mod line_channel;
pub mod payload;
pub mod sequencer;
pub mod simulator;
pub mod transport;
pub mod upload;
