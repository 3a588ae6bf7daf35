//! CLI Exit Codes
//!
//! Exit codes for scripted test runs.

use crate::core::sequencer::{HarnessError, TestResults};
use crate::core::transport::TransportError;
use crate::core::upload::ProtocolError;
use std::process::ExitCode;

/// Exit code constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodes;

impl ExitCodes {
    /// All tests passed
    pub const SUCCESS: u8 = 0;

    /// General error
    pub const ERROR: u8 = 1;

    /// Invalid arguments
    pub const INVALID_ARGS: u8 = 2;

    /// Serial link could not be opened or failed
    pub const CONNECTION_FAILED: u8 = 3;

    /// A protocol step timed out
    pub const TIMEOUT: u8 = 4;

    /// Permission denied on the port
    pub const PERMISSION_DENIED: u8 = 7;

    /// Test plan or settings error
    pub const CONFIG_ERROR: u8 = 8;

    /// Device broke the protocol
    pub const PROTOCOL_ERROR: u8 = 9;

    /// Device aborted a data transfer
    pub const TRANSFER_FAILED: u8 = 10;

    /// User cancelled
    pub const CANCELLED: u8 = 11;

    /// Port not found
    pub const PORT_NOT_FOUND: u8 = 14;

    /// Test payload could not be prepared
    pub const PAYLOAD_ERROR: u8 = 15;

    /// One or more tests failed
    pub const TESTS_FAILED: u8 = 17;
}

/// CLI operation result
#[derive(Debug)]
pub enum CliResult {
    /// Every test passed
    Success,

    /// Failure with exit code
    Error(u8),
}

impl CliResult {
    /// Outcome of a run that finished without a fatal error
    pub fn from_results(results: &TestResults) -> Self {
        if results.is_success() {
            Self::Success
        } else {
            Self::Error(ExitCodes::TESTS_FAILED)
        }
    }

    /// Get exit code
    pub fn code(&self) -> u8 {
        match self {
            Self::Success => ExitCodes::SUCCESS,
            Self::Error(code) => *code,
        }
    }

    /// Convert to ExitCode
    pub fn to_exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }
}

fn transport_code(err: &TransportError) -> u8 {
    match err {
        TransportError::PortNotFound(_) | TransportError::NoDefaultPort => ExitCodes::PORT_NOT_FOUND,
        TransportError::PermissionDenied(_) => ExitCodes::PERMISSION_DENIED,
        _ => ExitCodes::CONNECTION_FAILED,
    }
}

impl From<&HarnessError> for CliResult {
    fn from(err: &HarnessError) -> Self {
        let code = match err {
            HarnessError::Transport(e) | HarnessError::Protocol(ProtocolError::Transport(e)) => {
                transport_code(e)
            }
            HarnessError::Protocol(ProtocolError::Timeout { .. }) | HarnessError::ResultTimeout { .. } => {
                ExitCodes::TIMEOUT
            }
            HarnessError::Protocol(_) | HarnessError::Evaluation { .. } => ExitCodes::PROTOCOL_ERROR,
            HarnessError::Plan(_) | HarnessError::Settings(_) | HarnessError::Pattern { .. } => {
                ExitCodes::CONFIG_ERROR
            }
            HarnessError::Payload(_) => ExitCodes::PAYLOAD_ERROR,
            HarnessError::TransferAborted { .. } => ExitCodes::TRANSFER_FAILED,
            HarnessError::Cancelled => ExitCodes::CANCELLED,
        };
        Self::Error(code)
    }
}

/// Exit code description
pub fn exit_code_description(code: u8) -> &'static str {
    match code {
        ExitCodes::SUCCESS => "All tests passed",
        ExitCodes::ERROR => "General error",
        ExitCodes::INVALID_ARGS => "Invalid arguments",
        ExitCodes::CONNECTION_FAILED => "Connection failed",
        ExitCodes::TIMEOUT => "Device timeout",
        ExitCodes::PERMISSION_DENIED => "Permission denied",
        ExitCodes::CONFIG_ERROR => "Configuration error",
        ExitCodes::PROTOCOL_ERROR => "Protocol error",
        ExitCodes::TRANSFER_FAILED => "Transfer aborted",
        ExitCodes::CANCELLED => "Operation cancelled",
        ExitCodes::PORT_NOT_FOUND => "Port not found",
        ExitCodes::PAYLOAD_ERROR => "Test data error",
        ExitCodes::TESTS_FAILED => "Tests failed",
        _ => "Unknown error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::upload::Stage;

    #[test]
    fn test_cli_result_from_results() {
        let passed = TestResults {
            total: 2,
            completed: 2,
            passed: 2,
            failed: 0,
        };
        let result = CliResult::from_results(&passed);
        assert!(matches!(result, CliResult::Success));
        assert_eq!(result.code(), ExitCodes::SUCCESS);

        let failed = TestResults {
            failed: 1,
            passed: 1,
            ..passed
        };
        assert_eq!(CliResult::from_results(&failed).code(), ExitCodes::TESTS_FAILED);
    }

    #[test]
    fn test_harness_error_codes() {
        let cases = [
            (
                HarnessError::Transport(TransportError::PortNotFound("/dev/x".into())),
                ExitCodes::PORT_NOT_FOUND,
            ),
            (
                HarnessError::Protocol(ProtocolError::Timeout {
                    stage: Stage::DataAck,
                    direction: "reply",
                }),
                ExitCodes::TIMEOUT,
            ),
            (
                HarnessError::Protocol(ProtocolError::TestModeRefused),
                ExitCodes::PROTOCOL_ERROR,
            ),
            (HarnessError::TransferAborted { index: 2 }, ExitCodes::TRANSFER_FAILED),
            (HarnessError::Cancelled, ExitCodes::CANCELLED),
        ];
        for (err, code) in cases {
            let result = CliResult::from(&err);
            assert_eq!(result.code(), code, "{err}");
            assert_ne!(exit_code_description(code), "Unknown error");
        }
    }
}
