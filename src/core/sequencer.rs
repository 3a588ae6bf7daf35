//! Test sequencing
//!
//! Arms the device once, then for every case: prepare the payload, upload it,
//! wait for the inference result line and evaluate the case's expression.

use super::dispatcher::ResponseDispatcher;
use super::expr::{Bindings, ExprError};
use super::payload::{PayloadError, PayloadResolver};
use super::transport::{TransportError, TransportPort};
use super::upload::{ProtocolError, TransferOutcome, UploadProtocol};
use crate::config::{HarnessSettings, PlanError, SettingsError, TestPlan};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Run-level (fatal) errors
#[derive(Error, Debug)]
pub enum HarnessError {
    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Protocol desynchronization
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Test plan problem
    #[error(transparent)]
    Plan(#[from] PlanError),

    /// Settings problem
    #[error(transparent)]
    Settings(#[from] SettingsError),

    /// Payload could not be prepared
    #[error(transparent)]
    Payload(#[from] PayloadError),

    /// Device aborted a transfer under the abort policy
    #[error("Test #{index} ABORTED during data transfer")]
    TransferAborted {
        /// 1-based test index
        index: usize,
    },

    /// No inference result line arrived
    #[error("Test #{index} TIMEOUT waiting for inference result")]
    ResultTimeout {
        /// 1-based test index
        index: usize,
    },

    /// Expression could not be evaluated
    #[error("Test #{index} expression error: {source}")]
    Evaluation {
        /// 1-based test index
        index: usize,
        /// Underlying error
        source: ExprError,
    },

    /// Response pattern failed to compile
    #[error("Test #{index} bad response pattern: {source}")]
    Pattern {
        /// 1-based test index
        index: usize,
        /// Underlying error
        source: regex::Error,
    },

    /// Interrupted by the user
    #[error("Test run cancelled")]
    Cancelled,
}

/// How an aborted DATA transfer affects the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferFailurePolicy {
    /// Stop the whole run
    #[default]
    Abort,
    /// Count the test as failed and continue
    FailTest,
}

/// Test counters. Every field only ever increases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResults {
    /// Number of tests in the plan
    pub total: usize,
    /// Tests that ran to a verdict
    pub completed: usize,
    /// Tests that passed
    pub passed: usize,
    /// Tests that failed
    pub failed: usize,
}

impl TestResults {
    fn record(&mut self, passed: bool) {
        debug_assert!(self.completed < self.total);
        if passed {
            self.passed += 1;
        } else {
            self.failed += 1;
        }
        self.completed += 1;
    }

    /// All tests completed and none failed
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.completed == self.total
    }
}

impl fmt::Display for TestResults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total {} completed {} passed {} failed {}",
            self.total, self.completed, self.passed, self.failed
        )
    }
}

/// Results with run timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Counters at the end of the run
    pub results: TestResults,
    /// Run start
    pub started_at: DateTime<Local>,
    /// Run end, if the run has finished
    pub finished_at: Option<DateTime<Local>>,
}

/// Drives a test plan against one device
pub struct TestSequencer {
    port: Arc<dyn TransportPort>,
    dispatcher: Arc<ResponseDispatcher>,
    resolver: Arc<dyn PayloadResolver>,
    settings: HarnessSettings,
    summary: RunSummary,
}

impl TestSequencer {
    /// Create a sequencer
    pub fn new(
        port: Arc<dyn TransportPort>,
        dispatcher: Arc<ResponseDispatcher>,
        resolver: Arc<dyn PayloadResolver>,
        settings: HarnessSettings,
    ) -> Self {
        Self {
            port,
            dispatcher,
            resolver,
            settings,
            summary: RunSummary {
                results: TestResults::default(),
                started_at: Local::now(),
                finished_at: None,
            },
        }
    }

    /// Counters so far
    pub fn results(&self) -> TestResults {
        self.summary.results
    }

    /// Counters plus timing
    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    /// Run every case in `plan`. Test failures are counted, not returned.
    pub async fn run(&mut self, plan: &TestPlan) -> Result<(), HarnessError> {
        self.summary.started_at = Local::now();
        let result = self.run_cases(plan).await;
        self.summary.finished_at = Some(Local::now());
        if let Err(e) = &result {
            tracing::error!("FATAL {}", e);
        }
        result
    }

    async fn run_cases(&mut self, plan: &TestPlan) -> Result<(), HarnessError> {
        let port = Arc::clone(&self.port);
        let dispatcher = Arc::clone(&self.dispatcher);
        let protocol = UploadProtocol::new(port.as_ref(), dispatcher.as_ref(), self.settings.timeouts);

        let decode_length = protocol.arm().await?;
        self.summary.results.total = plan.cases.len();

        for (i, case) in plan.cases.iter().enumerate() {
            let index = i + 1;
            let datum = self.resolver.resolve(case)?;

            tracing::info!(
                "Test #{} for label <{}> file <{}>",
                index,
                case.label,
                case.file_name()
            );

            let passed = match protocol.send_data(case.data_kind, &datum, decode_length).await? {
                TransferOutcome::Completed => {
                    let groups = self
                        .dispatcher
                        .wait_match(
                            &[case.response_pattern.as_str()],
                            Some(self.settings.timeouts.inference_result),
                        )
                        .await
                        .map_err(|source| HarnessError::Pattern { index, source })?
                        .ok_or(HarnessError::ResultTimeout { index })?;

                    case.expression
                        .evaluate(&Bindings::new(&groups, &case.label))
                        .map_err(|source| HarnessError::Evaluation { index, source })?
                }
                TransferOutcome::Aborted => match self.settings.transfer_failure {
                    TransferFailurePolicy::Abort => {
                        return Err(HarnessError::TransferAborted { index })
                    }
                    TransferFailurePolicy::FailTest => {
                        tracing::warn!("Test #{} ABORTED during data transfer", index);
                        false
                    }
                },
            };

            self.summary.results.record(passed);
            tracing::info!("Test #{} {}", index, if passed { "PASSED" } else { "FAILED" });

            if !plan.delay.is_zero() && index < plan.cases.len() {
                tracing::info!("Waiting {:.3}s before next test", plan.delay.as_secs_f64());
                tokio::time::sleep(plan.delay).await;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_results_invariants() {
        let mut results = TestResults {
            total: 3,
            ..TestResults::default()
        };
        assert!(!results.is_success());

        results.record(true);
        results.record(false);
        assert_eq!(results.completed, 2);
        assert_eq!(results.passed + results.failed, results.completed);
        assert!(!results.is_success());

        results.record(true);
        assert_eq!(results.to_string(), "total 3 completed 3 passed 2 failed 1");
        assert!(!results.is_success());
    }

    #[test]
    fn test_empty_plan_is_success() {
        assert!(TestResults::default().is_success());
    }

    #[test]
    fn test_policy_serde() {
        assert_eq!(
            serde_json::to_string(&TransferFailurePolicy::FailTest).unwrap(),
            "\"fail-test\""
        );
    }
}
