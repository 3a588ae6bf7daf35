//! Test plan loading
//!
//! The on-disk format is the per-example `serial_test_config.json`:
//!
//! ```json
//! {
//!   "data type": "image-grayscale",
//!   "delay after": 0.5,
//!   "test data": [
//!     { "file name": "person.png", "label": "person",
//!       "regex": "person score:(\\d+) no person score (\\d+)",
//!       "expr": "groups[1] > groups[2]", "qqvga size": false }
//!   ]
//! }
//! ```

use crate::core::expr::{ExprError, Expression};
use crate::core::upload::DataKind;
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Plan loading errors
#[derive(Error, Debug)]
pub enum PlanError {
    /// File could not be read
    #[error("Unable to open config file <{path}> ({source})")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// JSON syntax or schema error
    #[error("Bad format for config file ({0})")]
    Json(#[from] serde_json::Error),

    /// YAML syntax or schema error
    #[error("Bad format for config file ({0})")]
    Yaml(#[from] serde_yaml::Error),

    /// Semantically invalid entry
    #[error("Invalid configuration data (test #{index}: {reason})")]
    InvalidEntry {
        /// 1-based test index
        index: usize,
        /// What was wrong
        reason: String,
    },

    /// Invalid plan-level value
    #[error("Invalid configuration data ({0})")]
    Invalid(String),
}

/// One test case
#[derive(Debug, Clone, PartialEq)]
pub struct TestCase {
    /// Expected label, bound as `label` in the expression
    pub label: String,
    /// Kind of payload, shared by the whole plan
    pub data_kind: DataKind,
    /// Input file
    pub source: PathBuf,
    /// Pattern for the inference result line
    pub response_pattern: String,
    /// Pass/fail expression
    pub expression: Expression,
    /// Use 160x120 instead of 96x96 for images
    pub qqvga: bool,
}

impl TestCase {
    /// File name for reporting
    pub fn file_name(&self) -> String {
        self.source
            .file_name()
            .map_or_else(|| self.source.display().to_string(), |n| n.to_string_lossy().into_owned())
    }
}

/// Ordered list of test cases with shared settings
#[derive(Debug, Clone, PartialEq)]
pub struct TestPlan {
    /// Data kind of every case
    pub data_kind: DataKind,
    /// Pause between consecutive tests
    pub delay: Duration,
    /// Cases in execution order
    pub cases: Vec<TestCase>,
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(rename = "data type")]
    data_type: DataKind,
    #[serde(rename = "delay after")]
    delay_after: f64,
    #[serde(rename = "test data")]
    test_data: Vec<RawCase>,
}

#[derive(Debug, Deserialize)]
struct RawCase {
    #[serde(rename = "file name")]
    file_name: PathBuf,
    label: Label,
    regex: String,
    expr: String,
    #[serde(rename = "qqvga size", default)]
    qqvga_size: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Label {
    Text(String),
    // Keeps the written form, so 5.0 stays "5.0"
    Number(serde_json::Number),
}

impl Label {
    fn into_string(self) -> String {
        match self {
            Self::Text(s) => s,
            Self::Number(n) => n.to_string(),
        }
    }
}

impl TestPlan {
    /// Load a plan, choosing YAML for `.yaml`/`.yml` files and JSON otherwise
    pub fn load(path: &Path) -> Result<Self, PlanError> {
        let content = std::fs::read_to_string(path).map_err(|source| PlanError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"));
        if is_yaml {
            Self::from_yaml_str(&content)
        } else {
            Self::from_json_str(&content)
        }
    }

    /// Parse a JSON plan
    pub fn from_json_str(json: &str) -> Result<Self, PlanError> {
        Self::from_raw(serde_json::from_str(json)?)
    }

    /// Parse a YAML plan
    pub fn from_yaml_str(yaml: &str) -> Result<Self, PlanError> {
        Self::from_raw(serde_yaml::from_str(yaml)?)
    }

    fn from_raw(raw: RawPlan) -> Result<Self, PlanError> {
        if !raw.delay_after.is_finite() || raw.delay_after < 0.0 {
            return Err(PlanError::Invalid(format!(
                "delay after must be a non-negative number of seconds, got {}",
                raw.delay_after
            )));
        }

        let cases = raw
            .test_data
            .into_iter()
            .enumerate()
            .map(|(i, case)| {
                let invalid = |reason: String| PlanError::InvalidEntry { index: i + 1, reason };

                Regex::new(&case.regex).map_err(|e| invalid(format!("bad regex: {e}")))?;
                let expression = Expression::parse(&case.expr)
                    .map_err(|e: ExprError| invalid(format!("bad expr: {e}")))?;

                Ok(TestCase {
                    label: case.label.into_string(),
                    data_kind: raw.data_type,
                    source: case.file_name,
                    response_pattern: case.regex,
                    expression,
                    qqvga: case.qqvga_size,
                })
            })
            .collect::<Result<Vec<_>, PlanError>>()?;

        Ok(Self {
            data_kind: raw.data_type,
            delay: Duration::from_secs_f64(raw.delay_after),
            cases,
        })
    }

    /// Number of cases
    pub fn len(&self) -> usize {
        self.cases.len()
    }

    /// Check if the plan has no cases
    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }
}
