//! Configuration module
//!
//! Handles test plans and harness settings

mod plan;
mod settings;

pub use plan::{PlanError, TestCase, TestPlan};
pub use settings::{HarnessSettings, LinkSettings, SettingsError};

use directories::ProjectDirs;
use std::path::PathBuf;

/// Example programs with a serial test mode
pub const EXAMPLES: &[&str] = &["person_detection", "magic_wand", "micro_speech", "hello_world"];

/// Get the application configuration directory
pub fn config_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "serialtest", "Serialtest")
        .map(|dirs| dirs.config_dir().to_path_buf())
}

/// Default location of the settings file
pub fn settings_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("settings.toml"))
}

/// Default test plan location for an example
pub fn default_plan_path(example: &str) -> PathBuf {
    PathBuf::from("examples")
        .join(example)
        .join("data")
        .join("serial_test_config.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_plan_path() {
        assert_eq!(
            default_plan_path("micro_speech"),
            PathBuf::from("examples/micro_speech/data/serial_test_config.json")
        );
    }
}
