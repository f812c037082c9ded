//! Test-driven guard model.

use serde::{Deserialize, Serialize};

/// How guard failures affect the pipeline.
///
/// There is deliberately no `Default`: callers must pick a mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TddMode {
    /// Retry, then fail the pipeline
    Strict,
    /// Record the result, never fail
    Warn,
    /// Never run guards
    Off,
}

/// Which guard ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardPhase {
    /// Tests are expected to fail
    Red,
    /// Tests are expected to pass
    Green,
}

impl GuardPhase {
    /// Wire name of the phase.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Red => "red",
            Self::Green => "green",
        }
    }
}

impl std::fmt::Display for GuardPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one guard attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TddGuardResult {
    /// Guard phase
    pub phase: GuardPhase,

    /// Whether the phase expectation held
    pub passed: bool,

    /// Exit code of the test command
    pub test_exit: i32,

    /// Captured test output
    pub output: String,
}

impl TddGuardResult {
    /// Passing result with no output.
    pub fn pass(phase: GuardPhase) -> Self {
        Self {
            phase,
            passed: true,
            test_exit: match phase {
                GuardPhase::Red => 1,
                GuardPhase::Green => 0,
            },
            output: String::new(),
        }
    }

    /// Failing result with no output.
    pub fn fail(phase: GuardPhase) -> Self {
        Self {
            phase,
            passed: false,
            test_exit: match phase {
                GuardPhase::Red => 0,
                GuardPhase::Green => 1,
            },
            output: String::new(),
        }
    }
}
