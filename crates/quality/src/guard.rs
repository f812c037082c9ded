//! TDD guard capability.

use ao_core::{GuardPhase, TddGuardResult};
use async_trait::async_trait;

/// Runs the project's tests and reports whether a TDD phase holds.
///
/// Red expects the tests to fail (they were written before the code), green
/// expects them to pass. Guards never error: a guard that cannot run reports
/// a failed result.
#[async_trait]
pub trait TddGuard: Send + Sync {
    /// Check that tests currently fail.
    async fn assert_red(&self) -> TddGuardResult;

    /// Check that tests currently pass.
    async fn assert_green(&self) -> TddGuardResult;

    /// Dispatch on phase.
    async fn check(&self, phase: GuardPhase) -> TddGuardResult {
        match phase {
            GuardPhase::Red => self.assert_red().await,
            GuardPhase::Green => self.assert_green().await,
        }
    }
}
