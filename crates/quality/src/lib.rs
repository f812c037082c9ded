//! Quality gates for the pipeline.
//!
//! TDD guard capability, a guard backed by the project's test command, and
//! test command resolution.

#![warn(missing_docs)]

pub mod guard;
pub mod command;
pub mod test_command;

pub use guard::TddGuard;
pub use command::{run_test_command, CommandGuard, CommandOutput};
pub use test_command::{
    parse_agents_test_command, resolve_test_command, ResolvedTestCommand, TestCommandSource,
    DEFAULT_TEST_COMMAND,
};
