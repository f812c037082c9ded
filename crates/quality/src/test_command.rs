//! Test command resolution.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Command used when nothing else is configured.
pub const DEFAULT_TEST_COMMAND: &str = "pytest -x --tb=short";

/// Where the resolved command came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestCommandSource {
    /// `test command:` line in the workspace's AGENTS.md
    Agents,
    /// Project configuration
    Project,
    /// [`DEFAULT_TEST_COMMAND`]
    Default,
}

/// A test command and its origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTestCommand {
    /// Shell command line
    pub command: String,

    /// Origin
    pub source: TestCommandSource,
}

fn agents_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?im)^\s*test\s*command\s*:\s*(.+?)\s*$").expect("valid regex")
    })
}

/// Extract the first `test command: <cmd>` line from AGENTS.md content.
pub fn parse_agents_test_command(content: &str) -> Option<String> {
    agents_line()
        .captures_iter(content)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .find(|cmd| !cmd.is_empty())
}

/// Resolve the test command for a workspace.
///
/// Precedence: AGENTS.md, then the project setting, then the default.
pub fn resolve_test_command(
    project_test_cmd: Option<&str>,
    workspace: impl AsRef<Path>,
) -> ResolvedTestCommand {
    let agents = std::fs::read_to_string(workspace.as_ref().join("AGENTS.md"))
        .ok()
        .and_then(|content| parse_agents_test_command(&content));
    if let Some(command) = agents {
        return ResolvedTestCommand {
            command,
            source: TestCommandSource::Agents,
        };
    }

    if let Some(cmd) = project_test_cmd.map(str::trim).filter(|c| !c.is_empty()) {
        return ResolvedTestCommand {
            command: cmd.to_string(),
            source: TestCommandSource::Project,
        };
    }

    ResolvedTestCommand {
        command: DEFAULT_TEST_COMMAND.to_string(),
        source: TestCommandSource::Default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_agents_line() {
        let content = "# Agents\n\nSome notes\nTest Command: cargo test --workspace  \nmore\n";
        assert_eq!(
            parse_agents_test_command(content).as_deref(),
            Some("cargo test --workspace")
        );
    }

    #[test]
    fn test_parse_agents_crlf_and_spacing() {
        let content = "intro\r\n  test   command :  npm test\r\n";
        assert_eq!(parse_agents_test_command(content).as_deref(), Some("npm test"));
    }

    #[test]
    fn test_parse_agents_missing() {
        assert!(parse_agents_test_command("no command here").is_none());
    }

    #[test]
    fn test_resolve_prefers_agents_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("AGENTS.md"), "test command: make check\n").unwrap();

        let resolved = resolve_test_command(Some("cargo test"), dir.path());
        assert_eq!(resolved.command, "make check");
        assert_eq!(resolved.source, TestCommandSource::Agents);
    }

    #[test]
    fn test_resolve_project_then_default() {
        let dir = tempfile::tempdir().unwrap();

        let resolved = resolve_test_command(Some("cargo test"), dir.path());
        assert_eq!(resolved.source, TestCommandSource::Project);

        let resolved = resolve_test_command(None, dir.path());
        assert_eq!(resolved.command, DEFAULT_TEST_COMMAND);
        assert_eq!(resolved.source, TestCommandSource::Default);
    }
}
