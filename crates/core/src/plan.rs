//! Subtask plan model - the unit of work handed to the pipeline.

use serde::{Deserialize, Serialize};

/// Role of the agent that executes a subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    /// Writes failing tests first
    Tester,
    /// Makes the tests pass
    Developer,
    /// Reviews the result
    Reviewer,
}

impl AgentType {
    /// Wire name of the agent type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tester => "tester",
            Self::Developer => "developer",
            Self::Reviewer => "reviewer",
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AgentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tester" => Ok(Self::Tester),
            "developer" => Ok(Self::Developer),
            "reviewer" => Ok(Self::Reviewer),
            other => Err(format!("unknown agent type: {other}")),
        }
    }
}

/// How the plan was decomposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStrategy {
    /// Tests first, then implementation
    Tdd,
    /// Minimal fix
    Hotfix,
    /// Behavior-preserving restructuring
    Refactor,
}

/// A single unit of work inside a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subtask {
    /// Unique identifier within the plan
    pub id: String,

    /// Role that runs this subtask
    pub agent_type: AgentType,

    /// What the agent should do
    pub description: String,

    /// Ids of subtasks that must finish first
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Files the subtask is expected to touch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<String>>,
}

impl Subtask {
    /// Create a subtask with no dependencies.
    pub fn new(
        id: impl Into<String>,
        agent_type: AgentType,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            agent_type,
            description: description.into(),
            depends_on: Vec::new(),
            files: None,
        }
    }

    /// Add dependencies.
    pub fn with_depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    /// Set the expected files.
    pub fn with_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.files = Some(files.into_iter().map(Into::into).collect());
        self
    }
}

/// A decomposed unit of work. Read-only once a pipeline run starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskPlan {
    /// Decomposition strategy
    pub strategy: PlanStrategy,

    /// Subtasks in plan order
    pub subtasks: Vec<Subtask>,
}

impl SubtaskPlan {
    /// Create a plan.
    pub fn new(strategy: PlanStrategy, subtasks: Vec<Subtask>) -> Self {
        Self { strategy, subtasks }
    }

    /// Look up a subtask by id.
    pub fn get(&self, id: &str) -> Option<&Subtask> {
        self.subtasks.iter().find(|s| s.id == id)
    }

    /// Number of subtasks.
    pub fn len(&self) -> usize {
        self.subtasks.len()
    }

    /// Whether the plan has no subtasks.
    pub fn is_empty(&self) -> bool {
        self.subtasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subtask_wire_format() {
        let subtask = Subtask::new("subtask-1", AgentType::Developer, "implement parser")
            .with_depends_on(["subtask-0"]);
        let json = serde_json::to_value(&subtask).unwrap();

        assert_eq!(json["agentType"], "developer");
        assert_eq!(json["dependsOn"][0], "subtask-0");
        assert!(json.get("files").is_none());
    }

    #[test]
    fn test_plan_parses_without_depends_on() {
        let plan: SubtaskPlan = serde_json::from_str(
            r#"{"strategy":"tdd","subtasks":[{"id":"a","agentType":"tester","description":"write tests"}]}"#,
        )
        .unwrap();

        assert_eq!(plan.strategy, PlanStrategy::Tdd);
        assert!(plan.subtasks[0].depends_on.is_empty());
        assert_eq!(plan.get("a").map(|s| s.agent_type), Some(AgentType::Tester));
    }

    #[test]
    fn test_agent_type_from_str() {
        assert_eq!("reviewer".parse::<AgentType>(), Ok(AgentType::Reviewer));
        assert!("coordinator".parse::<AgentType>().is_err());
    }
}
