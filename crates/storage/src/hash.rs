//! Plan hashing for checkpoint resume eligibility.

use ao_core::SubtaskPlan;
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::Result;

/// SHA-256 hex digest of the plan's canonical JSON form.
///
/// Object keys are sorted before serializing, so the digest depends neither
/// on struct field order nor on serde_json's `preserve_order` feature.
pub fn hash_plan(plan: &SubtaskPlan) -> Result<String> {
    let canonical = canonical_json(plan)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

fn canonical_json(plan: &SubtaskPlan) -> Result<String> {
    Ok(serde_json::to_string(&sort_keys(serde_json::to_value(plan)?))?)
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(entries.into_iter().map(|(k, v)| (k, sort_keys(v))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ao_core::{AgentType, PlanStrategy, Subtask};

    fn plan() -> SubtaskPlan {
        SubtaskPlan::new(
            PlanStrategy::Tdd,
            vec![
                Subtask::new("subtask-0", AgentType::Tester, "write tests"),
                Subtask::new("subtask-1", AgentType::Developer, "implement")
                    .with_depends_on(["subtask-0"]),
            ],
        )
    }

    #[test]
    fn test_hash_is_stable() {
        let a = hash_plan(&plan()).unwrap();
        let b = hash_plan(&plan()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_hash_changes_with_any_field() {
        let base = hash_plan(&plan()).unwrap();

        let mut p = plan();
        p.subtasks[1].description = "implement faster".to_string();
        assert_ne!(hash_plan(&p).unwrap(), base);

        let mut p = plan();
        p.subtasks[0].agent_type = AgentType::Reviewer;
        assert_ne!(hash_plan(&p).unwrap(), base);

        let mut p = plan();
        p.subtasks[1].depends_on.clear();
        assert_ne!(hash_plan(&p).unwrap(), base);

        let mut p = plan();
        p.subtasks[0].files = Some(vec!["src/lib.rs".to_string()]);
        assert_ne!(hash_plan(&p).unwrap(), base);

        let mut p = plan();
        p.strategy = PlanStrategy::Hotfix;
        assert_ne!(hash_plan(&p).unwrap(), base);
    }

    #[test]
    fn test_canonical_form_sorts_keys() {
        let plan = SubtaskPlan::new(
            PlanStrategy::Tdd,
            vec![Subtask::new("a", AgentType::Tester, "d").with_depends_on(["b"])],
        );
        assert_eq!(
            canonical_json(&plan).unwrap(),
            r#"{"strategy":"tdd","subtasks":[{"agentType":"tester","dependsOn":["b"],"description":"d","id":"a"}]}"#
        );
    }

    #[test]
    fn test_hash_ignores_source_key_order() {
        let a: SubtaskPlan = serde_json::from_str(
            r#"{"strategy":"tdd","subtasks":[{"id":"a","agentType":"tester","description":"d"}]}"#,
        )
        .unwrap();
        let b: SubtaskPlan = serde_json::from_str(
            r#"{"subtasks":[{"description":"d","agentType":"tester","id":"a"}],"strategy":"tdd"}"#,
        )
        .unwrap();
        assert_eq!(hash_plan(&a).unwrap(), hash_plan(&b).unwrap());
    }
}
