//! Plan validation, topological ordering and execution layering.

use ao_core::{Subtask, SubtaskPlan};
use std::collections::{HashMap, VecDeque};

/// Ways a plan can be malformed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    /// Plan has no subtasks
    #[error("subtask plan must contain at least one subtask")]
    EmptyPlan,

    /// A subtask id is blank
    #[error("subtask id must be non-empty")]
    EmptyId,

    /// Two subtasks share an id
    #[error("duplicate subtask id: {0}")]
    DuplicateId(String),

    /// A subtask description is blank
    #[error("subtask {0} has empty description")]
    EmptyDescription(String),

    /// A dependency names a subtask outside the plan
    #[error("subtask {subtask} depends on unknown subtask {dependency}")]
    UnknownDependency {
        /// Dependent subtask
        subtask: String,
        /// Missing dependency
        dependency: String,
    },

    /// A subtask depends on itself
    #[error("subtask {0} cannot depend on itself")]
    SelfDependency(String),

    /// Depth-first search re-entered a subtask still on the stack
    #[error("circular dependency detected at {0}")]
    CircularDependency(String),

    /// Ordering emitted fewer subtasks than the plan holds
    #[error("subtask plan contains a cycle")]
    CycleDetected,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Visited,
}

/// Check that a plan is well formed and acyclic.
pub fn validate(plan: &SubtaskPlan) -> Result<(), PlanError> {
    if plan.subtasks.is_empty() {
        return Err(PlanError::EmptyPlan);
    }

    let mut by_id: HashMap<&str, &Subtask> = HashMap::with_capacity(plan.len());
    for subtask in &plan.subtasks {
        if subtask.id.trim().is_empty() {
            return Err(PlanError::EmptyId);
        }
        if by_id.insert(subtask.id.as_str(), subtask).is_some() {
            return Err(PlanError::DuplicateId(subtask.id.clone()));
        }
        if subtask.description.trim().is_empty() {
            return Err(PlanError::EmptyDescription(subtask.id.clone()));
        }
    }

    for subtask in &plan.subtasks {
        for dep in &subtask.depends_on {
            if !by_id.contains_key(dep.as_str()) {
                return Err(PlanError::UnknownDependency {
                    subtask: subtask.id.clone(),
                    dependency: dep.clone(),
                });
            }
            if *dep == subtask.id {
                return Err(PlanError::SelfDependency(subtask.id.clone()));
            }
        }
    }

    let mut marks: HashMap<&str, Mark> =
        by_id.keys().map(|id| (*id, Mark::Unvisited)).collect();
    for subtask in &plan.subtasks {
        visit(subtask.id.as_str(), &by_id, &mut marks)?;
    }

    Ok(())
}

fn visit<'a>(
    id: &'a str,
    by_id: &HashMap<&'a str, &'a Subtask>,
    marks: &mut HashMap<&'a str, Mark>,
) -> Result<(), PlanError> {
    match marks.get(id).copied().unwrap_or(Mark::Unvisited) {
        Mark::Visiting => return Err(PlanError::CircularDependency(id.to_string())),
        Mark::Visited => return Ok(()),
        Mark::Unvisited => {}
    }

    marks.insert(id, Mark::Visiting);
    if let Some(&subtask) = by_id.get(id) {
        for dep in &subtask.depends_on {
            visit(dep.as_str(), by_id, marks)?;
        }
    }
    marks.insert(id, Mark::Visited);
    Ok(())
}

/// Index-based dependency graph of a validated plan.
struct DepGraph<'a> {
    /// Subtasks in plan order
    nodes: Vec<&'a Subtask>,
    /// node -> unresolved dependency count
    indegree: Vec<usize>,
    /// node -> [dependents]
    children: Vec<Vec<usize>>,
}

impl<'a> DepGraph<'a> {
    fn new(plan: &'a SubtaskPlan) -> Result<Self, PlanError> {
        let index: HashMap<&str, usize> = plan
            .subtasks
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i))
            .collect();

        let mut indegree = vec![0; plan.len()];
        let mut children = vec![Vec::new(); plan.len()];
        for (i, subtask) in plan.subtasks.iter().enumerate() {
            for dep in &subtask.depends_on {
                let Some(&parent) = index.get(dep.as_str()) else {
                    return Err(PlanError::UnknownDependency {
                        subtask: subtask.id.clone(),
                        dependency: dep.clone(),
                    });
                };
                indegree[i] += 1;
                children[parent].push(i);
            }
        }

        Ok(Self {
            nodes: plan.subtasks.iter().collect(),
            indegree,
            children,
        })
    }

    fn roots(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.nodes.len()).filter(|&i| self.indegree[i] == 0)
    }

    /// Resolve `node`, pushing newly ready dependents into `ready`.
    fn resolve(&mut self, node: usize, ready: &mut impl Extend<usize>) {
        for &child in &self.children[node] {
            self.indegree[child] -= 1;
            if self.indegree[child] == 0 {
                ready.extend(Some(child));
            }
        }
    }
}

/// Order subtasks so every dependency precedes its dependents.
///
/// Kahn's algorithm with a FIFO queue, so ties keep plan order.
pub fn topological_sort(plan: &SubtaskPlan) -> Result<Vec<&Subtask>, PlanError> {
    validate(plan)?;

    let mut graph = DepGraph::new(plan)?;
    let mut queue: VecDeque<usize> = graph.roots().collect();
    let mut sorted = Vec::with_capacity(plan.len());

    while let Some(node) = queue.pop_front() {
        sorted.push(graph.nodes[node]);
        graph.resolve(node, &mut queue);
    }

    if sorted.len() != plan.len() {
        return Err(PlanError::CycleDetected);
    }
    Ok(sorted)
}

/// Partition subtasks into layers that can each run concurrently.
///
/// Every subtask lands in the earliest layer whose predecessors hold all of
/// its dependencies.
pub fn build_execution_layers(plan: &SubtaskPlan) -> Result<Vec<Vec<&Subtask>>, PlanError> {
    validate(plan)?;

    let mut graph = DepGraph::new(plan)?;
    let mut frontier: Vec<usize> = graph.roots().collect();
    let mut layers = Vec::new();
    let mut placed = 0;

    while !frontier.is_empty() {
        let current = std::mem::take(&mut frontier);
        placed += current.len();
        layers.push(current.iter().map(|&i| graph.nodes[i]).collect());
        for node in current {
            graph.resolve(node, &mut frontier);
        }
    }

    if placed != plan.len() {
        return Err(PlanError::CycleDetected);
    }
    Ok(layers)
}
