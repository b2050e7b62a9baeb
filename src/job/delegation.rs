//! Delegation plan: scope-hinted work items assigned to roles.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CovenantError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegatedTask {
    pub id: String,
    pub role_id: String,
    pub description: String,
    /// Glob hints for where the task's changes should land.
    #[serde(default)]
    pub scope_hints: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DelegationPlan {
    pub tasks: Vec<DelegatedTask>,
}

impl DelegationPlan {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CovenantError::DelegationPlan(format!("{}: {}", path.display(), e)))?;
        let plan: DelegationPlan = serde_json::from_str(&content)
            .map_err(|e| CovenantError::DelegationPlan(e.to_string()))?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn tasks_for(&self, role_id: &str) -> Vec<&DelegatedTask> {
        self.tasks.iter().filter(|t| t.role_id == role_id).collect()
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for task in &self.tasks {
            if !seen.insert(task.id.as_str()) {
                return Err(CovenantError::DelegationPlan(format!(
                    "duplicate task id: {}",
                    task.id
                )));
            }
        }
        for task in &self.tasks {
            for dep in &task.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(CovenantError::DelegationPlan(format!(
                        "task {} depends on unknown task {}",
                        task.id, dep
                    )));
                }
            }
        }
        if let Some(path) = self.detect_cycle() {
            return Err(CovenantError::DelegationCycle { path });
        }
        Ok(())
    }

    /// Iterative depth-first search with explicit visiting/visited sets and
    /// a path stack for cycle reporting. Deep task graphs must not recurse.
    pub fn detect_cycle(&self) -> Option<Vec<String>> {
        let graph: HashMap<&str, &[String]> = self
            .tasks
            .iter()
            .map(|t| (t.id.as_str(), t.depends_on.as_slice()))
            .collect();

        let mut visited: HashSet<&str> = HashSet::new();
        let mut visiting: HashSet<&str> = HashSet::new();

        for start in graph.keys() {
            if visited.contains(start) {
                continue;
            }

            // Stack frames: (node, index of the next dependency to explore).
            let mut stack: Vec<(&str, usize)> = vec![(start, 0)];
            let mut path: Vec<&str> = vec![start];
            visiting.insert(start);

            while let Some((node, next_dep)) = stack.last_mut() {
                let deps = graph.get(node).copied().unwrap_or(&[]);

                if *next_dep < deps.len() {
                    let dep = deps[*next_dep].as_str();
                    *next_dep += 1;

                    if visiting.contains(dep) {
                        let from = path.iter().position(|n| *n == dep).unwrap_or(0);
                        let mut cycle: Vec<String> =
                            path[from..].iter().map(|s| s.to_string()).collect();
                        cycle.push(dep.to_string());
                        return Some(cycle);
                    }
                    if !visited.contains(dep) && graph.contains_key(dep) {
                        visiting.insert(dep);
                        path.push(dep);
                        stack.push((dep, 0));
                    }
                } else {
                    visiting.remove(node);
                    visited.insert(node);
                    path.pop();
                    stack.pop();
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, deps: &[&str]) -> DelegatedTask {
        DelegatedTask {
            id: id.to_string(),
            role_id: "worker".into(),
            description: String::new(),
            scope_hints: Vec::new(),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    #[test]
    fn acyclic_plan_validates() {
        let plan = DelegationPlan {
            tasks: vec![task("a", &["b", "c"]), task("b", &["d"]), task("c", &["d"]), task("d", &[])],
        };
        assert!(plan.detect_cycle().is_none());
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn cycle_reported_with_path() {
        let plan = DelegationPlan {
            tasks: vec![task("a", &["b"]), task("b", &["c"]), task("c", &["a"])],
        };
        let cycle = plan.detect_cycle().expect("cycle");
        assert_eq!(cycle.first(), cycle.last());
        assert!(cycle.len() >= 3);
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let plan = DelegationPlan {
            tasks: vec![task("a", &["a"])],
        };
        assert!(plan.detect_cycle().is_some());
    }

    #[test]
    fn deep_chain_does_not_overflow() {
        let mut tasks = Vec::new();
        for i in 0..10_000 {
            let deps: Vec<&str> = Vec::new();
            let mut t = task(&format!("t{i}"), &deps);
            if i > 0 {
                t.depends_on.push(format!("t{}", i - 1));
            }
            tasks.push(t);
        }
        let plan = DelegationPlan { tasks };
        assert!(plan.detect_cycle().is_none());
    }

    #[test]
    fn unknown_dependency_rejected() {
        let plan = DelegationPlan {
            tasks: vec![task("a", &["ghost"])],
        };
        assert!(plan.validate().is_err());
    }

    #[test]
    fn tasks_for_filters_by_role() {
        let mut plan = DelegationPlan {
            tasks: vec![task("a", &[]), task("b", &[])],
        };
        plan.tasks[1].role_id = "reviewer".into();
        assert_eq!(plan.tasks_for("worker").len(), 1);
    }
}
