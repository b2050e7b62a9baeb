//! Role budget checks, independent of scope.

use serde::{Deserialize, Serialize};

use crate::contract::RoleBudget;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BudgetUsage {
    pub iterations: u32,
    pub elapsed_ms: u64,
    pub diff_lines: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetKind {
    Iterations,
    WallTime,
    DiffLines,
}

impl std::fmt::Display for BudgetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Iterations => write!(f, "iterations"),
            Self::WallTime => write!(f, "wall time"),
            Self::DiffLines => write!(f, "diff lines"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BudgetCheck {
    pub exceeded: Vec<BudgetKind>,
}

impl BudgetCheck {
    pub fn within_budget(&self) -> bool {
        self.exceeded.is_empty()
    }
}

pub fn check_budget(usage: &BudgetUsage, budget: &RoleBudget) -> BudgetCheck {
    let mut exceeded = Vec::new();

    if usage.iterations > budget.max_iterations {
        exceeded.push(BudgetKind::Iterations);
    }
    if usage.elapsed_ms > budget.max_time_ms {
        exceeded.push(BudgetKind::WallTime);
    }
    if usage.diff_lines > budget.max_diff_lines {
        exceeded.push(BudgetKind::DiffLines);
    }

    BudgetCheck { exceeded }
}
