//! Scope, budget, and completion policy enforcement.

mod budget;
mod completion;
mod scope;

pub use budget::{check_budget, BudgetCheck, BudgetKind, BudgetUsage};
pub use completion::{
    verify_completion, CompletionContext, CompletionReport, CriterionOutcome,
};
pub use scope::{
    effective_scope, is_protected, verify_scope, OverrideKind, ScopeOverride, ScopeVerdict,
    ViolationSeverity, PROTECTED_PATHS,
};
