//! Immutable contract model: roles, phases, gates, budgets, escalation chain.

mod lenient;
mod types;

pub use lenient::{decode_optional_list, LenientDecoded};
pub use types::{
    CompletionCriterion, Contract, EscalationPolicy, EscalationStep, GateOutcome, GateSpec,
    GlobalLifetime, InputSource, PhaseSpec, RequiredInput, RoleBudget, RoleSpec, SharedScope,
};
