//! Session event and outcome vocabulary.
//!
//! Fixed sum types with exhaustive handling; expected termination paths are
//! outcome values, never errors.

use serde::{Deserialize, Serialize};

/// Terminal events an agent session may emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionEvent {
    PhaseComplete {
        summary: String,
    },
    NeedsEscalation {
        reason: String,
        #[serde(default)]
        context: Option<String>,
    },
    Exception {
        reason: String,
        #[serde(default)]
        impact: Option<String>,
    },
    Questions {
        questions: Vec<String>,
    },
    Question {
        text: String,
    },
}

impl SessionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PhaseComplete { .. } => "PHASE_COMPLETE",
            Self::NeedsEscalation { .. } => "NEEDS_ESCALATION",
            Self::Exception { .. } => "EXCEPTION",
            Self::Questions { .. } => "QUESTIONS",
            Self::Question { .. } => "QUESTION",
        }
    }
}

/// How a supervised session ended. Exactly one of these is returned per
/// session; consuming the first event is terminal.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    Event(SessionEvent),
    /// Process exited without emitting any event.
    ExitedWithoutEvent,
    /// The health monitor stopped the session for inactivity.
    Inactive { idle_secs: u64 },
    /// The health monitor stopped the session for budget exhaustion.
    BudgetExceeded { budget: ExceededBudget },
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceededBudget {
    Role,
    Global,
}

impl SessionOutcome {
    pub fn describe(&self) -> String {
        match self {
            Self::Event(event) => event.kind().to_string(),
            Self::ExitedWithoutEvent => "exited_without_event".to_string(),
            Self::Inactive { idle_secs } => format!("inactive_{idle_secs}s"),
            Self::BudgetExceeded {
                budget: ExceededBudget::Role,
            } => "role_budget_exceeded".to_string(),
            Self::BudgetExceeded {
                budget: ExceededBudget::Global,
            } => "global_budget_exceeded".to_string(),
            Self::Cancelled => "cancelled".to_string(),
        }
    }
}
