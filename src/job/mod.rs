//! Job orchestration: the state machine driving a job to a terminal state.

pub mod delegation;
pub mod escalation;
pub mod manager;
pub mod signal;
pub mod state;

pub use delegation::{DelegatedTask, DelegationPlan};
pub use escalation::{EscalationDecision, EscalationOutcome, EscalationRequest, Escalator};
pub use manager::{JobManager, JobOutcome, DELEGATION_PLAN_FILE};
pub use signal::CancelToken;
pub use state::{FeedbackEntry, JobState, JobStatus, WorkspaceBinding};
