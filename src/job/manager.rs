//! The top-level job state machine.
//!
//! One manager drives one job against one workspace: the phase loop walks
//! each phase's actors in declared order from the persisted checkpoint,
//! runs plan and implement sessions, enforces scope and completion policy,
//! presents gates with fingerprint dedup, and ends in exactly one terminal
//! status. Terminal failures are outcomes, never errors.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, JobPaths};
use crate::contract::{Contract, GateOutcome, GateSpec, PhaseSpec, RoleSpec};
use crate::error::{CovenantError, Result};
use crate::evidence::EvidenceArchive;
use crate::gate::{ApprovalBoundary, GateController, GateDecision};
use crate::git::{DiffSummary, WorkspaceVcs};
use crate::ledger::{Ledger, LedgerEvent};
use crate::policy::{
    check_budget, verify_completion, verify_scope, BudgetKind, BudgetUsage, CompletionContext,
    CompletionReport, ScopeVerdict, ViolationSeverity,
};
use crate::session::{
    MonitorLimits, PermissionProfile, RoleContext, SessionBackend, SessionEvent, SessionMode,
    SessionOutcome, SessionSupervisor, SpawnRequest,
};

use super::delegation::DelegationPlan;
use super::escalation::{EscalationOutcome, EscalationRequest, Escalator};
use super::signal::CancelToken;
use super::state::{FeedbackEntry, JobState, JobStatus};

pub const DELEGATION_PLAN_FILE: &str = "delegation.json";

/// How a job ended. Every terminal path carries a machine-readable reason
/// and a structured details payload.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub reason: String,
    pub details: serde_json::Value,
}

enum RoleResult {
    Completed,
    Failed {
        reason: String,
        details: serde_json::Value,
    },
    GlobalBudgetExceeded,
    Cancelled,
}

enum GateRoute {
    Phase(String),
    Completed,
}

pub struct JobManager {
    contract: Contract,
    config: EngineConfig,
    paths: JobPaths,
    vcs: Arc<dyn WorkspaceVcs>,
    approval: Arc<dyn ApprovalBoundary>,
    supervisor: SessionSupervisor,
    ledger: Ledger,
    evidence: EvidenceArchive,
    state: JobState,
    delegation: Option<DelegationPlan>,
}

impl JobManager {
    /// Create a fresh job: directory layout, ledger, snapshot.
    pub fn create(
        job_id: &str,
        contract: Contract,
        config: EngineConfig,
        state_dir: &Path,
        workspace_root: &Path,
        vcs: Arc<dyn WorkspaceVcs>,
        backend: Arc<dyn SessionBackend>,
        approval: Arc<dyn ApprovalBoundary>,
    ) -> Result<Self> {
        contract.validate()?;

        let paths = JobPaths::new(state_dir, job_id);
        paths.ensure()?;

        let mut ledger = Ledger::open(&paths.ledger_path)?;
        let evidence = EvidenceArchive::new(&paths.evidence_dir)?;
        let state = JobState::new(job_id, &contract, workspace_root)?;

        ledger.append(LedgerEvent::JobCreated {
            job_id: job_id.to_string(),
            contract: contract.name.clone(),
        })?;
        state.save(&paths.snapshot_path)?;

        info!(job_id, contract = contract.name, "Job created");

        let supervisor = SessionSupervisor::new(backend, config.session.clone());
        Ok(Self {
            contract,
            config,
            paths,
            vcs,
            approval,
            supervisor,
            ledger,
            evidence,
            state,
            delegation: None,
        })
    }

    /// Rehydrate a job from its last persisted snapshot plus the on-disk
    /// delegation plan, re-entering the loop at the checkpointed cursor.
    pub fn resume(
        job_id: &str,
        contract: Contract,
        config: EngineConfig,
        state_dir: &Path,
        vcs: Arc<dyn WorkspaceVcs>,
        backend: Arc<dyn SessionBackend>,
        approval: Arc<dyn ApprovalBoundary>,
    ) -> Result<Self> {
        contract.validate()?;

        let paths = JobPaths::new(state_dir, job_id);
        if !paths.snapshot_path.exists() {
            return Err(CovenantError::JobNotFound(job_id.to_string()));
        }

        let state = JobState::load(&paths.snapshot_path)?;
        let ledger = Ledger::open(&paths.ledger_path)?;
        let evidence = EvidenceArchive::new(&paths.evidence_dir)?;

        let plan_path = paths.planning_dir.join(DELEGATION_PLAN_FILE);
        let delegation = if plan_path.exists() {
            Some(DelegationPlan::load(&plan_path)?)
        } else {
            None
        };

        info!(
            job_id,
            status = %state.status,
            phase = state.current_phase_id,
            actor_index = state.current_actor_index,
            "Job resumed from checkpoint"
        );

        let supervisor = SessionSupervisor::new(backend, config.session.clone());
        Ok(Self {
            contract,
            config,
            paths,
            vcs,
            approval,
            supervisor,
            ledger,
            evidence,
            state,
            delegation,
        })
    }

    pub fn state(&self) -> &JobState {
        &self.state
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Drive the job to a terminal status.
    pub async fn run(&mut self, cancel: &CancelToken) -> Result<JobOutcome> {
        if self.state.status.is_terminal() {
            return Err(CovenantError::InvalidStatusTransition {
                from: self.state.status.as_str().to_string(),
                to: JobStatus::Executing.as_str().to_string(),
                allowed: String::new(),
            });
        }
        if self.state.status != JobStatus::Executing {
            self.set_status(JobStatus::Executing, "run loop entered")?;
        }

        loop {
            // Global wall-time budget, checked on every loop iteration and
            // therefore before any session is spawned.
            if self.global_budget_exhausted() {
                return self.finish(
                    JobStatus::BudgetExceeded,
                    "budget_exceeded",
                    json!({ "budget": "global", "max_time_ms": self.contract.global_lifetime.max_time_ms }),
                );
            }
            if cancel.is_cancelled() {
                return self.finish(JobStatus::Cancelled, "cancelled", json!({}));
            }

            let phase = self.contract.phase(&self.state.current_phase_id)?.clone();

            if self.state.current_actor_index < phase.actors.len() {
                let role_id = phase.actors[self.state.current_actor_index].clone();
                match self.run_role(&phase, &role_id, cancel).await? {
                    RoleResult::Completed => {
                        self.state.current_actor_index += 1;
                        self.state.current_role_id = None;
                        self.checkpoint()?;
                    }
                    RoleResult::Failed { reason, details } => {
                        return self.finish(JobStatus::Failed, &reason, details);
                    }
                    RoleResult::GlobalBudgetExceeded => {
                        return self.finish(
                            JobStatus::BudgetExceeded,
                            "budget_exceeded",
                            json!({ "budget": "global" }),
                        );
                    }
                    RoleResult::Cancelled => {
                        return self.finish(JobStatus::Cancelled, "cancelled", json!({}));
                    }
                }
                continue;
            }

            // All actors finished; route the outgoing transition.
            if let Some(gate) = self.contract.gate_for_phase(&phase.id).cloned() {
                match self.resolve_gate(&phase, &gate).await? {
                    GateRoute::Phase(next) => {
                        self.state.enter_phase(&next);
                        self.ledger.append(LedgerEvent::PhaseEntered {
                            phase_id: next.clone(),
                        })?;
                        self.checkpoint()?;
                    }
                    GateRoute::Completed => {
                        return self.finish(JobStatus::Completed, "completed", json!({}));
                    }
                }
                continue;
            }

            if phase.terminal {
                return self.finish(JobStatus::Completed, "completed", json!({}));
            }

            let next = self.successor_of(&phase)?;
            self.state.enter_phase(&next);
            self.ledger
                .append(LedgerEvent::PhaseEntered { phase_id: next })?;
            self.checkpoint()?;
        }
    }

    /// Unguarded routing: the `success` label, or the single declared
    /// successor when the map has exactly one entry.
    fn successor_of(&self, phase: &PhaseSpec) -> Result<String> {
        if let Some(next) = phase.successors.get("success") {
            return Ok(next.clone());
        }
        if phase.successors.len() == 1 {
            return Ok(phase.successors.values().next().cloned().unwrap_or_default());
        }
        Err(CovenantError::ContractInvalid(format!(
            "phase {} has no routable successor",
            phase.id
        )))
    }

    fn global_budget_exhausted(&self) -> bool {
        let elapsed_ms = (Utc::now() - self.state.started_at)
            .num_milliseconds()
            .max(0) as u64;
        elapsed_ms >= self.contract.global_lifetime.max_time_ms
    }

    fn remaining_global_ms(&self) -> u64 {
        let elapsed_ms = (Utc::now() - self.state.started_at)
            .num_milliseconds()
            .max(0) as u64;
        self.contract.global_lifetime.max_time_ms.saturating_sub(elapsed_ms)
    }

    async fn run_role(
        &mut self,
        phase: &PhaseSpec,
        role_id: &str,
        cancel: &CancelToken,
    ) -> Result<RoleResult> {
        let role = self.contract.role(role_id)?.clone();
        self.state.current_role_id = Some(role.id.clone());
        self.checkpoint()?;

        if role.delegated && !self.plan_marker(phase, &role).exists() {
            match self.run_plan_step(phase, &role, cancel).await? {
                Some(interrupt) => return Ok(interrupt),
                None => {}
            }
        }

        let mut last_failure = json!({});
        let mut extra_allowance = 0u32;

        loop {
            if self.global_budget_exhausted() {
                return Ok(RoleResult::GlobalBudgetExceeded);
            }
            if cancel.is_cancelled() {
                return Ok(RoleResult::Cancelled);
            }

            let used = self.state.attempts_for(&phase.id, &role.id);
            if used >= role.budget.max_iterations + extra_allowance {
                // One escalation per exhaustion event.
                self.ledger.append(LedgerEvent::EscalationRaised {
                    role_id: role.id.clone(),
                    reason: "iteration_budget_exhausted".to_string(),
                })?;
                match self
                    .escalate(&role, phase, "iteration budget exhausted", &[], used, cancel)
                    .await?
                {
                    EscalationOutcome::Granted(grant) => {
                        self.install_grant(grant)?;
                        extra_allowance += 1;
                        continue;
                    }
                    EscalationOutcome::Denied { detail }
                    | EscalationOutcome::Exhausted { detail } => {
                        return Ok(RoleResult::Failed {
                            reason: "iteration_budget_exhausted".to_string(),
                            details: json!({
                                "role": role.id,
                                "escalation": detail,
                                "last_failure": last_failure,
                            }),
                        });
                    }
                }
            }

            let attempt = self.state.begin_attempt(&phase.id, &role.id);
            self.checkpoint()?;

            let base = self.vcs.head_commit().await?;
            let seq = self.ledger.append(LedgerEvent::SessionStarted {
                role_id: role.id.clone(),
                phase_id: phase.id.clone(),
                mode: SessionMode::Implement.to_string(),
                attempt,
            })?;

            let outcome = self
                .run_session(phase, &role, SessionMode::Implement, attempt, cancel)
                .await?;
            self.ledger.append(LedgerEvent::SessionOutcome {
                role_id: role.id.clone(),
                outcome: outcome.describe(),
                detail: outcome_detail(&outcome),
            })?;

            let event = match &outcome {
                SessionOutcome::Cancelled => return Ok(RoleResult::Cancelled),
                SessionOutcome::BudgetExceeded { budget }
                    if *budget == crate::session::ExceededBudget::Global =>
                {
                    return Ok(RoleResult::GlobalBudgetExceeded)
                }
                SessionOutcome::Event(event) => Some(event.clone()),
                // Inactivity, crash, no-event exit, role time budget: an
                // unproductive attempt, retried like a failure.
                _ => None,
            };

            match event {
                Some(SessionEvent::PhaseComplete { summary }) => {
                    match self
                        .verify_attempt(phase, &role, &base, seq, attempt, &summary, cancel)
                        .await?
                    {
                        AttemptVerdict::Completed => return Ok(RoleResult::Completed),
                        AttemptVerdict::Retry { failure } => {
                            last_failure = failure;
                        }
                        AttemptVerdict::RetryRefunded => {
                            self.state.refund_attempt(&phase.id, &role.id);
                            self.checkpoint()?;
                        }
                        AttemptVerdict::Failed { reason, details } => {
                            return Ok(RoleResult::Failed { reason, details })
                        }
                    }
                }
                Some(SessionEvent::NeedsEscalation { reason, context }) => {
                    self.discard_working_tree(&base).await?;
                    self.ledger.append(LedgerEvent::EscalationRaised {
                        role_id: role.id.clone(),
                        reason: reason.clone(),
                    })?;
                    match self
                        .escalate(&role, phase, &reason, &[], attempt, cancel)
                        .await?
                    {
                        EscalationOutcome::Granted(grant) => {
                            self.install_grant(grant)?;
                        }
                        EscalationOutcome::Denied { detail }
                        | EscalationOutcome::Exhausted { detail } => {
                            return Ok(RoleResult::Failed {
                                reason: "escalation_denied".to_string(),
                                details: json!({
                                    "role": role.id,
                                    "requested": reason,
                                    "context": context,
                                    "escalation": detail,
                                }),
                            });
                        }
                    }
                }
                Some(SessionEvent::Exception { reason, impact }) => {
                    self.discard_working_tree(&base).await?;
                    return Ok(RoleResult::Failed {
                        reason: "session_exception".to_string(),
                        details: json!({
                            "role": role.id,
                            "reason": reason,
                            "impact": impact,
                        }),
                    });
                }
                Some(SessionEvent::Questions { questions }) => {
                    self.discard_working_tree(&base).await?;
                    last_failure = json!({ "questions": questions });
                    self.push_feedback(
                        &role.id,
                        FeedbackEntry {
                            attempt,
                            scope_violations: vec![],
                            failed_criteria: vec![],
                            hints: vec![format!(
                                "No interactive answers are available. Use your best judgment on: {}",
                                questions.join("; ")
                            )],
                        },
                    )?;
                }
                Some(SessionEvent::Question { text }) => {
                    self.discard_working_tree(&base).await?;
                    last_failure = json!({ "question": text });
                    self.push_feedback(
                        &role.id,
                        FeedbackEntry {
                            attempt,
                            scope_violations: vec![],
                            failed_criteria: vec![],
                            hints: vec![format!(
                                "No interactive answers are available. Use your best judgment on: {text}"
                            )],
                        },
                    )?;
                }
                None => {
                    self.discard_working_tree(&base).await?;
                    last_failure = json!({ "session": outcome_detail(&outcome) });
                    self.push_feedback(
                        &role.id,
                        FeedbackEntry {
                            attempt,
                            scope_violations: vec![],
                            failed_criteria: vec![],
                            hints: vec![
                                "The previous session ended without a terminal event. \
                                 Finish with PHASE_COMPLETE and a summary."
                                    .to_string(),
                            ],
                        },
                    )?;
                }
            }
        }
    }

    /// Scope and completion verification for one PHASE_COMPLETE attempt.
    async fn verify_attempt(
        &mut self,
        phase: &PhaseSpec,
        role: &RoleSpec,
        base: &str,
        seq: u64,
        attempt: u32,
        summary: &str,
        cancel: &CancelToken,
    ) -> Result<AttemptVerdict> {
        let diff = self.vcs.diff_since(base).await?;
        if !diff.patch.is_empty() {
            if let Err(e) = self.evidence.store_text(seq, "diff", &diff.patch) {
                warn!(error = %e, "Failed to archive diff evidence");
            }
        }

        let verdict = verify_scope(
            &diff,
            role,
            &self.contract,
            &self.state.overrides,
            &phase.id,
            attempt,
            self.config.policy.structural_violation_threshold,
        );

        if let ScopeVerdict::Violation { paths, severity } = verdict {
            self.vcs.hard_reset(base).await?;
            self.vcs.clean_untracked().await?;
            self.ledger.append(LedgerEvent::ScopeViolation {
                role_id: role.id.clone(),
                severity: severity.to_string(),
                paths: paths.clone(),
            })?;

            if severity == ViolationSeverity::Structural {
                self.ledger.append(LedgerEvent::SessionReverted {
                    role_id: role.id.clone(),
                    phase_id: phase.id.clone(),
                    attempt,
                    violations: paths.clone(),
                })?;
                self.ledger.append(LedgerEvent::EscalationRaised {
                    role_id: role.id.clone(),
                    reason: "structural_scope_violation".to_string(),
                })?;
                return match self
                    .escalate(role, phase, "structural scope violation", &paths, attempt, cancel)
                    .await?
                {
                    EscalationOutcome::Granted(grant) => {
                        self.install_grant(grant)?;
                        // A granted exception retries without consuming a
                        // normal attempt.
                        Ok(AttemptVerdict::RetryRefunded)
                    }
                    EscalationOutcome::Denied { detail }
                    | EscalationOutcome::Exhausted { detail } => Ok(AttemptVerdict::Failed {
                        reason: "structural_scope_violation".to_string(),
                        details: json!({
                            "role": role.id,
                            "paths": paths,
                            "escalation": detail,
                        }),
                    }),
                };
            }

            // Advisory: retry with a hard blocklist, provided budget remains.
            let retry_remains =
                self.state.attempts_for(&phase.id, &role.id) < role.budget.max_iterations;
            if retry_remains {
                self.ledger.append(LedgerEvent::SessionReverted {
                    role_id: role.id.clone(),
                    phase_id: phase.id.clone(),
                    attempt,
                    violations: paths.clone(),
                })?;
            }
            self.push_feedback(
                &role.id,
                FeedbackEntry {
                    attempt,
                    scope_violations: paths.clone(),
                    failed_criteria: vec![],
                    hints: vec![format!(
                        "Do not modify these paths, they are outside your scope: {}",
                        paths.join(", ")
                    )],
                },
            )?;
            return Ok(AttemptVerdict::Retry {
                failure: json!({ "scope_violations": paths }),
            });
        }

        // Diff-line budget, independent of any declared criterion. Wall
        // time is enforced live by the health monitor and iterations by
        // the retry loop, so only the diff measurement matters here.
        let usage = BudgetUsage {
            iterations: attempt,
            elapsed_ms: 0,
            diff_lines: diff.total_lines(),
        };
        if check_budget(&usage, &role.budget)
            .exceeded
            .contains(&BudgetKind::DiffLines)
        {
            self.vcs.hard_reset(base).await?;
            self.vcs.clean_untracked().await?;
            self.ledger.append(LedgerEvent::EscalationRaised {
                role_id: role.id.clone(),
                reason: "diff_budget_exhausted".to_string(),
            })?;
            return match self
                .escalate(role, phase, "diff line budget exhausted", &[], attempt, cancel)
                .await?
            {
                EscalationOutcome::Granted(grant) => {
                    self.install_grant(grant)?;
                    self.push_feedback(
                        &role.id,
                        FeedbackEntry {
                            attempt,
                            scope_violations: vec![],
                            failed_criteria: vec![],
                            hints: vec![format!(
                                "The change was {} lines against a budget of {}. \
                                 Split the work into smaller steps.",
                                usage.diff_lines, role.budget.max_diff_lines
                            )],
                        },
                    )?;
                    Ok(AttemptVerdict::Retry {
                        failure: json!({ "diff_lines": usage.diff_lines }),
                    })
                }
                EscalationOutcome::Denied { .. } | EscalationOutcome::Exhausted { .. } => {
                    Ok(AttemptVerdict::Failed {
                        reason: "diff_budget_exhausted".to_string(),
                        details: json!({
                            "role": role.id,
                            "diff_lines": usage.diff_lines,
                            "max_diff_lines": role.budget.max_diff_lines,
                        }),
                    })
                }
            };
        }

        // Scope passed; evaluate the phase's completion criteria.
        let report = {
            let ctx = CompletionContext {
                workspace: self.state.workspace.effective_root(),
                planning_dir: &self.paths.planning_dir,
                role,
                diff: &diff,
                budget: &role.budget,
                delegation: self.delegation.as_ref(),
                evidence: &self.evidence,
                evidence_seq: seq,
                config: &self.config.policy,
            };
            verify_completion(phase, &ctx).await?
        };

        self.ledger.append(LedgerEvent::CompletionChecked {
            role_id: role.id.clone(),
            phase_id: phase.id.clone(),
            passed: report.passed(),
            failed: report.failed_keys().iter().map(|s| s.to_string()).collect(),
            deferred: report.deferred_keys().iter().map(|s| s.to_string()).collect(),
        })?;

        if report.passed() {
            self.commit_attempt(role, phase, attempt, &diff).await?;
            self.ledger.append(LedgerEvent::RoleCompleted {
                role_id: role.id.clone(),
                phase_id: phase.id.clone(),
                summary: summary.to_string(),
            })?;
            return Ok(AttemptVerdict::Completed);
        }

        let signature = report.signature();
        if self.previous_signature(&role.id, attempt).as_deref() == Some(signature.as_str()) {
            // An agent that fails the same check twice in a row is unlikely
            // to self-correct with more of the same budget.
            self.ledger.append(LedgerEvent::EscalationRaised {
                role_id: role.id.clone(),
                reason: "repeated_completion_failure".to_string(),
            })?;
            return match self
                .escalate(role, phase, "repeated completion failure", &[], attempt, cancel)
                .await?
            {
                EscalationOutcome::Granted(grant) => {
                    self.install_grant(grant)?;
                    self.record_completion_feedback(role, attempt, &report, &diff, phase).await?;
                    Ok(AttemptVerdict::Retry {
                        failure: json!({ "failed_criteria": signature }),
                    })
                }
                EscalationOutcome::Denied { .. } | EscalationOutcome::Exhausted { .. } => {
                    Ok(AttemptVerdict::Failed {
                        reason: "repeated_completion_failure".to_string(),
                        details: json!({
                            "role": role.id,
                            "failed_criteria": report
                                .failed_keys()
                                .iter()
                                .map(|s| s.to_string())
                                .collect::<Vec<_>>(),
                        }),
                    })
                }
            };
        }

        self.record_completion_feedback(role, attempt, &report, &diff, phase).await?;
        Ok(AttemptVerdict::Retry {
            failure: json!({ "failed_criteria": report
                .failed_keys()
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>() }),
        })
    }

    /// A completion failure keeps the diff: commit it so the next attempt
    /// builds on the partial work, then record hint feedback.
    async fn record_completion_feedback(
        &mut self,
        role: &RoleSpec,
        attempt: u32,
        report: &CompletionReport,
        diff: &DiffSummary,
        phase: &PhaseSpec,
    ) -> Result<()> {
        if !diff.is_empty() {
            self.commit_attempt(role, phase, attempt, diff).await?;
        }
        self.push_feedback(
            &role.id,
            FeedbackEntry {
                attempt,
                scope_violations: vec![],
                failed_criteria: report.failed_keys().iter().map(|s| s.to_string()).collect(),
                hints: report.hints(),
            },
        )?;
        Ok(())
    }

    async fn commit_attempt(
        &self,
        role: &RoleSpec,
        phase: &PhaseSpec,
        attempt: u32,
        diff: &DiffSummary,
    ) -> Result<()> {
        if diff.is_empty() {
            return Ok(());
        }
        let message = format!(
            "{} {}: {} attempt {}",
            self.config.git.commit_prefix, phase.id, role.id, attempt
        );
        self.vcs.commit_all(&message).await?;
        Ok(())
    }

    /// Failure signature of the immediately preceding attempt, if any.
    fn previous_signature(&self, role_id: &str, attempt: u32) -> Option<String> {
        let previous = self
            .state
            .feedback_for(role_id)
            .iter()
            .rev()
            .find(|e| e.attempt + 1 == attempt && !e.failed_criteria.is_empty())?;
        let mut keys: Vec<&str> = previous.failed_criteria.iter().map(String::as_str).collect();
        keys.sort_unstable();
        Some(keys.join("+"))
    }

    async fn discard_working_tree(&self, base: &str) -> Result<()> {
        let diff = self.vcs.diff_since(base).await?;
        if !diff.is_empty() {
            self.vcs.hard_reset(base).await?;
            self.vcs.clean_untracked().await?;
        }
        Ok(())
    }

    /// Plan sub-step for delegated roles: a read-only session that stages a
    /// role-local implementation plan. Does not consume the attempt budget.
    async fn run_plan_step(
        &mut self,
        phase: &PhaseSpec,
        role: &RoleSpec,
        cancel: &CancelToken,
    ) -> Result<Option<RoleResult>> {
        if self.global_budget_exhausted() {
            return Ok(Some(RoleResult::GlobalBudgetExceeded));
        }

        self.ledger.append(LedgerEvent::SessionStarted {
            role_id: role.id.clone(),
            phase_id: phase.id.clone(),
            mode: SessionMode::Plan.to_string(),
            attempt: 0,
        })?;

        let outcome = self
            .run_session(phase, role, SessionMode::Plan, 0, cancel)
            .await?;
        self.ledger.append(LedgerEvent::SessionOutcome {
            role_id: role.id.clone(),
            outcome: outcome.describe(),
            detail: outcome_detail(&outcome),
        })?;

        match outcome {
            SessionOutcome::Cancelled => return Ok(Some(RoleResult::Cancelled)),
            SessionOutcome::BudgetExceeded { budget }
                if budget == crate::session::ExceededBudget::Global =>
            {
                return Ok(Some(RoleResult::GlobalBudgetExceeded))
            }
            SessionOutcome::Event(SessionEvent::PhaseComplete { .. }) => {}
            // An unproductive plan session leaves the marker unwritten, so
            // the step is re-attempted on the next run.
            _ => {
                warn!(role_id = role.id, "Plan session ended without completing");
                return Ok(None);
            }
        }

        self.promote_staging_to_planning()?;
        std::fs::write(self.plan_marker(phase, role), b"")?;

        let plan_path = self.paths.planning_dir.join(DELEGATION_PLAN_FILE);
        if plan_path.exists() {
            self.delegation = Some(DelegationPlan::load(&plan_path)?);
        }

        Ok(None)
    }

    fn plan_marker(&self, phase: &PhaseSpec, role: &RoleSpec) -> std::path::PathBuf {
        self.paths
            .planning_dir
            .join(format!(".planned-{}-{}", phase.id, role.id))
    }

    /// Move everything the plan session staged into the planning tree the
    /// gate fingerprint hashes.
    fn promote_staging_to_planning(&self) -> Result<()> {
        for entry in walkdir::WalkDir::new(&self.paths.staging_dir) {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&self.paths.staging_dir)
                .map_err(|e| CovenantError::Workspace(e.to_string()))?;
            let dest = self.paths.planning_dir.join(rel);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::rename(entry.path(), &dest)
                .or_else(|_| std::fs::copy(entry.path(), &dest).map(|_| ()))?;
        }
        Ok(())
    }

    async fn run_session(
        &self,
        phase: &PhaseSpec,
        role: &RoleSpec,
        mode: SessionMode,
        attempt: u32,
        cancel: &CancelToken,
    ) -> Result<SessionOutcome> {
        let prompt = RoleContext {
            role,
            phase,
            contract: &self.contract,
            mode,
            delegation: self.delegation.as_ref(),
            feedback: self.state.feedback_for(&role.id),
            attempt,
        }
        .compile();

        let permissions =
            PermissionProfile::derive(role, &self.contract, &self.paths.staging_dir, mode);

        let request = SpawnRequest {
            role_id: role.id.clone(),
            workspace: self.state.workspace.effective_root().to_path_buf(),
            env: Default::default(),
            permissions,
            log_path: Some(self.paths.job_dir.join(format!("{}.log", role.id))),
        };

        let now = tokio::time::Instant::now();
        let limits = MonitorLimits {
            inactivity_timeout: self.config.session.inactivity_timeout(),
            role_deadline: Some(now + Duration::from_millis(role.budget.max_time_ms)),
            global_deadline: Some(now + Duration::from_millis(self.remaining_global_ms())),
        };

        self.supervisor.run(request, &prompt, limits, cancel).await
    }

    async fn escalate(
        &mut self,
        role: &RoleSpec,
        phase: &PhaseSpec,
        reason: &str,
        violating_paths: &[String],
        attempt: u32,
        cancel: &CancelToken,
    ) -> Result<EscalationOutcome> {
        let outcome = {
            let escalator = Escalator {
                supervisor: &self.supervisor,
                contract: &self.contract,
                workspace: self.state.workspace.effective_root(),
                escalations_dir: &self.paths.escalation_dir,
            };
            let request = EscalationRequest {
                role_id: &role.id,
                phase_id: &phase.id,
                reason,
                violating_paths,
                attempt,
            };
            escalator.run(&request, cancel).await?
        };

        let (granted, detail) = match &outcome {
            EscalationOutcome::Granted(grant) => (true, format!("granted: {:?}", grant.patterns)),
            EscalationOutcome::Denied { detail } => (false, detail.clone()),
            EscalationOutcome::Exhausted { detail } => (false, detail.clone()),
        };
        self.ledger.append(LedgerEvent::EscalationResolved {
            role_id: role.id.clone(),
            granted,
            detail,
        })?;

        Ok(outcome)
    }

    fn install_grant(&mut self, grant: crate::policy::ScopeOverride) -> Result<()> {
        let kind = match grant.kind {
            crate::policy::OverrideKind::ExtraScope => "extra_scope",
            crate::policy::OverrideKind::SharedScope => "shared_scope",
        };
        self.ledger.append(LedgerEvent::OverrideInstalled {
            owner_role: grant.owner_role.clone(),
            kind: kind.to_string(),
            patterns: grant.patterns.clone(),
            phase: grant.phase.clone(),
            expires_after_attempt: grant.expires_after_attempt,
        })?;
        self.state.install_override(grant);
        self.checkpoint()
    }

    /// Gate resolution with content-addressed dedup: an unchanged
    /// fingerprint replays the prior decision with no new presentation.
    async fn resolve_gate(&mut self, phase: &PhaseSpec, gate: &GateSpec) -> Result<GateRoute> {
        self.state.pending_gate = Some(gate.id.clone());
        self.set_status(JobStatus::Paused, "awaiting gate decision")?;

        let controller = GateController::new(
            self.state.workspace.effective_root(),
            &self.paths.planning_dir,
            self.config.gate.input_preview_bytes,
        );
        let inputs = controller.collect_inputs(gate)?;
        let fingerprint = controller.fingerprint(gate, &inputs, phase.planning)?;

        let prior = self.ledger.last_matching(|entry| {
            matches!(&entry.event, LedgerEvent::GateResolved { gate_id, .. } if *gate_id == gate.id)
        })?;

        let decision = match prior {
            Some(entry) => match &entry.event {
                LedgerEvent::GateResolved {
                    decision,
                    fingerprint: prior_fp,
                    ..
                } if *prior_fp == fingerprint => {
                    debug!(gate_id = gate.id, "Fingerprint unchanged, replaying decision");
                    let replayed = parse_decision(decision)?;
                    self.ledger.append(LedgerEvent::GateResolved {
                        gate_id: gate.id.clone(),
                        decision: replayed.as_str().to_string(),
                        fingerprint: fingerprint.clone(),
                        replayed: true,
                    })?;
                    replayed
                }
                _ => self.present_gate(gate, &controller, inputs, &fingerprint).await?,
            },
            None => self.present_gate(gate, &controller, inputs, &fingerprint).await?,
        };

        self.state.pending_gate = None;
        self.set_status(JobStatus::Executing, "gate resolved")?;

        let outcome = match decision {
            GateDecision::Approve => &gate.on_approve,
            // An exception decision follows the reject route; the notes are
            // already on the resolution entry.
            GateDecision::Reject | GateDecision::Exception => &gate.on_reject,
        };
        Ok(match outcome {
            GateOutcome::Phase { phase } => GateRoute::Phase(phase.clone()),
            GateOutcome::Completed => GateRoute::Completed,
        })
    }

    async fn present_gate(
        &mut self,
        gate: &GateSpec,
        controller: &GateController,
        inputs: Vec<crate::gate::ResolvedInput>,
        fingerprint: &str,
    ) -> Result<GateDecision> {
        let seq = self.ledger.append(LedgerEvent::GatePresented {
            gate_id: gate.id.clone(),
            fingerprint: fingerprint.to_string(),
        })?;

        let model = controller.prompt_model(gate, inputs, fingerprint.to_string());
        if let Err(e) = self
            .evidence
            .store_text(seq, &format!("gate-{}", gate.id), &model.render())
        {
            warn!(error = %e, "Failed to archive gate prompt");
        }

        let resolution = controller.present(gate, &model, self.approval.as_ref()).await?;
        self.ledger.append(LedgerEvent::GateResolved {
            gate_id: gate.id.clone(),
            decision: resolution.decision.as_str().to_string(),
            fingerprint: fingerprint.to_string(),
            replayed: false,
        })?;
        Ok(resolution.decision)
    }

    fn push_feedback(&mut self, role_id: &str, entry: FeedbackEntry) -> Result<()> {
        self.state
            .push_feedback(role_id, entry, self.config.policy.feedback_history_len);
        self.checkpoint()
    }

    fn set_status(&mut self, to: JobStatus, reason: &str) -> Result<()> {
        let from = self.state.status;
        self.state.transition(to)?;
        self.ledger.append(LedgerEvent::StatusChanged {
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
            reason: reason.to_string(),
        })?;
        self.checkpoint()
    }

    fn checkpoint(&self) -> Result<()> {
        self.state.save(&self.paths.snapshot_path)
    }

    fn finish(
        &mut self,
        status: JobStatus,
        reason: &str,
        details: serde_json::Value,
    ) -> Result<JobOutcome> {
        self.set_status(status, reason)?;
        self.ledger.append(LedgerEvent::JobFinished {
            status: status.as_str().to_string(),
            reason: reason.to_string(),
            details: details.clone(),
        })?;
        self.checkpoint()?;

        info!(job_id = self.state.job_id, status = %status, reason, "Job finished");
        Ok(JobOutcome {
            status,
            reason: reason.to_string(),
            details,
        })
    }
}

enum AttemptVerdict {
    Completed,
    Retry { failure: serde_json::Value },
    /// Retry that does not consume the attempt budget.
    RetryRefunded,
    Failed {
        reason: String,
        details: serde_json::Value,
    },
}

fn parse_decision(raw: &str) -> Result<GateDecision> {
    match raw {
        "approve" => Ok(GateDecision::Approve),
        "reject" => Ok(GateDecision::Reject),
        "exception" => Ok(GateDecision::Exception),
        other => Err(CovenantError::Gate(format!("unknown recorded decision: {other}"))),
    }
}

fn outcome_detail(outcome: &SessionOutcome) -> String {
    match outcome {
        SessionOutcome::Event(event) => event.kind().to_string(),
        SessionOutcome::ExitedWithoutEvent => "process exited without a terminal event".into(),
        SessionOutcome::Inactive { idle_secs } => format!("inactive for {idle_secs}s"),
        SessionOutcome::BudgetExceeded { budget } => format!("{budget:?} time budget exceeded"),
        SessionOutcome::Cancelled => "cancelled".into(),
    }
}
