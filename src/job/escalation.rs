//! Escalation: the contract-declared handoff when a role cannot proceed.
//!
//! Walks the escalation chain, spawns a dedicated session for the target
//! role with an isolated log, and lenient-parses the staged decision file
//! it leaves behind. The decision artifact comes from an external agent,
//! so its shape is validated defensively rather than trusted.

use std::path::{Path, PathBuf};
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::contract::{Contract, EscalationPolicy};
use crate::error::Result;
use crate::policy::{OverrideKind, ScopeOverride, PROTECTED_PATHS};
use crate::session::{
    MonitorLimits, PermissionProfile, SessionMode, SessionSupervisor, SpawnRequest,
};

use super::signal::CancelToken;

pub struct EscalationRequest<'a> {
    pub role_id: &'a str,
    pub phase_id: &'a str,
    pub reason: &'a str,
    pub violating_paths: &'a [String],
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EscalationOutcome {
    Granted(ScopeOverride),
    Denied { detail: String },
    /// No further chain step, or the step's policy is terminate.
    Exhausted { detail: String },
}

/// The staged decision artifact an escalation session is asked to produce.
/// Only `grant` is required; everything else has a request-derived default.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EscalationDecision {
    pub grant: bool,
    #[serde(default)]
    pub kind: Option<OverrideKind>,
    #[serde(default)]
    pub owner_role: Option<String>,
    #[serde(default)]
    pub patterns: Option<serde_json::Value>,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub expires_after_attempt: Option<u32>,
    #[serde(default)]
    pub notes: Option<String>,
}

pub struct Escalator<'a> {
    pub supervisor: &'a SessionSupervisor,
    pub contract: &'a Contract,
    pub workspace: &'a Path,
    pub escalations_dir: &'a Path,
}

impl Escalator<'_> {
    pub async fn run(
        &self,
        request: &EscalationRequest<'_>,
        cancel: &CancelToken,
    ) -> Result<EscalationOutcome> {
        let step = match self.contract.escalation_step_for(request.role_id) {
            Some(step) => step,
            None => {
                return Ok(EscalationOutcome::Exhausted {
                    detail: format!("no escalation step declared for role {}", request.role_id),
                })
            }
        };

        if step.policy == EscalationPolicy::Terminate {
            return Ok(EscalationOutcome::Exhausted {
                detail: format!("escalation policy for role {} is terminate", request.role_id),
            });
        }

        let target_id = match &step.to_role {
            Some(id) => id.as_str(),
            None => {
                return Ok(EscalationOutcome::Exhausted {
                    detail: format!("escalation step for role {} names no target", request.role_id),
                })
            }
        };
        let target = self.contract.role(target_id)?;

        std::fs::create_dir_all(self.escalations_dir)?;
        let decision_path = self.decision_path(request);
        let log_path = decision_path.with_extension("log");

        info!(
            role_id = request.role_id,
            target = target_id,
            reason = request.reason,
            "Raising escalation"
        );

        // The escalation session only ever writes into the escalations dir.
        let permissions = PermissionProfile {
            mode: SessionMode::Implement,
            allow: vec![format!("{}/**", self.escalations_dir.display())],
            deny: PROTECTED_PATHS.iter().map(|p| p.to_string()).collect(),
            allowed_commands: target.allowed_commands.clone(),
        };

        let spawn = SpawnRequest {
            role_id: target.id.clone(),
            workspace: self.workspace.to_path_buf(),
            env: Default::default(),
            permissions,
            log_path: Some(log_path),
        };

        let limits = MonitorLimits {
            inactivity_timeout: Duration::from_secs(600),
            role_deadline: Some(
                tokio::time::Instant::now() + Duration::from_millis(target.budget.max_time_ms),
            ),
            global_deadline: None,
        };

        let prompt = self.compile_prompt(request, &decision_path);
        self.supervisor.run(spawn, &prompt, limits, cancel).await?;

        match std::fs::read_to_string(&decision_path) {
            Ok(raw) => Ok(self.interpret(&raw, request)),
            Err(_) => Ok(EscalationOutcome::Denied {
                detail: format!(
                    "no decision file produced at {}",
                    decision_path.display()
                ),
            }),
        }
    }

    fn decision_path(&self, request: &EscalationRequest<'_>) -> PathBuf {
        self.escalations_dir.join(format!(
            "{}-{}-attempt{}.json",
            request.role_id, request.phase_id, request.attempt
        ))
    }

    fn compile_prompt(&self, request: &EscalationRequest<'_>, decision_path: &Path) -> String {
        let paths = if request.violating_paths.is_empty() {
            "(none)".to_string()
        } else {
            request.violating_paths.join("\n- ")
        };
        format!(
            "# Escalation request\n\
             Role `{role}` in phase `{phase}` is blocked: {reason}\n\n\
             Paths involved:\n- {paths}\n\n\
             Decide whether to grant a scope exception. Write your decision as JSON to\n\
             `{decision}` with the shape:\n\
             {{\"grant\": bool, \"kind\": \"extra_scope\"|\"shared_scope\", \
             \"patterns\": [..], \"expires_after_attempt\": n, \"notes\": \"...\"}}\n\
             Then emit PHASE_COMPLETE.",
            role = request.role_id,
            phase = request.phase_id,
            reason = request.reason,
            paths = paths,
            decision = decision_path.display(),
        )
    }

    /// Lenient interpretation of the staged decision file: a malformed
    /// patterns list degrades to the violating paths, never to a parse
    /// failure of the whole escalation.
    fn interpret(&self, raw: &str, request: &EscalationRequest<'_>) -> EscalationOutcome {
        let decision: EscalationDecision = match serde_json::from_str(raw) {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "Unparseable escalation decision");
                return EscalationOutcome::Denied {
                    detail: format!("unparseable decision file: {e}"),
                };
            }
        };

        if !decision.grant {
            return EscalationOutcome::Denied {
                detail: decision.notes.unwrap_or_else(|| "grant denied".into()),
            };
        }

        let patterns = match &decision.patterns {
            Some(value) => {
                let decoded = crate::contract::decode_optional_list::<String>(value);
                for dropped in &decoded.dropped {
                    warn!(fragment = %dropped, "Dropped malformed pattern in escalation decision");
                }
                decoded.value
            }
            None => Vec::new(),
        };
        let patterns = if patterns.is_empty() {
            request.violating_paths.to_vec()
        } else {
            patterns
        };

        if patterns.is_empty() {
            return EscalationOutcome::Denied {
                detail: "grant carries no patterns and no violating paths to default to".into(),
            };
        }

        EscalationOutcome::Granted(ScopeOverride {
            kind: decision.kind.unwrap_or(OverrideKind::ExtraScope),
            patterns,
            owner_role: decision
                .owner_role
                .unwrap_or_else(|| request.role_id.to_string()),
            phase: decision.phase.unwrap_or_else(|| request.phase_id.to_string()),
            expires_after_attempt: decision
                .expires_after_attempt
                .unwrap_or(request.attempt + 1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::session::SessionBackend;
    use std::sync::Arc;

    struct NoopBackend;

    #[async_trait::async_trait]
    impl SessionBackend for NoopBackend {
        async fn spawn(
            &self,
            _request: SpawnRequest,
        ) -> Result<Box<dyn crate::session::SessionHandle>> {
            unreachable!("interpretation tests never spawn")
        }
    }

    fn escalator<'a>(
        supervisor: &'a SessionSupervisor,
        contract: &'a Contract,
        dir: &'a Path,
    ) -> Escalator<'a> {
        Escalator {
            supervisor,
            contract,
            workspace: dir,
            escalations_dir: dir,
        }
    }

    fn request<'a>(paths: &'a [String]) -> EscalationRequest<'a> {
        EscalationRequest {
            role_id: "worker",
            phase_id: "build",
            reason: "scope violation",
            violating_paths: paths,
            attempt: 2,
        }
    }

    #[test]
    fn grant_with_defaults_from_request() {
        let supervisor = SessionSupervisor::new(Arc::new(NoopBackend), SessionConfig::default());
        let contract = Contract::default();
        let dir = std::env::temp_dir();
        let esc = escalator(&supervisor, &contract, &dir);

        let paths = vec!["web/app.ts".to_string()];
        let outcome = esc.interpret(r#"{"grant": true}"#, &request(&paths));

        match outcome {
            EscalationOutcome::Granted(grant) => {
                assert_eq!(grant.owner_role, "worker");
                assert_eq!(grant.phase, "build");
                assert_eq!(grant.patterns, paths);
                assert_eq!(grant.expires_after_attempt, 3);
                assert_eq!(grant.kind, OverrideKind::ExtraScope);
            }
            other => panic!("expected grant, got {other:?}"),
        }
    }

    #[test]
    fn malformed_patterns_degrade_to_violating_paths() {
        let supervisor = SessionSupervisor::new(Arc::new(NoopBackend), SessionConfig::default());
        let contract = Contract::default();
        let dir = std::env::temp_dir();
        let esc = escalator(&supervisor, &contract, &dir);

        let paths = vec!["web/app.ts".to_string()];
        let raw = r#"{"grant": true, "patterns": [{"bad": 1}, "docs/**"]}"#;
        match esc.interpret(raw, &request(&paths)) {
            EscalationOutcome::Granted(grant) => {
                assert_eq!(grant.patterns, vec!["docs/**".to_string()]);
            }
            other => panic!("expected grant, got {other:?}"),
        }
    }

    #[test]
    fn denial_and_garbage_are_denied() {
        let supervisor = SessionSupervisor::new(Arc::new(NoopBackend), SessionConfig::default());
        let contract = Contract::default();
        let dir = std::env::temp_dir();
        let esc = escalator(&supervisor, &contract, &dir);

        let paths: Vec<String> = vec![];
        assert!(matches!(
            esc.interpret(r#"{"grant": false, "notes": "too broad"}"#, &request(&paths)),
            EscalationOutcome::Denied { detail } if detail == "too broad"
        ));
        assert!(matches!(
            esc.interpret("not json", &request(&paths)),
            EscalationOutcome::Denied { .. }
        ));
    }

    #[tokio::test]
    async fn missing_chain_step_exhausts() {
        let supervisor = SessionSupervisor::new(Arc::new(NoopBackend), SessionConfig::default());
        let contract = Contract::default();
        let dir = std::env::temp_dir();
        let esc = escalator(&supervisor, &contract, &dir);

        let paths: Vec<String> = vec![];
        let outcome = esc.run(&request(&paths), &CancelToken::new()).await.unwrap();
        assert!(matches!(outcome, EscalationOutcome::Exhausted { .. }));
    }
}
