use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{CovenantError, Result};

/// Validated description of roles, phases, gates, and budgets governing a job.
///
/// Validated once before any job starts; immutable for the job's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Contract {
    pub name: String,
    pub roles: Vec<RoleSpec>,
    pub phases: Vec<PhaseSpec>,
    pub gates: Vec<GateSpec>,
    pub shared_scopes: Vec<SharedScope>,
    pub escalation_chain: Vec<EscalationStep>,
    pub global_lifetime: GlobalLifetime,
    /// Documents injected into every role context.
    pub always_read: Vec<String>,
}

impl Default for Contract {
    fn default() -> Self {
        Self {
            name: String::new(),
            roles: Vec::new(),
            phases: Vec::new(),
            gates: Vec::new(),
            shared_scopes: Vec::new(),
            escalation_chain: Vec::new(),
            global_lifetime: GlobalLifetime::default(),
            always_read: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleSpec {
    pub id: String,
    /// Glob patterns the role may modify.
    pub scope: Vec<String>,
    /// Extra paths outside the scope the role is allowed to touch.
    pub extra_paths: Vec<String>,
    pub allowed_commands: Vec<String>,
    /// Expected output artifacts, as glob patterns.
    pub outputs: Vec<String>,
    pub budget: RoleBudget,
    pub notes: Option<String>,
    /// Whether the role runs a plan session before implementing.
    pub delegated: bool,
}

impl Default for RoleSpec {
    fn default() -> Self {
        Self {
            id: String::new(),
            scope: Vec::new(),
            extra_paths: Vec::new(),
            allowed_commands: Vec::new(),
            outputs: Vec::new(),
            budget: RoleBudget::default(),
            notes: None,
            delegated: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleBudget {
    pub max_iterations: u32,
    pub max_time_ms: u64,
    pub max_diff_lines: usize,
}

impl Default for RoleBudget {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            max_time_ms: 3_600_000,
            max_diff_lines: 5_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalLifetime {
    pub max_time_ms: u64,
}

impl Default for GlobalLifetime {
    fn default() -> Self {
        Self {
            max_time_ms: 14_400_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseSpec {
    pub id: String,
    /// Role ids processed in declared order.
    pub actors: Vec<String>,
    /// Input boundary: what the phase may read beyond role scopes.
    pub input_boundary: Vec<String>,
    /// Output boundary: where phase artifacts land.
    pub output_boundary: Vec<String>,
    pub completion_criteria: Vec<CompletionCriterion>,
    /// Outcome label -> next phase id.
    pub successors: HashMap<String, String>,
    pub terminal: bool,
    /// Marks a planning phase; gates triggered from it hash the planning tree.
    pub planning: bool,
}

/// A machine-checkable condition a phase must satisfy before advancing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompletionCriterion {
    ArtifactExists {
        pattern: String,
    },
    CommandSucceeds {
        command: String,
    },
    CommandFails {
        command: String,
    },
    NonEmptyDiff,
    DiffWithinBudget,
    MarkdownStructure {
        path: String,
        required_headings: Vec<String>,
        min_length: usize,
    },
    DelegationCoverage,
    SmokeCheck {
        command: String,
        url: String,
    },
    CustomScript {
        script: String,
    },
}

impl CompletionCriterion {
    /// Stable key identifying the criterion within a phase, used in
    /// failure signatures and ledger payloads.
    pub fn key(&self) -> String {
        match self {
            Self::ArtifactExists { pattern } => format!("artifact_exists:{pattern}"),
            Self::CommandSucceeds { command } => format!("command_succeeds:{command}"),
            Self::CommandFails { command } => format!("command_fails:{command}"),
            Self::NonEmptyDiff => "non_empty_diff".to_string(),
            Self::DiffWithinBudget => "diff_within_budget".to_string(),
            Self::MarkdownStructure { path, .. } => format!("markdown_structure:{path}"),
            Self::DelegationCoverage => "delegation_coverage".to_string(),
            Self::SmokeCheck { url, .. } => format!("smoke_check:{url}"),
            Self::CustomScript { script } => format!("custom_script:{script}"),
        }
    }

    /// Paths this criterion is about, used to decide deferral for
    /// multi-actor phases. `None` means the criterion applies to any actor.
    pub fn target_surface(&self) -> Option<Vec<&str>> {
        match self {
            Self::ArtifactExists { pattern } => Some(vec![pattern.as_str()]),
            Self::MarkdownStructure { path, .. } => Some(vec![path.as_str()]),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GateSpec {
    pub id: String,
    /// `"phaseA->phaseB"`.
    pub trigger: String,
    pub audience: String,
    pub required_inputs: Vec<RequiredInput>,
    /// Approval semantics; part of the dedup fingerprint.
    pub approval_scope: String,
    /// Decision -> routing.
    pub on_approve: GateOutcome,
    pub on_reject: GateOutcome,
}

impl GateSpec {
    pub fn trigger_phases(&self) -> Option<(&str, &str)> {
        self.trigger.split_once("->")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GateOutcome {
    /// Continue to the named phase.
    Phase { phase: String },
    /// Terminal success.
    Completed,
}

impl Default for GateOutcome {
    fn default() -> Self {
        Self::Completed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum InputSource {
    /// Glob resolved across the repo and job-local planning directories.
    Path { pattern: String },
    /// Literal text included verbatim.
    Text { text: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequiredInput {
    pub label: String,
    #[serde(flatten)]
    pub source: InputSource,
    #[serde(default)]
    pub optional: bool,
}

/// One step of the contract escalation chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationStep {
    pub from_role: String,
    pub to_role: Option<String>,
    #[serde(default)]
    pub policy: EscalationPolicy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationPolicy {
    #[default]
    Escalate,
    Terminate,
}

impl Contract {
    pub async fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).await?;
        let contract: Contract = serde_json::from_str(&content)?;
        contract.validate()?;
        Ok(contract)
    }

    pub fn role(&self, id: &str) -> Result<&RoleSpec> {
        self.roles
            .iter()
            .find(|r| r.id == id)
            .ok_or_else(|| CovenantError::UnknownRole(id.to_string()))
    }

    pub fn phase(&self, id: &str) -> Result<&PhaseSpec> {
        self.phases
            .iter()
            .find(|p| p.id == id)
            .ok_or_else(|| CovenantError::UnknownPhase(id.to_string()))
    }

    pub fn gate(&self, id: &str) -> Result<&GateSpec> {
        self.gates
            .iter()
            .find(|g| g.id == id)
            .ok_or_else(|| CovenantError::UnknownGate(id.to_string()))
    }

    pub fn first_phase(&self) -> Result<&PhaseSpec> {
        self.phases
            .first()
            .ok_or_else(|| CovenantError::ContractInvalid("contract has no phases".into()))
    }

    /// Gate guarding the outgoing transition of `phase_id`, if any.
    pub fn gate_for_phase(&self, phase_id: &str) -> Option<&GateSpec> {
        self.gates.iter().find(|g| {
            g.trigger_phases()
                .map(|(from, _)| from == phase_id)
                .unwrap_or(false)
        })
    }

    /// Shared-scope patterns applicable to `role_id`.
    pub fn shared_patterns_for(&self, role_id: &str) -> Vec<&str> {
        self.shared_scopes
            .iter()
            .filter(|s| s.roles.iter().any(|r| r == role_id))
            .flat_map(|s| s.patterns.iter().map(|p| p.as_str()))
            .collect()
    }

    /// Next escalation step for a role, walking the declared chain.
    pub fn escalation_step_for(&self, role_id: &str) -> Option<&EscalationStep> {
        self.escalation_chain.iter().find(|s| s.from_role == role_id)
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.phases.is_empty() {
            errors.push("contract declares no phases".to_string());
        }

        let mut seen_roles = std::collections::HashSet::new();
        for role in &self.roles {
            if role.id.is_empty() {
                errors.push("role with empty id".to_string());
            }
            if !seen_roles.insert(role.id.as_str()) {
                errors.push(format!("duplicate role id: {}", role.id));
            }
            if role.budget.max_iterations == 0 {
                errors.push(format!("role {}: max_iterations must be > 0", role.id));
            }
            for pattern in role.scope.iter().chain(role.extra_paths.iter()) {
                if glob::Pattern::new(pattern).is_err() {
                    errors.push(format!("role {}: invalid glob '{}'", role.id, pattern));
                }
            }
        }

        let mut seen_phases = std::collections::HashSet::new();
        for phase in &self.phases {
            if !seen_phases.insert(phase.id.as_str()) {
                errors.push(format!("duplicate phase id: {}", phase.id));
            }
            for actor in &phase.actors {
                if !self.roles.iter().any(|r| &r.id == actor) {
                    errors.push(format!("phase {}: unknown actor '{}'", phase.id, actor));
                }
            }
            for next in phase.successors.values() {
                if !self.phases.iter().any(|p| &p.id == next) {
                    errors.push(format!("phase {}: unknown successor '{}'", phase.id, next));
                }
            }
            if !phase.terminal && phase.successors.is_empty() && self.gate_for_phase(&phase.id).is_none()
            {
                errors.push(format!(
                    "phase {}: non-terminal phase has no successors and no gate",
                    phase.id
                ));
            }
        }

        for gate in &self.gates {
            match gate.trigger_phases() {
                Some((from, to)) => {
                    if !self.phases.iter().any(|p| p.id == from) {
                        errors.push(format!("gate {}: unknown trigger phase '{from}'", gate.id));
                    }
                    if !self.phases.iter().any(|p| p.id == to) {
                        errors.push(format!("gate {}: unknown target phase '{to}'", gate.id));
                    }
                }
                None => errors.push(format!(
                    "gate {}: trigger must be 'phaseA->phaseB', got '{}'",
                    gate.id, gate.trigger
                )),
            }
            for outcome in [&gate.on_approve, &gate.on_reject] {
                if let GateOutcome::Phase { phase } = outcome {
                    if !self.phases.iter().any(|p| &p.id == phase) {
                        errors.push(format!("gate {}: unknown outcome phase '{}'", gate.id, phase));
                    }
                }
            }
        }

        for step in &self.escalation_chain {
            if !self.roles.iter().any(|r| r.id == step.from_role) {
                errors.push(format!("escalation: unknown from_role '{}'", step.from_role));
            }
            if let Some(to) = &step.to_role {
                if !self.roles.iter().any(|r| &r.id == to) {
                    errors.push(format!("escalation: unknown to_role '{to}'"));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CovenantError::ContractInvalid(errors.join("; ")))
        }
    }
}

/// Scope extension for a specific set of roles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedScope {
    pub roles: Vec<String>,
    pub patterns: Vec<String>,
}
