//! Scope verification: which paths a role's diff may touch.

use glob::Pattern;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::contract::{Contract, RoleSpec};
use crate::git::DiffSummary;

/// Paths no role or override may ever match: the engine's own state and
/// the protocol-critical contract file.
pub const PROTECTED_PATHS: &[&str] = &[
    ".covenant/**",
    "covenant.contract.json",
    ".git/**",
];

/// A narrow, time-boxed scope grant created by an escalation resolution.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ScopeOverride {
    pub kind: OverrideKind,
    pub patterns: Vec<String>,
    pub owner_role: String,
    pub phase: String,
    /// Attempt number after which the grant expires.
    pub expires_after_attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum OverrideKind {
    ExtraScope,
    SharedScope,
}

impl ScopeOverride {
    pub fn applies_to(&self, role_id: &str, phase_id: &str, attempt: u32) -> bool {
        self.owner_role == role_id && self.phase == phase_id && attempt <= self.expires_after_attempt
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    /// Retryable with feedback.
    Advisory,
    /// Can never succeed without an explicit grant; escalate immediately.
    Structural,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Advisory => write!(f, "advisory"),
            Self::Structural => write!(f, "structural"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScopeVerdict {
    Pass,
    Violation {
        paths: Vec<String>,
        severity: ViolationSeverity,
    },
}

impl ScopeVerdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }
}

pub fn is_protected(path: &str) -> bool {
    matches_any(path, PROTECTED_PATHS.iter().copied())
}

fn matches_any<'a>(path: &str, patterns: impl IntoIterator<Item = &'a str>) -> bool {
    patterns.into_iter().any(|p| {
        Pattern::new(p)
            .map(|pattern| pattern.matches(path))
            .unwrap_or(false)
    })
}

/// The glob set a role may modify for one attempt: declared scope, shared
/// scopes, allow-listed extras, and unexpired overrides. Protected paths
/// are excluded downstream regardless of what this returns.
pub fn effective_scope(
    role: &RoleSpec,
    contract: &Contract,
    overrides: &[ScopeOverride],
    phase_id: &str,
    attempt: u32,
) -> Vec<String> {
    let mut patterns: Vec<String> = role.scope.clone();
    patterns.extend(role.extra_paths.iter().cloned());
    patterns.extend(
        contract
            .shared_patterns_for(&role.id)
            .into_iter()
            .map(String::from),
    );
    for grant in overrides {
        if grant.applies_to(&role.id, phase_id, attempt) {
            patterns.extend(grant.patterns.iter().cloned());
        }
    }
    patterns
}

/// Check every changed path against the role's effective scope.
///
/// Violations are structural when the count reaches the threshold or any
/// violating path lies inside another declared role's exclusive scope.
/// Such a change can never succeed without an explicit grant, so it must
/// escalate instead of burning the retry budget.
pub fn verify_scope(
    diff: &DiffSummary,
    role: &RoleSpec,
    contract: &Contract,
    overrides: &[ScopeOverride],
    phase_id: &str,
    attempt: u32,
    structural_threshold: usize,
) -> ScopeVerdict {
    let allowed = effective_scope(role, contract, overrides, phase_id, attempt);

    let mut violations = Vec::new();
    let mut structural = false;

    for path in diff.paths() {
        if is_protected(path) {
            violations.push(path.to_string());
            structural = true;
            continue;
        }
        if matches_any(path, allowed.iter().map(String::as_str)) {
            continue;
        }
        if touches_foreign_exclusive_scope(path, role, contract) {
            structural = true;
        }
        violations.push(path.to_string());
    }

    if violations.is_empty() {
        return ScopeVerdict::Pass;
    }

    if violations.len() >= structural_threshold {
        structural = true;
    }

    let severity = if structural {
        ViolationSeverity::Structural
    } else {
        ViolationSeverity::Advisory
    };

    debug!(
        role_id = role.id,
        count = violations.len(),
        severity = %severity,
        "Scope violation"
    );

    ScopeVerdict::Violation {
        paths: violations,
        severity,
    }
}

/// True when `path` matches another role's scope without a shared-scope
/// declaration covering both roles.
fn touches_foreign_exclusive_scope(path: &str, role: &RoleSpec, contract: &Contract) -> bool {
    for other in contract.roles.iter().filter(|r| r.id != role.id) {
        if !matches_any(path, other.scope.iter().map(String::as_str)) {
            continue;
        }
        let shared_with_both = contract.shared_scopes.iter().any(|s| {
            s.roles.iter().any(|r| *r == role.id)
                && s.roles.iter().any(|r| *r == other.id)
                && matches_any(path, s.patterns.iter().map(String::as_str))
        });
        if !shared_with_both {
            return true;
        }
    }
    false
}
