//! Role context compilation: the prompt an agent session receives.

use crate::contract::{Contract, PhaseSpec, RoleSpec};
use crate::job::{DelegationPlan, FeedbackEntry};

use super::permissions::SessionMode;

pub struct RoleContext<'a> {
    pub role: &'a RoleSpec,
    pub phase: &'a PhaseSpec,
    pub contract: &'a Contract,
    pub mode: SessionMode,
    pub delegation: Option<&'a DelegationPlan>,
    pub feedback: &'a [FeedbackEntry],
    pub attempt: u32,
}

impl RoleContext<'_> {
    /// Compile identity, mission, world, and feedback history into the
    /// session prompt.
    pub fn compile(&self) -> String {
        let mut sections = Vec::new();

        sections.push(format!(
            "# Identity\nYou are the `{}` role in the `{}` contract, working phase `{}` in {} mode (attempt {}).",
            self.role.id, self.contract.name, self.phase.id, self.mode, self.attempt
        ));

        if let Some(notes) = &self.role.notes {
            sections.push(format!("# Behavioral notes\n{notes}"));
        }

        sections.push(format!(
            "# Scope\nYou may modify paths matching:\n{}",
            bullet_list(self.role.scope.iter())
        ));

        if !self.contract.always_read.is_empty() {
            sections.push(format!(
                "# Always read first\n{}",
                bullet_list(self.contract.always_read.iter())
            ));
        }

        if !self.phase.input_boundary.is_empty() || !self.phase.output_boundary.is_empty() {
            sections.push(format!(
                "# Phase boundaries\nInputs:\n{}\nOutputs:\n{}",
                bullet_list(self.phase.input_boundary.iter()),
                bullet_list(self.phase.output_boundary.iter())
            ));
        }

        if let Some(plan) = self.delegation {
            let tasks = plan.tasks_for(&self.role.id);
            if !tasks.is_empty() {
                let rendered: Vec<String> = tasks
                    .iter()
                    .map(|t| {
                        format!(
                            "- [{}] {} (scope hints: {})",
                            t.id,
                            t.description,
                            if t.scope_hints.is_empty() {
                                "none".to_string()
                            } else {
                                t.scope_hints.join(", ")
                            }
                        )
                    })
                    .collect();
                sections.push(format!("# Delegated tasks\n{}", rendered.join("\n")));
            }
        }

        if !self.feedback.is_empty() {
            let rendered: Vec<String> = self.feedback.iter().map(render_feedback).collect();
            sections.push(format!(
                "# Feedback from previous attempts\n{}",
                rendered.join("\n")
            ));
        }

        match self.mode {
            SessionMode::Plan => sections.push(
                "# Instructions\nProduce an implementation plan in the staging area. \
                 Do not modify any other files."
                    .to_string(),
            ),
            SessionMode::Implement => sections.push(
                "# Instructions\nImplement your delegated work within scope. \
                 Emit PHASE_COMPLETE with a summary when done, or NEEDS_ESCALATION \
                 if you are blocked."
                    .to_string(),
            ),
        }

        sections.join("\n\n")
    }
}

fn render_feedback(entry: &FeedbackEntry) -> String {
    let mut lines = vec![format!("Attempt {}:", entry.attempt)];
    if !entry.scope_violations.is_empty() {
        lines.push(format!(
            "  Out-of-scope paths (do NOT touch these): {}",
            entry.scope_violations.join(", ")
        ));
    }
    if !entry.failed_criteria.is_empty() {
        lines.push(format!(
            "  Failed completion criteria: {}",
            entry.failed_criteria.join(", ")
        ));
    }
    for hint in &entry.hints {
        lines.push(format!("  Hint: {hint}"));
    }
    lines.join("\n")
}

fn bullet_list<'a>(items: impl Iterator<Item = &'a String>) -> String {
    let rendered: Vec<String> = items.map(|i| format!("- {i}")).collect();
    if rendered.is_empty() {
        "- (none)".to_string()
    } else {
        rendered.join("\n")
    }
}
