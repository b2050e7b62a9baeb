//! Phase completion-criteria evaluation.
//!
//! Criteria owned by a different actor of the same phase are deferred, not
//! failed, so multi-actor phases are never blocked by work that was
//! delegated elsewhere.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use glob::Pattern;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::PolicyConfig;
use crate::contract::{CompletionCriterion, PhaseSpec, RoleBudget, RoleSpec};
use crate::error::Result;
use crate::evidence::EvidenceArchive;
use crate::git::DiffSummary;
use crate::job::DelegationPlan;

#[derive(Debug, Clone, PartialEq)]
pub enum CriterionOutcome {
    Passed,
    /// Owned by another actor of this phase; recorded, not failed.
    Deferred { reason: String },
    Failed { hint: String },
}

#[derive(Debug, Clone, Default)]
pub struct CompletionReport {
    pub results: Vec<(String, CriterionOutcome)>,
}

impl CompletionReport {
    pub fn passed(&self) -> bool {
        !self
            .results
            .iter()
            .any(|(_, o)| matches!(o, CriterionOutcome::Failed { .. }))
    }

    pub fn failed_keys(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|(_, o)| matches!(o, CriterionOutcome::Failed { .. }))
            .map(|(k, _)| k.as_str())
            .collect()
    }

    pub fn deferred_keys(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|(_, o)| matches!(o, CriterionOutcome::Deferred { .. }))
            .map(|(k, _)| k.as_str())
            .collect()
    }

    pub fn hints(&self) -> Vec<String> {
        self.results
            .iter()
            .filter_map(|(key, o)| match o {
                CriterionOutcome::Failed { hint } => Some(format!("{key}: {hint}")),
                _ => None,
            })
            .collect()
    }

    /// Stable signature of the failed criteria, compared across consecutive
    /// attempts to short-circuit agents that repeat the same failure.
    pub fn signature(&self) -> String {
        let mut keys: Vec<&str> = self.failed_keys();
        keys.sort_unstable();
        keys.join("+")
    }
}

pub struct CompletionContext<'a> {
    pub workspace: &'a Path,
    pub planning_dir: &'a Path,
    pub role: &'a RoleSpec,
    pub diff: &'a DiffSummary,
    pub budget: &'a RoleBudget,
    pub delegation: Option<&'a DelegationPlan>,
    pub evidence: &'a EvidenceArchive,
    /// Ledger sequence the evidence files are filed under.
    pub evidence_seq: u64,
    pub config: &'a PolicyConfig,
}

/// Evaluate every completion criterion declared on the phase.
pub async fn verify_completion(
    phase: &PhaseSpec,
    ctx: &CompletionContext<'_>,
) -> Result<CompletionReport> {
    let mut report = CompletionReport::default();

    for (idx, criterion) in phase.completion_criteria.iter().enumerate() {
        let key = criterion.key();

        if let Some(reason) = deferral_reason(criterion, ctx) {
            debug!(role_id = ctx.role.id, criterion = %key, "Criterion deferred");
            report.results.push((key, CriterionOutcome::Deferred { reason }));
            continue;
        }

        let outcome = evaluate(criterion, idx, ctx).await;
        report.results.push((key, outcome));
    }

    debug!(
        role_id = ctx.role.id,
        phase_id = phase.id,
        passed = report.passed(),
        failed = report.failed_keys().len(),
        deferred = report.deferred_keys().len(),
        "Completion checked"
    );

    Ok(report)
}

/// A criterion is deferred when its target surface does not intersect the
/// current role's delegated scope (role scope plus the scope hints of its
/// delegated tasks).
fn deferral_reason(criterion: &CompletionCriterion, ctx: &CompletionContext<'_>) -> Option<String> {
    let surface = criterion.target_surface()?;

    let mut role_patterns: Vec<&str> = ctx.role.scope.iter().map(String::as_str).collect();
    if let Some(plan) = ctx.delegation {
        for task in plan.tasks_for(&ctx.role.id) {
            role_patterns.extend(task.scope_hints.iter().map(String::as_str));
        }
    }

    let intersects = surface
        .iter()
        .any(|target| role_patterns.iter().any(|p| globs_overlap(target, p)));

    if intersects {
        None
    } else {
        Some(format!(
            "target surface {:?} is outside the scope delegated to role {}",
            surface, ctx.role.id
        ))
    }
}

/// Conservative overlap test between two glob patterns: compare the literal
/// prefixes before the first metacharacter. Over-approximating overlap is
/// safe here (a wrongly-undeferred criterion just gets evaluated).
fn globs_overlap(a: &str, b: &str) -> bool {
    let pa = literal_prefix(a);
    let pb = literal_prefix(b);
    pa.starts_with(pb) || pb.starts_with(pa)
}

fn literal_prefix(pattern: &str) -> &str {
    let end = pattern
        .find(|c| matches!(c, '*' | '?' | '['))
        .unwrap_or(pattern.len());
    &pattern[..end]
}

async fn evaluate(
    criterion: &CompletionCriterion,
    idx: usize,
    ctx: &CompletionContext<'_>,
) -> CriterionOutcome {
    match criterion {
        CompletionCriterion::ArtifactExists { pattern } => {
            if artifact_exists(ctx.workspace, pattern) || artifact_exists(ctx.planning_dir, pattern)
            {
                CriterionOutcome::Passed
            } else {
                CriterionOutcome::Failed {
                    hint: format!("expected artifact matching '{pattern}' was not produced"),
                }
            }
        }

        CompletionCriterion::CommandSucceeds { command } => {
            match run_command(command, idx, ctx).await {
                Ok(true) => CriterionOutcome::Passed,
                Ok(false) => CriterionOutcome::Failed {
                    hint: format!("command failed: {command}"),
                },
                Err(e) => CriterionOutcome::Failed {
                    hint: format!("command could not run: {e}"),
                },
            }
        }

        CompletionCriterion::CommandFails { command } => {
            match run_command(command, idx, ctx).await {
                Ok(false) => CriterionOutcome::Passed,
                Ok(true) => CriterionOutcome::Failed {
                    hint: format!("command unexpectedly succeeded: {command}"),
                },
                Err(e) => CriterionOutcome::Failed {
                    hint: format!("command could not run: {e}"),
                },
            }
        }

        CompletionCriterion::NonEmptyDiff => {
            if ctx.diff.is_empty() {
                CriterionOutcome::Failed {
                    hint: "the session produced no changes".to_string(),
                }
            } else {
                CriterionOutcome::Passed
            }
        }

        CompletionCriterion::DiffWithinBudget => {
            let lines = ctx.diff.total_lines();
            if lines <= ctx.budget.max_diff_lines {
                CriterionOutcome::Passed
            } else {
                CriterionOutcome::Failed {
                    hint: format!(
                        "diff of {lines} lines exceeds the budget of {}",
                        ctx.budget.max_diff_lines
                    ),
                }
            }
        }

        CompletionCriterion::MarkdownStructure {
            path,
            required_headings,
            min_length,
        } => check_markdown(ctx, path, required_headings, *min_length),

        CompletionCriterion::DelegationCoverage => check_delegation_coverage(ctx),

        CompletionCriterion::SmokeCheck { command, url } => {
            match smoke_check(command, url, ctx).await {
                Ok(()) => CriterionOutcome::Passed,
                Err(hint) => CriterionOutcome::Failed { hint },
            }
        }

        CompletionCriterion::CustomScript { script } => {
            match run_command(script, idx, ctx).await {
                Ok(true) => CriterionOutcome::Passed,
                Ok(false) => CriterionOutcome::Failed {
                    hint: format!("custom script failed: {script}"),
                },
                Err(e) => CriterionOutcome::Failed {
                    hint: format!("custom script could not run: {e}"),
                },
            }
        }
    }
}

fn artifact_exists(root: &Path, pattern: &str) -> bool {
    let full = format!("{}/{}", root.display(), pattern);
    glob::glob(&full)
        .map(|mut paths| paths.any(|p| p.is_ok()))
        .unwrap_or(false)
}

/// Run a shell command, archiving its combined output as evidence.
async fn run_command(command: &str, idx: usize, ctx: &CompletionContext<'_>) -> Result<bool> {
    let timeout = Duration::from_secs(ctx.config.command_timeout_secs);

    let result = tokio::time::timeout(
        timeout,
        Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(ctx.workspace)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output(),
    )
    .await;

    let output = match result {
        Ok(output) => output?,
        Err(_) => {
            warn!(command, timeout_secs = timeout.as_secs(), "Criterion command timed out");
            return Ok(false);
        }
    };

    let mut captured = String::from_utf8_lossy(&output.stdout).into_owned();
    captured.push_str(&String::from_utf8_lossy(&output.stderr));
    if let Err(e) = ctx
        .evidence
        .store_text(ctx.evidence_seq, &format!("crit{idx}-output"), &captured)
    {
        warn!(error = %e, "Failed to archive criterion output");
    }

    Ok(output.status.success())
}

fn check_markdown(
    ctx: &CompletionContext<'_>,
    path: &str,
    required_headings: &[String],
    min_length: usize,
) -> CriterionOutcome {
    let candidates = [ctx.workspace.join(path), ctx.planning_dir.join(path)];
    let content = candidates
        .iter()
        .find_map(|p| std::fs::read_to_string(p).ok());

    let content = match content {
        Some(content) => content,
        None => {
            return CriterionOutcome::Failed {
                hint: format!("document '{path}' does not exist"),
            }
        }
    };

    if content.len() < min_length {
        return CriterionOutcome::Failed {
            hint: format!(
                "document '{path}' is {} bytes, below the minimum of {min_length}",
                content.len()
            ),
        };
    }

    let headings: Vec<&str> = content
        .lines()
        .filter(|l| l.trim_start().starts_with('#'))
        .collect();

    let missing: Vec<&String> = required_headings
        .iter()
        .filter(|required| {
            !headings
                .iter()
                .any(|h| h.trim_start_matches('#').trim().eq_ignore_ascii_case(required))
        })
        .collect();

    if missing.is_empty() {
        CriterionOutcome::Passed
    } else {
        CriterionOutcome::Failed {
            hint: format!(
                "document '{path}' is missing required headings: {}",
                missing
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }
}

/// Every delegated task for the role must have touched at least one path
/// matching its scope hints.
fn check_delegation_coverage(ctx: &CompletionContext<'_>) -> CriterionOutcome {
    let plan = match ctx.delegation {
        Some(plan) => plan,
        None => return CriterionOutcome::Passed,
    };

    let paths = ctx.diff.paths();
    let mut untouched = Vec::new();

    for task in plan.tasks_for(&ctx.role.id) {
        if task.scope_hints.is_empty() {
            continue;
        }
        let covered = task.scope_hints.iter().any(|hint| {
            Pattern::new(hint)
                .map(|p| paths.iter().any(|path| p.matches(path)))
                .unwrap_or(false)
        });
        if !covered {
            untouched.push(task.id.as_str());
        }
    }

    if untouched.is_empty() {
        CriterionOutcome::Passed
    } else {
        CriterionOutcome::Failed {
            hint: format!(
                "delegated tasks produced no changes in their hinted scope: {}",
                untouched.join(", ")
            ),
        }
    }
}

/// Start a process, poll the URL's endpoint until it accepts a connection,
/// then stop the process.
async fn smoke_check(
    command: &str,
    url: &str,
    ctx: &CompletionContext<'_>,
) -> std::result::Result<(), String> {
    let addr = endpoint_of(url).ok_or_else(|| format!("cannot extract host:port from '{url}'"))?;

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(ctx.workspace)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to start '{command}': {e}"))?;

    let deadline =
        tokio::time::Instant::now() + Duration::from_secs(ctx.config.smoke_check_timeout_secs);
    let mut responded = false;

    while tokio::time::Instant::now() < deadline {
        if let Ok(Some(status)) = child.try_wait() {
            return Err(format!("process exited before responding: {status}"));
        }
        if TcpStream::connect(&addr).await.is_ok() {
            responded = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    let _ = child.kill().await;

    if responded {
        Ok(())
    } else {
        Err(format!("no response at {addr} within the timeout"))
    }
}

fn endpoint_of(url: &str) -> Option<String> {
    let rest = url.split("://").last()?;
    let authority = rest.split('/').next()?;
    if authority.is_empty() {
        return None;
    }
    if authority.contains(':') {
        Some(authority.to_string())
    } else {
        Some(format!("{authority}:80"))
    }
}
