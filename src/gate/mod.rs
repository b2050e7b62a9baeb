//! Approval gates: input collection, prompt models, and resolutions.

pub mod fingerprint;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::contract::{GateSpec, InputSource};
use crate::error::{CovenantError, Result};

pub use fingerprint::compute_gate_fingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    Approve,
    Reject,
    Exception,
}

impl GateDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Exception => "exception",
        }
    }
}

impl std::fmt::Display for GateDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the approval audience answered.
#[derive(Debug, Clone)]
pub struct ApprovalResponse {
    pub decision: GateDecision,
    pub notes: Option<String>,
}

/// Recorded once per presentation; replayed on fingerprint match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResolution {
    pub gate_id: String,
    pub decision: GateDecision,
    pub notes: Option<String>,
    pub fingerprint: String,
    pub resolved_at: DateTime<Utc>,
}

/// The only point where a human or policy audience enters the loop.
#[async_trait]
pub trait ApprovalBoundary: Send + Sync {
    async fn present_gate_prompt(
        &self,
        gate: &GateSpec,
        model: &GatePromptModel,
    ) -> Result<ApprovalResponse>;
}

#[derive(Debug, Clone)]
pub struct InputFile {
    /// Path relative to the root it was resolved against.
    pub path: String,
    pub digest: String,
    pub preview: String,
}

#[derive(Debug, Clone)]
pub enum InputDetail {
    Text { text: String },
    /// Empty means the glob matched nothing.
    Files { files: Vec<InputFile> },
}

#[derive(Debug, Clone)]
pub struct ResolvedInput {
    pub label: String,
    pub optional: bool,
    pub detail: InputDetail,
}

/// Rendered decision model shown to the approval audience.
#[derive(Debug, Clone)]
pub struct GatePromptModel {
    pub gate_id: String,
    pub audience: String,
    pub approval_scope: String,
    pub fingerprint: String,
    pub inputs: Vec<ResolvedInput>,
}

impl GatePromptModel {
    pub fn render(&self) -> String {
        let mut out = format!(
            "Gate `{}` for {} (scope: {})\n",
            self.gate_id, self.audience, self.approval_scope
        );
        for input in &self.inputs {
            out.push_str(&format!("\n## {}\n", input.label));
            match &input.detail {
                InputDetail::Text { text } => out.push_str(text),
                InputDetail::Files { files } if files.is_empty() => {
                    out.push_str("(no matching files)")
                }
                InputDetail::Files { files } => {
                    for file in files {
                        out.push_str(&format!("--- {} ---\n{}\n", file.path, file.preview));
                    }
                }
            }
            out.push('\n');
        }
        out
    }
}

/// Resolves required inputs and computes the dedup fingerprint for one gate.
pub struct GateController {
    workspace: PathBuf,
    planning_dir: PathBuf,
    preview_bytes: usize,
}

impl GateController {
    pub fn new(workspace: &Path, planning_dir: &Path, preview_bytes: usize) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            planning_dir: planning_dir.to_path_buf(),
            preview_bytes,
        }
    }

    /// Collect required inputs, resolving path globs against the repo first
    /// and the job-local planning directory second.
    pub fn collect_inputs(&self, gate: &GateSpec) -> Result<Vec<ResolvedInput>> {
        let mut resolved = Vec::with_capacity(gate.required_inputs.len());
        for input in &gate.required_inputs {
            let detail = match &input.source {
                InputSource::Text { text } => InputDetail::Text { text: text.clone() },
                InputSource::Path { pattern } => {
                    let mut files = self.resolve_pattern(&self.workspace, pattern)?;
                    if files.is_empty() {
                        files = self.resolve_pattern(&self.planning_dir, pattern)?;
                    }
                    if files.is_empty() && !input.optional {
                        return Err(CovenantError::GateInput(format!(
                            "gate {}: required input '{}' matched no files for '{pattern}'",
                            gate.id, input.label
                        )));
                    }
                    InputDetail::Files { files }
                }
            };
            resolved.push(ResolvedInput {
                label: input.label.clone(),
                optional: input.optional,
                detail,
            });
        }
        Ok(resolved)
    }

    fn resolve_pattern(&self, root: &Path, pattern: &str) -> Result<Vec<InputFile>> {
        if !root.is_dir() {
            return Ok(Vec::new());
        }
        let full = root.join(pattern);
        let mut paths: Vec<PathBuf> = glob::glob(&full.to_string_lossy())
            .map_err(|e| CovenantError::GateInput(e.to_string()))?
            .filter_map(|p| p.ok())
            .filter(|p| p.is_file())
            .collect();
        paths.sort();

        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = std::fs::read(&path)?;
            let digest = fingerprint::hex(&Sha256::digest(&bytes));
            let preview_len = bytes.len().min(self.preview_bytes);
            let preview = String::from_utf8_lossy(&bytes[..preview_len]).into_owned();
            let rel = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .into_owned();
            files.push(InputFile {
                path: rel,
                digest,
                preview,
            });
        }
        Ok(files)
    }

    /// Fingerprint over the gate's semantics, its resolved inputs, and the
    /// planning tree when the gate is triggered from a planning phase.
    pub fn fingerprint(
        &self,
        gate: &GateSpec,
        inputs: &[ResolvedInput],
        planning_phase: bool,
    ) -> Result<String> {
        let tree = planning_phase.then_some(self.planning_dir.as_path());
        compute_gate_fingerprint(gate, inputs, tree)
    }

    pub fn prompt_model(
        &self,
        gate: &GateSpec,
        inputs: Vec<ResolvedInput>,
        fingerprint: String,
    ) -> GatePromptModel {
        GatePromptModel {
            gate_id: gate.id.clone(),
            audience: gate.audience.clone(),
            approval_scope: gate.approval_scope.clone(),
            fingerprint,
            inputs,
        }
    }

    /// Present the prompt to the audience and record the resolution.
    pub async fn present(
        &self,
        gate: &GateSpec,
        model: &GatePromptModel,
        boundary: &dyn ApprovalBoundary,
    ) -> Result<GateResolution> {
        debug!(gate_id = gate.id, fingerprint = model.fingerprint, "Presenting gate");
        let response = boundary.present_gate_prompt(gate, model).await?;
        Ok(GateResolution {
            gate_id: gate.id.clone(),
            decision: response.decision,
            notes: response.notes,
            fingerprint: model.fingerprint.clone(),
            resolved_at: Utc::now(),
        })
    }
}
