//! The single mutable job aggregate and its persisted snapshot.
//!
//! Every mutation is serialized to a versioned, checksummed JSON snapshot
//! so a crash at any point can resume from the last checkpoint.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::contract::Contract;
use crate::error::{CovenantError, Result};
use crate::policy::ScopeOverride;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Executing,
    Paused,
    Completed,
    Failed,
    Cancelled,
    BudgetExceeded,
}

impl JobStatus {
    pub fn allowed_transitions(&self) -> &'static [JobStatus] {
        use JobStatus::*;
        match self {
            Created => &[Executing, Cancelled, Failed, BudgetExceeded],
            Executing => &[Paused, Completed, Failed, Cancelled, BudgetExceeded],
            Paused => &[Executing, Cancelled, Failed, BudgetExceeded],
            Completed | Failed | Cancelled | BudgetExceeded => &[],
        }
    }

    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        self.allowed_transitions().contains(&to)
    }

    pub fn is_terminal(&self) -> bool {
        self.allowed_transitions().is_empty()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Executing => "executing",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::BudgetExceeded => "budget_exceeded",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verdicts and hints from one attempt, replayed into the next prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEntry {
    pub attempt: u32,
    pub scope_violations: Vec<String>,
    pub failed_criteria: Vec<String>,
    pub hints: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceBinding {
    pub root: PathBuf,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub worktree: Option<PathBuf>,
}

impl WorkspaceBinding {
    /// The tree sessions actually run in.
    pub fn effective_root(&self) -> &Path {
        self.worktree.as_deref().unwrap_or(&self.root)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobState {
    pub job_id: String,
    pub contract_name: String,
    pub status: JobStatus,
    pub current_phase_id: String,
    /// Checkpoint cursor into the current phase's declared actor list.
    pub current_actor_index: usize,
    #[serde(default)]
    pub current_role_id: Option<String>,
    /// Attempt counters keyed by `phase:role`.
    #[serde(default)]
    pub attempts: HashMap<String, u32>,
    /// Feedback history per role, most recent last, truncated to N.
    #[serde(default)]
    pub feedback: HashMap<String, Vec<FeedbackEntry>>,
    #[serde(default)]
    pub overrides: Vec<ScopeOverride>,
    pub workspace: WorkspaceBinding,
    #[serde(default)]
    pub pending_gate: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobState {
    pub fn new(job_id: &str, contract: &Contract, workspace_root: &Path) -> Result<Self> {
        let first_phase = contract.first_phase()?;
        let now = Utc::now();
        Ok(Self {
            job_id: job_id.to_string(),
            contract_name: contract.name.clone(),
            status: JobStatus::Created,
            current_phase_id: first_phase.id.clone(),
            current_actor_index: 0,
            current_role_id: None,
            attempts: HashMap::new(),
            feedback: HashMap::new(),
            overrides: Vec::new(),
            workspace: WorkspaceBinding {
                root: workspace_root.to_path_buf(),
                branch: None,
                worktree: None,
            },
            pending_gate: None,
            started_at: now,
            updated_at: now,
        })
    }

    pub fn transition(&mut self, to: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(CovenantError::InvalidStatusTransition {
                from: self.status.as_str().to_string(),
                to: to.as_str().to_string(),
                allowed: self
                    .status
                    .allowed_transitions()
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        }
        debug!(job_id = self.job_id, from = %self.status, to = %to, "Status transition");
        self.status = to;
        self.touch();
        Ok(())
    }

    fn attempt_key(phase_id: &str, role_id: &str) -> String {
        format!("{phase_id}:{role_id}")
    }

    pub fn attempts_for(&self, phase_id: &str, role_id: &str) -> u32 {
        self.attempts
            .get(&Self::attempt_key(phase_id, role_id))
            .copied()
            .unwrap_or(0)
    }

    /// Increment and return the attempt number now starting.
    pub fn begin_attempt(&mut self, phase_id: &str, role_id: &str) -> u32 {
        let counter = self
            .attempts
            .entry(Self::attempt_key(phase_id, role_id))
            .or_insert(0);
        *counter += 1;
        let attempt = *counter;
        self.touch();
        attempt
    }

    pub fn feedback_for(&self, role_id: &str) -> &[FeedbackEntry] {
        self.feedback.get(role_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn push_feedback(&mut self, role_id: &str, entry: FeedbackEntry, keep_last: usize) {
        let history = self.feedback.entry(role_id.to_string()).or_default();
        history.push(entry);
        if history.len() > keep_last {
            let drop = history.len() - keep_last;
            history.drain(..drop);
        }
        self.touch();
    }

    /// Undo a `begin_attempt` that must not count against the budget, such
    /// as a retry granted by a structural-violation escalation.
    pub fn refund_attempt(&mut self, phase_id: &str, role_id: &str) {
        if let Some(counter) = self.attempts.get_mut(&Self::attempt_key(phase_id, role_id)) {
            *counter = counter.saturating_sub(1);
        }
        self.touch();
    }

    /// A phase entered fresh (including via a gate rejection) starts with a
    /// clean attempt budget for its actors.
    pub fn enter_phase(&mut self, phase_id: &str) {
        self.current_phase_id = phase_id.to_string();
        self.current_actor_index = 0;
        self.current_role_id = None;
        self.pending_gate = None;
        let prefix = format!("{phase_id}:");
        self.attempts.retain(|key, _| !key.starts_with(&prefix));
        self.touch();
    }

    pub fn install_override(&mut self, grant: ScopeOverride) {
        self.overrides.push(grant);
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Persist a versioned snapshot, atomically replacing the previous one.
    pub fn save(&self, path: &Path) -> Result<()> {
        let body = serde_json::to_string(self)?;
        let envelope = SnapshotEnvelope {
            version: SNAPSHOT_VERSION,
            checksum: crc32fast::hash(body.as_bytes()),
            state: body,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&envelope)?)
            .map_err(|e| CovenantError::SnapshotPersistence(e.to_string()))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| CovenantError::SnapshotPersistence(e.to_string()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CovenantError::SnapshotPersistence(e.to_string()))?;
        let envelope: SnapshotEnvelope = serde_json::from_str(&raw)
            .map_err(|e| CovenantError::SnapshotCorrupted(e.to_string()))?;

        if envelope.version != SNAPSHOT_VERSION {
            return Err(CovenantError::SnapshotCorrupted(format!(
                "unsupported snapshot version {}",
                envelope.version
            )));
        }
        let actual = crc32fast::hash(envelope.state.as_bytes());
        if actual != envelope.checksum {
            return Err(CovenantError::SnapshotCorrupted(format!(
                "checksum mismatch: stored {:08x}, computed {actual:08x}",
                envelope.checksum
            )));
        }

        serde_json::from_str(&envelope.state)
            .map_err(|e| CovenantError::SnapshotCorrupted(e.to_string()))
    }
}

/// On-disk wrapper: the state is stored as an opaque string so the crc is
/// computed over exactly the bytes that will be re-read.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotEnvelope {
    version: u32,
    checksum: u32,
    state: String,
}
