use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{CovenantError, Result};

pub const CONFIG_FILE: &str = "config.toml";

/// Directory layout for one job under the engine state dir.
#[derive(Debug, Clone)]
pub struct JobPaths {
    pub job_dir: PathBuf,
    pub ledger_path: PathBuf,
    pub snapshot_path: PathBuf,
    pub evidence_dir: PathBuf,
    pub planning_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub escalation_dir: PathBuf,
}

impl JobPaths {
    pub fn new(state_dir: &Path, job_id: &str) -> Self {
        let job_dir = state_dir.join("jobs").join(job_id);
        Self {
            ledger_path: job_dir.join("ledger.jsonl"),
            snapshot_path: job_dir.join("status.json"),
            evidence_dir: job_dir.join("evidence"),
            planning_dir: job_dir.join("planning"),
            staging_dir: job_dir.join("staging"),
            escalation_dir: job_dir.join("escalations"),
            job_dir,
        }
    }

    pub fn ensure(&self) -> Result<()> {
        for dir in [
            &self.job_dir,
            &self.evidence_dir,
            &self.planning_dir,
            &self.staging_dir,
            &self.escalation_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub session: SessionConfig,
    pub gate: GateConfig,
    pub policy: PolicyConfig,
    pub git: GitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds without session output before the health monitor requests a stop.
    pub inactivity_timeout_secs: u64,
    /// Floor applied to `inactivity_timeout_secs`.
    pub min_inactivity_timeout_secs: u64,
    /// Health monitor tick interval.
    pub monitor_interval_secs: u64,
    /// Grace period between graceful stop and forced kill.
    pub stop_grace_secs: u64,
    pub agent_command: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: 600,
            min_inactivity_timeout_secs: 60,
            monitor_interval_secs: 5,
            stop_grace_secs: 10,
            agent_command: "claude".to_string(),
        }
    }
}

impl SessionConfig {
    /// Effective inactivity timeout with the floor applied.
    pub fn inactivity_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(
            self.inactivity_timeout_secs
                .max(self.min_inactivity_timeout_secs),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Max bytes of a required-input file included in the prompt preview.
    pub input_preview_bytes: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            input_preview_bytes: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Violation count at which a scope violation becomes structural.
    pub structural_violation_threshold: usize,
    /// Attempts of feedback history retained per role.
    pub feedback_history_len: usize,
    /// Seconds to wait for a smoke-check endpoint to respond.
    pub smoke_check_timeout_secs: u64,
    /// Seconds allotted to completion-criterion commands.
    pub command_timeout_secs: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            structural_violation_threshold: 3,
            feedback_history_len: 5,
            smoke_check_timeout_secs: 30,
            command_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub commit_prefix: String,
    pub branch_prefix: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            commit_prefix: "covenant".to_string(),
            branch_prefix: "covenant/".to_string(),
        }
    }
}

impl EngineConfig {
    pub async fn load(state_dir: &Path) -> Result<Self> {
        let config_path = state_dir.join(CONFIG_FILE);
        let config = if config_path.exists() {
            let content = fs::read_to_string(&config_path).await?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, state_dir: &Path) -> Result<()> {
        self.validate()?;
        let content =
            toml::to_string_pretty(self).map_err(|e| CovenantError::Config(e.to_string()))?;
        fs::write(state_dir.join(CONFIG_FILE), content).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.session.monitor_interval_secs == 0 {
            errors.push("session.monitor_interval_secs must be greater than 0");
        }
        if self.session.min_inactivity_timeout_secs == 0 {
            errors.push("session.min_inactivity_timeout_secs must be greater than 0");
        }
        if self.session.agent_command.is_empty() {
            errors.push("session.agent_command must not be empty");
        }
        if self.policy.structural_violation_threshold == 0 {
            errors.push("policy.structural_violation_threshold must be greater than 0");
        }
        if self.policy.feedback_history_len == 0 {
            errors.push("policy.feedback_history_len must be greater than 0");
        }
        if self.policy.command_timeout_secs == 0 {
            errors.push("policy.command_timeout_secs must be greater than 0");
        }
        if self.gate.input_preview_bytes == 0 {
            errors.push("gate.input_preview_bytes must be greater than 0");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CovenantError::Config(errors.join("; ")))
        }
    }
}
