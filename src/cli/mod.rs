//! Command-line interface: thin dispatch over the engine.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing::info;

use crate::config::{EngineConfig, JobPaths};
use crate::contract::{Contract, GateSpec};
use crate::error::{CovenantError, Result};
use crate::gate::{ApprovalBoundary, ApprovalResponse, GateDecision, GatePromptModel};
use crate::git::GitRunner;
use crate::job::{CancelToken, JobManager, JobOutcome, JobState};
use crate::ledger::Ledger;
use crate::session::ProcessSessionBackend;

pub const DEFAULT_CONTRACT_FILE: &str = "covenant.contract.json";
pub const DEFAULT_STATE_DIR: &str = ".covenant";

#[derive(Parser)]
#[command(name = "covenant", about = "Contract-governed multi-agent job orchestration")]
pub struct Cli {
    /// Enable debug logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Engine state directory.
    #[arg(long, global = true, default_value = DEFAULT_STATE_DIR)]
    pub state_dir: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start a new job from a contract.
    Run {
        /// Contract file.
        #[arg(long, default_value = DEFAULT_CONTRACT_FILE)]
        contract: PathBuf,

        /// Repository the job runs against; defaults to the current directory.
        #[arg(long)]
        workspace: Option<PathBuf>,

        /// Job identifier; generated when omitted.
        #[arg(long)]
        job_id: Option<String>,
    },

    /// Resume an interrupted job from its last checkpoint.
    Resume {
        job_id: String,

        #[arg(long, default_value = DEFAULT_CONTRACT_FILE)]
        contract: PathBuf,
    },

    /// Show a job's persisted status.
    Status { job_id: String },

    /// Verify a job ledger's sequence integrity.
    VerifyLedger { job_id: String },
}

pub async fn execute(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run {
            contract,
            workspace,
            job_id,
        } => {
            let workspace = match workspace {
                Some(path) => path,
                None => std::env::current_dir()?,
            };
            let contract = Contract::load(&contract).await?;
            let config = EngineConfig::load(&cli.state_dir).await?;
            let job_id = job_id
                .unwrap_or_else(|| format!("job-{}", &uuid::Uuid::new_v4().to_string()[..8]));

            let mut manager = JobManager::create(
                &job_id,
                contract,
                config.clone(),
                &cli.state_dir,
                &workspace,
                Arc::new(GitRunner::new(&workspace)),
                Arc::new(ProcessSessionBackend::new(config.session.clone())),
                Arc::new(ConsoleApproval),
            )?;

            let cancel = CancelToken::new();
            cancel.listen_for_ctrl_c();
            let outcome = manager.run(&cancel).await?;
            report_outcome(&job_id, &outcome)
        }

        Command::Resume { job_id, contract } => {
            let contract = Contract::load(&contract).await?;
            let config = EngineConfig::load(&cli.state_dir).await?;

            let state = JobState::load(&JobPaths::new(&cli.state_dir, &job_id).snapshot_path)?;
            let workspace = state.workspace.root.clone();

            let mut manager = JobManager::resume(
                &job_id,
                contract,
                config.clone(),
                &cli.state_dir,
                Arc::new(GitRunner::new(&workspace)),
                Arc::new(ProcessSessionBackend::new(config.session.clone())),
                Arc::new(ConsoleApproval),
            )?;

            let cancel = CancelToken::new();
            cancel.listen_for_ctrl_c();
            let outcome = manager.run(&cancel).await?;
            report_outcome(&job_id, &outcome)
        }

        Command::Status { job_id } => {
            let paths = JobPaths::new(&cli.state_dir, &job_id);
            let state = JobState::load(&paths.snapshot_path)
                .map_err(|_| CovenantError::JobNotFound(job_id.clone()))?;
            println!("job:     {}", state.job_id);
            println!("status:  {}", state.status);
            println!("phase:   {}", state.current_phase_id);
            println!("actor:   {}", state.current_actor_index);
            if let Some(gate) = &state.pending_gate {
                println!("pending gate: {gate}");
            }
            println!("started: {}", state.started_at);
            println!("updated: {}", state.updated_at);
            Ok(())
        }

        Command::VerifyLedger { job_id } => {
            let paths = JobPaths::new(&cli.state_dir, &job_id);
            let ledger = Ledger::open(&paths.ledger_path)?;
            let count = ledger.verify_integrity()?;
            println!("ledger ok: {count} entries, sequence 1..{count}");
            Ok(())
        }
    }
}

fn report_outcome(job_id: &str, outcome: &JobOutcome) -> Result<()> {
    info!(job_id, status = %outcome.status, reason = outcome.reason, "Job finished");
    println!("{job_id}: {} ({})", outcome.status, outcome.reason);
    if !outcome.details.is_null() && outcome.details != serde_json::json!({}) {
        println!("{}", serde_json::to_string_pretty(&outcome.details)?);
    }
    Ok(())
}

/// Terminal approval boundary: renders the prompt model and reads one
/// decision from stdin.
pub struct ConsoleApproval;

#[async_trait]
impl ApprovalBoundary for ConsoleApproval {
    async fn present_gate_prompt(
        &self,
        gate: &GateSpec,
        model: &GatePromptModel,
    ) -> Result<ApprovalResponse> {
        println!("{}", model.render());
        println!("Decision for gate `{}` [a]pprove / [r]eject / e[x]ception:", gate.id);

        let line = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).map(|_| line)
        })
        .await
        .map_err(|e| CovenantError::Gate(e.to_string()))??;

        let decision = match line.trim().to_lowercase().as_str() {
            "a" | "approve" => GateDecision::Approve,
            "r" | "reject" => GateDecision::Reject,
            "x" | "exception" => GateDecision::Exception,
            other => {
                return Err(CovenantError::Gate(format!(
                    "unrecognized decision: '{other}'"
                )))
            }
        };

        Ok(ApprovalResponse {
            decision,
            notes: None,
        })
    }
}
