use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CovenantError {
    #[error("Contract validation failed: {0}")]
    ContractInvalid(String),

    #[error("Unknown role: {0}")]
    UnknownRole(String),

    #[error("Unknown phase: {0}")]
    UnknownPhase(String),

    #[error("Unknown gate: {0}")]
    UnknownGate(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Invalid job status transition: {from} -> {to} (allowed: {allowed})")]
    InvalidStatusTransition {
        from: String,
        to: String,
        allowed: String,
    },

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Ledger integrity violation: {0}")]
    LedgerIntegrity(String),

    #[error("Evidence error: {0}")]
    Evidence(String),

    #[error("Evidence already archived: {}", path.display())]
    EvidenceExists { path: PathBuf },

    #[error("Snapshot corrupted: {0}")]
    SnapshotCorrupted(String),

    #[error("Snapshot persistence failed: {0}")]
    SnapshotPersistence(String),

    #[error("Delegation plan error: {0}")]
    DelegationPlan(String),

    #[error("Delegation cycle detected: {}", path.join(" -> "))]
    DelegationCycle { path: Vec<String> },

    #[error("Session error: {0}")]
    Session(String),

    #[error("Session backend unavailable: {0}")]
    SessionBackend(String),

    #[error("Gate error: {0}")]
    Gate(String),

    #[error("Gate input unresolvable: {0}")]
    GateInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, CovenantError>;
