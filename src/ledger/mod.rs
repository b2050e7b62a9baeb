//! Append-only, sequence-numbered audit ledger.
//!
//! One JSONL file per job. Every orchestration mutation appends exactly one
//! entry; entries are never rewritten. A crash mid-write leaves at most one
//! partial trailing line, which `open` tolerates and the next append
//! supersedes.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CovenantError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: LedgerEvent,
}

/// The orchestration event vocabulary recorded in the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    JobCreated {
        job_id: String,
        contract: String,
    },
    StatusChanged {
        from: String,
        to: String,
        reason: String,
    },
    PhaseEntered {
        phase_id: String,
    },
    SessionStarted {
        role_id: String,
        phase_id: String,
        mode: String,
        attempt: u32,
    },
    SessionOutcome {
        role_id: String,
        outcome: String,
        detail: String,
    },
    SessionReverted {
        role_id: String,
        phase_id: String,
        attempt: u32,
        violations: Vec<String>,
    },
    ScopeViolation {
        role_id: String,
        severity: String,
        paths: Vec<String>,
    },
    CompletionChecked {
        role_id: String,
        phase_id: String,
        passed: bool,
        failed: Vec<String>,
        deferred: Vec<String>,
    },
    RoleCompleted {
        role_id: String,
        phase_id: String,
        summary: String,
    },
    GatePresented {
        gate_id: String,
        fingerprint: String,
    },
    GateResolved {
        gate_id: String,
        decision: String,
        fingerprint: String,
        replayed: bool,
    },
    EscalationRaised {
        role_id: String,
        reason: String,
    },
    EscalationResolved {
        role_id: String,
        granted: bool,
        detail: String,
    },
    OverrideInstalled {
        owner_role: String,
        kind: String,
        patterns: Vec<String>,
        phase: String,
        expires_after_attempt: u32,
    },
    JobFinished {
        status: String,
        reason: String,
        details: serde_json::Value,
    },
}

impl LedgerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::JobCreated { .. } => "job_created",
            Self::StatusChanged { .. } => "status_changed",
            Self::PhaseEntered { .. } => "phase_entered",
            Self::SessionStarted { .. } => "session_started",
            Self::SessionOutcome { .. } => "session_outcome",
            Self::SessionReverted { .. } => "session_reverted",
            Self::ScopeViolation { .. } => "scope_violation",
            Self::CompletionChecked { .. } => "completion_checked",
            Self::RoleCompleted { .. } => "role_completed",
            Self::GatePresented { .. } => "gate_presented",
            Self::GateResolved { .. } => "gate_resolved",
            Self::EscalationRaised { .. } => "escalation_raised",
            Self::EscalationResolved { .. } => "escalation_resolved",
            Self::OverrideInstalled { .. } => "override_installed",
            Self::JobFinished { .. } => "job_finished",
        }
    }
}

pub struct Ledger {
    path: PathBuf,
    file: File,
    next_seq: u64,
}

impl Ledger {
    /// Open (or create) the ledger, recovering the next sequence number by
    /// scanning from the end and accepting the last line that parses.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut next_seq = 1;
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            let lines: Vec<String> = reader.lines().collect::<std::io::Result<_>>()?;
            for (idx, line) in lines.iter().enumerate().rev() {
                match serde_json::from_str::<LedgerEntry>(line) {
                    Ok(entry) => {
                        next_seq = entry.seq + 1;
                        break;
                    }
                    Err(e) => {
                        // A trailing partial line from a crash mid-write.
                        warn!(
                            line = idx + 1,
                            error = %e,
                            "Ignoring unparseable trailing ledger line"
                        );
                    }
                }
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        debug!(path = %path.display(), next_seq, "Ledger opened");

        Ok(Self {
            path,
            file,
            next_seq,
        })
    }

    /// Append one event; returns the sequence number it received.
    pub fn append(&mut self, event: LedgerEvent) -> Result<u64> {
        let entry = LedgerEntry {
            seq: self.next_seq,
            timestamp: Utc::now(),
            event,
        };

        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        self.file.flush()?;

        debug!(seq = entry.seq, kind = entry.event.kind(), "Ledger append");

        self.next_seq += 1;
        Ok(entry.seq)
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read every entry. Fails on any unparseable line.
    pub fn read_all(&self) -> Result<Vec<LedgerEntry>> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut entries = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: LedgerEntry = serde_json::from_str(&line).map_err(|e| {
                CovenantError::Ledger(format!("line {}: {}", idx + 1, e))
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Assert sequence numbers are exactly `1..n` with no gaps and no
    /// unparseable lines.
    pub fn verify_integrity(&self) -> Result<u64> {
        let entries = self
            .read_all()
            .map_err(|e| CovenantError::LedgerIntegrity(e.to_string()))?;

        for (idx, entry) in entries.iter().enumerate() {
            let expected = idx as u64 + 1;
            if entry.seq != expected {
                return Err(CovenantError::LedgerIntegrity(format!(
                    "expected seq {expected}, found {}",
                    entry.seq
                )));
            }
        }

        Ok(entries.len() as u64)
    }

    /// Most recent entry matching `predicate`, scanning from the end.
    pub fn last_matching<F>(&self, predicate: F) -> Result<Option<LedgerEntry>>
    where
        F: Fn(&LedgerEntry) -> bool,
    {
        Ok(self.read_all()?.into_iter().rev().find(|e| predicate(e)))
    }

    pub fn count_matching<F>(&self, predicate: F) -> Result<usize>
    where
        F: Fn(&LedgerEntry) -> bool,
    {
        Ok(self.read_all()?.iter().filter(|e| predicate(e)).count())
    }
}
