//! Write-once artifact archive referenced by ledger sequence.
//!
//! Diffs, command output, and gate inputs are stored as individual files
//! named `<seq>-<label>`. Once written, a file is never replaced.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CovenantError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvidenceRef {
    pub seq: u64,
    pub label: String,
    pub path: PathBuf,
}

pub struct EvidenceArchive {
    root: PathBuf,
}

impl EvidenceArchive {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_path(&self, seq: u64, label: &str) -> PathBuf {
        let safe: String = label
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        self.root.join(format!("{seq:06}-{safe}"))
    }

    /// Archive raw bytes under `<seq>-<label>`. Refuses to overwrite.
    pub fn store(&self, seq: u64, label: &str, bytes: &[u8]) -> Result<EvidenceRef> {
        let path = self.file_path(seq, label);
        if path.exists() {
            return Err(CovenantError::EvidenceExists { path });
        }
        std::fs::write(&path, bytes)?;
        debug!(seq, label, path = %path.display(), "Evidence archived");
        Ok(EvidenceRef {
            seq,
            label: label.to_string(),
            path,
        })
    }

    pub fn store_text(&self, seq: u64, label: &str, text: &str) -> Result<EvidenceRef> {
        self.store(seq, label, text.as_bytes())
    }

    pub fn read(&self, evidence: &EvidenceRef) -> Result<Vec<u8>> {
        std::fs::read(&evidence.path).map_err(|e| {
            CovenantError::Evidence(format!("{}: {}", evidence.path.display(), e))
        })
    }
}
