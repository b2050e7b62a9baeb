//! Canonical gate fingerprints for presentation dedup.
//!
//! The fingerprint commits to the gate's identity and approval semantics,
//! the existence and content of every required input in declared order,
//! and, for gates triggered from a planning phase, the entire planning
//! artifact tree. Identical inputs always hash identically.

use std::path::Path;

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::contract::GateSpec;
use crate::error::Result;

use super::{InputDetail, ResolvedInput};

pub fn compute_gate_fingerprint(
    gate: &GateSpec,
    inputs: &[ResolvedInput],
    planning_tree: Option<&Path>,
) -> Result<String> {
    let mut hasher = Sha256::new();

    hasher.update(b"gate\0");
    hasher.update(gate.id.as_bytes());
    hasher.update(b"\0");
    hasher.update(gate.trigger.as_bytes());
    hasher.update(b"\0");
    hasher.update(gate.approval_scope.as_bytes());
    hasher.update(b"\0");

    for input in inputs {
        hasher.update(b"input\0");
        hasher.update(input.label.as_bytes());
        hasher.update(b"\0");
        match &input.detail {
            InputDetail::Text { text } => {
                hasher.update(b"text\0");
                hasher.update(text.as_bytes());
            }
            InputDetail::Files { files } if files.is_empty() => {
                hasher.update(b"absent\0");
            }
            InputDetail::Files { files } => {
                for file in files {
                    hasher.update(b"file\0");
                    hasher.update(file.path.as_bytes());
                    hasher.update(b"\0");
                    hasher.update(file.digest.as_bytes());
                }
            }
        }
        hasher.update(b"\0");
    }

    if let Some(root) = planning_tree {
        hasher.update(b"planning\0");
        hasher.update(hash_tree(root)?.as_slice());
    }

    Ok(hex(&hasher.finalize()))
}

/// Digest every regular file under `root` in sorted relative-path order.
fn hash_tree(root: &Path) -> Result<Vec<u8>> {
    let mut files = Vec::new();
    if root.is_dir() {
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry.map_err(std::io::Error::from)?;
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }
    }
    files.sort();

    let mut hasher = Sha256::new();
    for path in files {
        let rel = path.strip_prefix(root).unwrap_or(&path);
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update(b"\0");
        hasher.update(std::fs::read(&path)?.as_slice());
        hasher.update(b"\0");
    }
    Ok(hasher.finalize().to_vec())
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
