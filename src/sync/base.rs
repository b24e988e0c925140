//! Base-state store (C6, §4.6).
//!
//! The base snapshot from the last successful sync, kept as its own JSONL
//! file beside the tracked one. `None` means "no sync has ever succeeded
//! here" — the orchestrator treats that as a pure two-way merge against an
//! empty base.

use crate::error::Result;
use crate::jsonl;
use crate::model::Issue;
use std::path::Path;

pub const BASE_FILE_NAME: &str = ".base.jsonl";

/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_base(workspace_dir: &Path) -> Result<Option<Vec<Issue>>> {
    let path = workspace_dir.join(BASE_FILE_NAME);
    if !path.exists() {
        return Ok(None);
    }
    let report = jsonl::read_file(&path)?;
    Ok(Some(report.issues))
}

/// # Errors
///
/// Returns an error if the atomic write fails.
pub fn save_base(workspace_dir: &Path, issues: &[Issue]) -> Result<()> {
    let path = workspace_dir.join(BASE_FILE_NAME);
    jsonl::write_file_atomic(&path, issues)
}
