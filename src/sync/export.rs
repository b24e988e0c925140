//! Export pipeline (C7, §4.7): deferred, two-phase so a commit failure never
//! advances the hash metadata past what's actually on disk.

use crate::config::ValidationOnSync;
use crate::error::{BeadsError, Result};
use crate::jsonl;
use crate::storage::{SearchFilter, Store};
use crate::util::hash::hash_bytes;
use crate::validation::IssueValidator;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct ExportResult {
    pub path: PathBuf,
    pub exported_ids: Vec<String>,
    pub content_hash: String,
    pub export_time: DateTime<Utc>,
}

/// Pre-flight checks before writing the export.
///
/// # Errors
///
/// Returns `Validation` if the store is empty while the target JSONL already
/// has content (invariant #7: an empty export would look like a mass deletion).
/// Returns `ConstraintViolation` if two issues in the export set share an id
/// (duplicates are treated as database corruption, never warned-and-skipped).
/// Returns the accumulated `ValidationErrors` if `validation_on_sync` is
/// `Error` and any issue fails template validation.
fn preflight(
    store: &dyn Store,
    path: &Path,
    force: bool,
    validation_on_sync: ValidationOnSync,
) -> Result<()> {
    if force {
        return Ok(());
    }
    let count = store.count()?;
    if count == 0 && path.exists() && !jsonl::read_raw(path)?.is_empty() {
        return Err(BeadsError::Validation {
            field: "store".to_string(),
            reason: "refusing to export an empty store over a non-empty JSONL file".to_string(),
        });
    }

    let issues = store.search(SearchFilter {
        include_tombstones: false,
    })?;

    let mut seen_ids = HashSet::with_capacity(issues.len());
    for issue in &issues {
        if !seen_ids.insert(issue.id.as_str()) {
            return Err(BeadsError::ConstraintViolation {
                reason: format!("duplicate issue id in export set: {}", issue.id),
            });
        }
    }

    for issue in &issues {
        for dep in &issue.dependencies {
            if store.get(&dep.depends_on_id)?.is_none() {
                warn!(issue_id = %issue.id, depends_on = %dep.depends_on_id, "orphan dependency on export");
            }
        }
    }

    if validation_on_sync != ValidationOnSync::None {
        let mut all_errors = Vec::new();
        for issue in &issues {
            if let Err(errors) = IssueValidator::validate(issue) {
                warn!(issue_id = %issue.id, errors = ?errors, "template validation failed on export");
                all_errors.extend(errors);
            }
        }
        if !all_errors.is_empty() && validation_on_sync == ValidationOnSync::Error {
            return Err(BeadsError::from_validation_errors(all_errors));
        }
    }

    Ok(())
}

/// Export the store to `path` without touching sync metadata. The caller
/// must call `finalize` after the VCS commit succeeds.
///
/// # Errors
///
/// Returns an error if pre-flight or the atomic write fails.
pub fn export_deferred(
    store: &dyn Store,
    path: &Path,
    force: bool,
    validation_on_sync: ValidationOnSync,
) -> Result<ExportResult> {
    preflight(store, path, force, validation_on_sync)?;

    let issues = store.search(SearchFilter {
        include_tombstones: true,
    })?;
    let exported_ids: Vec<String> = issues
        .iter()
        .filter(|i| !i.ephemeral)
        .map(|i| i.id.clone())
        .collect();

    let bytes = jsonl::encode(&issues)?;
    jsonl::write_bytes_atomic(path, &bytes)?;

    let content_hash = hash_bytes(&bytes);
    let export_time = Utc::now();

    info!(path = %path.display(), count = exported_ids.len(), hash = %content_hash, "exported store to JSONL");

    Ok(ExportResult {
        path: path.to_path_buf(),
        exported_ids,
        content_hash,
        export_time,
    })
}

/// Advance sync metadata and dirty tracking after the VCS commit succeeds.
///
/// # Errors
///
/// Returns an error if the store metadata cannot be updated.
pub fn finalize(store: &mut dyn Store, result: &ExportResult, repo_key: &str) -> Result<()> {
    store.clear_dirty_issues_by_id(&result.exported_ids)?;
    store.set_metadata(
        &format!("jsonl_content_hash:{repo_key}"),
        &result.content_hash,
    )?;
    store.set_metadata(
        &format!("last_import_time:{repo_key}"),
        &result.export_time.to_rfc3339(),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Issue, IssueType, Priority, Status};
    use crate::storage::SqliteStore;
    use tempfile::tempdir;

    fn sample(id: &str) -> Issue {
        Issue {
            id: id.to_string(),
            content_hash: None,
            title: "T".to_string(),
            description: None,
            design: None,
            acceptance_criteria: None,
            notes: None,
            status: Status::Open,
            priority: Priority::MEDIUM,
            issue_type: IssueType::Task,
            assignee: None,
            estimated_minutes: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            closed_at: None,
            due_at: None,
            defer_until: None,
            close_reason: None,
            external_ref: None,
            source_repo: None,
            deleted_at: None,
            deleted_by: None,
            delete_reason: None,
            ephemeral: false,
            pinned: false,
            labels: vec![],
            dependencies: vec![],
            comments: vec![],
        }
    }

    #[test]
    fn export_then_finalize_advances_metadata() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("issues.jsonl");
        let mut store = SqliteStore::open_memory().unwrap();
        store.create(&sample("bd-1"), "tester").unwrap();

        let result = export_deferred(&store, &path, false, ValidationOnSync::None).unwrap();
        assert_eq!(result.exported_ids, vec!["bd-1".to_string()]);
        assert!(store.get_metadata("jsonl_content_hash:origin").unwrap().is_none());

        finalize(&mut store, &result, "origin").unwrap();
        assert_eq!(
            store.get_metadata("jsonl_content_hash:origin").unwrap(),
            Some(result.content_hash)
        );
        assert!(store.dirty_issue_ids().unwrap().is_empty());
    }

    #[test]
    fn preflight_refuses_emptying_nonempty_jsonl() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("issues.jsonl");
        std::fs::write(&path, "{\"id\":\"bd-1\"}\n").unwrap();
        let store = SqliteStore::open_memory().unwrap();

        let result = export_deferred(&store, &path, false, ValidationOnSync::None);
        assert!(matches!(result, Err(BeadsError::Validation { .. })));
    }

    #[test]
    fn validation_warn_logs_but_still_exports() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("issues.jsonl");
        let mut store = SqliteStore::open_memory().unwrap();
        let mut issue = sample("bd-1");
        issue.title = String::new();
        store.create(&issue, "tester").unwrap();

        let result = export_deferred(&store, &path, false, ValidationOnSync::Warn).unwrap();
        assert_eq!(result.exported_ids, vec!["bd-1".to_string()]);
    }

    #[test]
    fn validation_error_blocks_export() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("issues.jsonl");
        let mut store = SqliteStore::open_memory().unwrap();
        let mut issue = sample("bd-1");
        issue.title = String::new();
        issue.external_ref = Some("has space".to_string());
        store.create(&issue, "tester").unwrap();

        let result = export_deferred(&store, &path, false, ValidationOnSync::Error);
        assert!(matches!(
            result,
            Err(BeadsError::ValidationErrors { .. })
        ));
        assert!(!path.exists());
    }
}
