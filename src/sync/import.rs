//! Import pipeline (C8, §4.8): JSONL into the store.
//!
//! Each upsert below is individually transactional (every `Store` method is,
//! per §4.2); they are not wrapped in one outer transaction spanning the
//! whole batch, since that would require a non-object-safe method on the
//! `Store` trait. A partial import on a mid-batch I/O failure leaves the
//! store with a prefix of the batch applied, which the next sync's merge
//! reconciles against — it does not leave the store inconsistent.

use crate::error::{BeadsError, Result};
use crate::jsonl;
use crate::model::{Issue, Status};
use crate::storage::{IssuePatch, Store};
use crate::util::hash::hash_bytes;
use crate::util::id::{prefix_of, rewrite_prefix};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::warn;

#[derive(Debug, Default)]
pub struct ImportResult {
    pub imported: usize,
    pub tombstoned: usize,
    pub skipped_lines: Vec<usize>,
    pub pre_count: usize,
    pub post_count: usize,
}

/// # Errors
///
/// Returns `PrefixMismatch` if the inbound prefix differs from the store's
/// and `rename_on_import` wasn't requested, or any store/IO error.
pub fn import(
    store: &mut dyn Store,
    path: &Path,
    expected_prefix: &str,
    rename_on_import: bool,
    repo_key: &str,
) -> Result<ImportResult> {
    let report = jsonl::read_file(path)?;
    let pre_count = store.count()?;

    let mismatched: HashSet<String> = report
        .issues
        .iter()
        .filter_map(|i| prefix_of(&i.id))
        .filter(|p| *p != expected_prefix)
        .map(str::to_string)
        .collect();

    if !mismatched.is_empty() && !rename_on_import {
        let found = mismatched.into_iter().next().unwrap_or_default();
        return Err(BeadsError::PrefixMismatch {
            expected: expected_prefix.to_string(),
            found,
        });
    }

    let mut issues = report.issues;
    if !mismatched.is_empty() {
        let renames = rename_mismatched_prefixes(store, &mut issues, expected_prefix)?;
        for (old_id, new_id) in &renames {
            store.rename_dependency_target(old_id, new_id)?;
        }
    }

    let mut imported = 0;
    let mut tombstoned = 0;

    for issue in &issues {
        let is_tombstone = issue.status.is_tombstone();
        match store.get(&issue.id)? {
            Some(existing) => {
                if is_tombstone && !existing.status.is_tombstone() {
                    tombstoned += 1;
                }
                let patch = IssuePatch {
                    title: Some(issue.title.clone()),
                    description: Some(issue.description.clone()),
                    design: Some(issue.design.clone()),
                    acceptance_criteria: Some(issue.acceptance_criteria.clone()),
                    notes: Some(issue.notes.clone()),
                    status: Some(issue.status.clone()),
                    priority: Some(issue.priority),
                    issue_type: Some(issue.issue_type.clone()),
                    assignee: Some(issue.assignee.clone()),
                    estimated_minutes: Some(issue.estimated_minutes),
                    due_at: Some(issue.due_at),
                    defer_until: Some(issue.defer_until),
                    external_ref: Some(issue.external_ref.clone()),
                };
                store.update(&issue.id, &patch, "import")?;
            }
            None => {
                store.create(issue, "import")?;
                if is_tombstone {
                    tombstoned += 1;
                }
            }
        }

        let existing_labels: HashSet<String> = store.get_labels(&issue.id)?.into_iter().collect();
        for label in &issue.labels {
            if !existing_labels.contains(label) {
                store.add_label(&issue.id, label)?;
            }
        }

        for dep in &issue.dependencies {
            store.add_dependency(dep)?;
        }

        let existing_comment_ids: HashSet<i64> = store
            .get_comments(&issue.id)?
            .into_iter()
            .map(|c| c.id)
            .collect();
        for comment in &issue.comments {
            if comment.id == 0 || !existing_comment_ids.contains(&comment.id) {
                store.add_comment(comment)?;
            }
        }

        imported += 1;
    }

    let post_count = store.count()?;
    if pre_count > post_count && pre_count - post_count > tombstoned {
        warn!(
            pre_count,
            post_count, tombstoned, "issue count decreased by more than the number of applied tombstones"
        );
    }

    let bytes = jsonl::read_raw(path)?;
    let content_hash = hash_bytes(&bytes);
    store.set_metadata(&format!("jsonl_content_hash:{repo_key}"), &content_hash)?;
    store.set_metadata(
        &format!("last_import_time:{repo_key}"),
        &chrono::Utc::now().to_rfc3339(),
    )?;

    Ok(ImportResult {
        imported,
        tombstoned,
        skipped_lines: report.skipped_lines,
        pre_count,
        post_count,
    })
}

/// Resolve a foreign-prefix id to a local one, preserving the suffix and
/// child path, and disambiguating against both the store and the rest of
/// this batch on collision.
fn local_id_for(
    store: &dyn Store,
    expected_prefix: &str,
    foreign_id: &str,
    taken: &HashSet<String>,
    renames: &HashMap<String, String>,
) -> Result<String> {
    let base = rewrite_prefix(foreign_id, expected_prefix)
        .unwrap_or_else(|| format!("{expected_prefix}-{foreign_id}"));

    let mut candidate = base.clone();
    let mut attempt = 0u32;
    while store.get(&candidate)?.is_some()
        || taken.contains(&candidate)
        || renames.values().any(|v| v == &candidate)
    {
        attempt += 1;
        candidate = format!("{base}r{attempt}");
    }
    Ok(candidate)
}

/// Rename every issue whose id carries a prefix other than `expected_prefix`
/// to a freshly resolved local id, preserving the original id in
/// `external_ref` and rewriting every dependency reference within the batch
/// against the resulting mapping (spec §3.2 invariant #1: ids are
/// workspace-local once renamed).
///
/// # Errors
///
/// Returns an error if the store can't be queried while resolving collisions.
fn rename_mismatched_prefixes(
    store: &dyn Store,
    issues: &mut [Issue],
    expected_prefix: &str,
) -> Result<HashMap<String, String>> {
    let local_ids: HashSet<String> = issues
        .iter()
        .filter(|i| prefix_of(&i.id) == Some(expected_prefix))
        .map(|i| i.id.clone())
        .collect();

    let mut renames: HashMap<String, String> = HashMap::new();
    for issue in issues.iter() {
        if prefix_of(&issue.id) == Some(expected_prefix) {
            continue;
        }
        let new_id = local_id_for(store, expected_prefix, &issue.id, &local_ids, &renames)?;
        renames.insert(issue.id.clone(), new_id);
    }

    for issue in issues.iter_mut() {
        if let Some(new_id) = renames.get(&issue.id) {
            if issue.external_ref.is_none() {
                issue.external_ref = Some(issue.id.clone());
            }
            issue.id = new_id.clone();
        }
        for dep in &mut issue.dependencies {
            if let Some(new_target) = renames.get(&dep.depends_on_id) {
                dep.depends_on_id = new_target.clone();
            }
            if let Some(new_source) = renames.get(&dep.issue_id) {
                dep.issue_id = new_source.clone();
            }
        }
    }

    Ok(renames)
}
