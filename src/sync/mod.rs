//! Sync orchestrator (C9, §4.9) and its supporting modules.
//!
//! This module ties together the JSONL codec (`crate::jsonl`), the merge
//! engine (`crate::merge`), the base-state store, the staleness oracle, the
//! advisory file lock, and the git plumbing into the pull-first pipeline.

pub mod base;
pub mod export;
pub mod history;
pub mod import;
pub mod lock;
pub mod path;
pub mod staleness;
pub mod vcs;

use crate::config::ValidationOnSync;
use crate::error::Result;
use crate::jsonl;
use crate::merge::{self, MergeResult};
use crate::storage::Store;
use history::HistoryConfig;
use lock::SyncLock;
use std::path::PathBuf;
use tracing::{info, info_span};

/// Everything the orchestrator needs to know about one workspace.
#[derive(Debug, Clone)]
pub struct SyncContext {
    pub workspace_dir: PathBuf,
    pub jsonl_path: PathBuf,
    pub db_path: PathBuf,
    pub issue_prefix: String,
    pub repo_key: String,
    pub sync_branch: Option<String>,
    pub no_push: bool,
    pub no_pull: bool,
    pub no_git_history: bool,
    pub rename_on_import: bool,
    pub force_export: bool,
    pub validation_on_sync: ValidationOnSync,
}

#[derive(Debug, Default)]
pub struct SyncReport {
    pub merge: Option<MergeSummary>,
    pub imported: usize,
    pub exported: usize,
    pub pushed: bool,
}

#[derive(Debug)]
pub struct MergeSummary {
    pub conflict_count: usize,
    pub total: usize,
}

impl From<&MergeResult> for MergeSummary {
    fn from(result: &MergeResult) -> Self {
        Self {
            conflict_count: result.conflict_count,
            total: result.merged.len(),
        }
    }
}

/// Before acquiring the lock, recover from a previously aborted sync: if the
/// working tree has uncommitted changes to the JSONL file that don't
/// correspond to a real edit in the store, re-export so the file on disk
/// matches (§4.9 "Uncommitted-JSONL guard").
///
/// # Errors
///
/// Returns an error if the re-export fails.
fn uncommitted_jsonl_guard(ctx: &SyncContext, store: &mut dyn Store) -> Result<()> {
    if vcs::require_git_repo(&ctx.workspace_dir).is_err() {
        return Ok(());
    }
    let relative = ctx
        .jsonl_path
        .strip_prefix(&ctx.workspace_dir)
        .unwrap_or(&ctx.jsonl_path);
    if vcs::has_uncommitted_change(&ctx.workspace_dir, relative)? {
        info!(path = %ctx.jsonl_path.display(), "recovering from uncommitted JSONL left by a previous sync");
        let result = export::export_deferred(store, &ctx.jsonl_path, true, ctx.validation_on_sync)?;
        export::finalize(store, &result, &ctx.repo_key)?;
    }
    Ok(())
}

/// Run the full pull-first sync pipeline (§4.9 steps 1-15).
///
/// # Errors
///
/// Returns an error at any pipeline step; the lock is released on drop
/// regardless of how this function returns.
pub fn sync(ctx: &SyncContext, store: &mut dyn Store) -> Result<SyncReport> {
    let _span = info_span!("sync", workspace = %ctx.workspace_dir.display()).entered();

    uncommitted_jsonl_guard(ctx, store)?;

    // Step 2: snapshot local, including tombstones.
    let local = store.search(crate::storage::SearchFilter {
        include_tombstones: true,
    })?;

    // Step 3: acquire the exclusive sync lock.
    let _lock = SyncLock::acquire(&ctx.workspace_dir)?;

    // Step 4: load base.
    let base = base::load_base(&ctx.workspace_dir)?.unwrap_or_default();

    let beads_dir = ctx.db_path.parent().unwrap_or(&ctx.workspace_dir);
    path::require_valid_sync_path(&ctx.jsonl_path, beads_dir)?;

    let mut report = SyncReport::default();

    if ctx.no_pull {
        return sync_export_only(ctx, store, &mut report);
    }

    // Step 5: VCS pull (tolerating conflicts confined to the JSONL path itself).
    vcs::require_git_repo(&ctx.workspace_dir)?;
    let relative_jsonl = ctx
        .jsonl_path
        .strip_prefix(&ctx.workspace_dir)
        .unwrap_or(&ctx.jsonl_path)
        .to_path_buf();
    vcs::pull(&ctx.workspace_dir, ctx.sync_branch.as_deref(), &[relative_jsonl])?;

    // Step 6: load remote JSONL (post-pull, this is what's now on disk).
    let remote_report = jsonl::read_file(&ctx.jsonl_path)?;

    // Step 7: three-way merge.
    let merge_result = merge::merge(&base, &local, &remote_report.issues);
    report.merge = Some(MergeSummary::from(&merge_result));

    // Step 8: write merged set back to the JSONL path.
    jsonl::write_file_atomic(&ctx.jsonl_path, &merge_result.merged)?;

    // Step 9: import merged JSONL into the store.
    let import_result = import::import(
        store,
        &ctx.jsonl_path,
        &ctx.issue_prefix,
        ctx.rename_on_import,
        &ctx.repo_key,
    )?;
    report.imported = import_result.imported;

    // Step 10: re-export for a canonical byte form.
    let export_result = export::export_deferred(
        store,
        &ctx.jsonl_path,
        ctx.force_export,
        ctx.validation_on_sync,
    )?;
    report.exported = export_result.exported_ids.len();

    if !ctx.no_git_history {
        let history_config = HistoryConfig::default();
        history::backup_before_export(beads_dir, &history_config, &ctx.jsonl_path)?;
    }

    // Step 11: commit.
    let base_path = ctx.workspace_dir.join(base::BASE_FILE_NAME);
    vcs::commit(
        &ctx.workspace_dir,
        &[ctx.jsonl_path.as_path(), base_path.as_path()],
        "sync: reconcile issues",
    )?;

    // Step 12: push.
    if !ctx.no_push {
        vcs::push(&ctx.workspace_dir, ctx.sync_branch.as_deref())?;
        report.pushed = true;
    }

    // Step 13: finalize export metadata.
    export::finalize(store, &export_result, &ctx.repo_key)?;

    // Step 14: save the merged-and-canonicalized set as the new base.
    path::require_valid_sync_path(&base_path, &ctx.workspace_dir)?;
    let canonical = store.search(crate::storage::SearchFilter {
        include_tombstones: true,
    })?;
    base::save_base(&ctx.workspace_dir, &canonical)?;

    // Step 15: lock released on drop of `_lock`.
    Ok(report)
}

/// Export-only sync (`no_pull`, §4.9): lock → pre-flight → export → commit →
/// push → finalize. No base-state advance.
///
/// # Errors
///
/// Returns an error at any pipeline step.
fn sync_export_only(
    ctx: &SyncContext,
    store: &mut dyn Store,
    report: &mut SyncReport,
) -> Result<SyncReport> {
    let export_result = export::export_deferred(
        store,
        &ctx.jsonl_path,
        ctx.force_export,
        ctx.validation_on_sync,
    )?;
    report.exported = export_result.exported_ids.len();

    if vcs::require_git_repo(&ctx.workspace_dir).is_ok() {
        vcs::commit(
            &ctx.workspace_dir,
            &[ctx.jsonl_path.as_path()],
            "sync: export issues",
        )?;
        if !ctx.no_push {
            vcs::push(&ctx.workspace_dir, ctx.sync_branch.as_deref())?;
            report.pushed = true;
        }
    }

    export::finalize(store, &export_result, &ctx.repo_key)?;
    Ok(std::mem::take(report))
}

/// Import-only thin variant: parse the JSONL already on disk into the store,
/// without touching version control.
///
/// # Errors
///
/// Returns an error if the import fails.
pub fn sync_import_only(ctx: &SyncContext, store: &mut dyn Store) -> Result<import::ImportResult> {
    let _lock = SyncLock::acquire(&ctx.workspace_dir)?;
    import::import(
        store,
        &ctx.jsonl_path,
        &ctx.issue_prefix,
        ctx.rename_on_import,
        &ctx.repo_key,
    )
}

/// Flush-only thin variant: export the store to JSONL and finalize, without
/// touching version control.
///
/// # Errors
///
/// Returns an error if the export fails.
pub fn sync_flush_only(ctx: &SyncContext, store: &mut dyn Store) -> Result<export::ExportResult> {
    let _lock = SyncLock::acquire(&ctx.workspace_dir)?;
    let result = export::export_deferred(
        store,
        &ctx.jsonl_path,
        ctx.force_export,
        ctx.validation_on_sync,
    )?;
    export::finalize(store, &result, &ctx.repo_key)?;
    Ok(result)
}

/// Status thin variant: answer C4's two staleness questions without mutating
/// anything.
///
/// # Errors
///
/// Returns an error if either file can't be read.
pub fn sync_status(ctx: &SyncContext, store: &dyn Store) -> Result<SyncStatus> {
    let jsonl_changed = staleness::has_jsonl_changed(&ctx.jsonl_path, &ctx.repo_key, store)?;
    let jsonl_newer = staleness::is_jsonl_newer(&ctx.jsonl_path, &ctx.db_path, store)?;
    Ok(SyncStatus {
        jsonl_changed,
        jsonl_newer,
    })
}

#[derive(Debug, Clone, Copy)]
pub struct SyncStatus {
    pub jsonl_changed: bool,
    pub jsonl_newer: bool,
}
