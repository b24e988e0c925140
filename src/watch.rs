//! Filesystem watcher & debouncer (C10, §4.10).
//!
//! Watches the JSONL file, its parent directory (to catch rename-on-top
//! replacements), and the VCS `HEAD`/`refs/heads` to catch branch switches.
//! Falls back to mtime/size polling when kernel-level watching is
//! unavailable, since `notify`'s inotify backend can fail to register (e.g.
//! instance limits) on some hosts.

use crate::error::{BeadsError, Result};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;
use tracing::{debug, info, warn};

const DEBOUNCE: Duration = Duration::from_millis(500);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Paths this crate watches for one workspace.
pub struct WatchTargets {
    pub jsonl_path: PathBuf,
    pub db_path: PathBuf,
    pub workspace_dir: PathBuf,
}

impl WatchTargets {
    fn git_head(&self) -> PathBuf {
        self.workspace_dir.join(".git").join("HEAD")
    }

    fn git_refs_heads(&self) -> PathBuf {
        self.workspace_dir.join(".git").join("refs").join("heads")
    }

    fn parent_dir(&self) -> PathBuf {
        self.jsonl_path
            .parent()
            .map_or_else(|| self.workspace_dir.clone(), Path::to_path_buf)
    }

    /// Classify which of the paths this crate cares about a raw filesystem
    /// path corresponds to (§6.5: auto-import triggers on JSONL changes,
    /// auto-flush on local store mutation, tracked via the DB file).
    fn classify(&self, path: &Path) -> Option<ChangeKind> {
        if path == self.jsonl_path {
            Some(ChangeKind::Jsonl)
        } else if path == self.db_path {
            Some(ChangeKind::Db)
        } else if path.starts_with(self.git_head()) || path.starts_with(self.git_refs_heads()) {
            Some(ChangeKind::Vcs)
        } else {
            None
        }
    }
}

/// What kind of watched path changed, so the caller can decide between a
/// full sync, an import-only flush, or an export-only flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// The JSONL export changed underneath us (e.g. another process pulled).
    Jsonl,
    /// The SQLite database changed (a local mutation landed).
    Db,
    /// `HEAD` or a ref moved (branch switch, external pull/merge).
    Vcs,
}

/// The set of change kinds observed in one debounced burst.
pub type ChangeSet = std::collections::HashSet<ChangeKind>;

/// Block the calling thread, invoking `on_change` (debounced to one call per
/// 500ms burst) with the kinds of paths that changed. Returns only on
/// watcher setup failure that also fails the polling fallback.
///
/// # Errors
///
/// Returns `WatchSetupFailed` if neither kernel watching nor polling can be
/// established (practically unreachable — polling has no setup cost).
pub fn watch<F: FnMut(&ChangeSet)>(targets: &WatchTargets, mut on_change: F) -> Result<()> {
    match watch_kernel(targets) {
        Ok(rx) => {
            info!("watching via kernel filesystem events");
            debounce_loop(targets, &rx, &mut on_change);
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "kernel watch setup failed, falling back to polling");
            watch_polling(targets, DEFAULT_POLL_INTERVAL, &mut on_change)
        }
    }
}

fn watch_kernel(targets: &WatchTargets) -> Result<mpsc::Receiver<Event>> {
    let (tx, rx) = mpsc::channel();
    let mut watcher: RecommendedWatcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            let _ = tx.send(event);
        }
    })
    .map_err(|e| BeadsError::WatchSetupFailed {
        path: targets.jsonl_path.clone(),
        reason: e.to_string(),
    })?;

    watcher
        .watch(&targets.parent_dir(), RecursiveMode::NonRecursive)
        .map_err(|e| BeadsError::WatchSetupFailed {
            path: targets.parent_dir(),
            reason: e.to_string(),
        })?;

    let db_parent = targets
        .db_path
        .parent()
        .map_or_else(|| targets.workspace_dir.clone(), Path::to_path_buf);
    if db_parent != targets.parent_dir() {
        let _ = watcher.watch(&db_parent, RecursiveMode::NonRecursive);
    }

    if targets.git_head().exists() {
        let _ = watcher.watch(&targets.git_head(), RecursiveMode::NonRecursive);
    }
    if targets.git_refs_heads().exists() {
        let _ = watcher.watch(&targets.git_refs_heads(), RecursiveMode::Recursive);
    }

    // Leak the watcher onto the receiver's lifetime via a background thread
    // so it stays alive for the duration of the blocking loop below.
    std::mem::forget(watcher);
    Ok(rx)
}

fn event_change_kinds(targets: &WatchTargets, event: &Event) -> ChangeSet {
    event
        .paths
        .iter()
        .filter_map(|p| targets.classify(p))
        .collect()
}

fn debounce_loop<F: FnMut(&ChangeSet)>(
    targets: &WatchTargets,
    rx: &mpsc::Receiver<Event>,
    on_change: &mut F,
) {
    loop {
        match rx.recv() {
            Ok(event) => {
                let mut kinds = event_change_kinds(targets, &event);
                // Drain any further events within the debounce window, collapsing the burst.
                while let Ok(event) = rx.recv_timeout(DEBOUNCE) {
                    kinds.extend(event_change_kinds(targets, &event));
                }
                debug!(?kinds, "filesystem change detected, debounced burst collapsed");
                if kinds.is_empty() {
                    // Events we couldn't classify (e.g. a sibling temp file) still
                    // warrant a conservative full reconciliation.
                    kinds.insert(ChangeKind::Jsonl);
                    kinds.insert(ChangeKind::Db);
                }
                on_change(&kinds);
            }
            Err(_disconnected) => return,
        }
    }
}

type PollKey = PathBuf;
type PollState = (Option<std::time::SystemTime>, u64);

fn snapshot(paths: &[PathBuf]) -> HashMap<PollKey, PollState> {
    paths
        .iter()
        .map(|p| {
            let meta = fs::metadata(p).ok();
            let state = (
                meta.as_ref().and_then(|m| m.modified().ok()),
                meta.map_or(0, |m| m.len()),
            );
            (p.clone(), state)
        })
        .collect()
}

fn watch_polling<F: FnMut(&ChangeSet)>(
    targets: &WatchTargets,
    interval: Duration,
    on_change: &mut F,
) -> Result<()> {
    let paths = vec![
        targets.jsonl_path.clone(),
        targets.db_path.clone(),
        targets.git_head(),
    ];
    let mut last = snapshot(&paths);

    loop {
        std::thread::sleep(interval);
        let current = snapshot(&paths);
        if current != last {
            let mut kinds = ChangeSet::new();
            if current.get(&targets.jsonl_path) != last.get(&targets.jsonl_path) {
                kinds.insert(ChangeKind::Jsonl);
            }
            if current.get(&targets.db_path) != last.get(&targets.db_path) {
                kinds.insert(ChangeKind::Db);
            }
            if current.get(&targets.git_head()) != last.get(&targets.git_head()) {
                kinds.insert(ChangeKind::Vcs);
            }
            debug!(?kinds, "poll detected change in watched paths");
            on_change(&kinds);
        }
        last = current;
    }
}
