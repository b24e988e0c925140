//! Version-control plumbing: shells out to `git` (§4.9, §9).
//!
//! The sync core talks to version control the same way the rest of this
//! crate's CLI surface always has — by invoking the `git` binary and reading
//! its output — rather than embedding a git implementation. Every command
//! runs with the workspace directory as its working directory.

use crate::error::{BeadsError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};

fn run_git(workspace_dir: &Path, args: &[&str]) -> Result<String> {
    debug!(args = ?args, "running git command");
    let output = Command::new("git")
        .current_dir(workspace_dir)
        .args(args)
        .output()
        .map_err(BeadsError::Io)?;

    if !output.status.success() {
        let mut detail = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if detail.is_empty() {
            detail = String::from_utf8_lossy(&output.stdout).trim().to_string();
        } else {
            detail.push(' ');
            detail.push_str(String::from_utf8_lossy(&output.stdout).trim());
        }
        return Err(BeadsError::VcsCommandFailed {
            subcommand: args.join(" "),
            detail,
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// # Errors
///
/// Returns `NotAGitRepo` if `workspace_dir` is not inside a git working tree.
pub fn require_git_repo(workspace_dir: &Path) -> Result<()> {
    let output = Command::new("git")
        .current_dir(workspace_dir)
        .args(["rev-parse", "--is-inside-work-tree"])
        .output()
        .map_err(BeadsError::Io)?;
    if output.status.success() {
        Ok(())
    } else {
        Err(BeadsError::NotAGitRepo {
            path: workspace_dir.to_path_buf(),
        })
    }
}

/// A single `git status --porcelain=v1` entry.
#[derive(Debug, Clone)]
pub struct StatusEntry {
    pub path: PathBuf,
    pub unmerged: bool,
}

fn status_line_re() -> Regex {
    Regex::new(r"^(?P<x>.)(?P<y>.) (?P<path>.+)$").expect("static regex is valid")
}

/// # Errors
///
/// Returns an error if `git status` fails.
pub fn status(workspace_dir: &Path) -> Result<Vec<StatusEntry>> {
    let raw = run_git(workspace_dir, &["status", "--porcelain=v1"])?;
    let re = status_line_re();
    let mut entries = Vec::new();
    for line in raw.lines() {
        if let Some(caps) = re.captures(line) {
            let x = &caps["x"];
            let y = &caps["y"];
            let unmerged = x == "U" || y == "U" || (x == "A" && y == "A") || (x == "D" && y == "D");
            entries.push(StatusEntry {
                path: PathBuf::from(&caps["path"]),
                unmerged,
            });
        }
    }
    Ok(entries)
}

/// True if `workspace_dir` has any uncommitted change at `relative_path`.
///
/// # Errors
///
/// Returns an error if `git status` fails.
pub fn has_uncommitted_change(workspace_dir: &Path, relative_path: &Path) -> Result<bool> {
    Ok(status(workspace_dir)?
        .iter()
        .any(|entry| entry.path == relative_path))
}

/// # Errors
///
/// Returns `VcsCommandFailed` if the pull fails, or `VcsMergeConflict` if it
/// leaves unmerged paths outside the files the caller expects to reconcile itself.
pub fn pull(workspace_dir: &Path, branch: Option<&str>, tolerated: &[PathBuf]) -> Result<()> {
    let args: Vec<&str> = match branch {
        Some(b) => vec!["pull", "--no-rebase", "origin", b],
        None => vec!["pull", "--no-rebase"],
    };
    let pull_result = run_git(workspace_dir, &args);

    let entries = status(workspace_dir)?;
    let unresolved: Vec<PathBuf> = entries
        .iter()
        .filter(|e| e.unmerged && !tolerated.contains(&e.path))
        .map(|e| e.path.clone())
        .collect();

    if !unresolved.is_empty() {
        return Err(BeadsError::VcsMergeConflict { files: unresolved });
    }

    pull_result.map(|_| ())
}

/// # Errors
///
/// Returns an error if `git add`/`git commit` fails. A commit with nothing
/// staged is treated as success (nothing to do), matching `git commit`'s own
/// idempotence expectations here.
pub fn commit(workspace_dir: &Path, paths: &[&Path], message: &str) -> Result<()> {
    let path_strs: Vec<&str> = paths.iter().filter_map(|p| p.to_str()).collect();
    let mut add_args = vec!["add"];
    add_args.extend(path_strs.iter());
    run_git(workspace_dir, &add_args)?;

    match run_git(workspace_dir, &["commit", "-m", message]) {
        Ok(_) => Ok(()),
        Err(BeadsError::VcsCommandFailed { detail, .. }) if detail.contains("nothing to commit") => {
            debug!("nothing to commit, skipping");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// # Errors
///
/// Returns an error if `git push` fails.
pub fn push(workspace_dir: &Path, branch: Option<&str>) -> Result<()> {
    let args: Vec<&str> = match branch {
        Some(b) => vec!["push", "origin", b],
        None => vec!["push"],
    };
    match run_git(workspace_dir, &args) {
        Ok(_) => Ok(()),
        Err(e) => {
            warn!(error = %e, "git push failed");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_repo(dir: &Path) {
        Command::new("git").current_dir(dir).args(["init", "-q"]).status().unwrap();
        Command::new("git")
            .current_dir(dir)
            .args(["config", "user.email", "test@example.com"])
            .status()
            .unwrap();
        Command::new("git")
            .current_dir(dir)
            .args(["config", "user.name", "test"])
            .status()
            .unwrap();
    }

    #[test]
    fn require_git_repo_rejects_non_repo() {
        let dir = tempfile::tempdir().unwrap();
        assert!(require_git_repo(dir.path()).is_err());
    }

    #[test]
    fn require_git_repo_accepts_initialized_repo() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        assert!(require_git_repo(dir.path()).is_ok());
    }

    #[test]
    fn status_reports_untracked_file() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        std::fs::write(dir.path().join("issues.jsonl"), "{}").unwrap();
        let entries = status(dir.path()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, PathBuf::from("issues.jsonl"));
    }

    #[test]
    fn commit_with_nothing_staged_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();
        commit(dir.path(), &[Path::new("a.txt")], "initial").unwrap();
        commit(dir.path(), &[Path::new("a.txt")], "no changes").unwrap();
    }
}
