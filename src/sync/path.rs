//! Path validation and allowlist enforcement for sync operations.
//!
//! Every file the sync pipeline writes (the JSONL export, the base-state
//! snapshot, the manifest) is expected to live under the resolved `.beads`
//! directory. This module is the guard that enforces it, so a misconfigured
//! or adversarial path can't make sync write outside the workspace or touch
//! `.git/` internals.

use crate::error::{BeadsError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Files explicitly allowed for sync operations within `.beads/`.
///
/// This list is exhaustive - any file not matching these patterns is rejected.
pub const ALLOWED_EXTENSIONS: &[&str] = &[
    "db",        // SQLite database
    "db-wal",    // SQLite WAL
    "db-shm",    // SQLite shared memory
    "jsonl",     // JSONL export
    "jsonl.tmp", // Atomic write temp files
];

/// Files explicitly allowed by exact name within `.beads/`.
pub const ALLOWED_EXACT_NAMES: &[&str] = &[".manifest.json", "metadata.json", ".base.jsonl"];

/// Result of path validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathValidation {
    /// Path is allowed for sync operations.
    Allowed,
    /// Path is outside the beads directory.
    OutsideBeadsDir { path: PathBuf, beads_dir: PathBuf },
    /// Path has a disallowed extension.
    DisallowedExtension { path: PathBuf, extension: String },
    /// Path contains traversal sequences (e.g., `..`).
    TraversalAttempt { path: PathBuf },
    /// Path is a symlink pointing outside the beads directory.
    SymlinkEscape { path: PathBuf, target: PathBuf },
    /// Path failed canonicalization.
    CanonicalizationFailed { path: PathBuf, error: String },
    /// Path targets git internals (.git directory).
    GitPathAttempt { path: PathBuf },
}

impl PathValidation {
    /// Returns true if the path is allowed.
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    /// Returns the rejection reason as a human-readable string.
    #[must_use]
    pub fn rejection_reason(&self) -> Option<String> {
        match self {
            Self::Allowed => None,
            Self::OutsideBeadsDir { path, beads_dir } => Some(format!(
                "Path '{}' is outside the beads directory '{}'",
                path.display(),
                beads_dir.display()
            )),
            Self::DisallowedExtension { path, extension } => Some(format!(
                "Path '{}' has disallowed extension '{}' (allowed: {:?})",
                path.display(),
                extension,
                ALLOWED_EXTENSIONS
            )),
            Self::TraversalAttempt { path } => Some(format!(
                "Path '{}' contains traversal sequences",
                path.display()
            )),
            Self::SymlinkEscape { path, target } => Some(format!(
                "Symlink '{}' points outside beads directory to '{}'",
                path.display(),
                target.display()
            )),
            Self::CanonicalizationFailed { path, error } => Some(format!(
                "Failed to canonicalize path '{}': {}",
                path.display(),
                error
            )),
            Self::GitPathAttempt { path } => Some(format!(
                "Path '{}' targets git internals - sync never accesses .git/",
                path.display()
            )),
        }
    }
}

/// Validates that a path does not target git internals.
///
/// This is a hard safety invariant: sync writes NEVER touch `.git/`
/// directories, even when the rest of the allowlist check is bypassed.
#[must_use]
pub fn validate_no_git_path(path: &Path) -> PathValidation {
    fn has_git_component(candidate: &Path) -> bool {
        for component in candidate.components() {
            if let std::path::Component::Normal(name) = component {
                if name == ".git" {
                    return true;
                }
            }
        }

        let path_str = candidate.to_string_lossy();
        path_str.contains("/.git/")
            || path_str.contains("\\.git\\")
            || path_str.ends_with("/.git")
            || path_str.ends_with("\\.git")
    }

    if has_git_component(path) {
        return PathValidation::GitPathAttempt {
            path: path.to_path_buf(),
        };
    }

    // Resolve the canonical path when possible (catches symlinks to .git)
    if let Ok(canonical) = path.canonicalize() {
        if has_git_component(&canonical) {
            return PathValidation::GitPathAttempt { path: canonical };
        }
    } else if let Some(parent) = path.parent() {
        if let Ok(canonical_parent) = parent.canonicalize() {
            if has_git_component(&canonical_parent) {
                return PathValidation::GitPathAttempt {
                    path: canonical_parent,
                };
            }
        }
    }

    PathValidation::Allowed
}

/// Validates that a path is allowed for sync operations: under `beads_dir`,
/// not a symlink escaping it, and carrying an allowlisted extension or name.
#[allow(clippy::too_many_lines)]
pub fn validate_sync_path(path: &Path, beads_dir: &Path) -> PathValidation {
    debug!(path = %path.display(), beads_dir = %beads_dir.display(), "validating sync path");

    let git_check = validate_no_git_path(path);
    if !git_check.is_allowed() {
        warn!(
            path = %path.display(),
            reason = %git_check.rejection_reason().unwrap_or_default(),
            "git path access blocked"
        );
        return git_check;
    }

    for component in path.components() {
        if matches!(component, std::path::Component::ParentDir) {
            let result = PathValidation::TraversalAttempt {
                path: path.to_path_buf(),
            };
            warn!(
                path = %path.display(),
                reason = %result.rejection_reason().unwrap_or_default(),
                "path validation rejected"
            );
            return result;
        }
    }

    let canonical_beads = match beads_dir.canonicalize() {
        Ok(p) => p,
        Err(e) => {
            let result = PathValidation::CanonicalizationFailed {
                path: beads_dir.to_path_buf(),
                error: e.to_string(),
            };
            warn!(path = %beads_dir.display(), error = %e, "beads directory canonicalization failed");
            return result;
        }
    };

    // For new files that don't exist yet, we check the parent directory.
    let path_to_check = if path.exists() {
        path.to_path_buf()
    } else {
        match path.parent() {
            Some(parent) if parent.exists() => parent.to_path_buf(),
            _ => {
                if let Ok(relative) = path.strip_prefix(&canonical_beads) {
                    if !relative.to_string_lossy().contains("..") {
                        return validate_extension_and_name(path);
                    }
                }
                path.to_path_buf()
            }
        }
    };

    let canonical_path = match path_to_check.canonicalize() {
        Ok(p) => p,
        Err(e) => {
            if !path.exists() && (path.starts_with(beads_dir) || path.starts_with(&canonical_beads))
            {
                return validate_extension_and_name(path);
            }
            let result = PathValidation::CanonicalizationFailed {
                path: path.to_path_buf(),
                error: e.to_string(),
            };
            warn!(path = %path.display(), error = %e, "path canonicalization failed");
            return result;
        }
    };

    if path.is_symlink() {
        if let Ok(target) = std::fs::read_link(path) {
            let canonical_target = target.canonicalize().unwrap_or_else(|_| target.clone());
            if !canonical_target.starts_with(&canonical_beads) {
                let result = PathValidation::SymlinkEscape {
                    path: path.to_path_buf(),
                    target: canonical_target,
                };
                warn!(path = %path.display(), target = %target.display(), "symlink escape detected");
                return result;
            }
        }
    }

    let effective_canonical = if path.exists() {
        canonical_path
    } else {
        canonical_path.join(path.file_name().unwrap_or_default())
    };

    if !effective_canonical.starts_with(&canonical_beads) {
        let result = PathValidation::OutsideBeadsDir {
            path: path.to_path_buf(),
            beads_dir: canonical_beads,
        };
        warn!(
            path = %path.display(),
            beads_dir = %beads_dir.display(),
            reason = %result.rejection_reason().unwrap_or_default(),
            "path validation rejected"
        );
        return result;
    }

    let extension_result = validate_extension_and_name(path);
    if !extension_result.is_allowed() {
        warn!(
            path = %path.display(),
            reason = %extension_result.rejection_reason().unwrap_or_default(),
            "path validation rejected"
        );
        return extension_result;
    }

    debug!(path = %path.display(), "path validated for sync I/O");
    PathValidation::Allowed
}

/// Validates that the file extension or name is in the allowlist.
fn validate_extension_and_name(path: &Path) -> PathValidation {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    if ALLOWED_EXACT_NAMES.iter().any(|&name| file_name == name) {
        return PathValidation::Allowed;
    }

    for allowed_ext in ALLOWED_EXTENSIONS {
        if file_name.ends_with(&format!(".{allowed_ext}")) {
            return PathValidation::Allowed;
        }
    }

    let extension = path
        .extension()
        .map_or_else(|| "none".to_string(), |e| e.to_string_lossy().to_string());

    PathValidation::DisallowedExtension {
        path: path.to_path_buf(),
        extension,
    }
}

/// Validates a path and returns an error if it's not allowed.
///
/// # Errors
///
/// Returns `BeadsError::Config` with a descriptive message if the path is not allowed.
pub fn require_valid_sync_path(path: &Path, beads_dir: &Path) -> Result<()> {
    let validation = validate_sync_path(path, beads_dir);
    match validation {
        PathValidation::Allowed => Ok(()),
        _ => Err(BeadsError::Config(
            validation
                .rejection_reason()
                .unwrap_or_else(|| "Path validation failed".to_string()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_test_beads_dir() -> (TempDir, PathBuf) {
        let temp = TempDir::new().expect("create temp dir");
        let beads_dir = temp.path().join(".beads");
        std::fs::create_dir_all(&beads_dir).expect("create beads dir");
        (temp, beads_dir)
    }

    #[test]
    fn allowed_jsonl_file() {
        let (_temp, beads_dir) = setup_test_beads_dir();
        let path = beads_dir.join("issues.jsonl");
        std::fs::write(&path, "{}").expect("write");

        assert!(validate_sync_path(&path, &beads_dir).is_allowed());
    }

    #[test]
    fn allowed_db_and_wal_files() {
        let (_temp, beads_dir) = setup_test_beads_dir();
        for name in ["beads.db", "beads.db-wal", "beads.db-shm"] {
            let path = beads_dir.join(name);
            std::fs::write(&path, "").expect("write");
            assert!(validate_sync_path(&path, &beads_dir).is_allowed(), "{name}");
        }
    }

    #[test]
    fn allowed_base_snapshot_file() {
        let (_temp, beads_dir) = setup_test_beads_dir();
        let path = beads_dir.join(".base.jsonl");
        std::fs::write(&path, "").expect("write");
        assert!(validate_sync_path(&path, &beads_dir).is_allowed());
    }

    #[test]
    fn new_file_in_beads_dir_is_allowed_before_it_exists() {
        let (_temp, beads_dir) = setup_test_beads_dir();
        let path = beads_dir.join("new.jsonl");
        assert!(validate_sync_path(&path, &beads_dir).is_allowed());
    }

    #[test]
    fn rejected_outside_beads_dir() {
        let (_temp, beads_dir) = setup_test_beads_dir();
        let outside_path = beads_dir.parent().unwrap().join("outside.jsonl");
        std::fs::write(&outside_path, "").expect("write");

        assert!(matches!(
            validate_sync_path(&outside_path, &beads_dir),
            PathValidation::OutsideBeadsDir { .. }
        ));
    }

    #[test]
    fn rejected_traversal() {
        let (_temp, beads_dir) = setup_test_beads_dir();
        let traversal_path = beads_dir.join("../../../etc/passwd");

        assert!(matches!(
            validate_sync_path(&traversal_path, &beads_dir),
            PathValidation::TraversalAttempt { .. }
        ));
    }

    #[test]
    fn rejected_disallowed_extension() {
        let (_temp, beads_dir) = setup_test_beads_dir();
        let path = beads_dir.join("config.yaml");
        std::fs::write(&path, "").expect("write");

        assert!(matches!(
            validate_sync_path(&path, &beads_dir),
            PathValidation::DisallowedExtension { .. }
        ));
    }

    #[test]
    fn require_valid_sync_path_surfaces_traversal_as_error() {
        let (_temp, beads_dir) = setup_test_beads_dir();
        let path = beads_dir.join("../../../etc/passwd");

        let result = require_valid_sync_path(&path, &beads_dir);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("traversal"));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_rejected() {
        use std::os::unix::fs::symlink;

        let temp = TempDir::new().expect("create temp dir");
        let beads_dir = temp.path().join(".beads");
        std::fs::create_dir_all(&beads_dir).expect("create beads dir");

        let outside_target = temp.path().join("secret.txt");
        std::fs::write(&outside_target, "secret data").expect("write");

        let symlink_path = beads_dir.join("evil.jsonl");
        symlink(&outside_target, &symlink_path).expect("create symlink");

        assert!(matches!(
            validate_sync_path(&symlink_path, &beads_dir),
            PathValidation::SymlinkEscape { .. }
        ));
    }

    #[cfg(unix)]
    #[test]
    fn validate_no_git_path_rejects_symlinked_git_parent() {
        use std::os::unix::fs::symlink;

        let temp = TempDir::new().expect("create temp dir");
        let git_dir = temp.path().join(".git");
        std::fs::create_dir_all(&git_dir).expect("create .git dir");

        let symlink_parent = temp.path().join("gitlink");
        symlink(&git_dir, &symlink_parent).expect("create git symlink");

        let candidate = symlink_parent.join("issues.jsonl");
        assert!(matches!(
            validate_no_git_path(&candidate),
            PathValidation::GitPathAttempt { .. }
        ));
    }
}
