//! Per-issue content hashing for dedup and conflict-free equality checks.
//!
//! Uses SHA256 over stable ordered fields with null separators. This is the
//! C1 `equal()` primitive's hash form, distinct from C4's whole-file
//! staleness hash (`sync::staleness`), which hashes an entire canonical
//! JSONL/store serialization rather than a single issue's content fields.

use sha2::{Digest, Sha256};

use crate::model::{Issue, IssueType, Priority, Status};

/// Trait for types that can produce a deterministic content hash.
pub trait ContentHashable {
    fn content_hash(&self) -> String;
}

impl ContentHashable for Issue {
    fn content_hash(&self) -> String {
        content_hash(self)
    }
}

/// Compute the SHA256 content hash for an issue.
///
/// Fields included (stable order with null separators): title, description,
/// design, `acceptance_criteria`, notes, status, priority, `issue_type`,
/// assignee, `external_ref`, pinned.
///
/// Fields excluded: id, `content_hash` (circular), labels/dependencies/comments
/// (separate entities with their own merge rules), timestamps, tombstone fields.
#[must_use]
pub fn content_hash(issue: &Issue) -> String {
    content_hash_from_parts(
        &issue.title,
        issue.description.as_deref(),
        issue.design.as_deref(),
        issue.acceptance_criteria.as_deref(),
        issue.notes.as_deref(),
        &issue.status,
        &issue.priority,
        &issue.issue_type,
        issue.assignee.as_deref(),
        issue.external_ref.as_deref(),
        issue.pinned,
    )
}

/// Create a content hash from raw components (for import/validation).
#[must_use]
#[allow(clippy::too_many_arguments)]
pub fn content_hash_from_parts(
    title: &str,
    description: Option<&str>,
    design: Option<&str>,
    acceptance_criteria: Option<&str>,
    notes: Option<&str>,
    status: &Status,
    priority: &Priority,
    issue_type: &IssueType,
    assignee: Option<&str>,
    external_ref: Option<&str>,
    pinned: bool,
) -> String {
    let mut hasher = Sha256::new();

    let mut add_field = |value: &str| {
        if value.contains('\0') {
            hasher.update(value.replace('\0', " ").as_bytes());
        } else {
            hasher.update(value.as_bytes());
        }
        hasher.update(b"\x00");
    };

    add_field(title);
    add_field(description.unwrap_or(""));
    add_field(design.unwrap_or(""));
    add_field(acceptance_criteria.unwrap_or(""));
    add_field(notes.unwrap_or(""));
    add_field(status.as_str());
    add_field(&format!("P{}", priority.0));
    add_field(issue_type.as_str());
    add_field(assignee.unwrap_or(""));
    add_field(external_ref.unwrap_or(""));
    hasher.update(if pinned { b"true".as_slice() } else { b"false".as_slice() });

    format!("{:x}", hasher.finalize())
}

/// SHA256 of an arbitrary byte buffer, hex-encoded.
///
/// Shared primitive behind C4's two whole-file staleness questions
/// (`sync::staleness::has_jsonl_changed` / `is_jsonl_newer`), which hash a
/// whole canonical JSONL buffer rather than a single issue's fields.
#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
