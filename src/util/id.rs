//! Issue ID parsing and prefix validation.
//!
//! IDs are `<prefix>-<suffix>`, optionally with a hierarchical child path
//! (`bd-abc123.1.2`). The sync core never mints new IDs itself -- issues
//! arrive with an ID already assigned by whichever side created them -- but
//! it does need to parse the prefix out of an ID to enforce the prefix
//! invariant (spec §3.2) during import.

use crate::error::{BeadsError, Result};

/// Parsed components of an issue ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedId {
    /// The prefix (e.g., "bd").
    pub prefix: String,
    /// The suffix/hash portion (e.g., "abc123").
    pub suffix: String,
    /// Child path segments if this is a hierarchical ID (e.g., `[1, 2]` for `.1.2`).
    pub child_path: Vec<u32>,
}

impl ParsedId {
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.child_path.is_empty()
    }
}

/// Parse an issue ID into its prefix, suffix, and optional child path.
///
/// # Errors
///
/// Returns `InvalidId` if the ID has no `-` separator, an empty prefix or
/// suffix, a non-base36 suffix, or a non-numeric child path segment.
pub fn parse_id(id: &str) -> Result<ParsedId> {
    let Some(dash_pos) = id.find('-') else {
        return Err(BeadsError::InvalidId { id: id.to_string() });
    };

    let prefix = &id[..dash_pos];
    let remainder = &id[dash_pos + 1..];

    if prefix.is_empty() || remainder.is_empty() {
        return Err(BeadsError::InvalidId { id: id.to_string() });
    }

    let parts: Vec<&str> = remainder.split('.').collect();
    let suffix = parts[0].to_string();

    if suffix.is_empty()
        || !suffix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
    {
        return Err(BeadsError::InvalidId { id: id.to_string() });
    }

    let mut child_path = Vec::new();
    for part in parts.iter().skip(1) {
        match part.parse::<u32>() {
            Ok(n) => child_path.push(n),
            Err(_) => return Err(BeadsError::InvalidId { id: id.to_string() }),
        }
    }

    Ok(ParsedId {
        prefix: prefix.to_string(),
        suffix,
        child_path,
    })
}

/// Extract just the prefix from an ID, without full validation of the suffix shape.
#[must_use]
pub fn prefix_of(id: &str) -> Option<&str> {
    id.split_once('-').map(|(prefix, _)| prefix)
}

/// Validate that an ID carries the expected prefix (or one of the allowed aliases).
///
/// # Errors
///
/// Returns `PrefixMismatch` if the ID's prefix is neither `expected_prefix`
/// nor a member of `allowed_prefixes`.
pub fn validate_prefix(id: &str, expected_prefix: &str, allowed_prefixes: &[String]) -> Result<()> {
    let parsed = parse_id(id)?;

    if parsed.prefix == expected_prefix || allowed_prefixes.contains(&parsed.prefix) {
        return Ok(());
    }

    Err(BeadsError::PrefixMismatch {
        expected: expected_prefix.to_string(),
        found: parsed.prefix,
    })
}

/// Rewrite the prefix of an ID, preserving the suffix and any child path.
#[must_use]
pub fn rewrite_prefix(id: &str, new_prefix: &str) -> Option<String> {
    let parsed = parse_id(id).ok()?;
    let mut out = format!("{new_prefix}-{}", parsed.suffix);
    for segment in &parsed.child_path {
        use std::fmt::Write;
        let _ = write!(out, ".{segment}");
    }
    Some(out)
}

#[must_use]
pub fn is_valid_id_format(id: &str) -> bool {
    parse_id(id).is_ok()
}

/// Trim surrounding whitespace and lowercase an ID for comparison purposes.
///
/// Import sources (hand-edited JSONL, other tools) occasionally carry stray
/// whitespace or inconsistent casing; this does not change the ID's meaning,
/// only its comparison form.
#[must_use]
pub fn normalize_id(id: &str) -> String {
    id.trim().to_lowercase()
}
